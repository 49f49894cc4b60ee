// SPDX-License-Identifier: GPL-2.0
//
// ccdbind: topology-driven CPU-affinity daemon.
//
// CLI shape (clap derive Opts) and logging init follow scx_gamer::main;
// ctrlc-driven shutdown flag follows the same pattern generalized from a
// multi-thread shutdown sequence to a single reconciler loop.

mod reconciler;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn, LevelFilter};
use simplelog::{ColorChoice, TermLogger, TerminalMode};

use ccd_core::config::Config;
use ccd_core::error::CcdError;
use ccd_core::scanner::{self, ScanFilter};
use ccd_core::state::{self, DaemonState};
use ccd_core::status::{classify_all_processes, ObservedGame, SliceStatus, StatusSnapshot};
use ccd_core::supervisor::{unit_name_for_game, DryRunSupervisorClient, RealSupervisorClient, SupervisorClient};
use ccd_core::topology::Topology;

use reconciler::{current_uid, Reconciler};

#[derive(Parser, Debug)]
#[command(name = "ccdbind", about = "CPU-affinity controller for AMD multi-CCD desktops")]
struct Opts {
    /// Path to config.toml. Defaults to <config_home>/ccdbind/config.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the reconciler tick interval, in seconds.
    #[arg(long)]
    tick_interval: Option<u64>,

    /// Print detected topology and exit.
    #[arg(long)]
    print_topology: bool,

    /// Log all mutating calls instead of performing them.
    #[arg(long)]
    dry_run: bool,

    /// Print the current state file and exit.
    #[arg(long)]
    dump_state: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Print a structured snapshot of current pin state.
    Status {
        #[arg(long, value_enum, default_value_t = StatusFilter::Games)]
        filter: StatusFilter,
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum StatusFilter {
    Games,
    All,
}

fn main() {
    let opts = Opts::parse();
    init_logging(opts.verbose);

    if let Err(e) = run(opts) {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let log_config = simplelog::ConfigBuilder::new()
        .set_time_level(LevelFilter::Off)
        .set_location_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .build();
    let _ = TermLogger::init(level, log_config, TerminalMode::Mixed, ColorChoice::Auto);
}

fn run(opts: Opts) -> anyhow::Result<()> {
    let mut config = Config::load(opts.config.as_deref())?;
    if let Some(secs) = opts.tick_interval {
        config.tick_interval = std::time::Duration::from_secs(secs);
    }
    if opts.dry_run {
        config.dry_run = true;
    }
    if let Some(path) = &config.exe_ignorelist_file {
        match ccd_core::scanner::load_ignorelist_file(path) {
            Ok(list) => config.exe_ignorelist.extend(list),
            Err(e) => warn!("failed to load ignorelist file {}: {e}", path.display()),
        }
    }

    let topology = Topology::detect(&config.sysfs_root)?;
    if topology.game_cpus.is_empty() {
        if opts.print_topology {
            print_topology(&topology);
            return Ok(());
        }
        return Err(CcdError::TopologyNotAvailable(
            "only one cache group detected; refusing to pin with an empty game_cpus set".to_string(),
        )
        .into());
    }

    if opts.print_topology {
        print_topology(&topology);
        return Ok(());
    }

    let state_path = state::daemon_state_path(&config.state_home);

    if opts.dump_state {
        let state = DaemonState::load(&state_path)?;
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    if let Some(Command::Status { filter, json }) = &opts.command {
        return print_status(&config, &topology, &state_path, *filter, *json);
    }

    let supervisor: Box<dyn SupervisorClient> = if config.dry_run {
        info!("running in dry-run mode: no supervisor mutation will occur");
        Box::new(DryRunSupervisorClient)
    } else {
        Box::new(RealSupervisorClient::connect()?)
    };

    let state = DaemonState::load(&state_path)?;

    let mut reconciler = Reconciler::new(config, supervisor, topology, state, state_path);
    reconciler.startup_recovery()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_handler.store(true, Ordering::SeqCst);
    })?;

    info!("entering reconcile loop");
    reconciler.run(shutdown)?;
    info!("shutdown complete");
    Ok(())
}

fn print_topology(topology: &Topology) {
    println!("os_cpus: {}", topology.os_cpus);
    println!("game_cpus: {}", topology.game_cpus);
    for (i, group) in topology.groups.iter().enumerate() {
        println!("group[{i}]: {group}");
    }
}

/// §4.8: the status subcommand is read-only and reports real state
/// regardless of --dry-run, so it always connects a real supervisor
/// rather than honoring config.dry_run.
fn print_status(
    config: &Config,
    topology: &Topology,
    state_path: &std::path::Path,
    filter: StatusFilter,
    json: bool,
) -> anyhow::Result<()> {
    let state = DaemonState::load(state_path)?;
    let supervisor = RealSupervisorClient::connect()?;

    let slices: Vec<SliceStatus> = config
        .managed_slices
        .iter()
        .map(|name| SliceStatus {
            name: name.clone(),
            current_allowed_cpus: supervisor
                .get_allowed_cpus(name)
                .map(|c| c.canonical())
                .unwrap_or_default(),
            original_allowed_cpus: state.original_allowed_cpus.get(name).cloned(),
        })
        .collect();

    let uid = current_uid();
    let scan_filter = ScanFilter {
        uid,
        env_keys: config.env_keys.clone(),
        exe_allowlist: config.exe_allowlist.clone(),
        exe_ignorelist: config.exe_ignorelist.clone(),
    };
    let found = scanner::scan(&config.proc_root, &scan_filter)?;

    let games: Vec<ObservedGame> = found
        .into_iter()
        .map(|(game_id, records)| {
            let unit_name = unit_name_for_game(&config.unit_prefix, &game_id);
            let pids = records.iter().map(|r| r.pid).collect();
            let allowed_cpus = records
                .iter()
                .map(|r| r.allowed_cpus.clone())
                .collect();
            ObservedGame {
                game_id,
                unit_name,
                pids,
                allowed_cpus,
            }
        })
        .collect();

    let mut snapshot = StatusSnapshot::from_state(
        None,
        state_path.display().to_string(),
        &state,
        slices,
        games,
    );

    if filter == StatusFilter::All {
        let observations = scanner::scan_all_basenames(&config.proc_root, uid)?;
        snapshot.all_groups = Some(classify_all_processes(
            &topology.os_cpus.canonical(),
            &topology.game_cpus.canonical(),
            &observations,
        ));
    }

    if json {
        println!("{}", snapshot.to_json()?);
    } else {
        print!("{}", snapshot.to_text());
    }
    Ok(())
}
