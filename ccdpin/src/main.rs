// SPDX-License-Identifier: GPL-2.0
//
// ccdpin: single-game launch wrapper.
//
// Uses the same coordinator/pin primitives as ccdbind's reconciler but
// scoped to one child process launch, serialized across concurrent
// wrapper invocations through coordinator::acquire/release.
//
// Release is guaranteed on any exit path: a scope guard runs it on Drop
// (covering panics in launch_child), and the same ctrlc-driven signal
// handling ccdbind uses for its shutdown flag is adapted here to forward
// the signal to the child and trigger release before the process exits.

mod coordinator;

use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use log::{info, warn, LevelFilter};
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use ccd_core::config::{parse_bool_env, Config};
use ccd_core::cpulist::CpuList;
use ccd_core::state;
use ccd_core::supervisor::{unit_name_for_game, DryRunSupervisorClient, RealSupervisorClient, SupervisorClient};
use ccd_core::topology::Topology;

const EXIT_USAGE_ERROR: i32 = 2;

struct WrapperOpts {
    print_topology: bool,
    swap: bool,
    no_os_pin: bool,
    os_cpus_override: Option<String>,
    game_cpus_override: Option<String>,
    command: Vec<String>,
}

fn parse_args(args: Vec<String>) -> Result<WrapperOpts, String> {
    let mut opts = WrapperOpts {
        print_topology: false,
        swap: false,
        no_os_pin: false,
        os_cpus_override: None,
        game_cpus_override: None,
        command: Vec::new(),
    };

    let mut iter = args.into_iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--" => {
                opts.command.extend(iter);
                break;
            }
            "--print-topology" => opts.print_topology = true,
            "--swap" => opts.swap = true,
            "--no-os-pin" => opts.no_os_pin = true,
            "--os-cpus" => {
                opts.os_cpus_override = Some(iter.next().ok_or("--os-cpus requires a value")?);
            }
            "--game-cpus" => {
                opts.game_cpus_override = Some(iter.next().ok_or("--game-cpus requires a value")?);
            }
            other if !other.starts_with("--") => {
                opts.command.push(other.to_string());
                opts.command.extend(iter);
                break;
            }
            other => return Err(format!("unrecognized flag {other}")),
        }
    }

    Ok(opts)
}

fn main() {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let opts = match parse_args(args) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("ccdpin: {e}");
            std::process::exit(EXIT_USAGE_ERROR);
        }
    };

    match run(opts) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("ccdpin: {e}");
            std::process::exit(EXIT_USAGE_ERROR);
        }
    }
}

fn init_logging() {
    let debug = std::env::var("CCDPIN_DEBUG").map(|v| parse_bool_env(&v)).unwrap_or(false);
    let level = if debug { LevelFilter::Debug } else { LevelFilter::Info };
    let log_config = simplelog::ConfigBuilder::new()
        .set_time_level(LevelFilter::Off)
        .set_location_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .build();
    let _ = TermLogger::init(level, log_config, TerminalMode::Mixed, ColorChoice::Auto);
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn run(opts: WrapperOpts) -> anyhow::Result<i32> {
    let config = Config::load(None)?;

    let mut topology = Topology::detect(&config.sysfs_root)?;

    if let Some(swap_env) = env_override("CCDPIN_SWAP") {
        if parse_bool_env(&swap_env) {
            std::mem::swap(&mut topology.os_cpus, &mut topology.game_cpus);
        }
    }
    if opts.swap {
        std::mem::swap(&mut topology.os_cpus, &mut topology.game_cpus);
    }

    let mut os_cpus = topology.os_cpus.clone();
    let mut game_cpus = topology.game_cpus.clone();

    if let Some(raw) = env_override("CCDPIN_OS_CPUS") {
        os_cpus = CpuList::parse(&raw)?;
    }
    if let Some(raw) = opts.os_cpus_override {
        os_cpus = CpuList::parse(&raw)?;
    }
    if let Some(raw) = env_override("CCDPIN_GAME_CPUS") {
        game_cpus = CpuList::parse(&raw)?;
    }
    if let Some(raw) = opts.game_cpus_override {
        game_cpus = CpuList::parse(&raw)?;
    }

    if opts.print_topology {
        println!("os_cpus: {os_cpus}");
        println!("game_cpus: {game_cpus}");
        return Ok(0);
    }

    if opts.command.is_empty() {
        eprintln!("ccdpin: no command given");
        return Ok(EXIT_USAGE_ERROR);
    }

    let no_os_pin = opts.no_os_pin
        || env_override("CCDPIN_NO_OS_PIN")
            .map(|v| parse_bool_env(&v))
            .unwrap_or(false);

    let os_slices: Vec<String> = env_override("CCDPIN_OS_SLICES")
        .map(|raw| raw.split_whitespace().map(|s| s.to_string()).collect())
        .unwrap_or_else(|| config.wrapper_os_slices.clone());

    let supervisor: Arc<dyn SupervisorClient + Send + Sync> = if config.dry_run {
        Arc::new(DryRunSupervisorClient)
    } else {
        Arc::new(RealSupervisorClient::connect()?)
    };

    let proc_root = config.proc_root.clone();
    let self_pid = std::process::id();
    let self_start_time = ccd_core::scanner::read_start_time(&proc_root, self_pid).unwrap_or(0);

    let state_path = state::wrapper_state_path(&config.state_home);
    let lock_path = state::wrapper_lock_path(&config.state_home);

    if !no_os_pin {
        if let Err(e) = coordinator::acquire(
            &proc_root,
            &state_path,
            &lock_path,
            supervisor.as_ref(),
            self_pid,
            self_start_time,
            &os_slices,
            &os_cpus,
            config.dry_run,
        ) {
            warn!("failed to acquire OS pin, running child unpinned: {e}");
        }
    }

    let released = Arc::new(AtomicBool::new(false));
    let child_pid = Arc::new(AtomicI32::new(0));

    let guard = ReleaseGuard {
        proc_root: proc_root.clone(),
        state_path: state_path.clone(),
        lock_path: lock_path.clone(),
        supervisor: supervisor.clone(),
        self_pid,
        dry_run: config.dry_run,
        enabled: !no_os_pin,
        released: released.clone(),
    };

    ctrlc::set_handler({
        let supervisor = supervisor.clone();
        let child_pid = child_pid.clone();
        let proc_root = proc_root.clone();
        let state_path = state_path.clone();
        let lock_path = lock_path.clone();
        let released = released.clone();
        let dry_run = config.dry_run;
        move || {
            let pid = child_pid.load(Ordering::SeqCst);
            if pid > 0 {
                let _ = signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
            }
            if !no_os_pin {
                release_once(&proc_root, &state_path, &lock_path, supervisor.as_ref(), self_pid, dry_run, &released);
            }
            std::process::exit(128 + Signal::SIGTERM as i32);
        }
    })?;

    let game_id = format!("wrapper-{self_pid}");
    let unit_name = unit_name_for_game(&config.unit_prefix, &game_id);
    let launch_result = launch_child(&opts.command, &unit_name, &game_cpus, supervisor.as_ref(), &child_pid);

    drop(guard);

    launch_result
}

/// Ensures the OS pin is restored exactly once no matter how the wrapper
/// exits: normal return, an early `?`, a panic unwinding out of
/// `launch_child`, or a signal caught by the `ctrlc` handler. The `ctrlc`
/// handler and the Drop impl race to call `release_once`; `released`
/// makes the loser a no-op.
struct ReleaseGuard {
    proc_root: std::path::PathBuf,
    state_path: std::path::PathBuf,
    lock_path: std::path::PathBuf,
    supervisor: Arc<dyn SupervisorClient + Send + Sync>,
    self_pid: u32,
    dry_run: bool,
    enabled: bool,
    released: Arc<AtomicBool>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        release_once(
            &self.proc_root,
            &self.state_path,
            &self.lock_path,
            self.supervisor.as_ref(),
            self.self_pid,
            self.dry_run,
            &self.released,
        );
    }
}

fn release_once(
    proc_root: &std::path::Path,
    state_path: &std::path::Path,
    lock_path: &std::path::Path,
    supervisor: &dyn SupervisorClient,
    self_pid: u32,
    dry_run: bool,
    released: &AtomicBool,
) {
    if released.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Err(e) = coordinator::release(proc_root, state_path, lock_path, supervisor, self_pid, dry_run) {
        warn!("failed to release OS pin: {e}");
    }
}

fn launch_child(
    command: &[String],
    unit_name: &str,
    game_cpus: &CpuList,
    supervisor: &dyn SupervisorClient,
    child_pid: &AtomicI32,
) -> anyhow::Result<i32> {
    let mut child = Command::new(&command[0])
        .args(&command[1..])
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()?;

    let pid = child.id();
    child_pid.store(pid as i32, Ordering::SeqCst);

    if let Err(e) = supervisor.ensure_transient_scope(unit_name, &[pid], "game.slice", "ccdpin child") {
        warn!("could not create game scope for child, running unpinned: {e}");
    } else if let Err(e) = supervisor.set_allowed_cpus(unit_name, game_cpus) {
        warn!("could not pin child to game CPUs: {e}");
    } else {
        info!("child pid {pid} attached to {unit_name} with AllowedCPUs={game_cpus}");
    }

    let status = child.wait()?;
    child_pid.store(0, Ordering::SeqCst);
    match status.code() {
        Some(code) => Ok(code),
        None => {
            let signal = status.signal().unwrap_or(0);
            Ok(128 + signal)
        }
    }
}