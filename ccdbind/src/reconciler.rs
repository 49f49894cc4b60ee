// SPDX-License-Identifier: GPL-2.0
//
// ccdbind: the reconciler tick loop.
//
// No teacher module owns a reconcile loop at this granularity; built in
// scx_gamer::main's idiom (Arc<AtomicBool> shutdown flag polled between
// suspension points, log::info!/warn! at game_detect.rs's density).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};

use ccd_core::config::Config;
use ccd_core::cpulist::CpuList;
use ccd_core::error::Result;
use ccd_core::scanner::{self, ScanFilter};
use ccd_core::state::DaemonState;
use ccd_core::supervisor::{unit_name_for_game, SupervisorClient};
use ccd_core::topology::Topology;

/// Binding of a pid to the scope unit it was last attached to, plus the
/// start_time observed at attach time, used to defend against pid reuse.
#[derive(Debug, Clone, Copy)]
struct Binding {
    unit: UnitId,
    start_time: u64,
}

type UnitId = usize;

pub struct Reconciler {
    config: Config,
    supervisor: Box<dyn SupervisorClient>,
    topology: Topology,
    state: DaemonState,
    state_path: std::path::PathBuf,
    pid_unit: HashMap<u32, Binding>,
    unit_names: Vec<String>,
}

impl Reconciler {
    pub fn new(
        config: Config,
        supervisor: Box<dyn SupervisorClient>,
        topology: Topology,
        state: DaemonState,
        state_path: std::path::PathBuf,
    ) -> Self {
        Self {
            config,
            supervisor,
            topology,
            state,
            state_path,
            pid_unit: HashMap::new(),
            unit_names: Vec::new(),
        }
    }

    /// On boot: load state (already done by caller); if pin_applied and
    /// no games are currently running, restore and clear the flag.
    pub fn startup_recovery(&mut self) -> Result<()> {
        let games = self.scan_games()?;
        if self.state.pin_applied && games.is_empty() {
            info!("startup recovery: pin_applied but no games running, restoring");
            self.restore()?;
            self.state.pin_applied = false;
            if !self.config.dry_run {
                self.state.save(&self.state_path)?;
            }
        }
        Ok(())
    }

    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        while !shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.tick() {
                warn!("tick failed, will retry next interval: {e}");
            }
            std::thread::sleep(self.config.tick_interval);
        }
        self.on_shutdown()
    }

    pub fn on_shutdown(&mut self) -> Result<()> {
        if self.state.pin_applied {
            info!("shutdown: restoring managed slices");
            if let Err(e) = self.restore() {
                warn!("restore on shutdown failed, leaving pin_applied=true for next startup: {e}");
                return Ok(());
            }
            self.state.pin_applied = false;
        }
        if !self.config.dry_run {
            self.state.save(&self.state_path)?;
        }
        Ok(())
    }

    fn scan_games(&self) -> Result<std::collections::BTreeMap<String, Vec<scanner::ProcessRecord>>> {
        let filter = ScanFilter {
            uid: current_uid(),
            env_keys: self.config.env_keys.clone(),
            exe_allowlist: self.config.exe_allowlist.clone(),
            exe_ignorelist: self.config.exe_ignorelist.clone(),
        };
        scanner::scan(&self.config.proc_root, &filter)
    }

    pub fn tick(&mut self) -> Result<()> {
        let games = self.scan_games()?;

        if games.is_empty() {
            if self.state.pin_applied {
                info!("no games running, restoring managed slices");
                self.restore()?;
                self.state.pin_applied = false;
                if !self.config.dry_run {
                    self.state.save(&self.state_path)?;
                }
                self.pid_unit.clear();
            }
            return Ok(());
        }

        self.reapply_if_needed()?;

        let mut seen_pids: HashSet<u32> = HashSet::new();

        let mut game_ids: Vec<&String> = games.keys().collect();
        game_ids.sort();

        for game_id in game_ids {
            let records = &games[game_id];
            let unit = unit_name_for_game(&self.config.unit_prefix, game_id);
            let unit_id = self.intern_unit(&unit);
            let pids: Vec<u32> = records.iter().map(|r| r.pid).collect();
            seen_pids.extend(pids.iter().copied());

            let mut new_pids = Vec::new();
            for record in records {
                let is_new = match self.pid_unit.get(&record.pid) {
                    Some(binding) => binding.unit != unit_id || binding.start_time != record.start_time,
                    None => true,
                };
                if is_new {
                    new_pids.push(record.pid);
                }
            }

            let description = format!("ccdbind game scope for {game_id}");
            let created = self.supervisor.ensure_transient_scope(
                &unit,
                &pids,
                &self.config.parent_slice,
                &description,
            )?;

            let game_cpus = CpuList::parse(&self.topology.game_cpus.canonical())?;
            self.supervisor.set_allowed_cpus(&unit, &game_cpus)?;

            if created {
                for record in records {
                    self.pid_unit.insert(
                        record.pid,
                        Binding {
                            unit: unit_id,
                            start_time: record.start_time,
                        },
                    );
                }
            } else if !new_pids.is_empty() {
                self.supervisor.attach_processes_to_unit(&unit, "", &new_pids)?;
                for record in records {
                    if new_pids.contains(&record.pid) {
                        self.pid_unit.insert(
                            record.pid,
                            Binding {
                                unit: unit_id,
                                start_time: record.start_time,
                            },
                        );
                    }
                }
            }
        }

        self.pid_unit.retain(|pid, _| seen_pids.contains(pid));
        Ok(())
    }

    fn intern_unit(&mut self, name: &str) -> UnitId {
        if let Some(pos) = self.unit_names.iter().position(|n| n == name) {
            return pos;
        }
        self.unit_names.push(name.to_string());
        self.unit_names.len() - 1
    }

    /// §4.6.2: snapshot managed slices' current values on first pin;
    /// backfill missing entries only, adopting the current value as
    /// "original" only when it differs from os_cpus.
    fn reapply_if_needed(&mut self) -> Result<()> {
        let os_cpus = CpuList::parse(&self.topology.os_cpus.canonical())?;

        let mut current_values = HashMap::new();
        for slice in &self.config.managed_slices {
            let current = self.supervisor.get_allowed_cpus(slice)?;
            current_values.insert(slice.clone(), current);
        }

        let reapply_needed = !self.state.pin_applied
            || self
                .config
                .managed_slices
                .iter()
                .any(|s| current_values[s] != os_cpus)
            || self
                .config
                .managed_slices
                .iter()
                .any(|s| !self.state.original_allowed_cpus.contains_key(s) && current_values[s] != os_cpus);

        if !reapply_needed {
            return Ok(());
        }

        for slice in &self.config.managed_slices {
            if !self.state.original_allowed_cpus.contains_key(slice) {
                let current = &current_values[slice];
                let original = if *current != os_cpus {
                    current.canonical()
                } else {
                    String::new()
                };
                self.state.original_allowed_cpus.insert(slice.clone(), original);
            }
            self.supervisor.set_allowed_cpus(slice, &os_cpus)?;
        }

        self.state.pin_applied = true;
        self.state.os_cpus = self.topology.os_cpus.canonical();
        self.state.game_cpus = self.topology.game_cpus.canonical();
        self.state.last_pin_apply_ts = Some(chrono::Utc::now().timestamp());
        if !self.config.dry_run {
            self.state.save(&self.state_path)?;
        }
        Ok(())
    }

    /// §4.6.1: restore each managed slice to its recorded original.
    fn restore(&mut self) -> Result<()> {
        for slice in &self.config.managed_slices {
            let original = self
                .state
                .original_allowed_cpus
                .get(slice)
                .cloned()
                .unwrap_or_default();
            let list = CpuList::parse(&original)?;
            self.supervisor.set_allowed_cpus(slice, &list)?;
        }
        self.state.original_allowed_cpus.clear();
        self.state.last_restore_ts = Some(chrono::Utc::now().timestamp());
        Ok(())
    }
}

pub(crate) fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccd_core::cpulist::CpuList;
    use ccd_core::topology::Topology as CoreTopology;
    use std::cell::RefCell;
    use std::collections::HashMap as StdHashMap;

    struct FakeSupervisor {
        allowed: RefCell<StdHashMap<String, CpuList>>,
        existing_units: RefCell<HashSet<String>>,
        attach_calls: RefCell<Vec<(String, Vec<u32>)>>,
    }

    impl FakeSupervisor {
        fn new(slices: &[(&str, &str)]) -> Self {
            let mut allowed = StdHashMap::new();
            for (name, value) in slices {
                allowed.insert(name.to_string(), CpuList::parse(value).unwrap());
            }
            Self {
                allowed: RefCell::new(allowed),
                existing_units: RefCell::new(HashSet::new()),
                attach_calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl SupervisorClient for FakeSupervisor {
        fn start_unit(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        fn get_allowed_cpus(&self, unit: &str) -> Result<CpuList> {
            Ok(self
                .allowed
                .borrow()
                .get(unit)
                .cloned()
                .unwrap_or_else(CpuList::empty))
        }

        fn set_allowed_cpus(&self, unit: &str, list: &CpuList) -> Result<()> {
            self.allowed.borrow_mut().insert(unit.to_string(), list.clone());
            Ok(())
        }

        fn ensure_transient_scope(
            &self,
            unit_name: &str,
            _pids: &[u32],
            _parent_slice: &str,
            _description: &str,
        ) -> Result<bool> {
            let mut existing = self.existing_units.borrow_mut();
            if existing.contains(unit_name) {
                Ok(false)
            } else {
                existing.insert(unit_name.to_string());
                Ok(true)
            }
        }

        fn attach_processes_to_unit(&self, unit: &str, _subcgroup: &str, pids: &[u32]) -> Result<()> {
            self.attach_calls
                .borrow_mut()
                .push((unit.to_string(), pids.to_vec()));
            Ok(())
        }
    }

    fn topology_fixture() -> CoreTopology {
        CoreTopology {
            groups: vec![CpuList::parse("0-7").unwrap(), CpuList::parse("8-15").unwrap()],
            os_cpus: CpuList::parse("0-7").unwrap(),
            game_cpus: CpuList::parse("8-15").unwrap(),
        }
    }

    fn config_fixture() -> Config {
        let mut config = Config::default();
        config.managed_slices = vec!["app.slice".to_string(), "background.slice".to_string()];
        config
    }

    #[test]
    fn first_pin_snapshots_originals_and_sets_os_cpus() {
        let tmp = tempfile::tempdir().unwrap();
        let state_path = tmp.path().join("state.json");
        let supervisor = FakeSupervisor::new(&[("app.slice", ""), ("background.slice", "")]);

        let mut reconciler = Reconciler::new(
            config_fixture(),
            Box::new(supervisor),
            topology_fixture(),
            DaemonState::default(),
            state_path.clone(),
        );

        reconciler.reapply_if_needed().unwrap();

        assert!(reconciler.state.pin_applied);
        assert_eq!(
            reconciler.state.original_allowed_cpus.get("app.slice").unwrap(),
            ""
        );
    }

    #[test]
    fn reapply_backfills_without_clobbering_existing_original() {
        let tmp = tempfile::tempdir().unwrap();
        let state_path = tmp.path().join("state.json");
        let supervisor = FakeSupervisor::new(&[("app.slice", "0-7"), ("background.slice", "0-7")]);

        let mut state = DaemonState::default();
        state.pin_applied = true;
        state
            .original_allowed_cpus
            .insert("app.slice".to_string(), "2-3".to_string());

        let mut reconciler = Reconciler::new(
            config_fixture(),
            Box::new(supervisor),
            topology_fixture(),
            state,
            state_path,
        );

        reconciler.reapply_if_needed().unwrap();

        assert_eq!(
            reconciler.state.original_allowed_cpus.get("app.slice").unwrap(),
            "2-3"
        );
        // background.slice had no recorded original and was already at
        // os_cpus, so it backfills to empty (clear-on-restore).
        assert_eq!(
            reconciler.state.original_allowed_cpus.get("background.slice").unwrap(),
            ""
        );
    }

    #[test]
    fn restore_sets_each_slice_back_to_its_original() {
        let tmp = tempfile::tempdir().unwrap();
        let state_path = tmp.path().join("state.json");
        let supervisor = FakeSupervisor::new(&[("app.slice", "0-7"), ("background.slice", "0-7")]);

        let mut state = DaemonState::default();
        state.pin_applied = true;
        state
            .original_allowed_cpus
            .insert("app.slice".to_string(), String::new());
        state
            .original_allowed_cpus
            .insert("background.slice".to_string(), String::new());

        let mut reconciler = Reconciler::new(
            config_fixture(),
            Box::new(supervisor),
            topology_fixture(),
            state,
            state_path,
        );

        reconciler.restore().unwrap();
        assert!(reconciler.state.original_allowed_cpus.is_empty());
    }

    #[test]
    fn dry_run_reapply_mutates_supervisor_but_does_not_persist_state() {
        let tmp = tempfile::tempdir().unwrap();
        let state_path = tmp.path().join("state.json");
        let supervisor = FakeSupervisor::new(&[("app.slice", ""), ("background.slice", "")]);

        let mut config = config_fixture();
        config.dry_run = true;

        let mut reconciler = Reconciler::new(
            config,
            Box::new(supervisor),
            topology_fixture(),
            DaemonState::default(),
            state_path.clone(),
        );

        reconciler.reapply_if_needed().unwrap();

        assert!(reconciler.state.pin_applied);
        assert!(!state_path.exists(), "dry-run reapply must not write the state file");
    }
}
