// SPDX-License-Identifier: GPL-2.0
//
// ccdpin: multi-instance pin coordinator.
//
// The exclusive-lock-then-mutate-then-release lifecycle follows oddjobs's
// lock file pattern, adapted to nix::fcntl::flock since nix (already a
// teacher dependency, via the "fs" feature) already covers advisory
// locking without adding fs2.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use log::{info, warn};
use nix::fcntl::{flock, FlockArg};

use ccd_core::cpulist::CpuList;
use ccd_core::error::{CcdError, Result};
use ccd_core::scanner;
use ccd_core::state::WrapperState;
use ccd_core::supervisor::SupervisorClient;

pub struct LockGuard {
    _file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = flock(self._file.as_raw_fd(), FlockArg::Unlock);
    }
}

fn acquire_lock(lock_path: &Path) -> Result<LockGuard> {
    if let Some(dir) = lock_path.parent() {
        std::fs::create_dir_all(dir).map_err(|_| CcdError::LockContention(lock_path.to_path_buf()))?;
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(|_| CcdError::LockContention(lock_path.to_path_buf()))?;

    flock(file.as_raw_fd(), FlockArg::LockExclusive)
        .map_err(|_| CcdError::LockContention(lock_path.to_path_buf()))?;

    Ok(LockGuard { _file: file })
}

/// An instance is dead if its pid is gone, or alive but under a different
/// start_time (pid reuse).
fn prune_dead_instances(proc_root: &Path, state: &mut WrapperState) {
    state.instances.retain(|pid_str, recorded_start| {
        let pid: u32 = match pid_str.parse() {
            Ok(p) => p,
            Err(_) => return false,
        };
        match scanner::read_start_time(proc_root, pid) {
            Some(live_start) => live_start == *recorded_start,
            None => false,
        }
    });
}

/// Acquire coordinator responsibility for `self_pid`/`self_start_time`.
/// If this call makes the instance count 1, this caller is responsible
/// for pinning the configured OS slices to `os_cpus` and must roll back
/// on partial failure.
#[allow(clippy::too_many_arguments)]
pub fn acquire(
    proc_root: &Path,
    state_path: &Path,
    lock_path: &Path,
    supervisor: &dyn SupervisorClient,
    self_pid: u32,
    self_start_time: u64,
    os_slices: &[String],
    os_cpus: &CpuList,
    dry_run: bool,
) -> Result<()> {
    let _guard = acquire_lock(lock_path)?;

    let mut state = WrapperState::load(state_path)?;
    prune_dead_instances(proc_root, &mut state);
    state.instances.insert(self_pid.to_string(), self_start_time);

    if state.instances.len() == 1 {
        info!("first wrapper instance: pinning {} OS slices", os_slices.len());
        let mut applied: Vec<(String, CpuList)> = Vec::new();

        for slice in os_slices {
            let current = match supervisor.get_allowed_cpus(slice) {
                Ok(c) => c,
                Err(_) => {
                    // Slice does not exist (or is unreadable): tolerate and skip,
                    // mirroring the daemon's tolerance for absent managed slices.
                    continue;
                }
            };

            if let Err(e) = supervisor.set_allowed_cpus(slice, os_cpus) {
                warn!("failed to pin {slice}, rolling back previously-applied slices: {e}");
                for (rolled_slice, original) in applied.iter().rev() {
                    let _ = supervisor.set_allowed_cpus(rolled_slice, original);
                }
                state.instances.remove(&self_pid.to_string());
                return Err(e);
            }

            state
                .original_allowed_cpus
                .insert(slice.clone(), current.canonical());
            applied.push((slice.clone(), current));
        }

        state.os_cpus = os_cpus.canonical();
        state.slices = os_slices.to_vec();
    }

    state.updated_at = Some(chrono::Utc::now().timestamp());
    if !dry_run {
        state.save(state_path)?;
    }
    Ok(())
}

/// Release this instance's hold; if it was the last one, restore all
/// slices from the recorded originals and clear them.
pub fn release(
    proc_root: &Path,
    state_path: &Path,
    lock_path: &Path,
    supervisor: &dyn SupervisorClient,
    self_pid: u32,
    dry_run: bool,
) -> Result<()> {
    let _guard = acquire_lock(lock_path)?;

    let mut state = WrapperState::load(state_path)?;
    prune_dead_instances(proc_root, &mut state);
    state.instances.remove(&self_pid.to_string());

    if state.instances.is_empty() {
        info!("last wrapper instance releasing: restoring {} slices", state.slices.len());
        for slice in &state.slices {
            let original = state
                .original_allowed_cpus
                .get(slice)
                .cloned()
                .unwrap_or_default();
            let list = CpuList::parse(&original)?;
            if let Err(e) = supervisor.set_allowed_cpus(slice, &list) {
                warn!("failed to restore {slice} on release: {e}");
            }
        }
        state.original_allowed_cpus.clear();
        state.slices.clear();
        state.os_cpus.clear();
    }

    state.updated_at = Some(chrono::Utc::now().timestamp());
    if !dry_run {
        state.save(state_path)?;
    }
    Ok(())
}
