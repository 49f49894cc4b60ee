// SPDX-License-Identifier: GPL-2.0
//
// ccd-core: persistent state stores.
//
// The atomic-write shape (serialize to a temp file in the same
// directory, flush, rename over target) follows oddjobs's lifecycle
// module; the serde JSON load/save idiom follows
// scx_gamer::ml_profiles::ProfileManager.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{CcdError, Result};

const DAEMON_STATE_VERSION: u32 = 1;
const WRAPPER_STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonState {
    pub version: u32,
    pub pin_applied: bool,
    pub original_allowed_cpus: BTreeMap<String, String>,
    pub os_cpus: String,
    pub game_cpus: String,
    pub last_pin_apply_ts: Option<i64>,
    pub last_restore_ts: Option<i64>,
}

impl Default for DaemonState {
    fn default() -> Self {
        Self {
            version: DAEMON_STATE_VERSION,
            pin_applied: false,
            original_allowed_cpus: BTreeMap::new(),
            os_cpus: String::new(),
            game_cpus: String::new(),
            last_pin_apply_ts: None,
            last_restore_ts: None,
        }
    }
}

impl DaemonState {
    pub fn load(path: &Path) -> Result<Self> {
        load_json_or_default(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut upgraded = self.clone();
        upgraded.version = DAEMON_STATE_VERSION;
        save_json_atomic(path, &upgraded).map_err(|e| CcdError::StateSaveFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WrapperState {
    pub version: u32,
    pub instances: BTreeMap<String, u64>,
    pub original_allowed_cpus: BTreeMap<String, String>,
    pub os_cpus: String,
    pub slices: Vec<String>,
    pub updated_at: Option<i64>,
}

impl Default for WrapperState {
    fn default() -> Self {
        Self {
            version: WRAPPER_STATE_VERSION,
            instances: BTreeMap::new(),
            original_allowed_cpus: BTreeMap::new(),
            os_cpus: String::new(),
            slices: Vec::new(),
            updated_at: None,
        }
    }
}

impl WrapperState {
    pub fn load(path: &Path) -> Result<Self> {
        load_json_or_default(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut upgraded = self.clone();
        upgraded.version = WRAPPER_STATE_VERSION;
        save_json_atomic(path, &upgraded).map_err(|e| CcdError::StateSaveFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

fn load_json_or_default<T>(path: &Path) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).map_err(|e| CcdError::StateLoadFailed {
            path: path.to_path_buf(),
            source: e.into(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(CcdError::StateLoadFailed {
            path: path.to_path_buf(),
            source: e.into(),
        }),
    }
}

fn save_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::result::Result<(), anyhow::Error> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("state path {} has no parent directory", path.display()))?;
    fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(value)?;
    let mut temp_file = NamedTempFile::new_in(dir)?;
    use std::io::Write;
    temp_file.write_all(json.as_bytes())?;
    temp_file.flush()?;
    temp_file.persist(path)?;
    Ok(())
}

pub fn daemon_state_path(state_home: &Path) -> PathBuf {
    state_home.join("ccdbind").join("state.json")
}

pub fn wrapper_state_path(state_home: &Path) -> PathBuf {
    state_home.join("ccdpin").join("state.json")
}

pub fn wrapper_lock_path(state_home: &Path) -> PathBuf {
    state_home.join("ccdpin").join("lock")
}
