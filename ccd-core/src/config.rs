// SPDX-License-Identifier: GPL-2.0
//
// ccd-core: resolved configuration record.
//
// spec.md lists TOML loading as an external collaborator; this still
// carries the ambient config-loading stack every binary in the pack
// ships, following tools/scxtop's toml+serde precedent. Absence of a
// config file is not an error — defaults apply.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CcdError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub sysfs_root: PathBuf,
    pub proc_root: PathBuf,
    pub state_home: PathBuf,
    pub config_home: PathBuf,
    pub tick_interval: Duration,
    pub dry_run: bool,
    pub env_keys: Vec<String>,
    pub exe_allowlist: Vec<String>,
    pub exe_ignorelist: Vec<String>,
    pub exe_ignorelist_file: Option<PathBuf>,
    pub managed_slices: Vec<String>,
    pub unit_prefix: String,
    pub parent_slice: String,
    pub wrapper_os_slices: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            proc_root: PathBuf::from("/proc"),
            state_home: default_state_home(),
            config_home: default_config_home(),
            tick_interval: Duration::from_secs(2),
            dry_run: false,
            env_keys: vec![
                "SteamAppId".to_string(),
                "SteamGameId".to_string(),
                "STEAM_COMPAT_APP_ID".to_string(),
            ],
            exe_allowlist: Vec::new(),
            exe_ignorelist: Vec::new(),
            exe_ignorelist_file: None,
            managed_slices: vec!["app.slice".to_string(), "background.slice".to_string()],
            unit_prefix: "ccdbind-game-".to_string(),
            parent_slice: "game.slice".to_string(),
            wrapper_os_slices: vec!["app.slice".to_string(), "background.slice".to_string()],
        }
    }
}

fn default_state_home() -> PathBuf {
    dirs::state_dir().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".local/state")
    })
}

fn default_config_home() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
    })
}

/// On-disk shape of `<config_home>/ccdbind/config.toml`. Every field is
/// optional; unset fields fall back to `Config::default()`.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    sysfs_root: Option<PathBuf>,
    proc_root: Option<PathBuf>,
    tick_interval_secs: Option<u64>,
    dry_run: Option<bool>,
    env_keys: Option<Vec<String>>,
    exe_allowlist: Option<Vec<String>>,
    exe_ignorelist: Option<Vec<String>>,
    exe_ignorelist_file: Option<PathBuf>,
    managed_slices: Option<Vec<String>>,
    unit_prefix: Option<String>,
    parent_slice: Option<String>,
    wrapper_os_slices: Option<Vec<String>>,
}

impl Config {
    /// Load `<config_home>/ccdbind/config.toml` if present, applying
    /// defaults for anything absent. A missing file is not an error.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Config::default();

        let path = match config_path {
            Some(p) => Some(p.to_path_buf()),
            None => Some(config.config_home.join("ccdbind").join("config.toml")),
        };

        let Some(path) = path else {
            return Ok(config);
        };

        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(config),
            Err(e) => {
                return Err(CcdError::ConfigLoadFailed {
                    path: Some(path),
                    source: e.into(),
                })
            }
        };

        let raw: RawConfig = toml::from_str(&contents).map_err(|e| CcdError::ConfigLoadFailed {
            path: Some(path.clone()),
            source: e.into(),
        })?;

        if let Some(v) = raw.sysfs_root {
            config.sysfs_root = v;
        }
        if let Some(v) = raw.proc_root {
            config.proc_root = v;
        }
        if let Some(v) = raw.tick_interval_secs {
            config.tick_interval = Duration::from_secs(v);
        }
        if let Some(v) = raw.dry_run {
            config.dry_run = v;
        }
        if let Some(v) = raw.env_keys {
            config.env_keys = v;
        }
        if let Some(v) = raw.exe_allowlist {
            config.exe_allowlist = v;
        }
        if let Some(v) = raw.exe_ignorelist {
            config.exe_ignorelist = v;
        }
        if let Some(v) = raw.exe_ignorelist_file {
            config.exe_ignorelist_file = Some(v);
        }
        if let Some(v) = raw.managed_slices {
            config.managed_slices = v;
        }
        if let Some(v) = raw.unit_prefix {
            config.unit_prefix = v;
        }
        if let Some(v) = raw.parent_slice {
            config.parent_slice = v;
        }
        if let Some(v) = raw.wrapper_os_slices {
            config.wrapper_os_slices = v;
        }

        Ok(config)
    }
}

/// Parse a boolean environment-variable value per the accepted spellings:
/// truthy `{1,true,yes,y,on,enable,enabled}`, falsy
/// `{0,false,no,n,off,disable,disabled}`; any other non-empty value is
/// truthy.
pub fn parse_bool_env(raw: &str) -> bool {
    let lower = raw.trim().to_lowercase();
    match lower.as_str() {
        "0" | "false" | "no" | "n" | "off" | "disable" | "disabled" => false,
        "" => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nonexistent.toml");
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.unit_prefix, "ccdbind-game-");
        assert_eq!(config.parent_slice, "game.slice");
    }

    #[test]
    fn partial_config_overrides_only_specified_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "tick_interval_secs = 5\nunit_prefix = \"myprefix-\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.tick_interval, Duration::from_secs(5));
        assert_eq!(config.unit_prefix, "myprefix-");
        assert_eq!(config.parent_slice, "game.slice");
    }

    #[test]
    fn malformed_toml_is_config_load_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "this is not [ valid toml").unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(err, CcdError::ConfigLoadFailed { .. }));
    }

    #[test]
    fn bool_env_parsing_matches_accepted_spellings() {
        for truthy in ["1", "true", "YES", "y", "On", "enable", "enabled", "anything"] {
            assert!(parse_bool_env(truthy), "{truthy} should be truthy");
        }
        for falsy in ["0", "false", "No", "n", "off", "disable", "disabled", ""] {
            assert!(!parse_bool_env(falsy), "{falsy} should be falsy");
        }
    }
}
