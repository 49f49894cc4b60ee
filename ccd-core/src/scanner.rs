// SPDX-License-Identifier: GPL-2.0
//
// ccd-core: process table scanning and game identification.
//
// Grounded on scx_gamer::game_detect (the /proc walk, size-capped reads,
// panic-isolated per-pid handling) and scx_gamer::process_monitor
// (/proc/pid/stat field parsing for start_time). Unlike the teacher's
// single best-game scorer this performs identification against a
// priority list of environment keys and groups by game_id rather than
// picking one winner.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cpulist::CpuList;
use crate::error::{CcdError, Result};

/// Hard cap on bytes read from any single /proc file, mirroring
/// scx_gamer::game_detect's read_file_limited guard against a hostile or
/// malformed /proc entry exhausting memory.
const MAX_PROC_FILE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub start_time: u64,
    pub executable_basename: String,
    pub allowed_cpus: String,
    pub game_id: String,
    pub id_source: String,
}

#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub uid: u32,
    pub env_keys: Vec<String>,
    pub exe_allowlist: Vec<String>,
    pub exe_ignorelist: Vec<String>,
}

/// Scan `proc_root` for processes owned by `filter.uid`, returning them
/// grouped by game_id. Within a group, processes are ordered by ascending
/// pid.
pub fn scan(proc_root: &Path, filter: &ScanFilter) -> Result<BTreeMap<String, Vec<ProcessRecord>>> {
    let ignorelist: Vec<String> = filter
        .exe_ignorelist
        .iter()
        .map(|s| s.to_lowercase())
        .collect();
    let allowlist: Vec<String> = filter
        .exe_allowlist
        .iter()
        .map(|s| s.to_lowercase())
        .collect();

    let entries = fs::read_dir(proc_root)
        .map_err(|e| CcdError::ScanFailure(format!("cannot read {}: {e}", proc_root.display())))?;

    let mut out: BTreeMap<String, Vec<ProcessRecord>> = BTreeMap::new();

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let file_name = entry.file_name();
        let pid_str = match file_name.to_str() {
            Some(s) => s,
            None => continue,
        };
        let pid: u32 = match pid_str.parse() {
            Ok(p) => p,
            Err(_) => continue,
        };

        match scan_one(&entry.path(), pid, filter, &ignorelist, &allowlist) {
            Ok(Some(record)) => out.entry(record.game_id.clone()).or_default().push(record),
            Ok(None) => {}
            Err(ScanStep::NotFound) => {}
            Err(ScanStep::Fatal(msg)) => return Err(CcdError::ScanFailure(msg)),
        }
    }

    for records in out.values_mut() {
        records.sort_by_key(|r| r.pid);
    }

    Ok(out)
}

enum ScanStep {
    NotFound,
    Fatal(String),
}

/// Walk every process owned by `uid`, regardless of game identity, for
/// the Status Reporter's "all" mode: `(pid, executable_basename,
/// allowed_cpus)` for every user-owned process, no env/allowlist
/// filtering applied.
pub fn scan_all_basenames(proc_root: &Path, uid: u32) -> Result<Vec<(u32, String, String)>> {
    let entries = fs::read_dir(proc_root)
        .map_err(|e| CcdError::ScanFailure(format!("cannot read {}: {e}", proc_root.display())))?;

    let mut out = Vec::new();

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let pid: u32 = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            Some(p) => p,
            None => continue,
        };

        let pid_dir = entry.path();
        let status = match read_file_limited(&pid_dir.join("status")) {
            Ok(s) => s,
            Err(ScanStep::NotFound) => continue,
            Err(ScanStep::Fatal(msg)) => return Err(CcdError::ScanFailure(msg)),
        };
        let Some(process_uid) = parse_status_uid(&status) else {
            continue;
        };
        if process_uid != uid {
            continue;
        }

        let exe_basename = match read_exe_basename(&pid_dir) {
            Ok(b) => b,
            Err(ScanStep::NotFound) => continue,
            Err(ScanStep::Fatal(msg)) => return Err(CcdError::ScanFailure(msg)),
        };
        if exe_basename.is_empty() {
            continue;
        }

        let allowed_raw = parse_status_allowed_cpus(&status).unwrap_or_default();
        let allowed_cpus = CpuList::parse(&allowed_raw)
            .map(|c| c.canonical())
            .unwrap_or(allowed_raw);

        out.push((pid, exe_basename, allowed_cpus));
    }

    out.sort_by_key(|(pid, _, _)| *pid);
    Ok(out)
}

fn scan_one(
    pid_dir: &Path,
    pid: u32,
    filter: &ScanFilter,
    ignorelist: &[String],
    allowlist: &[String],
) -> std::result::Result<Option<ProcessRecord>, ScanStep> {
    let status = read_file_limited(&pid_dir.join("status"))?;
    let uid = parse_status_uid(&status).ok_or(ScanStep::NotFound)?;
    if uid != filter.uid {
        return Ok(None);
    }

    let exe_basename = read_exe_basename(pid_dir)?;
    if exe_basename.is_empty() {
        return Ok(None);
    }
    let exe_lower = exe_basename.to_lowercase();

    if ignorelist.iter().any(|i| i == &exe_lower) {
        return Ok(None);
    }

    let environ = read_file_limited(&pid_dir.join("environ"))?;
    let env_map = parse_environ(&environ);

    let (game_id, id_source) = match first_matching_env_key(&env_map, &filter.env_keys) {
        Some((key, value)) => (value, key),
        None => {
            if allowlist.iter().any(|a| a == &exe_lower) {
                (exe_basename.clone(), "exe".to_string())
            } else {
                return Ok(None);
            }
        }
    };

    let stat = read_file_limited(&pid_dir.join("stat"))?;
    let start_time = parse_stat_start_time(&stat).ok_or(ScanStep::NotFound)?;

    let allowed_cpus = parse_status_allowed_cpus(&status).unwrap_or_default();
    let allowed_cpus = CpuList::parse(&allowed_cpus)
        .map(|c| c.canonical())
        .unwrap_or(allowed_cpus);

    Ok(Some(ProcessRecord {
        pid,
        start_time,
        executable_basename: exe_basename,
        allowed_cpus,
        game_id,
        id_source,
    }))
}

fn read_file_limited(path: &Path) -> std::result::Result<String, ScanStep> {
    match fs::read(path) {
        Ok(mut bytes) => {
            bytes.truncate(MAX_PROC_FILE_BYTES);
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ScanStep::NotFound),
        Err(e) if e.raw_os_error() == Some(libc_esrch()) => Err(ScanStep::NotFound),
        Err(e) => Err(ScanStep::Fatal(format!("{}: {e}", path.display()))),
    }
}

/// ESRCH (3): the kernel returns this for /proc/pid/* reads against a pid
/// that exited between readdir() and open(). Hardcoded to avoid pulling
/// in libc solely for one errno constant.
fn libc_esrch() -> i32 {
    3
}

fn read_exe_basename(pid_dir: &Path) -> std::result::Result<String, ScanStep> {
    match fs::read_link(pid_dir.join("exe")) {
        Ok(target) => Ok(target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ScanStep::NotFound),
        Err(e) if e.raw_os_error() == Some(libc_esrch()) => Err(ScanStep::NotFound),
        // A gone or permission-denied exe link (kernel threads, other-owner
        // races) is not fatal to the whole scan; just skip this process.
        Err(_) => Ok(String::new()),
    }
}

/// Read a process's start_time directly, for crash-safety checks outside
/// the full scan (the wrapper coordinator's dead-instance pruning).
/// Returns `None` if the process is gone or unreadable.
pub fn read_start_time(proc_root: &Path, pid: u32) -> Option<u64> {
    let stat = fs::read_to_string(proc_root.join(pid.to_string()).join("stat")).ok()?;
    parse_stat_start_time(&stat)
}

fn parse_status_uid(status: &str) -> Option<u32> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            return rest.split_whitespace().next()?.parse().ok();
        }
    }
    None
}

fn parse_status_allowed_cpus(status: &str) -> Option<String> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Cpus_allowed_list:") {
            return Some(rest.trim().to_string());
        }
    }
    None
}

/// /proc/pid/stat: "pid (comm) state ppid ... start_time ...". The comm
/// field may itself contain spaces or parens, so split on the last ')'
/// rather than whitespace before counting fields.
fn parse_stat_start_time(stat: &str) -> Option<u64> {
    let close_paren = stat.rfind(')')?;
    let rest = &stat[close_paren + 1..];
    // rest begins with " state ppid pgrp session tty_nr tpgid flags ..."
    // field 3 (state) is rest's token index 0; start_time is field 22
    // overall, i.e. index 19 of `rest`.
    let fields: Vec<&str> = rest.split_whitespace().collect();
    fields.get(19)?.parse().ok()
}

fn parse_environ(raw: &str) -> BTreeMap<String, String> {
    raw.split('\0')
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn first_matching_env_key(
    env: &BTreeMap<String, String>,
    env_keys: &[String],
) -> Option<(String, String)> {
    for key in env_keys {
        if let Some(value) = env.get(key) {
            if !value.is_empty() {
                return Some((key.clone(), value.clone()));
            }
        }
    }
    None
}

/// Parse an ignorelist file: one basename per line, `#` comments and
/// blank lines ignored.
pub fn load_ignorelist_file(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .map_err(|e| CcdError::ScanFailure(format!("cannot read ignorelist {}: {e}", path.display())))?;
    Ok(contents
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.to_string())
        .collect())
}

pub fn default_ignorelist_path(config_home: &Path) -> PathBuf {
    config_home.join("ccdbind").join("ignorelist")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn write_proc_entry(
        root: &Path,
        pid: u32,
        uid: u32,
        comm: &str,
        exe_target: &str,
        env: &[(&str, &str)],
        allowed_cpus: &str,
        start_time: u64,
    ) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("status"),
            format!("Name:\t{comm}\nUid:\t{uid}\t{uid}\t{uid}\t{uid}\nCpus_allowed_list:\t{allowed_cpus}\n"),
        )
        .unwrap();

        // field 22 is start_time; fields 3..21 are filler, enough to push
        // the index out correctly regardless of their actual meaning here.
        let filler = "S 1 1 1 0 -1 4194304 0 0 0 0 0 0 0 0 20 0 1 0";
        fs::write(
            dir.join("stat"),
            format!("{pid} ({comm}) {filler} {start_time} 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0\n"),
        )
        .unwrap();

        let env_blob: String = env
            .iter()
            .map(|(k, v)| format!("{k}={v}\0"))
            .collect::<Vec<_>>()
            .join("");
        fs::write(dir.join("environ"), env_blob).unwrap();

        if !exe_target.is_empty() {
            let _ = symlink(exe_target, dir.join("exe"));
        }
    }

    fn default_filter(uid: u32) -> ScanFilter {
        ScanFilter {
            uid,
            env_keys: vec![
                "SteamAppId".to_string(),
                "SteamGameId".to_string(),
                "STEAM_COMPAT_APP_ID".to_string(),
            ],
            exe_allowlist: vec![],
            exe_ignorelist: vec![],
        }
    }

    #[test]
    fn identifies_process_by_steam_app_id() {
        let tmp = tempfile::tempdir().unwrap();
        write_proc_entry(
            tmp.path(),
            1000,
            1000,
            "game",
            "/usr/bin/game",
            &[("SteamAppId", "730")],
            "0-7",
            12345,
        );

        let result = scan(tmp.path(), &default_filter(1000)).unwrap();
        assert_eq!(result.len(), 1);
        let recs = &result["730"];
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].pid, 1000);
        assert_eq!(recs[0].id_source, "SteamAppId");
        assert_eq!(recs[0].start_time, 12345);
    }

    #[test]
    fn parse_stat_start_time_reads_field_22_not_21() {
        let filler = "S 1 1 1 0 -1 4194304 0 0 0 0 0 0 0 0 20 0 1 0";
        let stat = format!("1000 (game) {filler} 987654 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0\n");
        assert_eq!(parse_stat_start_time(&stat), Some(987654));
    }

    #[test]
    fn read_start_time_matches_parsed_stat_field() {
        let tmp = tempfile::tempdir().unwrap();
        write_proc_entry(
            tmp.path(),
            4242,
            1000,
            "game",
            "/usr/bin/game",
            &[("SteamAppId", "1")],
            "0-7",
            555555,
        );
        assert_eq!(read_start_time(tmp.path(), 4242), Some(555555));
    }

    #[test]
    fn filters_out_other_uids() {
        let tmp = tempfile::tempdir().unwrap();
        write_proc_entry(
            tmp.path(),
            1000,
            2000,
            "game",
            "/usr/bin/game",
            &[("SteamAppId", "730")],
            "0-7",
            1,
        );

        let result = scan(tmp.path(), &default_filter(1000)).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn earlier_priority_env_key_wins() {
        let tmp = tempfile::tempdir().unwrap();
        write_proc_entry(
            tmp.path(),
            1000,
            1000,
            "game",
            "/usr/bin/game",
            &[("SteamAppId", "730"), ("STEAM_COMPAT_APP_ID", "999")],
            "0-7",
            1,
        );

        let result = scan(tmp.path(), &default_filter(1000)).unwrap();
        let recs = &result["730"];
        assert_eq!(recs[0].id_source, "SteamAppId");
        assert!(!result.contains_key("999"));
    }

    #[test]
    fn allowlisted_exe_without_env_key_is_identified() {
        let tmp = tempfile::tempdir().unwrap();
        write_proc_entry(tmp.path(), 1000, 1000, "mygame", "/usr/bin/mygame", &[], "0-7", 1);

        let mut filter = default_filter(1000);
        filter.exe_allowlist = vec!["mygame".to_string()];

        let result = scan(tmp.path(), &filter).unwrap();
        let recs = &result["mygame"];
        assert_eq!(recs[0].id_source, "exe");

        filter.exe_allowlist.clear();
        let result = scan(tmp.path(), &filter).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn ignorelist_suppresses_match_even_with_env_key() {
        let tmp = tempfile::tempdir().unwrap();
        write_proc_entry(
            tmp.path(),
            1000,
            1000,
            "steam",
            "/usr/bin/steam",
            &[("SteamAppId", "1")],
            "0-7",
            1,
        );

        let mut filter = default_filter(1000);
        filter.exe_ignorelist = vec!["steam".to_string()];

        let result = scan(tmp.path(), &filter).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn process_with_no_executable_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        write_proc_entry(tmp.path(), 1000, 1000, "x", "", &[("SteamAppId", "1")], "0-7", 1);

        let result = scan(tmp.path(), &default_filter(1000)).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn load_ignorelist_file_skips_comments_and_blanks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ignorelist");
        fs::write(&path, "# comment\n\nsteam\nlutris\n").unwrap();
        let list = load_ignorelist_file(&path).unwrap();
        assert_eq!(list, vec!["steam".to_string(), "lutris".to_string()]);
    }

    #[test]
    fn scan_all_basenames_includes_processes_with_no_game_identity() {
        let tmp = tempfile::tempdir().unwrap();
        // No SteamAppId and not on any allowlist: scan() would drop this,
        // but scan_all_basenames must still report it for status --all.
        write_proc_entry(tmp.path(), 1000, 1000, "bash", "/usr/bin/bash", &[], "0-7", 1);
        write_proc_entry(tmp.path(), 2000, 9999, "bash", "/usr/bin/bash", &[], "0-7", 1);

        let result = scan_all_basenames(tmp.path(), 1000).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0], (1000, "bash".to_string(), "0-7".to_string()));
    }
}
