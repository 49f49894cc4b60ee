// SPDX-License-Identifier: GPL-2.0
//
// ccd-core: cache-topology detection.
//
// Grounded on scx_gamer::cpu_detect::CpuInfo::detect: a small sysfs/procfs
// reader that returns a Result<Self>, unit-tested against fixture strings
// rather than the live filesystem.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cpulist::CpuList;
use crate::error::{CcdError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Cache groups in ascending order of their minimum CPU id.
    pub groups: Vec<CpuList>,
    pub os_cpus: CpuList,
    pub game_cpus: CpuList,
}

impl Topology {
    /// Detect cache groups from `${sysfs_root}/devices/system/cpu/cpu*/cache/index*`.
    pub fn detect(sysfs_root: &Path) -> Result<Self> {
        let cpu_root = sysfs_root.join("devices/system/cpu");
        let entries = fs::read_dir(&cpu_root).map_err(|e| {
            CcdError::TopologyNotAvailable(format!("cannot read {}: {e}", cpu_root.display()))
        })?;

        // shared_cpu_list -> first-seen order, so groups come out stable
        // and reproducible across repeated detections on the same snapshot.
        let mut seen_order: Vec<String> = Vec::new();
        let mut seen_set: BTreeMap<String, ()> = BTreeMap::new();

        let mut cpu_dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| is_cpu_dir(p))
            .collect();
        cpu_dirs.sort();

        for cpu_dir in &cpu_dirs {
            if let Some(shared) = best_cache_shared_list(cpu_dir) {
                if !seen_set.contains_key(&shared) {
                    seen_set.insert(shared.clone(), ());
                    seen_order.push(shared);
                }
            }
        }

        if seen_order.is_empty() {
            return Err(CcdError::TopologyNotAvailable(
                "no cache groups found under devices/system/cpu/cpu*/cache".to_string(),
            ));
        }

        let mut groups: Vec<CpuList> = seen_order
            .iter()
            .map(|s| CpuList::parse(s))
            .collect::<Result<_>>()?;

        // Order is the ascending order of the minimum CPU in each group.
        groups.sort_by_key(|g| g.iter().next().unwrap_or(u32::MAX));

        let (os_cpus, game_cpus) = split_os_and_game(&groups);

        Ok(Self {
            groups,
            os_cpus,
            game_cpus,
        })
    }
}

fn split_os_and_game(groups: &[CpuList]) -> (CpuList, CpuList) {
    match groups.len() {
        0 => (CpuList::empty(), CpuList::empty()),
        1 => (groups[0].clone(), CpuList::empty()),
        _ => {
            let game_cpus = groups.last().cloned().unwrap_or_default();
            let os_cpus = groups[..groups.len() - 1]
                .iter()
                .fold(CpuList::empty(), |acc, g| acc.union(g));
            (os_cpus, game_cpus)
        }
    }
}

fn is_cpu_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("cpu") && n[3..].chars().all(|c| c.is_ascii_digit()) && !n[3..].is_empty())
        .unwrap_or(false)
}

/// Among `cache/index*`, select the one with the highest `level` whose
/// `type` is Unified or Data, and return its `shared_cpu_list` string.
fn best_cache_shared_list(cpu_dir: &Path) -> Option<String> {
    let cache_dir = cpu_dir.join("cache");
    let entries = fs::read_dir(&cache_dir).ok()?;

    let mut best: Option<(u32, String)> = None;

    for entry in entries.filter_map(|e| e.ok()) {
        let index_dir = entry.path();
        let name = index_dir.file_name()?.to_str()?;
        if !name.starts_with("index") {
            continue;
        }

        let cache_type = fs::read_to_string(index_dir.join("type")).ok()?;
        let cache_type = cache_type.trim();
        if cache_type != "Unified" && cache_type != "Data" {
            continue;
        }

        let level: u32 = fs::read_to_string(index_dir.join("level"))
            .ok()?
            .trim()
            .parse()
            .ok()?;

        let shared = fs::read_to_string(index_dir.join("shared_cpu_list"))
            .ok()?
            .trim()
            .to_string();

        if best.as_ref().map(|(lvl, _)| level > *lvl).unwrap_or(true) {
            best = Some((level, shared));
        }
    }

    best.map(|(_, shared)| shared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_cache_index(
        root: &Path,
        cpu: u32,
        index: u32,
        level: u32,
        cache_type: &str,
        shared_cpu_list: &str,
    ) {
        let dir = root
            .join("devices/system/cpu")
            .join(format!("cpu{cpu}"))
            .join("cache")
            .join(format!("index{index}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("level"), level.to_string()).unwrap();
        fs::write(dir.join("type"), cache_type).unwrap();
        fs::write(dir.join("shared_cpu_list"), shared_cpu_list).unwrap();
    }

    #[test]
    fn two_ccd_detection_matches_scenario_s1() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();

        for cpu in 0..8 {
            write_cache_index(root, cpu, 0, 1, "Data", "0-7");
            write_cache_index(root, cpu, 2, 3, "Unified", "0-7");
        }
        for cpu in 8..16 {
            write_cache_index(root, cpu, 0, 1, "Data", "8-15");
            write_cache_index(root, cpu, 2, 3, "Unified", "8-15");
        }

        let topo = Topology::detect(root).unwrap();
        assert_eq!(topo.os_cpus.canonical(), "0-7");
        assert_eq!(topo.game_cpus.canonical(), "8-15");
    }

    #[test]
    fn single_group_yields_empty_game_cpus() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        for cpu in 0..4 {
            write_cache_index(root, cpu, 2, 3, "Unified", "0-3");
        }

        let topo = Topology::detect(root).unwrap();
        assert_eq!(topo.os_cpus.canonical(), "0-3");
        assert!(topo.game_cpus.is_empty());
    }

    #[test]
    fn prefers_highest_level_matching_cache_type() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        // index0 (L1, Data) spans only this CPU; index3 (L3, Unified)
        // spans the whole CCX. Detector must follow the L3 grouping.
        write_cache_index(root, 0, 0, 1, "Data", "0");
        write_cache_index(root, 0, 3, 3, "Unified", "0-3");
        write_cache_index(root, 1, 0, 1, "Data", "1");
        write_cache_index(root, 1, 3, 3, "Unified", "0-3");

        let topo = Topology::detect(root).unwrap();
        assert_eq!(topo.groups.len(), 1);
        assert_eq!(topo.groups[0].canonical(), "0-3");
    }

    #[test]
    fn repeated_detection_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        for cpu in 0..4 {
            write_cache_index(root, cpu, 2, 3, "Unified", "0-3");
        }
        for cpu in 4..6 {
            write_cache_index(root, cpu, 2, 3, "Unified", "4-5");
        }

        let first = Topology::detect(root).unwrap();
        let second = Topology::detect(root).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_sysfs_root_is_topology_not_available() {
        let err = Topology::detect(Path::new("/nonexistent/sysfs/root")).unwrap_err();
        assert!(matches!(err, CcdError::TopologyNotAvailable(_)));
    }
}
