// SPDX-License-Identifier: GPL-2.0
//
// ccd-core: status snapshot.
//
// Simplified from scx_gamer::debug_api::DebugApiState's snapshot-then-
// serialize shape: a synchronous one-shot structure instead of a server
// resource, since ccdbind's `status` subcommand serializes it directly
// rather than serving it over HTTP.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::state::DaemonState;

#[derive(Debug, Clone, Serialize)]
pub struct SliceStatus {
    pub name: String,
    pub current_allowed_cpus: String,
    pub original_allowed_cpus: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObservedGame {
    pub game_id: String,
    pub unit_name: String,
    pub pids: Vec<u32>,
    pub allowed_cpus: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessGroup {
    pub class: String,
    pub executable_basename: String,
    pub count: usize,
    pub sample_pids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub config_path: Option<String>,
    pub state_path: String,
    pub os_cpus: String,
    pub game_cpus: String,
    pub pin_applied: bool,
    pub slices: Vec<SliceStatus>,
    pub games: Vec<ObservedGame>,
    pub all_groups: Option<Vec<ProcessGroup>>,
}

impl StatusSnapshot {
    pub fn from_state(
        config_path: Option<String>,
        state_path: String,
        state: &DaemonState,
        slices: Vec<SliceStatus>,
        games: Vec<ObservedGame>,
    ) -> Self {
        Self {
            config_path,
            state_path,
            os_cpus: state.os_cpus.clone(),
            game_cpus: state.game_cpus.clone(),
            pin_applied: state.pin_applied,
            slices,
            games,
            all_groups: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("state: {}\n", self.state_path));
        if let Some(cfg) = &self.config_path {
            out.push_str(&format!("config: {cfg}\n"));
        }
        out.push_str(&format!("os_cpus: {}\n", self.os_cpus));
        out.push_str(&format!("game_cpus: {}\n", self.game_cpus));
        out.push_str(&format!("pin_applied: {}\n", self.pin_applied));
        out.push_str("slices:\n");
        for slice in &self.slices {
            out.push_str(&format!(
                "  {}: current={} original={:?}\n",
                slice.name, slice.current_allowed_cpus, slice.original_allowed_cpus
            ));
        }
        out.push_str("games:\n");
        for game in &self.games {
            out.push_str(&format!(
                "  {} ({}): pids={:?}\n",
                game.game_id, game.unit_name, game.pids
            ));
        }
        if let Some(groups) = &self.all_groups {
            out.push_str("all:\n");
            for group in groups {
                out.push_str(&format!(
                    "  [{}] {} x{} sample={:?}\n",
                    group.class, group.executable_basename, group.count, group.sample_pids
                ));
            }
        }
        out
    }
}

/// Build the "all" mode grouping: every observed process constrained to
/// exactly `os_cpus` or exactly `game_cpus`, classified and sorted per
/// spec — class alphabetically, then descending count, then executable
/// name — with at most 8 sample pids retained per group.
pub fn classify_all_processes(
    os_cpus: &str,
    game_cpus: &str,
    observations: &[(u32, String, String)],
) -> Vec<ProcessGroup> {
    let mut groups: BTreeMap<(String, String), Vec<u32>> = BTreeMap::new();

    for (pid, exe, allowed) in observations {
        let class = if allowed == os_cpus {
            "os"
        } else if allowed == game_cpus {
            "game"
        } else {
            continue;
        };
        groups
            .entry((class.to_string(), exe.clone()))
            .or_default()
            .push(*pid);
    }

    let mut result: Vec<ProcessGroup> = groups
        .into_iter()
        .map(|((class, exe), mut pids)| {
            pids.sort();
            let count = pids.len();
            pids.truncate(8);
            ProcessGroup {
                class,
                executable_basename: exe,
                count,
                sample_pids: pids,
            }
        })
        .collect();

    result.sort_by(|a, b| {
        a.class
            .cmp(&b.class)
            .then_with(|| b.count.cmp(&a.count))
            .then_with(|| a.executable_basename.cmp(&b.executable_basename))
    });

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_into_os_and_game_groups() {
        let observations = vec![
            (1, "foo".to_string(), "0-7".to_string()),
            (2, "bar".to_string(), "8-15".to_string()),
            (3, "baz".to_string(), "99".to_string()),
        ];
        let groups = classify_all_processes("0-7", "8-15", &observations);
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().any(|g| g.class == "os" && g.executable_basename == "foo"));
        assert!(groups.iter().any(|g| g.class == "game" && g.executable_basename == "bar"));
    }

    #[test]
    fn ordering_is_class_then_count_then_name() {
        let observations = vec![
            (1, "a".to_string(), "0-7".to_string()),
            (2, "a".to_string(), "0-7".to_string()),
            (3, "b".to_string(), "0-7".to_string()),
        ];
        let groups = classify_all_processes("0-7", "8-15", &observations);
        assert_eq!(groups[0].executable_basename, "a");
        assert_eq!(groups[0].count, 2);
        assert_eq!(groups[1].executable_basename, "b");
    }

    #[test]
    fn sample_pids_capped_at_eight() {
        let observations: Vec<(u32, String, String)> = (1..=20)
            .map(|pid| (pid, "many".to_string(), "0-7".to_string()))
            .collect();
        let groups = classify_all_processes("0-7", "8-15", &observations);
        assert_eq!(groups[0].count, 20);
        assert_eq!(groups[0].sample_pids.len(), 8);
    }
}
