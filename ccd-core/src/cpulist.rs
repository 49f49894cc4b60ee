// SPDX-License-Identifier: GPL-2.0
//
// ccd-core: CPU-range string parsing and canonicalization.
//
// Grounded on rust/scx_utils/src/cpu_list.rs's `parse_cpu_list`: same
// token-splitting/range-validation shape, generalized to round-trip back
// to a canonical string instead of only producing a `Vec<usize>`.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::{CcdError, Result};

/// An ordered, deduplicated set of CPU ids, as found in `AllowedCPUs` /
/// `shared_cpu_list` sysfs files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuList(BTreeSet<u32>);

impl CpuList {
    pub fn empty() -> Self {
        Self(BTreeSet::new())
    }

    pub fn from_ids(ids: impl IntoIterator<Item = u32>) -> Self {
        Self(ids.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, cpu: u32) -> bool {
        self.0.contains(&cpu)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    pub fn union(&self, other: &CpuList) -> CpuList {
        CpuList(self.0.union(&other.0).copied().collect())
    }

    /// Parse a CPU-list string (`"0-3,8,10-11"`). Whitespace around tokens
    /// is tolerated. Empty input yields the empty set, not an error.
    pub fn parse(s: &str) -> Result<Self> {
        let mut ids = BTreeSet::new();

        for raw_token in s.split(',') {
            let token = raw_token.trim();
            if token.is_empty() {
                continue;
            }

            if let Some((lo_str, hi_str)) = token.split_once('-') {
                let lo = parse_cpu_id(s, lo_str)?;
                let hi = parse_cpu_id(s, hi_str)?;
                if lo > hi {
                    return Err(CcdError::InvalidCpuList {
                        input: s.to_string(),
                        reason: format!("inverted range {lo}-{hi}"),
                    });
                }
                ids.extend(lo..=hi);
            } else {
                ids.insert(parse_cpu_id(s, token)?);
            }
        }

        Ok(Self(ids))
    }

    /// Re-emit in canonical form: strictly increasing, runs of >= 2
    /// consecutive values collapsed into `lo-hi` ranges, singletons
    /// otherwise. `parse(canonicalize(x)) == parse(x)` and
    /// `canonicalize(canonicalize(x)) == canonicalize(x)` both hold.
    pub fn canonical(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }

        let mut parts = Vec::new();
        let mut iter = self.0.iter().copied().peekable();

        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end = iter.next().unwrap();
            }
            if end == start {
                parts.push(start.to_string());
            } else {
                parts.push(format!("{start}-{end}"));
            }
        }

        parts.join(",")
    }
}

impl fmt::Display for CpuList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

fn parse_cpu_id(whole: &str, token: &str) -> Result<u32> {
    token
        .trim()
        .parse::<u32>()
        .map_err(|_| CcdError::InvalidCpuList {
            input: whole.to_string(),
            reason: format!("invalid CPU id {token:?}"),
        })
}

/// Parse then immediately re-canonicalize a CPU-list string.
pub fn canonicalize(s: &str) -> Result<String> {
    Ok(CpuList::parse(s)?.canonical())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_unsorted_mixed_input() {
        assert_eq!(canonicalize("10-11,0-3,2,8").unwrap(), "0-3,8,10-11");
    }

    #[test]
    fn round_trip_is_idempotent() {
        for s in ["0-3,8,10-11", "5", "", "0,1,2,3,4", "7-7"] {
            let once = canonicalize(s).unwrap();
            let twice = canonicalize(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn empty_input_is_not_an_error() {
        assert_eq!(canonicalize("").unwrap(), "");
        assert_eq!(canonicalize("   ").unwrap(), "");
    }

    #[test]
    fn tolerates_whitespace_around_tokens() {
        assert_eq!(canonicalize(" 0 - 3 , 8 ").unwrap(), "0-3,8");
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(CpuList::parse("5-3").is_err());
    }

    #[test]
    fn rejects_malformed_token() {
        assert!(CpuList::parse("0-2,a").is_err());
        assert!(CpuList::parse("x").is_err());
    }

    #[test]
    fn run_of_two_consecutive_collapses_to_a_range() {
        assert_eq!(canonicalize("4,5").unwrap(), "4-5");
    }

    #[test]
    fn union_merges_and_dedupes() {
        let a = CpuList::parse("0-3").unwrap();
        let b = CpuList::parse("2-5").unwrap();
        assert_eq!(a.union(&b).canonical(), "0-5");
    }
}
