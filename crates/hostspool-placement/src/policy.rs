//! Placement policies for choosing among candidate hosts.
//!
//! Candidates reach this module already filtered (labels, capacity,
//! shareability). A policy only orders them:
//! - **Weight balanced**: least-loaded first (highest free ratio)
//! - **Bin packing**: most-loaded first (lowest free ratio)
//! - **Default** (no policy declared): host-name order
//!
//! Ties always break on host name so selection is reproducible.

use std::cmp::Ordering;

use crate::error::{PlacementError, PlacementResult};

/// Policy type spreading allocations over the least-loaded hosts.
pub const WEIGHT_BALANCED: &str = "hostspool.placement.WeightBalanced";

/// Policy type filling the most-loaded hosts first.
pub const BIN_PACKING: &str = "hostspool.placement.BinPacking";

/// A placement policy understood by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementPolicy {
    #[default]
    Default,
    WeightBalanced,
    BinPacking,
}

impl PlacementPolicy {
    /// Resolve a declared policy type; `None` or empty means no policy.
    pub fn from_type(policy_type: Option<&str>) -> PlacementResult<Self> {
        match policy_type.map(str::trim) {
            None | Some("") => Ok(PlacementPolicy::Default),
            Some(WEIGHT_BALANCED) => Ok(PlacementPolicy::WeightBalanced),
            Some(BIN_PACKING) => Ok(PlacementPolicy::BinPacking),
            Some(other) => Err(PlacementError::UnsupportedPolicy(other.to_string())),
        }
    }

    pub fn type_name(self) -> Option<&'static str> {
        match self {
            PlacementPolicy::Default => None,
            PlacementPolicy::WeightBalanced => Some(WEIGHT_BALANCED),
            PlacementPolicy::BinPacking => Some(BIN_PACKING),
        }
    }
}

/// A host that passed every filter, annotated with its load.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub name: String,
    /// Remaining over total capacity, in `0.0..=1.0`.
    pub free_ratio: f64,
    /// Active allocations on the host.
    pub allocations: usize,
}

fn by_ratio(a: &Candidate, b: &Candidate) -> Ordering {
    a.free_ratio.partial_cmp(&b.free_ratio).unwrap_or(Ordering::Equal)
}

/// Order candidates best first according to `policy`.
pub fn rank_candidates(policy: PlacementPolicy, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    match policy {
        PlacementPolicy::Default => candidates.sort_by(|a, b| a.name.cmp(&b.name)),
        PlacementPolicy::WeightBalanced => {
            candidates.sort_by(|a, b| by_ratio(b, a).then_with(|| a.name.cmp(&b.name)))
        }
        PlacementPolicy::BinPacking => {
            candidates.sort_by(|a, b| by_ratio(a, b).then_with(|| a.name.cmp(&b.name)))
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, free_ratio: f64) -> Candidate {
        Candidate {
            name: name.to_string(),
            free_ratio,
            allocations: 0,
        }
    }

    fn names(ranked: &[Candidate]) -> Vec<&str> {
        ranked.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn resolves_known_policies() {
        assert_eq!(PlacementPolicy::from_type(None), Ok(PlacementPolicy::Default));
        assert_eq!(PlacementPolicy::from_type(Some("")), Ok(PlacementPolicy::Default));
        assert_eq!(
            PlacementPolicy::from_type(Some(WEIGHT_BALANCED)),
            Ok(PlacementPolicy::WeightBalanced)
        );
        assert_eq!(
            PlacementPolicy::from_type(Some(BIN_PACKING)),
            Ok(PlacementPolicy::BinPacking)
        );
    }

    #[test]
    fn rejects_unknown_policy() {
        assert_eq!(
            PlacementPolicy::from_type(Some("hostspool.placement.Random")),
            Err(PlacementError::UnsupportedPolicy(
                "hostspool.placement.Random".to_string()
            ))
        );
    }

    #[test]
    fn weight_balanced_prefers_least_loaded() {
        let ranked = rank_candidates(
            PlacementPolicy::WeightBalanced,
            vec![candidate("a", 0.25), candidate("b", 1.0), candidate("c", 0.5)],
        );
        assert_eq!(names(&ranked), vec!["b", "c", "a"]);
    }

    #[test]
    fn bin_packing_prefers_most_loaded() {
        let ranked = rank_candidates(
            PlacementPolicy::BinPacking,
            vec![candidate("a", 0.25), candidate("b", 1.0), candidate("c", 0.5)],
        );
        assert_eq!(names(&ranked), vec!["a", "c", "b"]);
    }

    #[test]
    fn ties_break_on_name() {
        let ranked = rank_candidates(
            PlacementPolicy::WeightBalanced,
            vec![candidate("host23", 1.0), candidate("host21", 1.0), candidate("host22", 1.0)],
        );
        assert_eq!(names(&ranked), vec!["host21", "host22", "host23"]);
    }

    #[test]
    fn default_policy_orders_by_name() {
        let ranked = rank_candidates(
            PlacementPolicy::Default,
            vec![candidate("b", 0.1), candidate("a", 0.9)],
        );
        assert_eq!(names(&ranked), vec!["a", "b"]);
    }

    #[test]
    fn type_name_round_trips() {
        for policy in [PlacementPolicy::WeightBalanced, PlacementPolicy::BinPacking] {
            assert_eq!(PlacementPolicy::from_type(policy.type_name()), Ok(policy));
        }
        assert_eq!(PlacementPolicy::Default.type_name(), None);
    }
}
