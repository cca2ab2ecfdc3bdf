//! Conversion from stored hosts to placement candidates.
//!
//! A host's capacity labels hold what is left; the total is recovered by
//! adding back what its active allocations consume.

use hostspool_state::{CAPACITY_LABELS, Host};

use crate::policy::Candidate;
use crate::resources::parse_quantity;

/// Build the placement candidate for a host.
///
/// The free ratio is the mean, over the capacity dimensions the host
/// declares, of remaining / total. Hosts without capacity labels use
/// `1 / (1 + allocations)`.
pub fn host_to_candidate(host: &Host) -> Candidate {
    let mut ratios = Vec::new();
    for key in CAPACITY_LABELS {
        let Some(remaining) = host.labels.get(key).and_then(|v| parse_quantity(v)) else {
            continue;
        };
        let consumed: u64 = host
            .allocations
            .iter()
            .filter_map(|a| a.resources.get(key))
            .filter_map(|v| parse_quantity(v))
            .map(|q| q.value)
            .sum();
        let total = remaining.value.saturating_add(consumed);
        let ratio = if total == 0 {
            0.0
        } else {
            remaining.value as f64 / total as f64
        };
        ratios.push(ratio);
    }

    let free_ratio = if ratios.is_empty() {
        1.0 / (1.0 + host.allocations.len() as f64)
    } else {
        ratios.iter().sum::<f64>() / ratios.len() as f64
    };

    Candidate {
        name: host.name.clone(),
        free_ratio,
        allocations: host.allocations.len(),
    }
}
