//! Capacity arithmetic over host labels.
//!
//! Numeric capacity labels (`host.num_cpus`, `host.mem_size`,
//! `host.disk_size`) hold the *remaining* capacity of a host. Allocation
//! subtracts the consumed amount, release adds it back. Generic resources
//! are comma-separated item lists under `host.resource.<name>`; allocation
//! removes the consumed items and release puts them back.
//!
//! All functions here are pure: they take a label map and return a new one.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use hostspool_state::{
    Allocation, CAPACITY_LABELS, GENERIC_RESOURCE_LABEL_PREFIX, GenericResource, split_items,
};

use crate::error::{PlacementError, PlacementResult};
use crate::filter::Filter;

// ── Quantities ────────────────────────────────────────────────────

/// Unit attached to a quantity label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    /// Bare number (CPU counts, or sizes expressed in bytes).
    None,
    B,
    KB,
    MB,
    GB,
    TB,
    KiB,
    MiB,
    GiB,
    TiB,
}

const DECIMAL_UNITS: [Unit; 4] = [Unit::TB, Unit::GB, Unit::MB, Unit::KB];
const BINARY_UNITS: [Unit; 4] = [Unit::TiB, Unit::GiB, Unit::MiB, Unit::KiB];

impl Unit {
    pub fn factor(self) -> u64 {
        match self {
            Unit::None | Unit::B => 1,
            Unit::KB => 1_000,
            Unit::MB => 1_000_000,
            Unit::GB => 1_000_000_000,
            Unit::TB => 1_000_000_000_000,
            Unit::KiB => 1 << 10,
            Unit::MiB => 1 << 20,
            Unit::GiB => 1 << 30,
            Unit::TiB => 1 << 40,
        }
    }

    fn is_binary(self) -> bool {
        matches!(self, Unit::KiB | Unit::MiB | Unit::GiB | Unit::TiB)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Unit::None => "",
            Unit::B => "B",
            Unit::KB => "kB",
            Unit::MB => "MB",
            Unit::GB => "GB",
            Unit::TB => "TB",
            Unit::KiB => "KiB",
            Unit::MiB => "MiB",
            Unit::GiB => "GiB",
            Unit::TiB => "TiB",
        }
    }

    fn parse(s: &str) -> Option<Unit> {
        match s.to_ascii_lowercase().as_str() {
            "" => Some(Unit::None),
            "b" => Some(Unit::B),
            "kb" => Some(Unit::KB),
            "mb" => Some(Unit::MB),
            "gb" => Some(Unit::GB),
            "tb" => Some(Unit::TB),
            "kib" => Some(Unit::KiB),
            "mib" => Some(Unit::MiB),
            "gib" => Some(Unit::GiB),
            "tib" => Some(Unit::TiB),
            _ => None,
        }
    }
}

/// A parsed numeric label: value in base units plus the unit it was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantity {
    pub value: u64,
    pub unit: Unit,
}

impl Quantity {
    /// Canonical rendering of `value`: the largest unit of the family
    /// (decimal or binary) of `unit` dividing it exactly. The family never
    /// changes: decimal values fall back to bytes, binary values to a
    /// fractional KiB. Bare numbers stay bare. The result depends only on
    /// the value and the family, so add/subtract sequences that return to a
    /// value return to the same string.
    pub fn render(value: u64, unit: Unit) -> String {
        if unit == Unit::None {
            return value.to_string();
        }
        let family = if unit.is_binary() {
            BINARY_UNITS
        } else {
            DECIMAL_UNITS
        };
        for candidate in family {
            if value % candidate.factor() == 0 {
                return format!("{} {}", value / candidate.factor(), candidate.symbol());
            }
        }
        if unit.is_binary() {
            render_fractional_kib(value)
        } else {
            format!("{value} B")
        }
    }
}

/// `value` bytes as KiB with an exact decimal fraction (1/1024 terminates
/// after ten digits).
fn render_fractional_kib(value: u64) -> String {
    let kib = Unit::KiB.factor();
    let fraction = (value % kib) * 10_000_000_000 / kib;
    let digits = format!("{fraction:010}");
    format!(
        "{}.{} {}",
        value / kib,
        digits.trim_end_matches('0'),
        Unit::KiB.symbol()
    )
}

/// Parse `"4"`, `"2 GB"`, `"1.5GiB"`, `"512 MiB"` into a quantity.
pub fn parse_quantity(s: &str) -> Option<Quantity> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let unit = Unit::parse(unit.trim())?;
    if number.is_empty() {
        return None;
    }
    let value = if let Ok(int) = number.parse::<u64>() {
        int.checked_mul(unit.factor())?
    } else {
        let float: f64 = number.parse().ok()?;
        let scaled = float * unit.factor() as f64;
        if !scaled.is_finite() || scaled < 0.0 || scaled.fract() != 0.0 {
            return None;
        }
        scaled as u64
    };
    Some(Quantity { value, unit })
}

fn quantity_of(key: &str, value: &str) -> PlacementResult<Quantity> {
    parse_quantity(value).ok_or_else(|| PlacementError::InvalidQuantity {
        key: key.to_string(),
        value: value.to_string(),
    })
}

// ── Numeric capacity ──────────────────────────────────────────────

/// Direction of a numeric capacity update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceOp {
    Add,
    Subtract,
}

/// Direction of a generic-resource update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementOp {
    AddElements,
    RemoveElements,
}

/// Result of a label update: the new labels plus inconsistencies found.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LabelUpdate {
    pub labels: HashMap<String, String>,
    pub warnings: Vec<String>,
}

/// Apply `resources` to the numeric labels of a host.
///
/// Only keys present in both maps change; a host without a capacity label
/// has no accounting for that dimension. Subtracting below zero clamps to
/// zero and reports a warning.
pub fn update_resource_labels(
    labels: &HashMap<String, String>,
    resources: &HashMap<String, String>,
    op: ResourceOp,
) -> PlacementResult<LabelUpdate> {
    let mut update = LabelUpdate {
        labels: labels.clone(),
        warnings: Vec::new(),
    };
    for (key, delta) in resources {
        let Some(current) = labels.get(key) else {
            continue;
        };
        let current = quantity_of(key, current)?;
        let delta = quantity_of(key, delta)?;
        let value = match op {
            ResourceOp::Add => current.value.saturating_add(delta.value),
            ResourceOp::Subtract => match current.value.checked_sub(delta.value) {
                Some(v) => v,
                None => {
                    let msg = format!(
                        "capacity label {key} would drop below zero ({} - {}), clamped to 0",
                        current.value, delta.value
                    );
                    warn!(%key, "{msg}");
                    update.warnings.push(msg);
                    0
                }
            },
        };
        update
            .labels
            .insert(key.clone(), Quantity::render(value, current.unit));
    }
    Ok(update)
}

/// Whether the remaining capacity in `labels` covers `resources`.
/// Dimensions the host does not declare are not constrained.
pub fn fits(labels: &HashMap<String, String>, resources: &HashMap<String, String>) -> bool {
    resources.iter().all(|(key, required)| {
        let Some(available) = labels.get(key) else {
            return true;
        };
        match (parse_quantity(available), parse_quantity(required)) {
            (Some(available), Some(required)) => available.value >= required.value,
            _ => false,
        }
    })
}

// ── Generic resources ─────────────────────────────────────────────

/// Canonical form of an item list: trimmed, deduplicated, sorted.
fn canonical_items(mut items: Vec<String>) -> String {
    items.sort();
    items.dedup();
    items.join(",")
}

/// Rewrite capacity and `host.resource.*` labels in canonical form, so
/// that consuming then releasing restores the exact label value.
/// Unparsable capacity labels are kept verbatim.
pub fn normalize_labels(labels: &mut HashMap<String, String>) {
    for (key, value) in labels.iter_mut() {
        if key.starts_with(GENERIC_RESOURCE_LABEL_PREFIX) {
            *value = canonical_items(split_items(value));
        } else if CAPACITY_LABELS.contains(&key.as_str()) {
            if let Some(q) = parse_quantity(value) {
                *value = Quantity::render(q.value, q.unit);
            }
        }
    }
}

/// Add or remove consumed generic-resource items from the host labels.
pub fn update_generic_resource_labels(
    labels: &HashMap<String, String>,
    resources: &[GenericResource],
    op: ElementOp,
) -> LabelUpdate {
    let mut update = LabelUpdate {
        labels: labels.clone(),
        warnings: Vec::new(),
    };
    for resource in resources {
        let label = resource.label();
        let mut items = labels.get(&label).map(|v| split_items(v)).unwrap_or_default();
        match op {
            ElementOp::RemoveElements => {
                for item in &resource.items {
                    match items.iter().position(|i| i == item) {
                        Some(pos) => {
                            items.remove(pos);
                        }
                        None => {
                            let msg = format!("item {item:?} of {label} is not available");
                            warn!(%label, %item, "generic resource item missing");
                            update.warnings.push(msg);
                        }
                    }
                }
            }
            ElementOp::AddElements => {
                for item in &resource.items {
                    if items.contains(item) {
                        let msg = format!("item {item:?} of {label} is already available");
                        warn!(%label, %item, "generic resource item released twice");
                        update.warnings.push(msg);
                    } else {
                        items.push(item.clone());
                    }
                }
            }
        }
        update.labels.insert(label, canonical_items(items));
    }
    update
}

/// Labels of a host as seen by a new allocation: the stored labels minus
/// what the pending allocations are about to consume.
pub fn available_labels(
    labels: &HashMap<String, String>,
    allocations: &[Allocation],
) -> PlacementResult<HashMap<String, String>> {
    let mut available = labels.clone();
    for allocation in allocations.iter().filter(|a| a.pending) {
        available =
            update_resource_labels(&available, &allocation.resources, ResourceOp::Subtract)?.labels;
        available = update_generic_resource_labels(
            &available,
            &allocation.generic_resources,
            ElementOp::RemoveElements,
        )
        .labels;
    }
    Ok(available)
}

/// Remaining labels of a host whose declared (total) labels are `declared`
/// and which carries `allocations`. Pending allocations have not consumed
/// anything yet and are skipped.
pub fn remaining_from_declared(
    declared: &HashMap<String, String>,
    allocations: &[Allocation],
) -> PlacementResult<LabelUpdate> {
    let mut labels = declared.clone();
    normalize_labels(&mut labels);
    let mut update = LabelUpdate {
        labels,
        warnings: Vec::new(),
    };
    for allocation in allocations.iter().filter(|a| !a.pending) {
        let numeric =
            update_resource_labels(&update.labels, &allocation.resources, ResourceOp::Subtract)?;
        // Only resources the declaration lists; others keep their stored label.
        let declared_generic: Vec<GenericResource> = allocation
            .generic_resources
            .iter()
            .filter(|r| declared.contains_key(&r.label()))
            .cloned()
            .collect();
        let generic = update_generic_resource_labels(
            &numeric.labels,
            &declared_generic,
            ElementOp::RemoveElements,
        );
        update.labels = generic.labels;
        update.warnings.extend(numeric.warnings);
        update.warnings.extend(generic.warnings);
    }
    Ok(update)
}

// ── Generic resource requests ─────────────────────────────────────

/// Generic resource requested by a node, for all of its instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericResourceRequest {
    pub name: String,
    /// Specific items per instance: `ids[i]` is used by instance `i`.
    #[serde(default)]
    pub ids: Vec<Vec<String>>,
    /// Number of items per instance when no ids are given.
    #[serde(default)]
    pub number: usize,
}

impl GenericResourceRequest {
    /// Demand of the instance at `index`.
    pub fn for_instance(&self, index: usize) -> PlacementResult<GenericResourceDemand> {
        if self.ids.is_empty() {
            return Ok(GenericResourceDemand {
                name: self.name.clone(),
                ids: Vec::new(),
                count: self.number,
            });
        }
        let ids = self
            .ids
            .get(index)
            .ok_or_else(|| PlacementError::MissingInstanceIds {
                name: self.name.clone(),
                instance: index,
            })?;
        Ok(GenericResourceDemand {
            name: self.name.clone(),
            ids: ids.clone(),
            count: ids.len(),
        })
    }
}

/// Generic resource needed by one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericResourceDemand {
    pub name: String,
    /// Specific items required; empty means any `count` items.
    pub ids: Vec<String>,
    pub count: usize,
}

impl GenericResourceDemand {
    pub fn label(&self) -> String {
        format!("{GENERIC_RESOURCE_LABEL_PREFIX}{}", self.name)
    }

    /// Filter selecting hosts able to serve this demand.
    pub fn filter(&self) -> Filter {
        if self.ids.is_empty() {
            Filter::MinItems(self.label(), self.count)
        } else {
            Filter::Contains(self.label(), self.ids.clone())
        }
    }

    /// Items to consume from `available`, or `None` if the host cannot serve it.
    pub fn pick(&self, available: &[String]) -> Option<GenericResource> {
        let items = if self.ids.is_empty() {
            if available.len() < self.count {
                return None;
            }
            available[..self.count].to_vec()
        } else {
            if !self.ids.iter().all(|id| available.contains(id)) {
                return None;
            }
            self.ids.clone()
        };
        Some(GenericResource {
            name: self.name.clone(),
            items,
        })
    }
}
