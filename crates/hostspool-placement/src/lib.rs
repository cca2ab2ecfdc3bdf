//! Hosts pool placement — filters, capacity accounting, and host selection.
//!
//! This crate makes pure decisions over host label sets. It does NOT touch
//! the store (that's `hostspool-manager`). Instead, it evaluates filters,
//! computes updated labels, and ranks candidate hosts.
//!
//! # Components
//!
//! - **`filter`** — Label predicates compiled from strings or synthesized
//! - **`resources`** — Numeric capacity and generic-resource arithmetic
//! - **`policy`** — Placement policies ranking candidate hosts
//! - **`convert`** — Host records to policy candidates

pub mod convert;
pub mod error;
pub mod filter;
pub mod policy;
pub mod resources;

pub use convert::host_to_candidate;
pub use error::{PlacementError, PlacementResult};
pub use filter::{CompareOp, Filter, matches_all};
pub use policy::{BIN_PACKING, Candidate, PlacementPolicy, WEIGHT_BALANCED, rank_candidates};
pub use resources::{
    ElementOp, GenericResourceDemand, GenericResourceRequest, LabelUpdate, Quantity, ResourceOp,
    Unit, available_labels, fits, normalize_labels, parse_quantity, remaining_from_declared,
    update_generic_resource_labels, update_resource_labels,
};
