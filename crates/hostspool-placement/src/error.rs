//! Placement error types.

use thiserror::Error;

/// Errors raised while compiling filters, doing capacity arithmetic, or
/// resolving placement policies.
#[derive(Debug, Error, PartialEq)]
pub enum PlacementError {
    #[error("invalid filter {filter:?}: {reason}")]
    FilterSyntax { filter: String, reason: String },

    #[error("unsupported placement policy: {0}")]
    UnsupportedPolicy(String),

    #[error("invalid quantity {value:?} for {key}")]
    InvalidQuantity { key: String, value: String },

    #[error("generic resource {name:?} defines no ids for instance {instance}")]
    MissingInstanceIds { name: String, instance: usize },
}

pub type PlacementResult<T> = Result<T, PlacementError>;
