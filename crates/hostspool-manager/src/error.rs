//! Hosts pool error types.

use thiserror::Error;

use hostspool_placement::PlacementError;
use hostspool_state::StateError;

/// Errors raised by the pool manager and the delegate executor.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("host {host:?} not found in location {location:?}")]
    HostNotFound { location: String, host: String },

    #[error("a host named {0:?} already exists")]
    DuplicateName(String),

    #[error("outdated checkpoint: expected {expected}, stored {found}")]
    OutdatedCheckpoint { expected: u64, found: u64 },

    #[error("host {0:?} is allocated")]
    HostAllocated(String),

    #[error("allocation {allocation:?} not found on host {host:?}")]
    AllocationNotFound { host: String, allocation: String },

    #[error("no host of location {location:?} matches the allocation of {allocation}")]
    NoCandidateHost { location: String, allocation: String },

    #[error("unsupported placement policy: {0}")]
    UnsupportedPlacementPolicy(String),

    #[error("invalid filter {filter:?}: {reason}")]
    FilterSyntax { filter: String, reason: String },

    #[error("node {0:?} declares more than one hosts pool placement policy")]
    MultiplePlacementPolicies(String),

    #[error("location {0:?} not found")]
    LocationNotFound(String),

    #[error("no hosts pool location configured")]
    NoLocation,

    #[error("invalid host name {0:?}")]
    InvalidHostName(String),

    #[error("invalid property {name}: {reason}")]
    InvalidProperty { name: String, reason: String },

    #[error("unsupported delegate operation {0:?}")]
    UnsupportedOperation(String),

    #[error(
        "failed to allocate a host to {deployment}/{node}/{instance} in location {location:?}: {source}"
    )]
    InstallFailed {
        deployment: String,
        node: String,
        instance: String,
        location: String,
        #[source]
        source: Box<PoolError>,
    },

    #[error(
        "errors encountered during hosts pool node release. Some hosts maybe not properly released: {}",
        .failures.join("; ")
    )]
    ReleaseFailed { failures: Vec<String> },

    #[error("placement error: {0}")]
    Placement(PlacementError),

    #[error("state store error: {0}")]
    State(StateError),

    #[error("deployment store error: {0}")]
    Deployment(#[from] anyhow::Error),
}

impl From<PlacementError> for PoolError {
    fn from(err: PlacementError) -> Self {
        match err {
            PlacementError::FilterSyntax { filter, reason } => {
                PoolError::FilterSyntax { filter, reason }
            }
            PlacementError::UnsupportedPolicy(policy) => {
                PoolError::UnsupportedPlacementPolicy(policy)
            }
            other => PoolError::Placement(other),
        }
    }
}

impl From<StateError> for PoolError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Conflict {
                expected, found, ..
            } => PoolError::OutdatedCheckpoint { expected, found },
            StateError::AlreadyExists(key) => PoolError::DuplicateName(key),
            other => PoolError::State(other),
        }
    }
}

impl PoolError {
    /// The underlying error, looking through the install context wrapper.
    pub fn root(&self) -> &PoolError {
        match self {
            PoolError::InstallFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
