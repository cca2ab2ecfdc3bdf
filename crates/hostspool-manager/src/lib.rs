//! hostspool-manager — hosts pool allocation and the delegate executor.
//!
//! The manager owns every mutation of the pool state. It reads hosts
//! from the `StateStore`, decides with `hostspool-placement`, and writes
//! back with compare-and-swap on the host checkpoint.
//!
//! # Architecture
//!
//! ```text
//! DelegateExecutor (install / uninstall of one deployment node)
//!   ├── DeploymentStore (node properties in, instance attributes out)
//!   └── HostsPoolManager
//!       ├── allocation lock (allocate + resource update pairing)
//!       ├── ConnectionChecker (host reachability on add / apply)
//!       └── StateStore (checkpointed host records)
//! ```

pub mod connection;
pub mod error;
pub mod executor;
pub mod manager;
pub mod topology;

pub use connection::{ConnectionChecker, NoopChecker, TcpChecker};
pub use error::{PoolError, PoolResult};
pub use executor::DelegateExecutor;
pub use manager::{
    AllocationOutcome, AllocationRequest, HostList, HostSpec, HostsPoolManager, ManagerOptions,
};
pub use topology::{DeploymentStore, MemoryDeployments, NodeState, PlacementPolicyDecl};
