//! hostspool-state — coordination store for the hosts pool.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for pool hosts and location configurations.
//!
//! # Architecture
//!
//! Host records are JSON-serialized into redb's `&[u8]` value columns under
//! `{location}/{host}` keys. Every record carries a checkpoint; writes name
//! the checkpoint they were computed from and are rejected with
//! [`StateError::Conflict`] when it is stale. Each location also owns a
//! pool checkpoint bumped on every host write, guarding whole-pool updates.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across threads and async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{HostWrite, StateStore};
pub use types::*;
