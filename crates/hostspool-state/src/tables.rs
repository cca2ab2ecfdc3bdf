//! redb table definitions for the hosts pool store.
//!
//! Each table uses `&str` keys. Host keys follow `{location}/{host}`; the
//! trailing `/` of the location prefix keeps `lab` and `lab2` apart.

use redb::TableDefinition;

/// Versioned host records keyed by `{location}/{host}`.
pub const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");

/// Pool checkpoints keyed by location name.
pub const POOL_CHECKPOINTS: TableDefinition<&str, u64> = TableDefinition::new("pool_checkpoints");

/// Location configurations keyed by location name.
pub const LOCATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("locations");
