//! Domain types for the hosts pool store.
//!
//! These types represent the persisted state of pool hosts, their
//! allocations, and location configurations. All types are serializable
//! to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use hostspool_core::config::LocationConfig;

/// Remaining CPU count of a host.
pub const LABEL_NUM_CPUS: &str = "host.num_cpus";
/// Remaining memory of a host (size with unit, e.g. `16 GB`).
pub const LABEL_MEM_SIZE: &str = "host.mem_size";
/// Remaining disk of a host (size with unit).
pub const LABEL_DISK_SIZE: &str = "host.disk_size";
/// Built-in capacity labels, in the order they are reported.
pub const CAPACITY_LABELS: [&str; 3] = [LABEL_NUM_CPUS, LABEL_MEM_SIZE, LABEL_DISK_SIZE];

/// Prefix of labels listing the available items of a generic resource.
pub const GENERIC_RESOURCE_LABEL_PREFIX: &str = "host.resource.";

pub const LABEL_PRIVATE_ADDRESS: &str = "private_address";
pub const LABEL_PUBLIC_ADDRESS: &str = "public_address";

/// Build the composite key for the hosts table.
pub fn host_key(location: &str, name: &str) -> String {
    format!("{location}/{name}")
}

/// Key prefix selecting every host of a location, and only those.
pub fn location_prefix(location: &str) -> String {
    format!("{location}/")
}

// ── Host ──────────────────────────────────────────────────────────

/// Lifecycle status of a pool host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    #[default]
    Free,
    Allocated,
    /// Connection check failed; never an allocation candidate.
    Error,
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HostStatus::Free => "free",
            HostStatus::Allocated => "allocated",
            HostStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Settings used to open a remote session on a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Connection {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub private_key: String,
    /// 0 means the protocol default.
    #[serde(default)]
    pub port: u16,
}

impl Connection {
    /// Overlay the non-empty fields of `update` on top of `self`.
    pub fn merged_with(&self, update: &Connection) -> Connection {
        fn pick(new: &str, old: &str) -> String {
            let chosen = if new.is_empty() { old } else { new };
            chosen.to_string()
        }
        Connection {
            host: pick(&update.host, &self.host),
            user: pick(&update.user, &self.user),
            password: pick(&update.password, &self.password),
            private_key: pick(&update.private_key, &self.private_key),
            port: if update.port == 0 { self.port } else { update.port },
        }
    }
}

/// A pool member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Host {
    pub name: String,
    pub status: HostStatus,
    /// Reason for the `Error` status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub connection: Connection,
    /// Labels, with capacity labels holding the remaining capacity.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub allocations: Vec<Allocation>,
}

impl Host {
    pub fn new(name: &str, connection: Connection, labels: HashMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            status: HostStatus::Free,
            message: None,
            connection,
            labels,
            allocations: Vec::new(),
        }
    }

    /// Status implied by the current allocations.
    pub fn allocation_status(&self) -> HostStatus {
        if self.allocations.is_empty() {
            HostStatus::Free
        } else {
            HostStatus::Allocated
        }
    }

    /// Leave the error state, if any, and recompute the status.
    pub fn settle_status(&mut self) {
        self.message = None;
        self.status = self.allocation_status();
    }

    pub fn mark_error(&mut self, message: String) {
        self.status = HostStatus::Error;
        self.message = Some(message);
    }

    /// Position of the allocation of one node instance. Fields are
    /// compared one by one, so names containing `/` cannot alias.
    pub fn find_allocation(
        &self,
        deployment_id: &str,
        node_name: &str,
        instance: &str,
    ) -> Option<usize> {
        self.allocations
            .iter()
            .position(|a| a.is_for_node(deployment_id, node_name) && a.instance == instance)
    }

    /// Whether every current allocation accepts co-tenants.
    pub fn is_shared(&self) -> bool {
        self.allocations.iter().all(|a| a.shareable)
    }

    /// Available items of a generic resource.
    pub fn generic_resource_items(&self, name: &str) -> Vec<String> {
        self.labels
            .get(&format!("{GENERIC_RESOURCE_LABEL_PREFIX}{name}"))
            .map(|v| split_items(v))
            .unwrap_or_default()
    }
}

/// Split a comma-separated label value into trimmed, non-empty items.
pub fn split_items(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Allocation ────────────────────────────────────────────────────

/// Items of a generic resource consumed by an allocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenericResource {
    pub name: String,
    pub items: Vec<String>,
}

impl GenericResource {
    /// Host label holding the available items of this resource.
    pub fn label(&self) -> String {
        format!("{GENERIC_RESOURCE_LABEL_PREFIX}{}", self.name)
    }

    /// Attribute value written back to the instance.
    pub fn value(&self) -> String {
        self.items.join(",")
    }
}

/// Binding of one deployment node instance to a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Allocation {
    /// `{deployment_id}/{node_name}/{instance}`.
    pub id: String,
    pub deployment_id: String,
    pub node_name: String,
    pub instance: String,
    pub shareable: bool,
    /// Capacity consumed, keyed by capacity label.
    #[serde(default)]
    pub resources: HashMap<String, String>,
    #[serde(default)]
    pub generic_resources: Vec<GenericResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_policy: Option<String>,
    /// Recorded but its capacity not yet taken off the host labels.
    #[serde(default)]
    pub pending: bool,
}

impl Allocation {
    pub fn build_id(deployment_id: &str, node_name: &str, instance: &str) -> String {
        format!("{deployment_id}/{node_name}/{instance}")
    }

    /// Whether this allocation belongs to the given deployment node.
    pub fn is_for_node(&self, deployment_id: &str, node_name: &str) -> bool {
        self.deployment_id == deployment_id && self.node_name == node_name
    }
}

// ── Versioning ────────────────────────────────────────────────────

/// A stored value together with the checkpoint it was read at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Versioned<T> {
    pub checkpoint: u64,
    pub value: T,
}
