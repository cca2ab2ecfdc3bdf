//! hostspool.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Location type handled by the hosts pool.
pub const HOSTS_POOL_LOCATION_TYPE: &str = "hostspool";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// How many times a conflicting compare-and-swap write is retried
    /// after re-reading the host.
    #[serde(default = "default_max_update_retries")]
    pub max_update_retries: u32,
    /// Probe the host connection when hosts are added or updated.
    #[serde(default)]
    pub check_connections: bool,
    /// Probe timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

/// A location declared in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationConfig {
    pub name: String,
    #[serde(rename = "type", default = "default_location_type")]
    pub location_type: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/hostspool/pool.redb")
}

fn default_max_update_retries() -> u32 {
    5
}

fn default_connection_timeout_ms() -> u64 {
    2000
}

fn default_port() -> u16 {
    8800
}

fn default_location_type() -> String {
    HOSTS_POOL_LOCATION_TYPE.to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_update_retries: default_max_update_retries(),
            check_connections: false,
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl PoolConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PoolConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
