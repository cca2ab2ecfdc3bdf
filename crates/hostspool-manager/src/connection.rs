//! Host connection probing.
//!
//! A pool host must be reachable with its connection settings. Hosts
//! failing the probe are kept in the pool with the `error` status and are
//! never allocated until a later probe succeeds.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use hostspool_state::Connection;

/// Port probed when the connection does not set one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Verifies that a host can be reached with its connection settings.
pub trait ConnectionChecker: Send + Sync {
    /// `Err` carries the reason shown as the host status message.
    fn check(&self, connection: &Connection) -> Result<(), String>;
}

/// Accepts every connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopChecker;

impl ConnectionChecker for NoopChecker {
    fn check(&self, _connection: &Connection) -> Result<(), String> {
        Ok(())
    }
}

/// Opens a TCP connection to the host port.
#[derive(Debug, Clone, Copy)]
pub struct TcpChecker {
    timeout: Duration,
}

impl TcpChecker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ConnectionChecker for TcpChecker {
    fn check(&self, connection: &Connection) -> Result<(), String> {
        if connection.host.is_empty() {
            return Err("connection has no host address".to_string());
        }
        let port = if connection.port == 0 {
            DEFAULT_SSH_PORT
        } else {
            connection.port
        };
        let addrs = (connection.host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| format!("failed to resolve {}: {e}", connection.host))?;

        let mut last_error = format!("no address for {}", connection.host);
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(_) => {
                    debug!(%addr, "host connection check succeeded");
                    return Ok(());
                }
                Err(e) => last_error = format!("failed to connect to {addr}: {e}"),
            }
        }
        Err(last_error)
    }
}
