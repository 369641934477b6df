//! Server configuration.

use crate::error::ConfigError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Default WebSocket port.
pub const DEFAULT_PORT: u16 = 4001;

/// Wall-clock budget for build + run.
pub const DEFAULT_DEADLINE_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Parent directory for server-created workspaces.
    pub workspace_root: PathBuf,
    pub deadline: Duration,
    /// Tokens approved at startup, held in memory only.
    pub trusted_tokens: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            workspace_root: default_workspace_root(),
            deadline: Duration::from_secs(DEFAULT_DEADLINE_SECS),
            trusted_tokens: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.host.is_loopback() {
            return Err(ConfigError::NotLoopback(self.host));
        }
        if self.deadline.is_zero() {
            return Err(ConfigError::ZeroDeadline);
        }
        if self.trusted_tokens.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::EmptyToken);
        }
        Ok(())
    }
}

pub fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("localexec")
}
