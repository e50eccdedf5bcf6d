//! Transfer engine tunables.
//!
//! Defaults, optionally overridden by a TOML file, then by CLI flags.

use crate::error::{LaunchError, Result};
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_START_PORT: u16 = 22356;
pub const DEFAULT_NUM_PORTS: u16 = 8;
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;
pub const DEFAULT_ACCEPT_POLL_MS: u64 = 100;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_LOG_NAME: &str = ".wdt.log";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferOptions {
    /// First port of the listening/connecting range
    pub start_port: u16,
    /// Number of consecutive ports (one connection each)
    pub num_ports: u16,
    /// Read/write chunk size in bytes
    pub buffer_size: usize,
    /// How often a waiting receiver re-checks the abort signal
    pub accept_poll_ms: u64,
    /// Sender connect timeout per port
    pub connect_timeout_secs: u64,
    /// Transfer log file name inside the root directory
    pub log_name: String,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            start_port: DEFAULT_START_PORT,
            num_ports: DEFAULT_NUM_PORTS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            accept_poll_ms: DEFAULT_ACCEPT_POLL_MS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            log_name: DEFAULT_LOG_NAME.to_string(),
        }
    }
}

impl TransferOptions {
    pub fn from_toml_str(s: &str, origin: &Path) -> Result<Self> {
        toml::from_str(s).map_err(|source| LaunchError::ConfigParse {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| LaunchError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_ports == 0 {
            return Err(LaunchError::Config("num_ports must be at least 1".into()));
        }
        if self.start_port == 0 {
            return Err(LaunchError::Config("start_port must be non-zero".into()));
        }
        if u32::from(self.start_port) + u32::from(self.num_ports) - 1 > u32::from(u16::MAX) {
            return Err(LaunchError::Config(format!(
                "port range {}+{} exceeds {}",
                self.start_port,
                self.num_ports,
                u16::MAX
            )));
        }
        if self.buffer_size == 0 {
            return Err(LaunchError::Config("buffer_size must be non-zero".into()));
        }
        if self.accept_poll_ms == 0 {
            return Err(LaunchError::Config("accept_poll_ms must be non-zero".into()));
        }
        if self.log_name.is_empty() || self.log_name.contains(['/', '\\']) {
            return Err(LaunchError::Config(format!(
                "log_name must be a plain file name, got {:?}",
                self.log_name
            )));
        }
        Ok(())
    }

    /// The configured port range, in order.
    pub fn ports(&self) -> Vec<u16> {
        (0..self.num_ports)
            .filter_map(|i| self.start_port.checked_add(i))
            .collect()
    }
}
