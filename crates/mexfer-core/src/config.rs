//! Session configuration, loadable from TOML.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::device::TerminalCatalog;
use crate::transport::Backend;
use crate::transport::enip::DEFAULT_PORT;

/// Configuration shared by every terminal in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Transport backend.
    pub backend: Backend,
    /// EtherNet/IP TCP port.
    pub port: u16,
    /// Timeout of ordinary requests, in seconds.
    pub timeout_secs: u64,
    /// Timeout while flashing firmware, in seconds.
    pub flash_timeout_secs: u64,
    /// Wait after staging the firmware helper DLL, in milliseconds.
    pub helper_settle_ms: u64,
    /// Continue with terminals that fail validation.
    pub ignore_invalid: bool,
    /// Supported terminals.
    pub catalog: TerminalCatalog,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Enip,
            port: DEFAULT_PORT,
            timeout_secs: 10,
            flash_timeout_secs: 600,
            helper_settle_ms: 10_000,
            ignore_invalid: false,
            catalog: TerminalCatalog::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: SessionConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn flash_timeout(&self) -> Duration {
        Duration::from_secs(self.flash_timeout_secs)
    }

    pub fn helper_settle(&self) -> Duration {
        Duration::from_millis(self.helper_settle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mexfer.toml");
        let config = SessionConfig {
            backend: Backend::Mock,
            ignore_invalid: true,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(SessionConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SessionConfig = toml::from_str("backend = \"mock\"\ntimeout_secs = 3\n").unwrap();
        assert_eq!(config.backend, Backend::Mock);
        assert_eq!(config.timeout(), Duration::from_secs(3));
        assert_eq!(config.port, 44818);
        assert_eq!(config.catalog, TerminalCatalog::default());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(SessionConfig::load_from_file("/nonexistent/mexfer.toml").is_err());
    }
}
