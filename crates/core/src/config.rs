//! Runtime configuration, loadable from JSON.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default per-report read timeout.
pub const DEFAULT_READ_TIMEOUT_MS: u32 = 1000;
/// Default retry budget for the device-info handshake.
pub const DEFAULT_HANDSHAKE_RETRIES: u32 = 2;

/// Protocol-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Deadline for each HID report read.
    pub read_timeout_ms: u32,
    /// Extra attempts for the session handshake on transient failures.
    pub handshake_retries: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            handshake_retries: DEFAULT_HANDSHAKE_RETRIES,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub protocol: ProtocolConfig,
}

impl Config {
    /// Parse configuration from a JSON string. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json(&json)
    }
}
