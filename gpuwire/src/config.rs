//! Connection tuning knobs.

use std::path::Path;
use std::fs;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Limits and sizes shared by both endpoints of a connection.
///
/// Serializes to JSON with every field optional on input; missing fields
/// take their defaults.
///
/// # Example
///
/// ```
/// use gpuwire::WireConfig;
///
/// let config = WireConfig::default()
///     .max_chunk_size(64 * 1024)
///     .staging_limit(Some(1 << 20));
/// assert_eq!(config.max_chunk_size, 64 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct WireConfig {
    /// Largest single transmission handed to the transport.
    pub max_chunk_size: usize,
    /// Size of the first block of a staging arena.
    pub initial_block_size: usize,
    /// Cap on the doubling growth of arena blocks.
    pub max_block_size: usize,
    /// Largest command a receiver accepts.
    pub max_command_size: usize,
    /// Scratch bytes a receiver may allocate while decoding one command.
    pub deserialize_budget: usize,
    /// Optional cap on the total memory of a staging arena.
    pub staging_limit: Option<usize>,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 1024 * 1024,
            initial_block_size: 2 * 1024,
            max_block_size: 16 * 1024,
            max_command_size: 256 * 1024 * 1024,
            deserialize_budget: 64 * 1024 * 1024,
            staging_limit: None,
        }
    }
}

impl WireConfig {
    /// Sets the largest single transmission (default: 1 MiB).
    #[must_use]
    pub const fn max_chunk_size(mut self, bytes: usize) -> Self {
        self.max_chunk_size = bytes;
        self
    }

    /// Sets the first arena block size (default: 2 KiB).
    #[must_use]
    pub const fn initial_block_size(mut self, bytes: usize) -> Self {
        self.initial_block_size = bytes;
        self
    }

    /// Sets the block growth cap (default: 16 KiB).
    #[must_use]
    pub const fn max_block_size(mut self, bytes: usize) -> Self {
        self.max_block_size = bytes;
        self
    }

    /// Sets the largest accepted command (default: 256 MiB).
    #[must_use]
    pub const fn max_command_size(mut self, bytes: usize) -> Self {
        self.max_command_size = bytes;
        self
    }

    /// Sets the per-command decode budget (default: 64 MiB).
    #[must_use]
    pub const fn deserialize_budget(mut self, bytes: usize) -> Self {
        self.deserialize_budget = bytes;
        self
    }

    /// Caps the memory of each staging arena (default: unlimited).
    #[must_use]
    pub const fn staging_limit(mut self, bytes: Option<usize>) -> Self {
        self.staging_limit = bytes;
        self
    }

    /// Parses a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = WireConfig::from_json(r#"{"max_chunk_size": 512}"#).unwrap();
        assert_eq!(config.max_chunk_size, 512);
        assert_eq!(config.max_block_size, 16 * 1024);
        assert_eq!(config.staging_limit, None);
    }

    #[test]
    fn json_roundtrip() {
        let config = WireConfig::default().staging_limit(Some(4096));
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(WireConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wire.json");
        fs::write(&path, r#"{"initial_block_size": 64}"#).unwrap();
        assert_eq!(WireConfig::load(&path).unwrap().initial_block_size, 64);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(WireConfig::from_json("{").is_err());
    }
}
