//! Configuration system for Terrace.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TERRACE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/terrace/config.toml
//!   3. ~/.config/terrace/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TerraceConfig {
    pub buffers: BuffersConfig,
    pub protocol: ProtocolConfig,
    pub group: GroupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuffersConfig {
    /// First chunk size allocated by an output stream.
    pub initial_block_size: usize,
    /// Ceiling for chunk growth and for consolidation at finalize.
    pub max_block_size: usize,
    /// Capacity of the chunks kept in the shared pool.
    pub pool_chunk_size: usize,
    /// How many free chunks the pool retains. Extra returns are dropped.
    pub pool_max_chunks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Largest payload a peer may declare in a header.
    pub max_message_size: u32,
    /// Compute an Adler-32 over outgoing headers.
    pub checksum: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Human-readable node name. Never part of identity equality.
    pub node_name: String,
    /// Upper bound on blocking request/response calls. 0 = wait for a
    /// response or for the peer to leave.
    pub wait_for_response_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for BuffersConfig {
    fn default() -> Self {
        Self {
            initial_block_size: crate::buffers::DEFAULT_INITIAL_BLOCK_SIZE,
            max_block_size: crate::buffers::DEFAULT_MAX_BLOCK_SIZE,
            pool_chunk_size: crate::buffers::DEFAULT_POOLED_CHUNK_SIZE,
            pool_max_chunks: crate::buffers::DEFAULT_MAX_POOLED_CHUNKS,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024 * 1024,
            checksum: false,
        }
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            node_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "terrace".to_string()),
            wait_for_response_ms: 0,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("terrace")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TerraceConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            TerraceConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse one file without consulting the environment.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TERRACE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TerraceConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TERRACE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TERRACE_PROTOCOL__CHECKSUM") {
            self.protocol.checksum = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("TERRACE_PROTOCOL__MAX_MESSAGE_SIZE") {
            if let Ok(n) = v.parse() {
                self.protocol.max_message_size = n;
            }
        }
        if let Ok(v) = std::env::var("TERRACE_BUFFERS__MAX_BLOCK_SIZE") {
            if let Ok(n) = v.parse() {
                self.buffers.max_block_size = n;
            }
        }
        if let Ok(v) = std::env::var("TERRACE_GROUP__NODE_NAME") {
            self.group.node_name = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = TerraceConfig::default();
        assert_eq!(config.buffers.initial_block_size, 32);
        assert_eq!(config.buffers.max_block_size, 512 * 1024);
        assert!(!config.protocol.checksum);
        assert_eq!(config.group.wait_for_response_ms, 0);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: TerraceConfig = toml::from_str(
            r#"
            [protocol]
            checksum = true
            "#,
        )
        .unwrap();
        assert!(config.protocol.checksum);
        assert_eq!(config.protocol.max_message_size, 64 * 1024 * 1024);
        assert_eq!(config.buffers.pool_chunk_size, 4096);
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("terrace-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("TERRACE_CONFIG", config_path.to_str().unwrap());
        }

        let path =
            TerraceConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = TerraceConfig::load_from(&path).expect("load should succeed");
        assert_eq!(config.buffers.max_block_size, 512 * 1024);

        unsafe {
            std::env::remove_var("TERRACE_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
