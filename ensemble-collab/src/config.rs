//! Server and client configuration.
//!
//! Every config has a `Default` suited to a local session and a
//! `for_testing()` constructor. Server and client configs load from JSON;
//! missing fields fall back to their defaults.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::storage::StoreConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub session_name: String,
    /// Session tick period, drives sync-queue processing
    pub tick_interval_ms: u64,
    /// Time budget per tick for time-sliced sync replay
    pub sync_time_budget_ms: u64,
    /// Outbound frames buffered per endpoint
    pub outbound_capacity: usize,
    /// Ledger persistence (None = in-memory only)
    pub storage: Option<StoreConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9190".to_string(),
            session_name: "Ensemble Session".to_string(),
            tick_interval_ms: 16,
            sync_time_budget_ms: 4,
            outbound_capacity: 4096,
            storage: None,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory ledger, fast ticks.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            session_name: "Test Session".to_string(),
            tick_interval_ms: 5,
            sync_time_budget_ms: 2,
            outbound_capacity: 1024,
            storage: None,
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load_json(path.as_ref())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn sync_time_budget(&self) -> Duration {
        Duration::from_millis(self.sync_time_budget_ms)
    }
}

/// Package size policy and content location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageManagerConfig {
    /// Root of the client's on-disk package files
    pub content_dir: PathBuf,
    /// Largest package embedded directly in a message
    pub max_inline_package_size: u64,
    /// Largest package accepted at all
    pub max_package_size: u64,
}

impl Default for PackageManagerConfig {
    fn default() -> Self {
        Self {
            content_dir: PathBuf::from("Content"),
            max_inline_package_size: 32 * 1024 * 1024,
            max_package_size: 512 * 1024 * 1024,
        }
    }
}

impl PackageManagerConfig {
    pub fn for_testing(content_dir: impl Into<PathBuf>) -> Self {
        Self {
            content_dir: content_dir.into(),
            max_inline_package_size: 1024,
            max_package_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionManagerConfig {
    /// Minimum time between two snapshots of the same transaction
    pub snapshot_min_interval_ms: u64,
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        Self {
            snapshot_min_interval_ms: 100,
        }
    }
}

impl TransactionManagerConfig {
    /// No snapshot throttling.
    pub fn for_testing() -> Self {
        Self {
            snapshot_min_interval_ms: 0,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the session server
    pub server_url: String,
    pub display_name: String,
    pub enable_live_sync: bool,
    /// Per-session persisted package revisions (None = not persisted)
    pub persisted_state_path: Option<PathBuf>,
    /// Shared directory for large packages (None = no side channel)
    pub file_share_dir: Option<PathBuf>,
    pub packages: PackageManagerConfig,
    pub transactions: TransactionManagerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9190".to_string(),
            display_name: "Anonymous".to_string(),
            enable_live_sync: true,
            persisted_state_path: None,
            file_share_dir: None,
            packages: PackageManagerConfig::default(),
            transactions: TransactionManagerConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn for_testing(content_dir: impl Into<PathBuf>) -> Self {
        Self {
            display_name: "Tester".to_string(),
            packages: PackageManagerConfig::for_testing(content_dir),
            transactions: TransactionManagerConfig::for_testing(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load_json(path.as_ref())
    }
}
