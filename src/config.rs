//! Runtime configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file
//! (or no file at all) yields a working single-host setup.

use crate::error::{Result, SyncError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of connection handlers in the worker pool
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Default maximum frame payload (64MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024;

/// Default chunk size for transfers (256KB)
pub const DEFAULT_CHUNK_SIZE: u32 = 256 * 1024;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7420";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root of the synchronized tree
    pub data_dir: PathBuf,
    pub listen_addr: String,
    /// Fixed worker pool capacity
    pub max_connections: usize,
    pub max_message_size: u64,
    pub chunk_size: u32,
    /// Bounded wait for a version record lease; unset waits forever
    pub lock_timeout_ms: Option<u64>,
    pub require_auth: bool,
    /// Peer names allowed to authenticate (empty = any)
    pub allowed_peers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            lock_timeout_ms: None,
            require_auth: false,
            allowed_peers: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.data_dir = expand_tilde(&config.data_dir);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(SyncError::Config("max_connections must be > 0".into()));
        }
        if self.chunk_size == 0 {
            return Err(SyncError::Config("chunk_size must be > 0".into()));
        }
        // A full FileChunk must fit in one frame, with room for its header.
        if u64::from(self.chunk_size) + 1024 > self.max_message_size {
            return Err(SyncError::Config(format!(
                "chunk_size {} does not fit in max_message_size {}",
                self.chunk_size, self.max_message_size
            )));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn is_peer_allowed(&self, peer: &str) -> bool {
        self.allowed_peers.is_empty() || self.allowed_peers.iter().any(|p| p == peer)
    }
}

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}
