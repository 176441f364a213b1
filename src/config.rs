//! Environment-driven server configuration.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::storage::{StorageBackend, StorageConfig};
use crate::sync::SyncServerConfig;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

/// Everything the binary needs to start
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub storage: StorageConfig,
    pub sync: SyncServerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            storage: StorageConfig::default(),
            sync: SyncServerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup`, falling back to defaults for
    /// unset variables
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(port) = parse_var(&lookup, "PORT")? {
            config.port = port;
        }
        if let Some(backend) = lookup("STORAGE_BACKEND") {
            let parsed = StorageBackend::from_str(&backend).map_err(|_| ConfigError::InvalidValue {
                name: "STORAGE_BACKEND",
                value: backend,
            })?;
            config.storage = config.storage.with_backend(parsed);
        }
        if let Some(path) = lookup("STORAGE_PATH") {
            config.storage.path = path;
        }
        if let Some(bytes) = parse_var(&lookup, "STORAGE_CACHE_BYTES")? {
            config.storage = config.storage.with_cache_size(bytes);
        }
        if let Some(retries) = parse_var::<usize>(&lookup, "MAX_CONFLICT_RETRIES")? {
            config = config.with_max_conflict_retries(retries);
        }
        if let Some(limit) = parse_var::<usize>(&lookup, "CHECKPOINT_CHAIN_LIMIT")? {
            config = config.with_checkpoint_chain_limit(limit);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CONFLICT_SWEEP_SECS")? {
            config = config.with_conflict_sweep_secs(secs);
        }

        Ok(config)
    }

    pub fn with_max_conflict_retries(mut self, retries: usize) -> Self {
        self.sync.max_conflict_retries = retries.max(1);
        self
    }

    pub fn with_checkpoint_chain_limit(mut self, limit: usize) -> Self {
        self.sync.checkpoint_chain_limit = limit.max(1);
        self
    }

    /// Sweep period in seconds; 0 disables the sweep
    pub fn with_conflict_sweep_secs(mut self, secs: u64) -> Self {
        self.sync.conflict_sweep_interval = (secs > 0).then(|| Duration::from_secs(secs));
        self
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}
