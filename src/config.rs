//! Configuration management for the RAX file service
//!
//! Settings come from built-in defaults, an optional `config.toml`, and
//! `RAX_FS`-prefixed environment variables, in increasing order of precedence.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::middleware::AdmissionLimits;
use crate::protocol::DEFAULT_MAX_FRAME_BYTES;
use crate::service::TransferOptions;
use crate::transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_CONDUIT_CAPACITY};

/// Bytes a download frame adds around its chunk.
const FRAME_OVERHEAD: usize = 64;

/// Complete service configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub server: NetworkConfig,
    pub service: ServiceConfig,
    pub storage: StorageConfig,
}

/// Listener and framing settings
#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    /// IP address to listen on
    pub bind_address: String,
    pub port: u16,
    /// Largest frame accepted or produced on a connection
    pub max_frame_bytes: usize,
    /// Per-call deadline in seconds; 0 disables it
    pub call_timeout_secs: u64,
}

/// Admission limits and transfer tuning
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Concurrent uploads; non-positive selects the default (10)
    pub upload_limit: i64,
    /// Concurrent downloads; non-positive selects the default (10)
    pub download_limit: i64,
    /// Concurrent listings; non-positive selects the default (100)
    pub list_limit: i64,
    /// Download chunk size in bytes; non-positive selects the default (64 KiB)
    pub chunk_size: i64,
    /// Upload chunks buffered between the connection and the backend
    pub conduit_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Backend kind; only `filesystem` is built in
    pub backend: String,
    pub root: String,
}

impl ServerConfig {
    /// Load configuration from config.toml (if present) with environment overrides.
    ///
    /// Environment variables use the `RAX_FS` prefix and `__` between section
    /// and key, e.g. `RAX_FS_SERVICE__UPLOAD_LIMIT=4`.
    pub fn load() -> Result<Self, ConfigError> {
        // Container layout first, then the working directory
        let config_paths = ["rax-file-service/config", "config"];

        let mut builder = Self::defaults()?;
        for config_path in config_paths {
            builder = builder.add_source(File::with_name(config_path).required(false));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix("RAX_FS")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: ServerConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .set_default("server.bind_address", "127.0.0.1")?
            .set_default("server.port", 50051)?
            .set_default("server.max_frame_bytes", DEFAULT_MAX_FRAME_BYTES as u64)?
            .set_default("server.call_timeout_secs", 0)?
            .set_default("service.upload_limit", 0)?
            .set_default("service.download_limit", 0)?
            .set_default("service.list_limit", 0)?
            .set_default("service.chunk_size", DEFAULT_CHUNK_SIZE as u64)?
            .set_default("service.conduit_capacity", DEFAULT_CONDUIT_CAPACITY as u64)?
            .set_default("storage.backend", "filesystem")?
            .set_default("storage.root", "./storage_data")
    }

    /// Validation for all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Message("port cannot be 0".into()));
        }

        if self.storage.root.trim().is_empty() {
            return Err(ConfigError::Message("storage root cannot be empty".into()));
        }

        if self.storage.backend != "filesystem" {
            return Err(ConfigError::Message(format!(
                "unsupported storage backend '{}'",
                self.storage.backend
            )));
        }

        if self.service.conduit_capacity == 0 {
            return Err(ConfigError::Message(
                "conduit_capacity must be greater than 0".into(),
            ));
        }

        let needed = self.chunk_size() + FRAME_OVERHEAD;
        if self.server.max_frame_bytes < needed {
            return Err(ConfigError::Message(format!(
                "max_frame_bytes ({}) must be at least one chunk plus framing ({})",
                self.server.max_frame_bytes, needed
            )));
        }

        Ok(())
    }

    /// Listen address as a socket address
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.server.bind_address, self.server.port)
            .parse()
            .map_err(|e| {
                ConfigError::Message(format!(
                    "invalid bind address '{}:{}': {}",
                    self.server.bind_address, self.server.port, e
                ))
            })
    }

    /// Per-call deadline, if one is configured
    pub fn call_timeout(&self) -> Option<Duration> {
        match self.server.call_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn storage_root(&self) -> PathBuf {
        PathBuf::from(&self.storage.root)
    }

    pub fn admission_limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            upload_limit: self.service.upload_limit,
            download_limit: self.service.download_limit,
            list_limit: self.service.list_limit,
        }
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            chunk_size: self.chunk_size(),
            conduit_capacity: self.service.conduit_capacity,
        }
    }

    fn chunk_size(&self) -> usize {
        match self.service.chunk_size {
            size if size <= 0 => DEFAULT_CHUNK_SIZE,
            size => usize::try_from(size).unwrap_or(DEFAULT_CHUNK_SIZE),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: NetworkConfig {
                bind_address: "127.0.0.1".into(),
                port: 50051,
                max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
                call_timeout_secs: 0,
            },
            service: ServiceConfig {
                upload_limit: 0,
                download_limit: 0,
                list_limit: 0,
                chunk_size: DEFAULT_CHUNK_SIZE as i64,
                conduit_capacity: DEFAULT_CONDUIT_CAPACITY,
            },
            storage: StorageConfig {
                backend: "filesystem".into(),
                root: "./storage_data".into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.socket_addr().unwrap().port(), 50051);
        assert_eq!(config.call_timeout(), None);
        assert_eq!(config.transfer_options(), TransferOptions::default());
    }

    #[test]
    fn builder_defaults_deserialize() {
        let settings = ServerConfig::defaults().unwrap().build().unwrap();
        let config: ServerConfig = settings.try_deserialize().unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.server.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(config.storage.root, "./storage_data");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn non_positive_chunk_size_uses_default() {
        let mut config = ServerConfig::default();
        config.service.chunk_size = -5;
        assert_eq!(config.transfer_options().chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn rejects_zero_port() {
        let mut config = ServerConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_root() {
        let mut config = ServerConfig::default();
        config.storage.root = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_frame_smaller_than_chunk() {
        let mut config = ServerConfig::default();
        config.server.max_frame_bytes = DEFAULT_CHUNK_SIZE;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_backend() {
        let mut config = ServerConfig::default();
        config.storage.backend = "minio".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn call_timeout_from_seconds() {
        let mut config = ServerConfig::default();
        config.server.call_timeout_secs = 30;
        assert_eq!(config.call_timeout(), Some(Duration::from_secs(30)));
    }
}
