//! Configuration loading and persistence.
//!
//! Handles reading and writing the gate configuration file
//! (`<config dir>/gate.json`) and applying `MESHFORGE_*` environment
//! overrides on top of it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::broker::{
    ConnectionBroker, TcpConnector, DEFAULT_HOST, DEFAULT_LOCK_TIMEOUT, DEFAULT_PORT,
};
use crate::cache::{default_cache_dir, CacheStore};

/// Configuration file name inside [`Config::config_dir`].
const CONFIG_FILE: &str = "gate.json";

/// Configuration for the daemon gate.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Daemon host.
    pub host: String,
    /// Daemon control port.
    pub port: u16,
    /// Bound on opening the daemon connection, in seconds. `0` means the
    /// default.
    pub connect_timeout_secs: u64,
    /// Default wait for a blocking acquire, in seconds.
    pub lock_timeout_secs: u64,
    /// Directory holding the fallback caches.
    pub cache_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout_secs: TcpConnector::DEFAULT_CONNECT_TIMEOUT.as_secs(),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT.as_secs(),
            cache_dir: default_cache_dir(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `MESHFORGE_CONFIG_DIR` env var: explicit override
    /// 2. Default: platform config dir (Linux: ~/.config/meshforge)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("MESHFORGE_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("meshforge")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing or unreadable file falls back to defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|e| {
            log::debug!("[config] using defaults: {e:#}");
            Self::default()
        });
        config.apply_env_overrides();
        config.cache_dir = expand_tilde(&config.cache_dir);
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join(CONFIG_FILE);
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("MESHFORGE_HOST") {
            if !host.trim().is_empty() {
                self.host = host.trim().to_string();
            }
        }

        if let Ok(port) = std::env::var("MESHFORGE_PORT") {
            if let Ok(port) = port.trim().parse::<u16>() {
                self.port = port;
            }
        }

        if let Ok(timeout) = std::env::var("MESHFORGE_CONNECT_TIMEOUT") {
            match timeout.trim().parse::<u64>() {
                Ok(timeout) if timeout > 0 => self.connect_timeout_secs = timeout,
                _ => log::warn!("[config] ignoring MESHFORGE_CONNECT_TIMEOUT={timeout}"),
            }
        }

        if let Ok(timeout) = std::env::var("MESHFORGE_LOCK_TIMEOUT") {
            if let Ok(timeout) = timeout.trim().parse::<u64>() {
                self.lock_timeout_secs = timeout;
            }
        }

        if let Ok(cache_dir) = std::env::var("MESHFORGE_CACHE_DIR") {
            self.cache_dir = PathBuf::from(cache_dir);
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Connect-side timeout. Sockets reject a zero timeout, so `0` maps to
    /// the connector default.
    pub fn connect_timeout(&self) -> Duration {
        match self.connect_timeout_secs {
            0 => TcpConnector::DEFAULT_CONNECT_TIMEOUT,
            secs => Duration::from_secs(secs),
        }
    }

    /// Default lock-wait timeout.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Cache store for `cache_dir`.
    pub fn cache(&self) -> CacheStore {
        CacheStore::new(&self.cache_dir)
    }

    /// Builds a broker wired to this configuration.
    pub fn broker(&self) -> ConnectionBroker {
        ConnectionBroker::new(self.cache())
            .with_connector(Arc::new(TcpConnector::new(self.connect_timeout())))
            .with_target(self.host.clone(), self.port)
    }
}

fn expand_tilde(path: &std::path::Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).as_ref())
}
