//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_REMOTE_URL=https://sync.example.com                          │
//! │     TALLY_TOKEN=eyJ...                                                 │
//! │                                                                         │
//! │  2. SQLite Database (settings table)                                   │
//! │     Runtime preferences only: auto-sync on/off                         │
//! │                                                                         │
//! │  3. TOML Config File                                                   │
//! │     ~/.config/tally/sync.toml (Linux)                                  │
//! │     ~/Library/Application Support/com.tally.tally/sync.toml (macOS)    │
//! │                                                                         │
//! │  4. Default Values (lowest priority)                                   │
//! │     memory backend, auto-generated device id, 2 s debounce             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Laptop"
//!
//! [remote]
//! backend = "http"          # http | file | memory
//! url = "https://sync.example.com"
//! user_id = "alice"
//! request_timeout_secs = 15
//!
//! [session]
//! refresh_url = "https://auth.example.com/token"
//!
//! [sync]
//! auto_sync = true
//! debounce_ms = 2000
//! max_attempts = 3
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Remote Backend
// =============================================================================

/// Where the shared document lives.
///
/// ## Backends
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  HTTP     GET/PUT {url}/v1/users/{user_id}/ledger, bearer token        │
/// │  FILE     one JSON document on a shared path (sync folder, NAS)        │
/// │  MEMORY   in-process document; tests and local experiments             │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteBackend {
    Http,
    File,
    #[default]
    Memory,
}

impl std::fmt::Display for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteBackend::Http => write!(f, "http"),
            RemoteBackend::File => write!(f, "file"),
            RemoteBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for RemoteBackend {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" | "https" => Ok(RemoteBackend::Http),
            "file" | "folder" => Ok(RemoteBackend::File),
            "memory" | "mem" => Ok(RemoteBackend::Memory),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown remote backend: '{}'. Valid options: http, file, memory",
                other
            ))),
        }
    }
}

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Phone", "Laptop").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "Tally Device".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Remote Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    #[serde(default)]
    pub backend: RemoteBackend,

    /// Base URL for the HTTP backend.
    #[serde(default)]
    pub url: Option<String>,

    /// Document path for the file backend.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Owner of the remote document.
    #[serde(default = "default_user_id")]
    pub user_id: String,

    /// Deadline for one network attempt (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_user_id() -> String {
    "default".to_string()
}

fn default_request_timeout() -> u64 {
    15
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            backend: RemoteBackend::default(),
            url: None,
            path: None,
            user_id: default_user_id(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// Session Settings
// =============================================================================

/// Credential source for the remote store.
///
/// With only `token` set the credential is static. With `refresh_url` and
/// `refresh_token` set, the access token is exchanged whenever it is about
/// to expire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub refresh_url: Option<String>,

    #[serde(default)]
    pub refresh_token: Option<String>,
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Initial auto-sync preference. Once toggled at runtime, the value
    /// stored in the database wins.
    #[serde(default = "default_true")]
    pub auto_sync: bool,

    /// Quiet period after the last local change before an automatic sync.
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Attempts per network operation, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff duration (milliseconds) between attempts.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration (seconds) between attempts.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_debounce() -> u64 {
    2000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    10
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            auto_sync: true,
            debounce_ms: default_debounce(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl SyncSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite file. Defaults to `tally.db` in the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub remote: RemoteSettings,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(SyncError::InvalidConfig("device.id must not be empty".into()));
        }

        if self.remote.user_id.trim().is_empty() {
            return Err(SyncError::InvalidConfig("remote.user_id must not be empty".into()));
        }

        match self.remote.backend {
            RemoteBackend::Http => {
                let raw = self.remote.url.as_deref().ok_or_else(|| {
                    SyncError::InvalidConfig("remote.url is required for the http backend".into())
                })?;
                let parsed = url::Url::parse(raw)?;
                if parsed.scheme() != "http" && parsed.scheme() != "https" {
                    return Err(SyncError::InvalidUrl(format!(
                        "Remote URL must start with http:// or https://, got: {}",
                        raw
                    )));
                }
            }
            RemoteBackend::File => {
                if self.remote.path.is_none() {
                    return Err(SyncError::InvalidConfig(
                        "remote.path is required for the file backend".into(),
                    ));
                }
            }
            RemoteBackend::Memory => {}
        }

        if let Some(ref refresh) = self.session.refresh_url {
            url::Url::parse(refresh)?;
            if self.session.refresh_token.is_none() {
                return Err(SyncError::InvalidConfig(
                    "session.refresh_token is required with session.refresh_url".into(),
                ));
            }
        }

        if self.remote.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.sync.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(id) = var("TALLY_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(name) = var("TALLY_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Some(backend) = var("TALLY_REMOTE_BACKEND") {
            match backend.parse() {
                Ok(parsed) => self.remote.backend = parsed,
                Err(_) => warn!(backend = %backend, "Unknown remote backend in environment"),
            }
        }

        if let Some(url) = var("TALLY_REMOTE_URL") {
            debug!(url = %url, "Overriding remote URL from environment");
            self.remote.url = Some(url);
        }

        if let Some(path) = var("TALLY_REMOTE_PATH") {
            self.remote.path = Some(PathBuf::from(path));
        }

        if let Some(user) = var("TALLY_USER_ID") {
            self.remote.user_id = user;
        }

        if let Some(token) = var("TALLY_TOKEN") {
            self.session.token = Some(token);
        }

        if let Some(url) = var("TALLY_REFRESH_URL") {
            self.session.refresh_url = Some(url);
        }

        if let Some(token) = var("TALLY_REFRESH_TOKEN") {
            self.session.refresh_token = Some(token);
        }

        if let Some(auto) = var("TALLY_AUTO_SYNC") {
            match auto.to_lowercase().as_str() {
                "1" | "true" | "on" => self.sync.auto_sync = true,
                "0" | "false" | "off" => self.sync.auto_sync = false,
                _ => warn!(value = %auto, "Unknown TALLY_AUTO_SYNC value"),
            }
        }

        if let Some(ms) = var("TALLY_DEBOUNCE_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.sync.debounce_ms = ms;
            }
        }

        if let Some(path) = var("TALLY_DB_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "tally")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Resolved SQLite path.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .or_else(|| {
                directories::ProjectDirs::from("com", "tally", "tally")
                    .map(|dirs| dirs.data_dir().join("tally.db"))
            })
            .unwrap_or_else(|| PathBuf::from("tally.db"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("http".parse::<RemoteBackend>().unwrap(), RemoteBackend::Http);
        assert_eq!("HTTPS".parse::<RemoteBackend>().unwrap(), RemoteBackend::Http);
        assert_eq!("file".parse::<RemoteBackend>().unwrap(), RemoteBackend::File);
        assert_eq!("memory".parse::<RemoteBackend>().unwrap(), RemoteBackend::Memory);
        assert!("ftp".parse::<RemoteBackend>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.device.id.is_empty()); // Auto-generated
        assert_eq!(config.remote.backend, RemoteBackend::Memory);
        assert_eq!(config.sync.debounce(), Duration::from_secs(2));
        assert_eq!(config.sync.max_attempts, 3);
        assert!(config.sync.auto_sync);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.device.id = String::new();
        assert!(config.validate().is_err());
        config.device.id = "laptop".to_string();

        config.remote.backend = RemoteBackend::Http;
        assert!(config.validate().is_err()); // url missing

        config.remote.url = Some("ws://invalid".to_string());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.remote.url = Some("https://sync.example.com".to_string());
        assert!(config.validate().is_ok());

        config.remote.backend = RemoteBackend::File;
        assert!(config.validate().is_err()); // path missing
        config.remote.path = Some(PathBuf::from("/tmp/ledger.json"));
        assert!(config.validate().is_ok());

        config.sync.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_refresh_url_needs_refresh_token() {
        let mut config = SyncConfig::default();
        config.session.refresh_url = Some("https://auth.example.com/token".into());
        assert!(config.validate().is_err());
        config.session.refresh_token = Some("r-1".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("TALLY_REMOTE_BACKEND", "http"),
            ("TALLY_REMOTE_URL", "https://sync.example.com"),
            ("TALLY_USER_ID", "alice"),
            ("TALLY_AUTO_SYNC", "off"),
            ("TALLY_DEBOUNCE_MS", "50"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.remote.backend, RemoteBackend::Http);
        assert_eq!(config.remote.user_id, "alice");
        assert!(!config.sync.auto_sync);
        assert_eq!(config.sync.debounce_ms, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = SyncConfig::default();
        config.remote.backend = RemoteBackend::File;
        config.remote.path = Some(PathBuf::from("/srv/share/ledger.json"));

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[device]"));
        assert!(toml_str.contains("[remote]"));
        assert!(toml_str.contains("backend = \"file\""));

        let back: SyncConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.device.id, config.device.id);
        assert_eq!(back.remote.path, config.remote.path);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [remote]
            backend = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.max_attempts, 3);
        assert!(!config.device.id.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.toml");

        let mut config = SyncConfig::default();
        config.device.name = "Laptop".into();
        config.save(Some(path.clone())).unwrap();

        let loaded = SyncConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.device.name, "Laptop");
        assert_eq!(loaded.device.id, config.device.id);
    }
}
