//! Configuration management.
//!
//! WorkflowGuard configuration can come from:
//! - Environment variables (WFG_*)
//! - Config file (~/.config/workflowguard/config.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// WorkflowGuard configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// HubSpot API integration
    #[serde(default)]
    pub hubspot: HubSpotConfig,

    /// Snapshot scheduling
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// HubSpot API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSpotConfig {
    /// HubSpot API base URL
    #[serde(default = "default_hubspot_base_url")]
    pub base_url: String,

    /// Private app access token (OAuth token exchange is out of scope)
    #[serde(default)]
    pub access_token: Option<String>,

    /// Request timeout for HubSpot calls (seconds)
    #[serde(default = "default_hubspot_timeout")]
    pub timeout_seconds: u64,
}

impl Default for HubSpotConfig {
    fn default() -> Self {
        Self {
            base_url: default_hubspot_base_url(),
            access_token: None,
            timeout_seconds: default_hubspot_timeout(),
        }
    }
}

fn default_hubspot_base_url() -> String {
    "https://api.hubapi.com".to_string()
}

fn default_hubspot_timeout() -> u64 {
    30
}

/// Snapshot scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Cron expression for the periodic snapshot run (6-field, with seconds)
    #[serde(default = "default_snapshot_schedule")]
    pub schedule: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            schedule: default_snapshot_schedule(),
        }
    }
}

fn default_snapshot_schedule() -> String {
    // Every 15 minutes
    "0 */15 * * * *".to_string()
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("workflowguard"))
            .unwrap_or_else(|| PathBuf::from(".workflowguard"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("workflowguard"))
            .unwrap_or_else(|| PathBuf::from(".workflowguard"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("WFG_SERVER_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                self.server.port = parsed;
            }
        }
        if let Ok(host) = std::env::var("WFG_SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(path) = std::env::var("WFG_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Ok(url) = std::env::var("WFG_HUBSPOT_BASE_URL") {
            self.hubspot.base_url = url;
        }
        if let Ok(token) = std::env::var("WFG_HUBSPOT_TOKEN") {
            if !token.is_empty() {
                self.hubspot.access_token = Some(token);
            }
        }
        if let Ok(timeout) = std::env::var("WFG_HUBSPOT_TIMEOUT_SECONDS") {
            if let Ok(parsed) = timeout.parse::<u64>() {
                self.hubspot.timeout_seconds = parsed;
            }
        }
        if let Ok(schedule) = std::env::var("WFG_SNAPSHOT_SCHEDULE") {
            self.snapshot.schedule = schedule;
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(server) = partial.server {
            self.server = server;
        }
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
        if let Some(hubspot) = partial.hubspot {
            self.hubspot = hubspot;
        }
        if let Some(snapshot) = partial.snapshot {
            self.snapshot = snapshot;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    server: Option<ServerConfig>,
    storage: Option<StorageConfig>,
    hubspot: Option<HubSpotConfig>,
    snapshot: Option<SnapshotConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.hubspot.base_url, "https://api.hubapi.com");
        assert_eq!(config.hubspot.timeout_seconds, 30);
        assert_eq!(config.snapshot.schedule, "0 */15 * * * *");
    }

    #[test]
    fn test_partial_toml() {
        let partial: PartialConfig = toml::from_str(
            r#"
            [server]
            port = 9090

            [hubspot]
            base_url = "http://localhost:4010"
            "#,
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_partial(partial);
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.hubspot.base_url, "http://localhost:4010");
        // Untouched sections keep defaults
        assert_eq!(config.snapshot.schedule, "0 */15 * * * *");
    }
}
