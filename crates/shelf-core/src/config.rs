use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::Session;

/// Configuration for the shelf sync layer
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SyncSettings {
    /// Backend base URL (if None, runs in local-only mode)
    pub server_url: Option<String>,

    /// Public API key sent alongside the bearer token
    pub api_key: Option<String>,

    /// Sync automatically when the device comes back online
    #[serde(default = "default_auto_sync")]
    pub auto_sync: bool,

    /// Minimum time between automatic syncs, in seconds
    #[serde(default = "default_auto_sync_interval")]
    pub auto_sync_interval_secs: u64,

    /// Delay after reconnecting before an automatic sync starts, in milliseconds
    #[serde(default = "default_stabilization_delay")]
    pub stabilization_delay_ms: u64,

    /// Local schema version sent with every pull
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// Local schema migration info forwarded with every pull
    #[serde(default)]
    pub migration: Option<serde_json::Value>,

    /// How often the daemon probes connectivity, in seconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct StorageConfig {
    /// Path to the local SQLite database
    pub database_path: Option<PathBuf>,
}

/// Machine-specific state that should not be synced across devices
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct State {
    #[serde(default)]
    pub auth: AuthState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AuthState {
    /// Backend user identifier of the signed-in account
    pub user_id: Option<String>,

    /// Bearer token for the backend
    pub access_token: Option<String>,

    /// Expiration timestamp for the access token
    #[schemars(with = "Option<String>")]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

fn default_auto_sync() -> bool {
    true
}

fn default_auto_sync_interval() -> u64 {
    5 * 60 // 5 minutes
}

fn default_stabilization_delay() -> u64 {
    2000
}

fn default_schema_version() -> u32 {
    1
}

fn default_probe_interval() -> u64 {
    15
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: None,
            api_key: None,
            auto_sync: default_auto_sync(),
            auto_sync_interval_secs: default_auto_sync_interval(),
            stabilization_delay_ms: default_stabilization_delay(),
            schema_version: default_schema_version(),
            migration: None,
            probe_interval_secs: default_probe_interval(),
        }
    }
}

impl SyncSettings {
    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_secs(self.auto_sync_interval_secs)
    }

    pub fn stabilization_delay(&self) -> Duration {
        Duration::from_millis(self.stabilization_delay_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }
}

fn shelf_data_dir() -> Result<PathBuf> {
    let home_dir = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home_dir.join(".local").join("share").join("shelf"))
}

impl Config {
    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            let default_config = Self::default();
            default_config.save_to(&path)?;
            return Ok(default_config);
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, toml_str).context("Failed to write config file")?;
        Ok(())
    }

    /// `SHELF_CONFIG` if set, otherwise ~/.config/shelf/config.toml
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(custom_path) = std::env::var("SHELF_CONFIG") {
            return Ok(PathBuf::from(custom_path));
        }
        let home_dir = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home_dir.join(".config").join("shelf").join("config.toml"))
    }

    /// Get the database path, using the default if not configured
    pub fn database_path(&self) -> Result<PathBuf> {
        match self.storage.database_path {
            Some(ref path) => Ok(path.clone()),
            None => Ok(shelf_data_dir()?.join("shelf.db")),
        }
    }

    /// Generate JSON schema for the configuration
    pub fn generate_schema() -> Result<String> {
        let schema = schemars::schema_for!(Config);
        serde_json::to_string_pretty(&schema).context("Failed to serialize schema to JSON")
    }
}

impl State {
    /// Load state from the default location
    pub fn load() -> Result<Self> {
        let path = Self::state_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load state from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;

        let state: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

        Ok(state)
    }

    /// `SHELF_STATE` if set, otherwise ~/.local/share/shelf/state.toml
    pub fn state_path() -> Result<PathBuf> {
        if let Ok(custom_path) = std::env::var("SHELF_STATE") {
            return Ok(PathBuf::from(custom_path));
        }
        Ok(shelf_data_dir()?.join("state.toml"))
    }

    /// Check if the access token is present and not expired
    pub fn is_session_valid(&self) -> bool {
        match (&self.auth.user_id, &self.auth.access_token) {
            (Some(user_id), Some(token)) if !user_id.is_empty() && !token.is_empty() => self
                .auth
                .expires_at
                .map(|expires_at| chrono::Utc::now() < expires_at)
                .unwrap_or(true),
            _ => false,
        }
    }

    /// Authenticated session, if the stored credentials are usable
    pub fn session(&self) -> Option<Session> {
        if !self.is_session_valid() {
            return None;
        }
        Some(Session::new(
            self.auth.user_id.clone()?,
            self.auth.access_token.clone()?,
        ))
    }

    pub fn store_session(
        &mut self,
        user_id: String,
        access_token: String,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    ) {
        self.auth.user_id = Some(user_id);
        self.auth.access_token = Some(access_token);
        self.auth.expires_at = expires_at;
    }

    pub fn clear_session(&mut self) {
        self.auth = AuthState::default();
    }
}
