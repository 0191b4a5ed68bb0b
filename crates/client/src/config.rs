// Client configuration: file-backed global settings and the runtime view.
//
// Global config lives at `~/.tandem/config.toml`. A missing file or missing
// fields fall back to defaults; the nested `[reconnect]` section rejects
// unknown keys so a typo fails loudly instead of silently using defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::queue::DEFAULT_QUEUE_CAPACITY;

/// Root directory for tandem state: `~/.tandem/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tandem"))
}

/// Path to the global config file: `~/.tandem/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|dir| dir.join("config.toml"))
}

/// Fallback hub endpoint for local development.
pub const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:8080/v1/ws";

// ── Global config ──────────────────────────────────────────────────

/// User-level configuration at `~/.tandem/config.toml`.
///
/// Auth tokens never live here; the session provider supplies them at
/// runtime and `ClientConfig::from_global` merges the two.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GlobalConfig {
    /// Hub WebSocket URL (e.g. `wss://hub.tandem.dev/v1/ws`).
    pub hub_url: Option<String>,
    /// Display name announced in presence.
    pub display_name: Option<String>,
    /// Outbound queue ceiling while disconnected.
    pub queue_capacity: Option<usize>,
    /// Reconnection backoff settings.
    pub reconnect: ReconnectSettings,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            hub_url: None,
            display_name: None,
            queue_capacity: None,
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl GlobalConfig {
    /// Load from `~/.tandem/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to `~/.tandem/config.toml`.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = global_config_path().ok_or_else(|| {
            ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "could not determine home directory",
            ))
        })?;
        self.save_to(&path)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Backoff knobs under `[reconnect]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectSettings {
    /// First retry delay in milliseconds.
    pub base_delay_ms: u64,
    /// Delay ceiling in milliseconds.
    pub max_delay_ms: u64,
    /// Attempts before giving up (`u32::MAX` = retry indefinitely).
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self { base_delay_ms: 250, max_delay_ms: 30_000, max_attempts: u32::MAX }
    }
}

// ── Runtime config ─────────────────────────────────────────────────

/// Reconnection parameters in runtime form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            max_attempts: settings.max_attempts,
        }
    }
}

/// Everything the connection manager needs to dial the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub hub_url: String,
    pub user_id: Uuid,
    pub display_name: String,
    /// Opaque token from the session provider, forwarded in `hello`.
    pub token: Option<String>,
    pub queue_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    /// Merge file config with the identity the session provider supplies.
    pub fn from_global(global: &GlobalConfig, user_id: Uuid, token: Option<String>) -> Self {
        Self {
            hub_url: global.hub_url.clone().unwrap_or_else(|| DEFAULT_HUB_URL.to_string()),
            user_id,
            display_name: global.display_name.clone().unwrap_or_else(|| "anonymous".to_string()),
            token,
            queue_capacity: global.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            reconnect: ReconnectPolicy::from(&global.reconnect),
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
