// Hub server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Auth token issuance lives outside the hub; the only auth
// knob here is the optional shared token compared during the handshake.

use std::net::SocketAddr;
use std::time::Duration;

/// Core hub server configuration.
///
/// Constructed via [`HubConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Opaque token every hello must present; `None` disables the check.
    pub shared_token: Option<String>,
    /// Heartbeat cadence advertised to clients in `hello_ack`.
    pub heartbeat_interval_ms: u64,
    /// Socket is closed after this long without a heartbeat frame.
    pub heartbeat_idle_ms: u64,
    /// Applied operations retained per document for transforms.
    pub history_horizon: usize,
    /// Events retained per entity for late joiners.
    pub event_history_cap: usize,
    /// Typing indicators expire after this inactivity window.
    pub typing_ttl_ms: u64,
    /// A user counts as online while `last_seen_at` is within this window.
    pub presence_liveness_ms: u64,
    /// Processed message ids are remembered this long.
    pub dedup_ttl_secs: u64,
    /// Maximum accepted WebSocket frame size.
    pub max_frame_bytes: u32,
    /// Log filter directive (e.g. `info`, `tandem_hub=debug`).
    pub log_filter: String,
}

impl HubConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TANDEM_HUB_HOST` | `0.0.0.0` |
    /// | `TANDEM_HUB_PORT` | `8080` |
    /// | `TANDEM_HUB_SHARED_TOKEN` | *(none; handshake accepts any token)* |
    /// | `TANDEM_HUB_HEARTBEAT_INTERVAL_MS` | `15000` |
    /// | `TANDEM_HUB_HEARTBEAT_IDLE_MS` | `45000` |
    /// | `TANDEM_HUB_HISTORY_HORIZON` | `512` |
    /// | `TANDEM_HUB_EVENT_HISTORY_CAP` | `256` |
    /// | `TANDEM_HUB_TYPING_TTL_MS` | `5000` |
    /// | `TANDEM_HUB_PRESENCE_LIVENESS_MS` | `45000` |
    /// | `TANDEM_HUB_DEDUP_TTL_SECS` | `600` |
    /// | `TANDEM_HUB_MAX_FRAME_BYTES` | `262144` |
    /// | `TANDEM_HUB_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub(crate) fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("TANDEM_HUB_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("TANDEM_HUB_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let shared_token = env("TANDEM_HUB_SHARED_TOKEN").ok().filter(|t| !t.trim().is_empty());

        let heartbeat_interval_ms =
            parse_or(&env, "TANDEM_HUB_HEARTBEAT_INTERVAL_MS", crate::ws::HEARTBEAT_INTERVAL_MS);
        let heartbeat_idle_ms =
            parse_or(&env, "TANDEM_HUB_HEARTBEAT_IDLE_MS", crate::ws::HEARTBEAT_IDLE_DISCONNECT_MS);
        let history_horizon = parse_or(&env, "TANDEM_HUB_HISTORY_HORIZON", 512);
        let event_history_cap = parse_or(&env, "TANDEM_HUB_EVENT_HISTORY_CAP", 256);
        let typing_ttl_ms = parse_or(&env, "TANDEM_HUB_TYPING_TTL_MS", 5_000);
        let presence_liveness_ms = parse_or(&env, "TANDEM_HUB_PRESENCE_LIVENESS_MS", 45_000);
        let dedup_ttl_secs = parse_or(&env, "TANDEM_HUB_DEDUP_TTL_SECS", 600);
        let max_frame_bytes =
            parse_or(&env, "TANDEM_HUB_MAX_FRAME_BYTES", crate::ws::MAX_FRAME_BYTES);

        let log_filter = env("TANDEM_HUB_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self {
            listen_addr,
            shared_token,
            heartbeat_interval_ms,
            heartbeat_idle_ms,
            history_horizon,
            event_history_cap,
            typing_ttl_ms,
            presence_liveness_ms,
            dedup_ttl_secs,
            max_frame_bytes,
            log_filter,
        }
    }

    pub fn heartbeat_idle(&self) -> Duration {
        Duration::from_millis(self.heartbeat_idle_ms)
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }

    pub fn presence_liveness(&self) -> Duration {
        Duration::from_millis(self.presence_liveness_ms)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
