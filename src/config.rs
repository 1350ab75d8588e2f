//! Configuration for the notification relay.
//!
//! Loaded from environment variables (after `.env`, if present).
//! The upstream API key is never logged.

use std::path::PathBuf;
use std::time::Duration;

/// Default lookback window for the notification stream without a checkpoint
pub const NOTIFICATION_WINDOW_HOURS: u32 = 3;

/// Default lookback window for the cancellation stream without a checkpoint
pub const CANCELLATION_WINDOW_HOURS: u32 = 24;

/// Server and poller configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address
    pub bind_addr: String,

    /// Server port
    pub port: u16,

    // === Upstream ===
    /// Base URL of the upstream message source (background polling is
    /// disabled when unset)
    pub upstream_base_url: Option<String>,

    /// `X-API-Key` sent to the upstream source
    pub upstream_api_key: String,

    /// Fixed timeout for each upstream fetch (default: 15 seconds)
    pub fetch_timeout: Duration,

    // === Polling ===
    /// Foreground poll interval (default: 5 seconds)
    pub poll_interval: Duration,

    /// Period of background wake-ups on the server (default: 60 seconds)
    pub background_wake_interval: Duration,

    /// Lookback window without a checkpoint, notification stream
    pub notification_window_hours: u32,

    /// Lookback window without a checkpoint, cancellation stream
    pub cancellation_window_hours: u32,

    // === Ingestion ===
    /// Key required in `X-API-Key` on the save endpoints (open when unset)
    pub ingest_api_key: Option<String>,

    /// Whether the notification schema is provisioned at startup
    pub schema_ready: bool,

    // === Alert client ===
    /// Server the alert client posts batches to
    pub server_url: String,

    /// Where the alert client keeps its settings
    pub alert_settings_path: PathBuf,

    /// Command the alert client pipes WAV sounds into (e.g. `aplay -q`)
    pub alert_audio_player: Option<String>,

    /// Operator the alert client alerts for; only notifications routed to
    /// this user reach sound and desktop
    pub alert_user_id: Option<i64>,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| v == "true" || v == "1")
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            port: env_parse("PORT").unwrap_or(defaults.port),

            upstream_base_url: std::env::var("UPSTREAM_BASE_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            upstream_api_key: std::env::var("UPSTREAM_API_KEY").unwrap_or_default(),
            fetch_timeout: env_parse("FETCH_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),

            poll_interval: env_parse("POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            background_wake_interval: env_parse("BACKGROUND_WAKE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.background_wake_interval),
            notification_window_hours: env_parse("NOTIFICATION_WINDOW_HOURS")
                .unwrap_or(defaults.notification_window_hours),
            cancellation_window_hours: env_parse("CANCELLATION_WINDOW_HOURS")
                .unwrap_or(defaults.cancellation_window_hours),

            ingest_api_key: std::env::var("INGEST_API_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            schema_ready: env_flag("SCHEMA_READY").unwrap_or(defaults.schema_ready),

            server_url: std::env::var("SERVER_URL").unwrap_or(defaults.server_url),
            alert_settings_path: std::env::var("ALERT_SETTINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.alert_settings_path),
            alert_audio_player: std::env::var("ALERT_AUDIO_PLAYER")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            alert_user_id: env_parse::<i64>("ALERT_USER_ID").filter(|id| *id > 0),
        }
    }

    /// Check if background polling can run
    pub fn upstream_configured(&self) -> bool {
        self.upstream_base_url.is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            upstream_base_url: None,
            upstream_api_key: String::new(),
            fetch_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_secs(5),
            background_wake_interval: Duration::from_secs(60),
            notification_window_hours: NOTIFICATION_WINDOW_HOURS,
            cancellation_window_hours: CANCELLATION_WINDOW_HOURS,
            ingest_api_key: None,
            schema_ready: true,
            server_url: "http://127.0.0.1:8080".to_string(),
            alert_settings_path: PathBuf::from("alert-settings.json"),
            alert_audio_player: None,
            alert_user_id: None,
        }
    }
}
