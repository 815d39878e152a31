use std::time::Duration;

/// Window without any inbound event after which the connection is treated as
/// silently dead and force-closed.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(30);
/// Seed delay for the reconnect backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(250);
/// Upper bound for the reconnect backoff.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(25);
/// Soft-deleted messages older than this are purged during sync.
pub const DEFAULT_TOMBSTONE_RETENTION: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// REST base url, e.g. `https://chat.example.com`.
    pub api_url: String,
    /// Realtime socket url, e.g. `wss://chat.example.com/connect`.
    pub ws_url: String,
    pub api_key: String,
    pub health_check_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Disable for deterministic reconnect timing in tests.
    pub backoff_jitter: bool,
    pub tombstone_retention: Duration,
}

impl ChatConfig {
    pub fn new(
        api_url: impl Into<String>,
        ws_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            ws_url: ws_url.into(),
            api_key: api_key.into(),
            ..Self::default()
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:3030".to_string(),
            ws_url: "ws://127.0.0.1:3030/connect".to_string(),
            api_key: String::new(),
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            backoff_jitter: true,
            tombstone_retention: DEFAULT_TOMBSTONE_RETENTION,
        }
    }
}
