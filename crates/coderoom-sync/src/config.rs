//! Configuration for sessions, the server and stored preferences.

use coderoom_doc::{Identity, DEFAULT_EXPIRY_MS};
use coderoom_sandbox::Language;
use std::time::Duration;
use tracing::debug;

/// Timing of the background work a session does while connected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    /// How often to send anti-entropy `SYNC_REQUEST`s (in milliseconds).
    pub sync_interval_ms: u64,
    /// Minimum spacing of cursor publications (in milliseconds).
    pub presence_interval_ms: u64,
    /// Inactivity window after which presence entries expire.
    pub presence_expiry_ms: u64,
    /// How often the local presence entry is refreshed and stale ones swept.
    pub heartbeat_interval_ms: u64,
    /// How long to wait for `WELCOME` after `JOIN`.
    pub handshake_timeout_ms: u64,
    /// Capacity of message channels.
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 5_000,
            presence_interval_ms: 100,
            presence_expiry_ms: DEFAULT_EXPIRY_MS,
            heartbeat_interval_ms: 10_000,
            handshake_timeout_ms: 5_000,
            channel_capacity: 256,
        }
    }
}

/// Builder for sync configuration.
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn sync_interval(mut self, ms: u64) -> Self {
        self.config.sync_interval_ms = ms;
        self
    }

    pub fn presence_interval(mut self, ms: u64) -> Self {
        self.config.presence_interval_ms = ms;
        self
    }

    pub fn presence_expiry(mut self, ms: u64) -> Self {
        self.config.presence_expiry_ms = ms;
        self
    }

    pub fn heartbeat_interval(mut self, ms: u64) -> Self {
        self.config.heartbeat_interval_ms = ms;
        self
    }

    pub fn handshake_timeout(mut self, ms: u64) -> Self {
        self.config.handshake_timeout_ms = ms;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconnection policy of a client session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub auto_reconnect: bool,
    /// Attempts per outage before the session gives up and disconnects.
    pub max_reconnect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_reconnect_attempts: 10,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
        }
    }
}

impl ClientConfig {
    /// Delay before reconnect attempt `attempt` (starting at 0): doubles
    /// each time up to the maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.backoff_max_ms),
        )
    }
}

/// Builder for client configuration.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    pub fn backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.config.backoff_base_ms = base_ms;
        self.config.backoff_max_ms = max_ms.max(base_ms);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings of the WebSocket server and its hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Per-connection outbound queue; a full queue drops messages.
    pub channel_capacity: usize,
    pub presence_expiry_ms: u64,
    /// How often expired presence entries are swept.
    pub sweep_interval_ms: u64,
    /// How long a new connection may take to send `JOIN`.
    pub join_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            max_peers_per_room: 64,
            channel_capacity: 256,
            presence_expiry_ms: DEFAULT_EXPIRY_MS,
            sweep_interval_ms: 5_000,
            join_timeout_ms: 10_000,
        }
    }
}

pub const THEME_KEY: &str = "theme";
pub const LANGUAGE_KEY: &str = "language";
pub const USER_KEY: &str = "user_id";

pub const DEFAULT_THEME: &str = "vs-dark";

/// Locally stored editor preferences.
///
/// Stored as flat key-value pairs; missing or malformed values fall back to
/// the defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Preferences {
    pub theme: String,
    pub language: Language,
    /// The identity chosen last time, stored as JSON `{name, color}`.
    pub identity: Option<Identity>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            theme: DEFAULT_THEME.to_string(),
            language: Language::JavaScript,
            identity: None,
        }
    }
}

impl Preferences {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut prefs = Self::default();
        for (key, value) in pairs {
            match key {
                THEME_KEY if !value.trim().is_empty() => prefs.theme = value.trim().to_string(),
                LANGUAGE_KEY => match value.parse() {
                    Ok(language) => prefs.language = language,
                    Err(_) => debug!(value, "Ignoring stored language"),
                },
                USER_KEY => match serde_json::from_str::<Identity>(value) {
                    Ok(identity) if !identity.name.is_empty() => prefs.identity = Some(identity),
                    _ => debug!(value, "Ignoring stored identity"),
                },
                _ => {}
            }
        }
        prefs
    }

    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            (THEME_KEY.to_string(), self.theme.clone()),
            (LANGUAGE_KEY.to_string(), self.language.as_str().to_string()),
        ];
        if let Some(identity) = &self.identity {
            if let Ok(json) = serde_json::to_string(identity) {
                pairs.push((USER_KEY.to_string(), json));
            }
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let sync = SyncConfigBuilder::new()
            .sync_interval(50)
            .presence_interval(10)
            .channel_capacity(0)
            .build();
        assert_eq!(sync.sync_interval_ms, 50);
        assert_eq!(sync.presence_interval_ms, 10);
        assert_eq!(sync.channel_capacity, 1);

        let client = ClientConfigBuilder::new()
            .auto_reconnect(false)
            .max_reconnect_attempts(3)
            .build();
        assert!(!client.auto_reconnect);
        assert_eq!(client.max_reconnect_attempts, 3);
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let client = ClientConfigBuilder::new().backoff(100, 1_000).build();
        assert_eq!(client.backoff(0), Duration::from_millis(100));
        assert_eq!(client.backoff(1), Duration::from_millis(200));
        assert_eq!(client.backoff(3), Duration::from_millis(800));
        assert_eq!(client.backoff(4), Duration::from_millis(1_000));
        assert_eq!(client.backoff(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_preferences_fall_back_to_defaults() {
        let prefs = Preferences::from_pairs([
            ("theme", ""),
            ("language", "cobol"),
            ("user_id", "{not json"),
        ]);
        assert_eq!(prefs, Preferences::default());
    }

    #[test]
    fn test_preferences_round_trip_through_pairs() {
        let prefs = Preferences::from_pairs([
            ("theme", "light"),
            ("language", "ts"),
            ("user_id", r##"{"name":"Hootsie","color":"#9AD1D4"}"##),
        ]);
        assert_eq!(prefs.theme, "light");
        assert_eq!(prefs.language, Language::TypeScript);
        assert_eq!(prefs.identity, Some(Identity::new("Hootsie", "#9AD1D4")));

        let pairs = prefs.to_pairs();
        let restored =
            Preferences::from_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        assert_eq!(restored, prefs);
    }
}
