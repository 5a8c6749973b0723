//! Store settings controlling the replication cache.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use crate::pg_feed::DEFAULT_CHANNEL;

/// Settings key enabling the replication cache.
pub const ENABLE_REPLICATION_CACHE_SETTING: &str = "enableReplicationCache";

/// Settings key for the maximum number of cached records.
pub const REPLICATION_CACHE_SIZE_SETTING: &str = "replicationCacheSize";

/// Settings key for the delay before the updater reconnects, in milliseconds.
pub const RECONNECT_DELAY_SETTING: &str = "replicationReconnectDelayMs";

/// Settings key for the change notification channel. A records trigger
/// must notify on it, or the updater fails on subscribe.
pub const REPLICATION_CHANNEL_SETTING: &str = "replicationChannel";

/// Default maximum number of cached records.
pub const DEFAULT_CACHE_SIZE: usize = 10_000;

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Replication cache settings read at store initialization.
///
/// Settings can be built from a string-keyed settings map or from
/// environment variables:
/// - `ENABLE_REPLICATION_CACHE` (default: `false`)
/// - `REPLICATION_CACHE_SIZE` (default: `10000`)
/// - `REPLICATION_RECONNECT_DELAY_MS` (default: `1000`)
/// - `REPLICATION_CHANNEL` (default: `"record_changes"`)
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
    pub enable_replication_cache: bool,
    pub replication_cache_size: usize,
    pub reconnect_delay: Duration,
    pub replication_channel: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            enable_replication_cache: false,
            replication_cache_size: DEFAULT_CACHE_SIZE,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            replication_channel: DEFAULT_CHANNEL.to_string(),
        }
    }
}

impl StoreSettings {
    /// Settings with the replication cache switched on.
    pub fn enabled() -> Self {
        Self {
            enable_replication_cache: true,
            ..Self::default()
        }
    }

    /// Sets the maximum number of cached records.
    pub fn cache_size(mut self, size: usize) -> Self {
        self.replication_cache_size = size;
        self
    }

    /// Sets the reconnect delay.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Reads settings from a settings map.
    ///
    /// Values are converted leniently: flags accept booleans and the string
    /// `"true"`, sizes accept numbers and numeric strings. Unusable values
    /// fall back to their defaults.
    pub fn from_settings(settings: &HashMap<String, Value>) -> Self {
        let defaults = Self::default();

        let enable_replication_cache = settings
            .get(ENABLE_REPLICATION_CACHE_SETTING)
            .map(value_as_bool)
            .unwrap_or(defaults.enable_replication_cache);

        let replication_cache_size = match settings.get(REPLICATION_CACHE_SIZE_SETTING) {
            None | Some(Value::Null) => defaults.replication_cache_size,
            Some(value) => value_as_u64(value)
                .filter(|size| *size > 0)
                .and_then(|size| usize::try_from(size).ok())
                .unwrap_or_else(|| {
                    tracing::warn!(
                        value = %value,
                        default = DEFAULT_CACHE_SIZE,
                        "invalid {REPLICATION_CACHE_SIZE_SETTING}, using default"
                    );
                    DEFAULT_CACHE_SIZE
                }),
        };

        let reconnect_delay = settings
            .get(RECONNECT_DELAY_SETTING)
            .and_then(value_as_u64)
            .map(Duration::from_millis)
            .unwrap_or(defaults.reconnect_delay);

        let replication_channel = settings
            .get(REPLICATION_CHANNEL_SETTING)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(defaults.replication_channel);

        Self {
            enable_replication_cache,
            replication_cache_size,
            reconnect_delay,
            replication_channel,
        }
    }

    /// Reads settings from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut settings = HashMap::new();
        for (var, key) in [
            ("ENABLE_REPLICATION_CACHE", ENABLE_REPLICATION_CACHE_SETTING),
            ("REPLICATION_CACHE_SIZE", REPLICATION_CACHE_SIZE_SETTING),
            ("REPLICATION_RECONNECT_DELAY_MS", RECONNECT_DELAY_SETTING),
            ("REPLICATION_CHANNEL", REPLICATION_CHANNEL_SETTING),
        ] {
            if let Ok(value) = std::env::var(var) {
                settings.insert(key.to_string(), Value::String(value));
            }
        }
        Self::from_settings(&settings)
    }
}

fn value_as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
