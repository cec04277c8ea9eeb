//! Configuration management for Chatlink
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from YAML files and environment variables.

use crate::error::{ChatlinkError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for Chatlink
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Duplex channel settings
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Session synchronization settings
    #[serde(default)]
    pub sync: SyncConfig,
    /// Point-to-point fallback transport
    #[serde(default)]
    pub fallback: FallbackConfig,
    /// Execution stream pacing
    #[serde(default)]
    pub stream: StreamConfig,
    /// Persisted client state
    #[serde(default)]
    pub storage: StorageConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What the outbound queue does when it is full
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame to make room
    #[default]
    DropOldest,
    /// Refuse the new frame with `QueueFull`
    RejectNew,
}

/// Connection manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// WebSocket endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Timeout for opening the channel (milliseconds)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Interval between liveness probes (milliseconds)
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which the channel is declared dead (milliseconds)
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// First reconnect delay (milliseconds)
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Reconnect delay cap (milliseconds)
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Reconnect attempts before entering the terminal error state
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Jitter applied to reconnect delays, as a fraction of the delay
    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter: f64,

    /// Rate-limit window (milliseconds)
    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,

    /// Frames allowed per rate-limit window
    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: u32,

    /// Maximum frames held while disconnected or rate-limited
    #[serde(default = "default_outbound_queue_max")]
    pub outbound_queue_max: usize,

    /// Behaviour when the outbound queue is full
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// Window for coalescing low-priority frames (milliseconds)
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    /// Maximum frames per batch; 1 disables batching
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Default deadline for correlated requests (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Capacity of the subscriber event feed
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_endpoint() -> String {
    "ws://localhost:8080/ws".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    25_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    60_000
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_jitter() -> f64 {
    0.25
}

fn default_rate_limit_window_ms() -> u64 {
    1_000
}

fn default_rate_limit_max_requests() -> u32 {
    50
}

fn default_outbound_queue_max() -> usize {
    1_000
}

fn default_batch_delay_ms() -> u64 {
    50
}

fn default_max_batch_size() -> usize {
    10
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_event_buffer() -> usize {
    1_024
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_jitter: default_reconnect_jitter(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
            rate_limit_max_requests: default_rate_limit_max_requests(),
            outbound_queue_max: default_outbound_queue_max(),
            overflow_policy: OverflowPolicy::default(),
            batch_delay_ms: default_batch_delay_ms(),
            max_batch_size: default_max_batch_size(),
            request_timeout_ms: default_request_timeout_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl ConnectionConfig {
    /// Channel open timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Liveness probe interval
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence tolerated before the channel is declared dead
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Rate-limit window
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    /// Low-priority batching window
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Default request deadline
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Sync engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Quiet period before a debounced flush (milliseconds)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Longest a mutation may wait for a debounced flush (milliseconds)
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Safety-net flush interval (milliseconds)
    #[serde(default = "default_auto_sync_interval_ms")]
    pub auto_sync_interval_ms: u64,

    /// Delay before the first retry of a failed flush (milliseconds)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Retries before a failed flush is left for the caller
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_debounce_ms() -> u64 {
    1_000
}

fn default_max_wait_ms() -> u64 {
    5_000
}

fn default_auto_sync_interval_ms() -> u64 {
    30_000
}

fn default_retry_delay_ms() -> u64 {
    2_000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_wait_ms: default_max_wait_ms(),
            auto_sync_interval_ms: default_auto_sync_interval_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl SyncConfig {
    /// Debounce quiet period
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Debounce upper bound
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Auto-sync interval
    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_millis(self.auto_sync_interval_ms)
    }

    /// Retry delay for the given retry number (0-based), doubling each time
    pub fn retry_delay(&self, retry: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms.saturating_mul(1u64 << retry.min(16)))
    }
}

/// Point-to-point fallback transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Base URL of the HTTP API; `None` disables the fallback
    #[serde(default)]
    pub base_url: Option<String>,

    /// Per-request timeout (milliseconds)
    #[serde(default = "default_fallback_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_fallback_timeout_ms() -> u64 {
    15_000
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: default_fallback_timeout_ms(),
        }
    }
}

/// Execution stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Delay between revealed fragments (milliseconds)
    #[serde(default = "default_message_delay_ms")]
    pub message_delay_ms: u64,

    /// Separator inserted between appended fragments
    #[serde(default = "default_separator")]
    pub separator: String,

    /// Subtypes treated as structural noise for non-execution events
    #[serde(default = "default_noise_subtypes")]
    pub noise_subtypes: Vec<String>,

    /// Regex; fragments whose text matches are dropped
    #[serde(default)]
    pub noise_pattern: Option<String>,
}

fn default_message_delay_ms() -> u64 {
    120
}

fn default_separator() -> String {
    "\n".to_string()
}

fn default_noise_subtypes() -> Vec<String> {
    vec!["start".to_string(), "end".to_string()]
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            message_delay_ms: default_message_delay_ms(),
            separator: default_separator(),
            noise_subtypes: default_noise_subtypes(),
            noise_pattern: None,
        }
    }
}

impl StreamConfig {
    /// Delay between revealed fragments
    pub fn message_delay(&self) -> Duration {
        Duration::from_millis(self.message_delay_ms)
    }
}

/// Persisted client state configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database path; defaults to the platform data directory
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Fixed storage name the session is keyed by
    #[serde(default = "default_storage_key")]
    pub key: String,
}

fn default_storage_key() -> String {
    "chatlink-session".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            key: default_storage_key(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text
    #[serde(default)]
    pub json_format: bool,

    /// Optional file to append logs to
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "chatlink=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file with environment overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    ///
    /// # Returns
    ///
    /// Returns the loaded and merged configuration
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ChatlinkError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| ChatlinkError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(endpoint) = std::env::var("CHATLINK_ENDPOINT") {
            self.connection.endpoint = endpoint;
        }

        if let Ok(url) = std::env::var("CHATLINK_FALLBACK_URL") {
            self.fallback.base_url = if url.is_empty() { None } else { Some(url) };
        }

        if let Ok(path) = std::env::var("CHATLINK_STORAGE_PATH") {
            self.storage.path = Some(PathBuf::from(path));
        }

        if let Ok(level) = std::env::var("CHATLINK_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(json_logs) = std::env::var("CHATLINK_JSON_LOGS") {
            match json_logs.parse::<bool>() {
                Ok(v) => self.logging.json_format = v,
                Err(_) => tracing::warn!("Invalid CHATLINK_JSON_LOGS value: {}", json_logs),
            }
        }

        if let Ok(attempts) = std::env::var("CHATLINK_MAX_RECONNECT_ATTEMPTS") {
            match attempts.parse::<u32>() {
                Ok(v) => self.connection.max_reconnect_attempts = v,
                Err(_) => tracing::warn!(
                    "Invalid CHATLINK_MAX_RECONNECT_ATTEMPTS value: {}",
                    attempts
                ),
            }
        }

        if let Ok(delay) = std::env::var("CHATLINK_MESSAGE_DELAY_MS") {
            match delay.parse::<u64>() {
                Ok(v) => self.stream.message_delay_ms = v,
                Err(_) => tracing::warn!("Invalid CHATLINK_MESSAGE_DELAY_MS value: {}", delay),
            }
        }
    }

    /// Session identifier supplied by the environment, if any
    pub fn session_id_from_env() -> Option<String> {
        std::env::var("CHATLINK_SESSION_ID")
            .ok()
            .filter(|s| !s.trim().is_empty())
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ChatlinkError::Config` describing the first invalid option
    pub fn validate(&self) -> Result<()> {
        let c = &self.connection;

        url::Url::parse(&c.endpoint).map_err(|e| {
            ChatlinkError::Config(format!("connection.endpoint is not a valid URL: {}", e))
        })?;

        if c.connect_timeout_ms == 0 {
            return Err(config_err("connection.connect_timeout_ms must be greater than 0"));
        }

        if c.heartbeat_interval_ms == 0 {
            return Err(config_err("connection.heartbeat_interval_ms must be greater than 0"));
        }

        if c.heartbeat_timeout_ms <= c.heartbeat_interval_ms {
            return Err(config_err(
                "connection.heartbeat_timeout_ms must be greater than heartbeat_interval_ms",
            ));
        }

        if c.reconnect_base_delay_ms == 0 {
            return Err(config_err("connection.reconnect_base_delay_ms must be greater than 0"));
        }

        if c.reconnect_base_delay_ms > c.reconnect_max_delay_ms {
            return Err(config_err(
                "connection.reconnect_base_delay_ms must not exceed reconnect_max_delay_ms",
            ));
        }

        if !(0.0..=1.0).contains(&c.reconnect_jitter) {
            return Err(config_err("connection.reconnect_jitter must be between 0.0 and 1.0"));
        }

        if c.rate_limit_window_ms == 0 || c.rate_limit_max_requests == 0 {
            return Err(config_err(
                "connection.rate_limit_window_ms and rate_limit_max_requests must be greater than 0",
            ));
        }

        if c.outbound_queue_max == 0 {
            return Err(config_err("connection.outbound_queue_max must be greater than 0"));
        }

        if c.max_batch_size == 0 {
            return Err(config_err("connection.max_batch_size must be at least 1"));
        }

        if c.request_timeout_ms == 0 {
            return Err(config_err("connection.request_timeout_ms must be greater than 0"));
        }

        if c.event_buffer == 0 {
            return Err(config_err("connection.event_buffer must be greater than 0"));
        }

        let s = &self.sync;
        if s.debounce_ms == 0 || s.auto_sync_interval_ms == 0 || s.retry_delay_ms == 0 {
            return Err(config_err(
                "sync.debounce_ms, auto_sync_interval_ms and retry_delay_ms must be greater than 0",
            ));
        }

        if s.debounce_ms > s.max_wait_ms {
            return Err(config_err("sync.debounce_ms must not exceed sync.max_wait_ms"));
        }

        if let Some(base) = &self.fallback.base_url {
            url::Url::parse(base).map_err(|e| {
                ChatlinkError::Config(format!("fallback.base_url is not a valid URL: {}", e))
            })?;
        }

        if self.fallback.timeout_ms == 0 {
            return Err(config_err("fallback.timeout_ms must be greater than 0"));
        }

        if let Some(pattern) = &self.stream.noise_pattern {
            regex::Regex::new(pattern).map_err(|e| {
                ChatlinkError::Config(format!("stream.noise_pattern is not a valid regex: {}", e))
            })?;
        }

        if self.storage.key.trim().is_empty() {
            return Err(config_err("storage.key cannot be empty"));
        }

        Ok(())
    }
}

fn config_err(message: &str) -> anyhow::Error {
    ChatlinkError::Config(message.to_string()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn assert_config_error(config: &Config, needle: &str) {
        let err = config.validate().unwrap_err();
        match err.downcast_ref::<ChatlinkError>() {
            Some(ChatlinkError::Config(msg)) => {
                assert!(msg.contains(needle), "unexpected message: {msg}")
            }
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.stream.message_delay_ms, 120);
        assert_eq!(config.storage.key, "chatlink-session");
    }

    #[test]
    fn test_validation_rejects_bad_endpoint() {
        let mut config = Config::default();
        config.connection.endpoint = "not a url".to_string();
        assert_config_error(&config, "connection.endpoint");
    }

    #[test]
    fn test_validation_rejects_heartbeat_timeout_below_interval() {
        let mut config = Config::default();
        config.connection.heartbeat_timeout_ms = config.connection.heartbeat_interval_ms;
        assert_config_error(&config, "heartbeat_timeout_ms");
    }

    #[test]
    fn test_validation_rejects_base_delay_above_max() {
        let mut config = Config::default();
        config.connection.reconnect_base_delay_ms = 60_000;
        config.connection.reconnect_max_delay_ms = 1_000;
        assert_config_error(&config, "reconnect_base_delay_ms");
    }

    #[test]
    fn test_validation_rejects_jitter_out_of_range() {
        let mut config = Config::default();
        config.connection.reconnect_jitter = 1.5;
        assert_config_error(&config, "reconnect_jitter");
    }

    #[test]
    fn test_validation_rejects_zero_queue() {
        let mut config = Config::default();
        config.connection.outbound_queue_max = 0;
        assert_config_error(&config, "outbound_queue_max");
    }

    #[test]
    fn test_validation_rejects_debounce_above_max_wait() {
        let mut config = Config::default();
        config.sync.debounce_ms = 10_000;
        config.sync.max_wait_ms = 1_000;
        assert_config_error(&config, "debounce_ms");
    }

    #[test]
    fn test_validation_rejects_bad_fallback_url() {
        let mut config = Config::default();
        config.fallback.base_url = Some("::nope".to_string());
        assert_config_error(&config, "fallback.base_url");
    }

    #[test]
    fn test_validation_rejects_bad_noise_pattern() {
        let mut config = Config::default();
        config.stream.noise_pattern = Some("(unclosed".to_string());
        assert_config_error(&config, "stream.noise_pattern");
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
connection:
  endpoint: wss://chat.example.com/live
  max_reconnect_attempts: 4
  overflow_policy: reject_new
sync:
  debounce_ms: 500
stream:
  message_delay_ms: 80
fallback:
  base_url: https://chat.example.com/api
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.connection.endpoint, "wss://chat.example.com/live");
        assert_eq!(config.connection.max_reconnect_attempts, 4);
        assert_eq!(config.connection.overflow_policy, OverflowPolicy::RejectNew);
        assert_eq!(config.connection.heartbeat_interval_ms, 25_000);
        assert_eq!(config.sync.debounce_ms, 500);
        assert_eq!(config.stream.message_delay_ms, 80);
        assert_eq!(
            config.fallback.base_url.as_deref(),
            Some("https://chat.example.com/api")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let sync = SyncConfig {
            retry_delay_ms: 100,
            ..SyncConfig::default()
        };
        assert_eq!(sync.retry_delay(0), Duration::from_millis(100));
        assert_eq!(sync.retry_delay(1), Duration::from_millis(200));
        assert_eq!(sync.retry_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_load_nonexistent_file_uses_defaults() {
        let config = Config::load("does-not-exist.yaml").unwrap();
        assert_eq!(config.sync.debounce_ms, 1_000);
    }

    #[test]
    #[serial]
    fn test_apply_env_vars_overrides_fields() {
        std::env::set_var("CHATLINK_ENDPOINT", "ws://env-host:9000/ws");
        std::env::set_var("CHATLINK_MAX_RECONNECT_ATTEMPTS", "3");
        std::env::set_var("CHATLINK_JSON_LOGS", "true");
        std::env::set_var("CHATLINK_MESSAGE_DELAY_MS", "not-a-number");

        let mut config = Config::default();
        config.apply_env_vars();

        std::env::remove_var("CHATLINK_ENDPOINT");
        std::env::remove_var("CHATLINK_MAX_RECONNECT_ATTEMPTS");
        std::env::remove_var("CHATLINK_JSON_LOGS");
        std::env::remove_var("CHATLINK_MESSAGE_DELAY_MS");

        assert_eq!(config.connection.endpoint, "ws://env-host:9000/ws");
        assert_eq!(config.connection.max_reconnect_attempts, 3);
        assert!(config.logging.json_format);
        // Invalid value leaves the default in place
        assert_eq!(config.stream.message_delay_ms, 120);
    }

    #[test]
    #[serial]
    fn test_session_id_from_env_ignores_blank() {
        std::env::set_var("CHATLINK_SESSION_ID", "  ");
        assert_eq!(Config::session_id_from_env(), None);
        std::env::set_var("CHATLINK_SESSION_ID", "sess-42");
        assert_eq!(Config::session_id_from_env().as_deref(), Some("sess-42"));
        std::env::remove_var("CHATLINK_SESSION_ID");
    }
}
