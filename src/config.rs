use std::time::Duration;

use serde::Deserialize;

use crate::key_extractor::DEFAULT_KEY_HEADER;

/// How the coordinator handles a duplicate that is still executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingWaitPolicy {
    /// Reject immediately with an in-flight conflict.
    FailFast,
    /// Poll the store for completion up to `timeout`, then reject.
    Wait {
        timeout: Duration,
        poll_interval: Duration,
    },
}

impl PendingWaitPolicy {
    /// Retry hint surfaced to the caller alongside an in-flight conflict.
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            PendingWaitPolicy::FailFast => 1,
            PendingWaitPolicy::Wait { timeout, .. } => timeout.as_secs().max(1),
        }
    }
}

/// Immutable engine configuration, handed to the detector and coordinator
/// at construction.
#[derive(Debug, Clone)]
pub struct DedupOptions {
    /// Header the idempotency key is read from.
    pub key_header: String,
    /// Record lifetime when no per-route override exists.
    pub default_ttl_seconds: i64,
    /// Whether POST requests are deduplicated absent an explicit rule.
    pub posts_idempotent: bool,
    /// Whether PUT requests are deduplicated absent an explicit rule.
    pub puts_idempotent: bool,
    /// Reject replays whose body differs from the original request.
    pub strict_content_validation: bool,
    /// Fail eligible requests that carry no key. When false, a keyless
    /// request is simply not deduplicated.
    pub require_key: bool,
    /// Execute without the at-most-once guarantee when the store is down.
    /// Off by default: the engine refuses to promise what it cannot back.
    pub fail_open: bool,
    /// Cadence of the background sweep; None disables the sweeper and
    /// leaves cleanup to lazy expiry.
    pub cleanup_interval: Option<Duration>,
    pub pending_wait: PendingWaitPolicy,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            key_header: DEFAULT_KEY_HEADER.to_string(),
            default_ttl_seconds: 86400, // 24 hours
            posts_idempotent: false,
            puts_idempotent: true,
            strict_content_validation: true,
            require_key: true,
            fail_open: false,
            cleanup_interval: None,
            pending_wait: PendingWaitPolicy::FailFast,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub application: ApplicationSettings,
    pub dedup: DedupSettings,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Deserialize)]
pub struct RedisSettings {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct ApplicationSettings {
    pub log_level: String,
    pub log_format: String,
}

/// File/env representation of [`DedupOptions`].
#[derive(Debug, Deserialize)]
pub struct DedupSettings {
    #[serde(default = "default_key_header")]
    pub key_header: String,
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: i64,
    #[serde(default)]
    pub posts_idempotent: bool,
    #[serde(default = "default_true")]
    pub puts_idempotent: bool,
    #[serde(default = "default_true")]
    pub strict_content_validation: bool,
    #[serde(default = "default_true")]
    pub require_key: bool,
    #[serde(default)]
    pub fail_open: bool,
    #[serde(default)]
    pub cleanup_interval_seconds: Option<u64>,
    #[serde(default)]
    pub pending_wait_timeout_ms: Option<u64>,
    #[serde(default = "default_poll_interval_ms")]
    pub pending_poll_interval_ms: u64,
}

fn default_key_header() -> String {
    DEFAULT_KEY_HEADER.to_string()
}

fn default_ttl_seconds() -> i64 {
    86400
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    50
}

impl DedupSettings {
    pub fn to_options(&self) -> DedupOptions {
        let pending_wait = match self.pending_wait_timeout_ms {
            Some(timeout_ms) => PendingWaitPolicy::Wait {
                timeout: Duration::from_millis(timeout_ms),
                poll_interval: Duration::from_millis(self.pending_poll_interval_ms),
            },
            None => PendingWaitPolicy::FailFast,
        };

        DedupOptions {
            key_header: self.key_header.clone(),
            default_ttl_seconds: self.default_ttl_seconds,
            posts_idempotent: self.posts_idempotent,
            puts_idempotent: self.puts_idempotent,
            strict_content_validation: self.strict_content_validation,
            require_key: self.require_key,
            fail_open: self.fail_open,
            cleanup_interval: self.cleanup_interval_seconds.map(Duration::from_secs),
            pending_wait,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }
}
