//! Service configuration.
//!
//! [`HeraldConfig`] is plain serde data with defaults. The binary fills it
//! from `HERALD_*` environment variables (a `.env` file is honored) and
//! validates it before anything starts.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::RetryPolicy;
use crate::logging::LogFormat;
use crate::scheduler::DispatchPolicy;
use crate::transport::TransportMode;
use crate::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeraldConfig {
    /// SQLite database URL.
    pub database_url: String,
    /// Delivery mode for the whole deployment.
    pub mode: TransportMode,
    pub log_format: LogFormat,
    /// Directory for rotated log files. Console only when unset.
    pub log_dir: Option<PathBuf>,
    /// Root of the local attachment store. Attachments are skipped when unset.
    pub attachment_dir: Option<PathBuf>,
    /// JSON file of template definitions loaded at startup.
    pub template_file: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
    pub inline: InlineConfig,
    /// Required in relay mode.
    pub broker: Option<BrokerConfig>,
}

impl Default for HeraldConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:herald.db?mode=rwc".to_string(),
            mode: TransportMode::Queue,
            log_format: LogFormat::Pretty,
            log_dir: None,
            attachment_dir: None,
            template_file: None,
            scheduler: SchedulerConfig::default(),
            inline: InlineConfig::default(),
            broker: None,
        }
    }
}

/// Queue scheduler and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Time between scheduler ticks.
    pub poll_interval_ms: u64,
    /// Maximum records claimed per tick.
    pub batch_size: u32,
    /// Maximum concurrent deliveries within a tick.
    pub concurrency: usize,
    /// Failed attempts before a record is FAILED.
    pub max_retries: u32,
    /// Delay before a RETRYING record is reclaimed.
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// 1.0 keeps the delay fixed.
    pub backoff_multiplier: f64,
    pub use_jitter: bool,
    /// PROCESSING records older than this are reset to PENDING.
    pub stale_after_secs: u64,
    /// Identical SENT records within this window suppress a delivery.
    pub dedup_window_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 50,
            concurrency: 4,
            max_retries: 3,
            retry_delay_ms: 60_000,
            max_retry_delay_ms: 3_600_000,
            backoff_multiplier: 1.0,
            use_jitter: false,
            stale_after_secs: 300,
            dedup_window_secs: 300,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay_ms: self.retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.backoff_multiplier,
            use_jitter: self.use_jitter,
        }
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            retry: self.retry_policy(),
            dedup_window: self.dedup_window(),
            stale_after: self.stale_after(),
            poll_interval: self.poll_interval(),
        }
    }
}

/// Inline delivery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InlineConfig {
    /// Maximum delivery attempts running at once. Records waiting out a
    /// retry backoff do not hold a slot.
    pub max_in_flight: usize,
}

impl Default for InlineConfig {
    fn default() -> Self {
        Self { max_in_flight: 32 }
    }
}

/// Broker relay settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Publish endpoint.
    pub url: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Sent as a bearer token.
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default = "default_broker_timeout")]
    pub timeout_secs: u64,
}

fn default_topic() -> String {
    "notifications".to_string()
}

fn default_broker_timeout() -> u64 {
    10
}

impl BrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            topic: default_topic(),
            auth_token: None,
            headers: Vec::new(),
            timeout_secs: default_broker_timeout(),
        }
    }
}

impl HeraldConfig {
    /// Load from the process environment after reading `.env`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source. Unset variables keep their
    /// defaults; unparsable ones are configuration errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("HERALD_DATABASE_URL").or_else(|| lookup("DATABASE_URL")) {
            config.database_url = url;
        }
        if let Some(mode) = parse_var(&lookup, "HERALD_MODE")? {
            config.mode = mode;
        }
        if let Some(format) = parse_var(&lookup, "HERALD_LOG_FORMAT")? {
            config.log_format = format;
        }
        config.log_dir = lookup("HERALD_LOG_DIR").map(PathBuf::from);
        config.attachment_dir = lookup("HERALD_ATTACHMENT_DIR").map(PathBuf::from);
        config.template_file = lookup("HERALD_TEMPLATE_FILE").map(PathBuf::from);

        let s = &mut config.scheduler;
        set_var(&lookup, "HERALD_POLL_INTERVAL_MS", &mut s.poll_interval_ms)?;
        set_var(&lookup, "HERALD_BATCH_SIZE", &mut s.batch_size)?;
        set_var(&lookup, "HERALD_CONCURRENCY", &mut s.concurrency)?;
        set_var(&lookup, "HERALD_MAX_RETRIES", &mut s.max_retries)?;
        set_var(&lookup, "HERALD_RETRY_DELAY_MS", &mut s.retry_delay_ms)?;
        set_var(&lookup, "HERALD_MAX_RETRY_DELAY_MS", &mut s.max_retry_delay_ms)?;
        set_var(&lookup, "HERALD_BACKOFF_MULTIPLIER", &mut s.backoff_multiplier)?;
        set_var(&lookup, "HERALD_RETRY_JITTER", &mut s.use_jitter)?;
        set_var(&lookup, "HERALD_STALE_AFTER_SECS", &mut s.stale_after_secs)?;
        set_var(&lookup, "HERALD_DEDUP_WINDOW_SECS", &mut s.dedup_window_secs)?;

        set_var(
            &lookup,
            "HERALD_INLINE_MAX_IN_FLIGHT",
            &mut config.inline.max_in_flight,
        )?;

        if let Some(url) = lookup("HERALD_BROKER_URL") {
            let mut broker = BrokerConfig::new(url);
            if let Some(topic) = lookup("HERALD_BROKER_TOPIC") {
                broker.topic = topic;
            }
            broker.auth_token = lookup("HERALD_BROKER_TOKEN");
            set_var(&lookup, "HERALD_BROKER_TIMEOUT_SECS", &mut broker.timeout_secs)?;
            config.broker = Some(broker);
        }

        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::config("database url must not be empty"));
        }

        let s = &self.scheduler;
        if s.poll_interval_ms == 0 {
            return Err(Error::config("poll interval must be greater than zero"));
        }
        if s.batch_size == 0 {
            return Err(Error::config("batch size must be greater than zero"));
        }
        if s.concurrency == 0 {
            return Err(Error::config("concurrency must be greater than zero"));
        }
        if !s.backoff_multiplier.is_finite() || s.backoff_multiplier < 1.0 {
            return Err(Error::config(format!(
                "backoff multiplier must be at least 1.0, got {}",
                s.backoff_multiplier
            )));
        }
        if s.max_retry_delay_ms < s.retry_delay_ms {
            return Err(Error::config(
                "max retry delay must not be less than the retry delay",
            ));
        }
        if s.stale_after_secs == 0 {
            return Err(Error::config("stale threshold must be greater than zero"));
        }
        if self.inline.max_in_flight == 0 {
            return Err(Error::config("inline max in-flight must be greater than zero"));
        }

        if self.mode == TransportMode::Relay {
            match &self.broker {
                Some(broker) if !broker.url.trim().is_empty() && !broker.topic.is_empty() => {}
                _ => {
                    return Err(Error::config(
                        "relay mode requires a broker url and topic (HERALD_BROKER_URL)",
                    ));
                }
            }
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::config(format!("invalid value for {key} ('{raw}'): {e}"))),
        None => Ok(None),
    }
}

fn set_var<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    if let Some(value) = parse_var(lookup, key)? {
        *target = value;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = HeraldConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mode, TransportMode::Queue);
        assert_eq!(config.scheduler.retry_policy().max_retries, 3);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = HeraldConfig::from_lookup(lookup_from(&[
            ("HERALD_DATABASE_URL", "sqlite::memory:"),
            ("HERALD_MODE", "inline"),
            ("HERALD_BATCH_SIZE", "10"),
            ("HERALD_RETRY_DELAY_MS", "0"),
            ("HERALD_RETRY_JITTER", "true"),
            ("HERALD_DEDUP_WINDOW_SECS", "60"),
            ("HERALD_TEMPLATE_FILE", "/etc/herald/templates.json"),
        ]))
        .unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.mode, TransportMode::Inline);
        assert_eq!(config.scheduler.batch_size, 10);
        assert_eq!(config.scheduler.retry_delay_ms, 0);
        assert!(config.scheduler.use_jitter);
        assert_eq!(config.scheduler.dedup_window(), Duration::from_secs(60));
        assert!(config.broker.is_none());
        assert_eq!(
            config.template_file.as_deref(),
            Some(std::path::Path::new("/etc/herald/templates.json"))
        );
    }

    #[test]
    fn test_invalid_number_is_configuration_error() {
        let err = HeraldConfig::from_lookup(lookup_from(&[("HERALD_BATCH_SIZE", "many")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.contains("HERALD_BATCH_SIZE")));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = HeraldConfig::default();
        config.scheduler.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = HeraldConfig::default();
        config.scheduler.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = HeraldConfig::default();
        config.scheduler.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_relay_mode_requires_broker() {
        let config =
            HeraldConfig::from_lookup(lookup_from(&[("HERALD_MODE", "relay")])).unwrap();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let config = HeraldConfig::from_lookup(lookup_from(&[
            ("HERALD_MODE", "relay"),
            ("HERALD_BROKER_URL", "http://broker.local/publish"),
            ("HERALD_BROKER_TOKEN", "secret"),
        ]))
        .unwrap();
        assert!(config.validate().is_ok());
        let broker = config.broker.unwrap();
        assert_eq!(broker.topic, "notifications");
        assert_eq!(broker.auth_token.as_deref(), Some("secret"));
    }
}
