//! Denormalizer configuration.
//!
//! Every knob has a default; [`DenormalizerConfig::from_env`] overlays
//! `DENORMALIZER_*` environment variables and validates the result.
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `DENORMALIZER_QUEUE_TIMEOUT_MS` | `revision_guard.queue_timeout` | 1000 |
//! | `DENORMALIZER_QUEUE_TIMEOUT_MAX_LOOPS` | `revision_guard.queue_timeout_max_loops` | 3 |
//! | `DENORMALIZER_START_REVISION_NUMBER` | `revision_guard.start_revision_number` | 1 (`none` disables) |
//! | `DENORMALIZER_IGNORE_REVISION` | `revision_guard.ignore_revision` | false |
//! | `DENORMALIZER_REVISION_PREFIX` | `revision_guard.prefix` | `revision` |
//! | `DENORMALIZER_CONCURRENCY_RETRY_DELAY_MS` | `revision_guard.concurrency_retry_delay` | 10 |
//! | `DENORMALIZER_RETRY_TIMEOUT_MS` | `view_builder.retry_timeout` | 800 |
//! | `DENORMALIZER_REPLAY_BATCH_SIZE` | `replay.batch_size` | unbounded |
//!
//! # Example
//!
//! ```
//! use denormalizer_core::config::DenormalizerConfig;
//! use std::time::Duration;
//!
//! let config = DenormalizerConfig::from_lookup(|key| match key {
//!     "DENORMALIZER_QUEUE_TIMEOUT_MS" => Some("50".to_string()),
//!     _ => None,
//! })
//! .unwrap();
//!
//! assert_eq!(config.revision_guard.queue_timeout, Duration::from_millis(50));
//! assert_eq!(config.view_builder.retry_timeout, Duration::from_millis(800));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable could not be parsed.
    #[error("Failed to parse {key}: {value}")]
    ParseError {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Serialize durations as whole milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Ordering guard settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevisionGuardConfig {
    /// How long an out-of-order event waits before each re-check.
    #[serde(with = "duration_millis")]
    pub queue_timeout: Duration,
    /// Re-checks before the predecessor is declared missing.
    pub queue_timeout_max_loops: u32,
    /// Expected revision of an aggregate with no stored entry.
    ///
    /// `None` takes the first revision seen as the baseline.
    pub start_revision_number: Option<u64>,
    /// Skip ordering entirely and dispatch every event immediately.
    pub ignore_revision: bool,
    /// Key prefix in the revision store.
    pub prefix: String,
    /// Fixed pause before retrying after a revision CAS conflict.
    #[serde(with = "duration_millis")]
    pub concurrency_retry_delay: Duration,
}

impl Default for RevisionGuardConfig {
    fn default() -> Self {
        Self {
            queue_timeout: Duration::from_millis(1000),
            queue_timeout_max_loops: 3,
            start_revision_number: Some(1),
            ignore_revision: false,
            prefix: "revision".to_string(),
            concurrency_retry_delay: Duration::from_millis(10),
        }
    }
}

/// View builder commit settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewBuilderConfig {
    /// Upper bound of the random delay before retrying a conflicting commit.
    #[serde(with = "duration_millis")]
    pub retry_timeout: Duration,
}

impl Default for ViewBuilderConfig {
    fn default() -> Self {
        Self {
            retry_timeout: Duration::from_millis(800),
        }
    }
}

/// Replay settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Flush a replaying collection whenever this many view models are buffered.
    ///
    /// `None` buffers everything until the replay finishes.
    pub batch_size: Option<usize>,
}

/// Complete denormalizer configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenormalizerConfig {
    /// Ordering guard settings.
    pub revision_guard: RevisionGuardConfig,
    /// View builder settings.
    pub view_builder: ViewBuilderConfig,
    /// Replay settings.
    pub replay: ReplayConfig,
}

impl DenormalizerConfig {
    /// Defaults overlaid with `DENORMALIZER_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns error if a variable cannot be parsed or validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// # Errors
    ///
    /// Returns error if a value cannot be parsed or validation fails.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let guard = &mut config.revision_guard;

        if let Some(ms) = parse_var::<u64>(&lookup, "DENORMALIZER_QUEUE_TIMEOUT_MS")? {
            guard.queue_timeout = Duration::from_millis(ms);
        }
        if let Some(loops) = parse_var(&lookup, "DENORMALIZER_QUEUE_TIMEOUT_MAX_LOOPS")? {
            guard.queue_timeout_max_loops = loops;
        }
        if let Some(raw) = lookup("DENORMALIZER_START_REVISION_NUMBER") {
            guard.start_revision_number = if raw.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(parse_value("DENORMALIZER_START_REVISION_NUMBER", &raw)?)
            };
        }
        if let Some(ignore) = parse_var(&lookup, "DENORMALIZER_IGNORE_REVISION")? {
            guard.ignore_revision = ignore;
        }
        if let Some(prefix) = lookup("DENORMALIZER_REVISION_PREFIX") {
            guard.prefix = prefix;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "DENORMALIZER_CONCURRENCY_RETRY_DELAY_MS")? {
            guard.concurrency_retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "DENORMALIZER_RETRY_TIMEOUT_MS")? {
            config.view_builder.retry_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var(&lookup, "DENORMALIZER_REPLAY_BATCH_SIZE")? {
            config.replay.batch_size = Some(size);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values that would stall processing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let guard = &self.revision_guard;
        if guard.queue_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "revision_guard.queue_timeout must be positive".to_string(),
            ));
        }
        if guard.queue_timeout_max_loops == 0 {
            return Err(ConfigError::ValidationError(
                "revision_guard.queue_timeout_max_loops must be at least 1".to_string(),
            ));
        }
        if guard.prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "revision_guard.prefix cannot be empty".to_string(),
            ));
        }
        if self.replay.batch_size == Some(0) {
            return Err(ConfigError::ValidationError(
                "replay.batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    lookup(key).map(|raw| parse_value(key, &raw)).transpose()
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::ParseError {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DenormalizerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.revision_guard.start_revision_number, Some(1));
        assert_eq!(config.revision_guard.queue_timeout_max_loops, 3);
    }

    #[test]
    fn lookup_overrides_defaults() {
        let config = DenormalizerConfig::from_lookup(|key| match key {
            "DENORMALIZER_QUEUE_TIMEOUT_MAX_LOOPS" => Some("5".to_string()),
            "DENORMALIZER_START_REVISION_NUMBER" => Some("none".to_string()),
            "DENORMALIZER_IGNORE_REVISION" => Some("true".to_string()),
            "DENORMALIZER_REPLAY_BATCH_SIZE" => Some("100".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.revision_guard.queue_timeout_max_loops, 5);
        assert_eq!(config.revision_guard.start_revision_number, None);
        assert!(config.revision_guard.ignore_revision);
        assert_eq!(config.replay.batch_size, Some(100));
    }

    #[test]
    fn unparsable_value_is_reported() {
        let err = DenormalizerConfig::from_lookup(|key| {
            (key == "DENORMALIZER_RETRY_TIMEOUT_MS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::ParseError {
                key: "DENORMALIZER_RETRY_TIMEOUT_MS".to_string(),
                value: "soon".to_string(),
            }
        );
    }

    #[test]
    fn zero_loops_fail_validation() {
        let mut config = DenormalizerConfig::default();
        config.revision_guard.queue_timeout_max_loops = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn durations_serialize_as_millis() {
        let json = serde_json::to_value(RevisionGuardConfig::default()).unwrap();
        assert_eq!(json["queue_timeout"], serde_json::json!(1000));

        let parsed: RevisionGuardConfig =
            serde_json::from_value(serde_json::json!({ "queue_timeout": 50 })).unwrap();
        assert_eq!(parsed.queue_timeout, Duration::from_millis(50));
        assert_eq!(parsed.queue_timeout_max_loops, 3);
    }
}
