//! Process-wide queue tunables.
//!
//! The configuration lives in the store and is read on every operation that
//! needs it, so a change made by one process is seen by the next enqueue or
//! failure in any other. Values only enter through [`ConfigPatch::parse`],
//! which validates them.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("{key} {reason}")]
    InvalidValue { key: ConfigKey, reason: &'static str },
}

/// Canonical configuration keys. Hyphenated spellings are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKey {
    MaxRetries,
    BackoffBase,
    WorkerCount,
    JobTimeout,
    BackoffMax,
    BackoffJitter,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 6] = [
        ConfigKey::MaxRetries,
        ConfigKey::BackoffBase,
        ConfigKey::WorkerCount,
        ConfigKey::JobTimeout,
        ConfigKey::BackoffMax,
        ConfigKey::BackoffJitter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "max_retries",
            ConfigKey::BackoffBase => "backoff_base",
            ConfigKey::WorkerCount => "worker_count",
            ConfigKey::JobTimeout => "job_timeout",
            ConfigKey::BackoffMax => "backoff_max",
            ConfigKey::BackoffJitter => "backoff_jitter",
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let canonical = s.trim().to_ascii_lowercase().replace('-', "_");
        ConfigKey::ALL
            .into_iter()
            .find(|key| key.as_str() == canonical)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Retries granted to jobs enqueued without an explicit budget.
    pub max_retries: u32,
    /// Base of the exponential backoff, in seconds.
    pub backoff_base: f64,
    /// Workers started when no count is given.
    pub worker_count: u32,
    /// Seconds a command may run before it is killed.
    pub job_timeout: u64,
    /// Optional ceiling on a single backoff delay, in seconds.
    pub backoff_max: Option<f64>,
    /// Random extra delay as a fraction of the computed delay.
    pub backoff_jitter: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2.0,
            worker_count: 1,
            job_timeout: 300,
            backoff_max: None,
            backoff_jitter: 0.0,
        }
    }
}

impl QueueConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout)
    }

    /// Render one value the way it is accepted by [`ConfigPatch::parse`].
    pub fn value(&self, key: ConfigKey) -> String {
        match key {
            ConfigKey::MaxRetries => self.max_retries.to_string(),
            ConfigKey::BackoffBase => self.backoff_base.to_string(),
            ConfigKey::WorkerCount => self.worker_count.to_string(),
            ConfigKey::JobTimeout => self.job_timeout.to_string(),
            ConfigKey::BackoffMax => self
                .backoff_max
                .map(|v| v.to_string())
                .unwrap_or_else(|| "none".to_string()),
            ConfigKey::BackoffJitter => self.backoff_jitter.to_string(),
        }
    }

    pub fn entries(&self) -> Vec<(ConfigKey, String)> {
        ConfigKey::ALL
            .into_iter()
            .map(|key| (key, self.value(key)))
            .collect()
    }

    pub fn apply(&mut self, patch: &ConfigPatch) {
        if let Some(v) = patch.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = patch.backoff_base {
            self.backoff_base = v;
        }
        if let Some(v) = patch.worker_count {
            self.worker_count = v;
        }
        if let Some(v) = patch.job_timeout {
            self.job_timeout = v;
        }
        if let Some(v) = patch.backoff_max {
            self.backoff_max = v;
        }
        if let Some(v) = patch.backoff_jitter {
            self.backoff_jitter = v;
        }
    }
}

/// A validated partial configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigPatch {
    pub max_retries: Option<u32>,
    pub backoff_base: Option<f64>,
    pub worker_count: Option<u32>,
    pub job_timeout: Option<u64>,
    pub backoff_max: Option<Option<f64>>,
    pub backoff_jitter: Option<f64>,
}

impl ConfigPatch {
    /// Parse and validate a single `key = value` assignment.
    pub fn parse(key: ConfigKey, value: &str) -> Result<Self, ConfigError> {
        let value = value.trim();
        let invalid = |reason| ConfigError::InvalidValue { key, reason };
        let mut patch = ConfigPatch::default();

        match key {
            ConfigKey::MaxRetries => {
                let v = value
                    .parse::<u32>()
                    .map_err(|_| invalid("must be a non-negative integer"))?;
                patch.max_retries = Some(v);
            }
            ConfigKey::BackoffBase => {
                let v = parse_positive(value).ok_or_else(|| invalid("must be a positive number"))?;
                patch.backoff_base = Some(v);
            }
            ConfigKey::WorkerCount => {
                let v = value
                    .parse::<u32>()
                    .ok()
                    .filter(|v| *v >= 1)
                    .ok_or_else(|| invalid("must be a positive integer"))?;
                patch.worker_count = Some(v);
            }
            ConfigKey::JobTimeout => {
                let v = value
                    .parse::<u64>()
                    .ok()
                    .filter(|v| *v >= 1)
                    .ok_or_else(|| invalid("must be a positive number of seconds"))?;
                patch.job_timeout = Some(v);
            }
            ConfigKey::BackoffMax => {
                let v = if value.eq_ignore_ascii_case("none") {
                    None
                } else {
                    Some(parse_positive(value).ok_or_else(|| {
                        invalid("must be a positive number of seconds or 'none'")
                    })?)
                };
                patch.backoff_max = Some(v);
            }
            ConfigKey::BackoffJitter => {
                let v = value
                    .parse::<f64>()
                    .ok()
                    .filter(|v| (0.0..=1.0).contains(v))
                    .ok_or_else(|| invalid("must be a number between 0 and 1"))?;
                patch.backoff_jitter = Some(v);
            }
        }

        Ok(patch)
    }

    /// Key/value pairs in their persisted text form.
    pub fn entries(&self) -> Vec<(ConfigKey, String)> {
        let mut config = QueueConfig::default();
        config.apply(self);

        let present = [
            (ConfigKey::MaxRetries, self.max_retries.is_some()),
            (ConfigKey::BackoffBase, self.backoff_base.is_some()),
            (ConfigKey::WorkerCount, self.worker_count.is_some()),
            (ConfigKey::JobTimeout, self.job_timeout.is_some()),
            (ConfigKey::BackoffMax, self.backoff_max.is_some()),
            (ConfigKey::BackoffJitter, self.backoff_jitter.is_some()),
        ];

        present
            .into_iter()
            .filter(|(_, set)| *set)
            .map(|(key, _)| (key, config.value(key)))
            .collect()
    }
}

fn parse_positive(value: &str) -> Option<f64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_accepts_hyphenated_alias() {
        assert_eq!("max-retries".parse::<ConfigKey>().unwrap(), ConfigKey::MaxRetries);
        assert_eq!("backoff_base".parse::<ConfigKey>().unwrap(), ConfigKey::BackoffBase);
        assert_eq!("Worker-Count".parse::<ConfigKey>().unwrap(), ConfigKey::WorkerCount);
        assert!(matches!(
            "retries".parse::<ConfigKey>(),
            Err(ConfigError::UnknownKey(k)) if k == "retries"
        ));
    }

    #[test]
    fn test_parse_rejects_invalid_values() {
        assert!(ConfigPatch::parse(ConfigKey::MaxRetries, "-1").is_err());
        assert!(ConfigPatch::parse(ConfigKey::MaxRetries, "1.5").is_err());
        assert!(ConfigPatch::parse(ConfigKey::BackoffBase, "0").is_err());
        assert!(ConfigPatch::parse(ConfigKey::BackoffBase, "NaN").is_err());
        assert!(ConfigPatch::parse(ConfigKey::WorkerCount, "0").is_err());
        assert!(ConfigPatch::parse(ConfigKey::JobTimeout, "0").is_err());
        assert!(ConfigPatch::parse(ConfigKey::BackoffJitter, "1.5").is_err());
        assert!(ConfigPatch::parse(ConfigKey::BackoffMax, "-3").is_err());
    }

    #[test]
    fn test_parse_and_apply() {
        let mut config = QueueConfig::default();
        for (key, value) in [
            (ConfigKey::MaxRetries, "0"),
            (ConfigKey::BackoffBase, "1.5"),
            (ConfigKey::BackoffMax, "60"),
        ] {
            config.apply(&ConfigPatch::parse(key, value).unwrap());
        }

        assert_eq!(config.max_retries, 0);
        assert_eq!(config.backoff_base, 1.5);
        assert_eq!(config.backoff_max, Some(60.0));
        assert_eq!(config.worker_count, 1);

        let cleared = ConfigPatch::parse(ConfigKey::BackoffMax, "none").unwrap();
        config.apply(&cleared);
        assert_eq!(config.backoff_max, None);
    }

    #[test]
    fn test_patch_entries_only_contain_set_keys() {
        let patch = ConfigPatch::parse(ConfigKey::WorkerCount, "4").unwrap();
        assert_eq!(patch.entries(), vec![(ConfigKey::WorkerCount, "4".to_string())]);
        assert!(ConfigPatch::default().entries().is_empty());
    }

    #[test]
    fn test_value_round_trips_through_parse() {
        let config = QueueConfig::default();
        for (key, value) in config.entries() {
            let mut parsed = QueueConfig::default();
            parsed.apply(&ConfigPatch::parse(key, &value).unwrap());
            assert_eq!(parsed, config, "key {key}");
        }
    }
}
