use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::conflict::resolution::ConflictMode;
use crate::errors::{Result, ThothError};
use crate::priority::Priority;

/// Priority given to a task when it is resubmitted after a retryable failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPriority {
    #[default]
    Same,
    Higher,
    Lower,
}

impl RetryPriority {
    pub fn apply(self, priority: Priority) -> Priority {
        match self {
            RetryPriority::Same => priority,
            RetryPriority::Higher => priority.higher(),
            RetryPriority::Lower => priority.lower(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before a retryable failure is surfaced. `None` retries forever.
    pub max_attempts: Option<u32>,
    pub retry_priority: RetryPriority,
    /// Delay before the first retry, doubled for each further retry.
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            retry_priority: RetryPriority::Same,
            backoff: Duration::ZERO,
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// Delay before running attempt number `attempt` (the first attempt is 1).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.backoff.is_zero() {
            return Duration::ZERO;
        }
        let doublings = (attempt - 2).min(31);
        self.backoff
            .checked_mul(1u32 << doublings)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    /// Returns `true` once `attempts` have been used up.
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThothConfig {
    pub worker_threads: usize,
    /// Upper bound on queued and reserved tasks. `None` is unbounded.
    pub max_backlog: Option<usize>,
    /// How long shutdown waits for in-flight tasks.
    pub shutdown_timeout: Duration,
    pub conflict_mode: ConflictMode,
    pub retry: RetryConfig,
}

impl Default for ThothConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            max_backlog: None,
            shutdown_timeout: Duration::from_secs(5),
            conflict_mode: ConflictMode::FailFast,
            retry: RetryConfig::default(),
        }
    }
}

impl ThothConfig {
    /// Reads a configuration from `thoth.*` property keys.
    ///
    /// Keys outside the `thoth.` namespace are ignored; missing keys keep
    /// their defaults.
    pub fn from_properties<I, K, V>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = ThothConfig::default();
        for (key, value) in properties {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            match key {
                "thoth.scheduler.worker_threads" => config.worker_threads = parse(key, value)?,
                "thoth.scheduler.max_backlog" => {
                    config.max_backlog = match value {
                        "" | "none" | "unbounded" => None,
                        v => Some(parse(key, v)?),
                    }
                }
                "thoth.scheduler.shutdown_timeout_ms" => {
                    config.shutdown_timeout = Duration::from_millis(parse(key, value)?)
                }
                "thoth.conflict.mode" => {
                    config.conflict_mode = match value {
                        "fail_fast" | "failfast" => ConflictMode::FailFast,
                        "advisory" => ConflictMode::Advisory,
                        other => return Err(invalid(key, other)),
                    }
                }
                "thoth.retry.max_attempts" => {
                    config.retry.max_attempts = match value {
                        "" | "unbounded" => None,
                        v => Some(parse(key, v)?),
                    }
                }
                "thoth.retry.priority" => {
                    config.retry.retry_priority = match value {
                        "same" => RetryPriority::Same,
                        "higher" => RetryPriority::Higher,
                        "lower" => RetryPriority::Lower,
                        other => return Err(invalid(key, other)),
                    }
                }
                "thoth.retry.backoff_ms" => {
                    config.retry.backoff = Duration::from_millis(parse(key, value)?)
                }
                "thoth.retry.max_backoff_ms" => {
                    config.retry.max_backoff = Duration::from_millis(parse(key, value)?)
                }
                other if other.starts_with("thoth.") => warn!("Ignoring unknown property {}", other),
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(ThothError::Config(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.max_backlog == Some(0) {
            return Err(ThothError::Config("max_backlog must be at least 1".to_string()));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ThothError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> ThothError {
    ThothError::Config(format!("invalid value {:?} for {}", value, key))
}
