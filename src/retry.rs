//! Retry classification and exponential backoff.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ServiceError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Terminal,
}

/// Throttling (429) and any server-side status (5xx) are transient. Errors that
/// carry no status are inspected for the same codes in their message.
pub fn classify(err: &ServiceError) -> ErrorClass {
    let transient = match err.status {
        Some(status) => is_transient_status(status),
        None => message_has_transient_marker(&err.message),
    };
    if transient {
        ErrorClass::Transient
    } else {
        ErrorClass::Terminal
    }
}

fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

fn message_has_transient_marker(message: &str) -> bool {
    message
        .split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse::<u16>().ok())
        .any(is_transient_status)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    const STOP: RetryDecision = RetryDecision {
        retry: false,
        delay: Duration::ZERO,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", deserialize_with = "millis::deserialize")]
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Decide what to do after `attempt` (1-based) failed with `err`.
    ///
    /// A `retry = false` answer means the target should be considered failed
    /// for this operation; it is never a process-level failure.
    pub fn should_retry(&self, attempt: u32, err: &ServiceError) -> RetryDecision {
        if classify(err) == ErrorClass::Terminal {
            return RetryDecision::STOP;
        }
        if attempt >= self.max_attempts {
            return RetryDecision::STOP;
        }
        RetryDecision {
            retry: true,
            delay: self.delay_for(attempt),
        }
    }

    /// `base * 2^attempt`, saturating instead of overflowing.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
