use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_BASE_DELAY_MS, DEFAULT_CONNECTION_TIMEOUT_MS, DEFAULT_JITTER,
    DEFAULT_MAX_DELAY_MS, DEFAULT_MAX_RETRIES, RETRYABLE_STATUS_CODES,
};
use crate::types::TransportError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub connection_timeout_ms: u64,
    pub retryable_statuses: Vec<u16>,
    /// Fraction of the computed delay applied as symmetric random jitter.
    /// `0.0` makes delays deterministic.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            retryable_statuses: RETRYABLE_STATUS_CODES.to_vec(),
            jitter: DEFAULT_JITTER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    NotRetryable,
    /// Data already reached the client; replaying would duplicate content.
    DataReceived,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { next_attempt: u32, delay: Duration },
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.config.connection_timeout_ms)
    }

    /// An error without a status (network failure, timeout) is always retryable.
    pub fn is_retryable(&self, status: Option<u16>) -> bool {
        match status {
            None => true,
            Some(status) => self.config.retryable_statuses.contains(&status),
        }
    }

    /// `min(base * factor^attempt, max)`, before jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_ms as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = base * self.config.backoff_factor.powi(exponent);
        let capped = raw.min(self.config.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let delay_ms = delay.as_millis() as f64;
        let spread = delay_ms * jitter;
        let offset = (fastrand::f64() * 2.0 - 1.0) * spread;
        Duration::from_millis((delay_ms + offset).max(1.0) as u64)
    }

    /// Decides what follows a failed attempt `attempt` (0-based). At most
    /// `max_retries + 1` attempts are ever made, and nothing is retried once the
    /// current connection has delivered data.
    pub fn decide(&self, err: &TransportError, attempt: u32, has_received_data: bool) -> RetryDecision {
        if has_received_data {
            return RetryDecision::GiveUp(GiveUpReason::DataReceived);
        }
        if !self.is_retryable(err.status) {
            return RetryDecision::GiveUp(GiveUpReason::NotRetryable);
        }
        if attempt >= self.config.max_retries {
            return RetryDecision::GiveUp(GiveUpReason::Exhausted);
        }
        let delay = self.jittered_delay(attempt);
        tracing::warn!(
            "[⚙️ ] Attempt {} failed ({}). Retrying in {:?} (jittered)...",
            attempt + 1,
            err,
            delay
        );
        RetryDecision::Retry {
            next_attempt: attempt + 1,
            delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deterministic() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            jitter: 0.0,
            ..RetryConfig::default()
        })
    }

    #[test]
    fn delays_grow_then_cap() {
        let policy = deterministic();
        assert_eq!(policy.delay(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay(3), Duration::from_millis(8_000));
        assert_eq!(policy.delay(4), Duration::from_millis(10_000));
        assert_eq!(policy.delay(40), Duration::from_millis(10_000));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let d = policy.jittered_delay(1).as_millis();
            assert!((1_600..=2_400).contains(&d), "delay {} out of band", d);
        }
    }

    #[test]
    fn status_classification() {
        let policy = deterministic();
        assert!(policy.is_retryable(None));
        assert!(policy.is_retryable(Some(503)));
        assert!(policy.is_retryable(Some(429)));
        assert!(!policy.is_retryable(Some(400)));
        assert!(!policy.is_retryable(Some(401)));
    }

    #[test]
    fn data_received_blocks_retry_even_when_retryable() {
        let policy = deterministic();
        let err = TransportError::new(Some(503), "unavailable");
        assert_eq!(
            policy.decide(&err, 0, true),
            RetryDecision::GiveUp(GiveUpReason::DataReceived)
        );
    }
}
