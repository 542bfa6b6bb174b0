//! Circuit breaker for provider failures
//!
//! Each LLM client owns one breaker. After `threshold` consecutive
//! non-retryable failures the breaker opens and calls fail fast with
//! `ApiLimit` until the cooldown has elapsed; the next call after that is a
//! half-open trial call.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use troupe_core::{Result, TroupeError};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests allowed
    Closed,
    /// Too many failures - reject requests immediately
    Open,
    /// Cooldown elapsed - allow a trial request
    HalfOpen,
}

/// Consecutive-failure circuit breaker
pub struct CircuitBreaker {
    failure_count: AtomicU32,
    last_failure_ms: AtomicU64,
    threshold: u32,
    cooldown: Duration,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_count: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            threshold,
            cooldown,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn elapsed_since_failure(&self) -> Duration {
        let last = self.last_failure_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    pub fn state(&self) -> CircuitState {
        if self.failure_count.load(Ordering::Relaxed) < self.threshold {
            CircuitState::Closed
        } else if self.elapsed_since_failure() >= self.cooldown {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Time left before a trial call is allowed; zero unless open
    pub fn time_until_retry(&self) -> Duration {
        match self.state() {
            CircuitState::Open => self.cooldown.saturating_sub(self.elapsed_since_failure()),
            _ => Duration::ZERO,
        }
    }

    /// Fail fast when the circuit is open
    pub fn check(&self) -> Result<()> {
        match self.state() {
            CircuitState::Open => Err(TroupeError::ApiLimit(format!(
                "circuit open after {} failures, retry in {}s",
                self.failure_count(),
                self.time_until_retry().as_secs()
            ))),
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_opens_after_threshold() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.check(), Err(TroupeError::ApiLimit(_))));
        assert!(cb.time_until_retry() > Duration::ZERO);
    }

    #[test]
    fn test_success_resets_failures() {
        let cb = CircuitBreaker::default();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.check().is_ok());
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(20));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        sleep(Duration::from_millis(40));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.check().is_ok());
        assert_eq!(cb.time_until_retry(), Duration::ZERO);
    }
}
