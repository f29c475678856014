//! Per-certificate circuit breaker.
//!
//! An explicit closed/open/half-open state machine with a failure
//! counter over a rolling window. While open, revocation checks
//! short-circuit without any network I/O; after the reset duration one
//! probe is allowed through, and its outcome decides between closing
//! and reopening.
//!
//! All transitions take the current time as a parameter, so the state
//! machine is fully deterministic under test.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::config::BreakerConfig;
use crate::error::RevocationCheckError;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Checks pass through; failures are counted.
    Closed,
    /// Checks are rejected immediately.
    Open,
    /// One probe is allowed through to test recovery.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    window_start: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
}

/// Thread-safe circuit breaker for one certificate's check endpoints.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            config: config.clone(),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                window_start: None,
                opened_at: None,
            }),
        }
    }

    /// Whether a check may proceed now. Transitions an expired open
    /// breaker to half-open, admitting the probe.
    pub fn check(&self, now: DateTime<Utc>) -> Result<(), RevocationCheckError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let reset = Duration::seconds(self.config.reset_secs as i64);
                if now - opened_at >= reset {
                    inner.state = BreakerState::HalfOpen;
                    tracing::info!("revocation breaker half-open, admitting probe");
                    Ok(())
                } else {
                    let retry_after = (opened_at + reset - now).num_seconds().max(0) as u64;
                    Err(RevocationCheckError::BreakerOpen {
                        retry_after_secs: retry_after,
                    })
                }
            }
        }
    }

    pub fn record_success(&self, _now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state != BreakerState::Closed {
            tracing::info!("revocation breaker closed after successful check");
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.window_start = None;
        inner.opened_at = None;
    }

    pub fn record_failure(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => {
                let window = Duration::seconds(self.config.window_secs as i64);
                let in_window = inner
                    .window_start
                    .map(|start| now - start <= window)
                    .unwrap_or(false);
                if in_window {
                    inner.failures += 1;
                } else {
                    inner.window_start = Some(now);
                    inner.failures = 1;
                }
                if inner.failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    tracing::warn!(
                        failures = inner.failures,
                        threshold = self.config.failure_threshold,
                        "revocation breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.failures = 0;
                inner.window_start = None;
                tracing::warn!("revocation breaker reopened after failed probe");
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self, now: DateTime<Utc>) -> BreakerState {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if now - opened_at >= Duration::seconds(self.config.reset_secs as i64) {
                    return BreakerState::HalfOpen;
                }
            }
        }
        inner.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, window_secs: u64, reset_secs: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            window_secs,
            reset_secs,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        chrono::TimeZone::with_ymd_and_hms(&Utc, 2026, 3, 14, 9, 0, 0).unwrap()
            + Duration::seconds(secs)
    }

    #[test]
    fn closed_allows_checks() {
        let breaker = CircuitBreaker::new(&config(3, 600, 1800));
        assert!(breaker.check(at(0)).is_ok());
        assert_eq!(breaker.state(at(0)), BreakerState::Closed);
    }

    #[test]
    fn opens_after_threshold_failures_within_window() {
        let breaker = CircuitBreaker::new(&config(3, 600, 1800));
        breaker.record_failure(at(0));
        breaker.record_failure(at(10));
        assert_eq!(breaker.state(at(10)), BreakerState::Closed);
        breaker.record_failure(at(20));
        assert_eq!(breaker.state(at(20)), BreakerState::Open);
        assert!(matches!(
            breaker.check(at(30)),
            Err(RevocationCheckError::BreakerOpen { .. })
        ));
    }

    #[test]
    fn failures_outside_window_do_not_accumulate() {
        let breaker = CircuitBreaker::new(&config(3, 60, 1800));
        breaker.record_failure(at(0));
        breaker.record_failure(at(30));
        // Window expired; this failure starts a fresh window.
        breaker.record_failure(at(120));
        assert_eq!(breaker.state(at(120)), BreakerState::Closed);
    }

    #[test]
    fn open_transitions_to_half_open_after_reset() {
        let breaker = CircuitBreaker::new(&config(1, 600, 300));
        breaker.record_failure(at(0));
        assert!(breaker.check(at(100)).is_err());
        // Reset elapsed: probe admitted.
        assert!(breaker.check(at(301)).is_ok());
        assert_eq!(breaker.state(at(301)), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_probe_success_closes() {
        let breaker = CircuitBreaker::new(&config(1, 600, 0));
        breaker.record_failure(at(0));
        breaker.check(at(1)).unwrap();
        breaker.record_success(at(2));
        assert_eq!(breaker.state(at(2)), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(&config(1, 600, 300));
        breaker.record_failure(at(0));
        breaker.check(at(301)).unwrap();
        breaker.record_failure(at(302));
        assert_eq!(breaker.state(at(302)), BreakerState::Open);
        assert!(breaker.check(at(400)).is_err());
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new(&config(3, 600, 1800));
        breaker.record_failure(at(0));
        breaker.record_failure(at(1));
        breaker.record_success(at(2));
        breaker.record_failure(at(3));
        breaker.record_failure(at(4));
        assert_eq!(breaker.state(at(4)), BreakerState::Closed);
    }

    #[test]
    fn retry_after_is_reported() {
        let breaker = CircuitBreaker::new(&config(1, 600, 300));
        breaker.record_failure(at(0));
        match breaker.check(at(100)) {
            Err(RevocationCheckError::BreakerOpen { retry_after_secs }) => {
                assert_eq!(retry_after_secs, 200);
            }
            other => panic!("expected BreakerOpen, got {other:?}"),
        }
    }
}
