//! Per-backend circuit breaker: CLOSED -> OPEN -> HALF_OPEN -> CLOSED.
//!
//! State is derived lazily: `state()` checks elapsed time since the last
//! failure on every read rather than running a background timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

const RAW_CLOSED: u8 = 0;
const RAW_OPEN: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Tracks consecutive backend failures and trips after `failure_threshold`
/// is reached, refusing calls until `cooldown` has elapsed.
pub struct CircuitBreaker {
    raw_state: AtomicU8,
    consecutive_failures: AtomicU32,
    last_failure_millis: AtomicU64,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Arc<Self> {
        Arc::new(Self {
            raw_state: AtomicU8::new(RAW_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            last_failure_millis: AtomicU64::new(0),
            failure_threshold,
            cooldown,
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }

    /// Current state, transitioning OPEN -> HALF_OPEN lazily once the
    /// cooldown window has elapsed since the last recorded failure.
    pub fn state(&self) -> CircuitState {
        match self.raw_state.load(Ordering::Acquire) {
            RAW_CLOSED => CircuitState::Closed,
            _ => {
                let last_failure = self.last_failure_millis.load(Ordering::Acquire);
                let elapsed = now_millis().saturating_sub(last_failure);
                if elapsed >= self.cooldown.as_millis() as u64 {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
        }
    }

    /// Whether a request is currently allowed through (CLOSED or HALF_OPEN).
    pub fn allows_request(&self) -> bool {
        !matches!(self.state(), CircuitState::Open)
    }

    /// Reset to CLOSED with zero consecutive failures.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.raw_state.store(RAW_CLOSED, Ordering::Release);
    }

    /// Record a failure; trips to OPEN once `failure_threshold` consecutive
    /// failures have been seen, whether the prior state was CLOSED or HALF_OPEN.
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.last_failure_millis.store(now_millis(), Ordering::Release);
        if failures >= self.failure_threshold {
            self.raw_state.store(RAW_OPEN, Ordering::Release);
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allows_request());
    }

    #[test]
    fn trips_after_threshold() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allows_request());
    }

    #[test]
    fn success_resets() {
        let cb = CircuitBreaker::new(2, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn half_open_after_cooldown() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(0));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allows_request());
    }
}
