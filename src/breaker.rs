// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connect Circuit Breaker
//!
//! Fast-fail wrapper around the connect path. Every exhausted connect cycle
//! counts as one failure; at the configured threshold the breaker opens and
//! further connects are rejected without touching the driver. Any successful
//! connect closes the breaker again. An open breaker admits a single probe
//! attempt once the reset timeout has elapsed since the last failure.

use crate::config::BreakerConfig;
use crate::errors::AmqpError;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

#[derive(Debug, Default)]
struct BreakerState {
    failures: u32,
    open: bool,
    last_failure: Option<Instant>,
}

/// Failure counter guarding the connect path.
pub(crate) struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub(crate) fn new(config: BreakerConfig) -> Self {
        CircuitBreaker {
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Checks whether a connect attempt is admitted right now.
    ///
    /// Returns `CircuitBreakerOpen` while the breaker is open and the reset
    /// timeout has not yet elapsed since the last failure. After the timeout
    /// one probe attempt passes through; its outcome decides whether the
    /// breaker resets or stays open.
    pub(crate) fn check(&self) -> Result<(), AmqpError> {
        let state = self.state.lock().expect("breaker lock poisoned");
        if !state.open {
            return Ok(());
        }

        let elapsed = state
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX);
        if elapsed >= Duration::from_millis(self.config.reset_timeout_ms) {
            return Ok(());
        }

        Err(AmqpError::CircuitBreakerOpen {
            failures: state.failures,
        })
    }

    /// Records one exhausted connect cycle.
    pub(crate) fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.failures += 1;
        state.last_failure = Some(Instant::now());
        if state.failures >= self.config.failure_threshold {
            state.open = true;
        }
    }

    /// Resets the breaker after a successful connect.
    pub(crate) fn reset(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.failures = 0;
        state.open = false;
        state.last_failure = None;
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().expect("breaker lock poisoned").open
    }

    #[cfg(test)]
    fn failures(&self) -> u32 {
        self.state.lock().expect("breaker lock poisoned").failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            reset_timeout_ms,
        })
    }

    #[test]
    fn opens_exactly_at_threshold() {
        let breaker = breaker(2, 30_000);

        breaker.record_failure();
        assert!(!breaker.is_open());
        assert!(breaker.check().is_ok());

        breaker.record_failure();
        assert!(breaker.is_open());
        let err = breaker.check().unwrap_err();
        assert_eq!(err.code(), "CIRCUIT_BREAKER_OPEN");
    }

    #[test]
    fn reset_clears_failures_and_open_flag() {
        let breaker = breaker(1, 30_000);

        breaker.record_failure();
        assert!(breaker.is_open());

        breaker.reset();
        assert!(!breaker.is_open());
        assert_eq!(breaker.failures(), 0);
        assert!(breaker.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_admits_a_probe_after_reset_timeout() {
        let breaker = breaker(1, 1_000);

        breaker.record_failure();
        assert!(breaker.check().is_err());

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(breaker.check().is_ok());
        // A failed probe keeps the breaker open for another window.
        breaker.record_failure();
        assert!(breaker.check().is_err());
    }
}
