//! Per-peer circuit breaker (§4.4): a three-state latch — Closed, Open,
//! HalfOpen — that suppresses use of a peer for a cooldown after
//! consecutive failures.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 3, reset_timeout: Duration::from_secs(300) }
    }
}

/// One breaker per peer. `consecutive_failures` only ever grows under
/// failure and resets to zero on success or on a half-open trial being
/// granted, matching §4.4's "clearing the failure counter".
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config, state: BreakerState::Closed, consecutive_failures: 0, opened_at: None }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Record a success: closes the breaker and clears the counter. Returns
    /// `true` if a nonzero failure counter was cleared (the caller uses
    /// this to bump a `recoveredPeers` metric).
    pub fn record_success(&mut self) -> bool {
        let was_failing = self.consecutive_failures > 0;
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
        self.opened_at = None;
        was_failing
    }

    /// Record a failure. Returns `true` if this call just tripped the
    /// breaker open. A failed half-open trial reopens the breaker
    /// unconditionally and re-stamps `opened_at`, rather than waiting for a
    /// fresh run of `failure_threshold` failures to trip again.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Open;
            self.opened_at = Some(Instant::now());
            return true;
        }
        if self.consecutive_failures >= self.config.failure_threshold && self.state != BreakerState::Open {
            self.state = BreakerState::Open;
            self.opened_at = Some(Instant::now());
            return true;
        }
        false
    }

    /// True until `reset_timeout` has elapsed since the breaker opened;
    /// implicitly resets the latch (to `Closed`) once queried past
    /// maturity, matching §4.4's "implicitly reset when queried".
    pub fn is_open(&mut self) -> bool {
        match (self.state, self.opened_at) {
            (BreakerState::Open, Some(opened_at)) if opened_at.elapsed() >= self.config.reset_timeout => {
                self.state = BreakerState::Closed;
                self.consecutive_failures = 0;
                self.opened_at = None;
                false
            }
            (BreakerState::Open, _) => true,
            _ => false,
        }
    }

    /// Explicitly half-open a matured breaker, allowing exactly one trial.
    /// Returns `true` if the breaker transitioned (i.e. was open and had
    /// matured); a caller that gets `false` should not issue a trial.
    pub fn attempt_reset(&mut self) -> bool {
        match (self.state, self.opened_at) {
            (BreakerState::Open, Some(opened_at)) if opened_at.elapsed() >= self.config.reset_timeout => {
                self.state = BreakerState::HalfOpen;
                self.consecutive_failures = 0;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig { failure_threshold: 3, reset_timeout: Duration::from_millis(50) }
    }

    #[test]
    fn opens_on_threshold_failure() {
        let mut breaker = CircuitBreaker::new(fast_config());
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn success_clears_and_reports_recovery() {
        let mut breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        assert!(breaker.record_success());
        assert!(!breaker.record_success());
    }

    #[tokio::test]
    async fn is_open_resets_after_timeout() {
        let mut breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!breaker.is_open());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn attempt_reset_half_opens_only_once_matured() {
        let mut breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.attempt_reset());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(breaker.attempt_reset());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn a_failed_half_open_trial_reopens_immediately() {
        let mut breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(breaker.attempt_reset());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.is_open());
    }
}
