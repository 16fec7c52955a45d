//! Circuit breaker and per-client rate limiting.
//!
//! One [`CircuitBreaker`] instance exists per external dependency class
//! (embedding provider, generation provider, vector store), constructed
//! once per process and passed by reference to every component that needs
//! it — never ambient globals, so tests can build isolated instances.
//!
//! The [`ClientRateLimiter`] tracks a sliding window of request timestamps
//! per client key and rejects requests over the allowance before any
//! downstream call is attempted.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    /// Normal operation — calls are permitted.
    Closed,
    /// Too many failures — calls fail fast.
    Open { since: Instant },
    /// Recovery probe — one call is permitted to test the dependency.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    probe_in_flight: bool,
}

/// A circuit breaker that trips after consecutive failures and recovers
/// through a single half-open probe after a cooldown.
///
/// Interior-mutexed so one `Arc<CircuitBreaker>` can be shared
/// process-wide per dependency and used safely under concurrency.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    failure_threshold: usize,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, failure_threshold: usize, cooldown: Duration) -> Self {
        Self {
            dependency: dependency.into(),
            failure_threshold,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                probe_in_flight: false,
            }),
        }
    }

    /// Check whether a call may proceed; fails fast with
    /// `ServiceUnavailable` while the circuit is open. While half-open,
    /// exactly one probe call is admitted.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { since } => {
                if since.elapsed() >= self.cooldown {
                    debug!(dependency = %self.dependency, "circuit half-open, admitting probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(self.unavailable())
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.unavailable())
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call; closes the circuit and resets counters.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::HalfOpen {
            debug!(dependency = %self.dependency, "circuit closing after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
    }

    /// Record a failed call; trips the circuit at the threshold, and
    /// re-opens (restarting the cooldown) on a failed half-open probe.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.probe_in_flight = false;

        if inner.state == CircuitState::HalfOpen {
            warn!(dependency = %self.dependency, "probe failed, circuit re-opening");
            inner.state = CircuitState::Open {
                since: Instant::now(),
            };
            return;
        }

        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.failure_threshold {
            warn!(
                dependency = %self.dependency,
                failures = inner.consecutive_failures,
                threshold = self.failure_threshold,
                "circuit opening"
            );
            inner.state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    fn unavailable(&self) -> PipelineError {
        PipelineError::ServiceUnavailable {
            dependency: self.dependency.clone(),
        }
    }
}

/// Sliding-window request limiter keyed by client identifier.
#[derive(Debug)]
pub struct ClientRateLimiter {
    limit: usize,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl ClientRateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject one request for `client`. Rejections carry the
    /// seconds until the oldest in-window request ages out.
    pub fn check(&self, client: &str) -> Result<()> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let history = windows.entry(client.to_string()).or_default();

        while history
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            history.pop_front();
        }

        if history.len() >= self.limit {
            let retry_after = history
                .front()
                .map(|t| self.window.saturating_sub(now.duration_since(*t)))
                .unwrap_or(self.window);
            warn!(client, "rate limit exceeded");
            return Err(PipelineError::RateLimitExceeded {
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }

        history.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_starts_closed() {
        let cb = CircuitBreaker::new("embedding", 3, Duration::from_secs(60));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn breaker_opens_after_threshold() {
        let cb = CircuitBreaker::new("embedding", 3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));
    }

    #[test]
    fn breaker_fails_fast_while_open() {
        let cb = CircuitBreaker::new("generation", 2, Duration::from_secs(600));
        cb.record_failure();
        cb.record_failure();
        let err = cb.try_acquire().unwrap_err();
        assert!(matches!(err, PipelineError::ServiceUnavailable { .. }));
    }

    #[test]
    fn breaker_half_open_after_cooldown() {
        let cb = CircuitBreaker::new("store", 1, Duration::from_millis(1));
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));

        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let cb = CircuitBreaker::new("store", 1, Duration::from_millis(1));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));

        assert!(cb.try_acquire().is_ok());
        assert!(cb.try_acquire().is_err());
    }

    #[test]
    fn probe_success_closes_circuit() {
        let cb = CircuitBreaker::new("embedding", 1, Duration::from_millis(1));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        cb.try_acquire().unwrap();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn probe_failure_reopens_circuit() {
        let cb = CircuitBreaker::new("embedding", 1, Duration::from_millis(1));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        cb.try_acquire().unwrap();
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));
        assert!(cb.try_acquire().is_err());
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = CircuitBreaker::new("embedding", 3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn limiter_admits_up_to_limit() {
        let limiter = ClientRateLimiter::new(3, Duration::from_secs(3600));
        for _ in 0..3 {
            assert!(limiter.check("10.0.0.1").is_ok());
        }
        let err = limiter.check("10.0.0.1").unwrap_err();
        assert!(matches!(err, PipelineError::RateLimitExceeded { .. }));
    }

    #[test]
    fn limiter_keys_clients_independently() {
        let limiter = ClientRateLimiter::new(1, Duration::from_secs(3600));
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("b").is_ok());
        assert!(limiter.check("a").is_err());
    }

    #[test]
    fn limiter_window_expires() {
        let limiter = ClientRateLimiter::new(1, Duration::from_millis(5));
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_err());
        std::thread::sleep(Duration::from_millis(10));
        assert!(limiter.check("a").is_ok());
    }

    #[test]
    fn rejection_reports_retry_after() {
        let limiter = ClientRateLimiter::new(1, Duration::from_secs(3600));
        limiter.check("a").unwrap();
        match limiter.check("a").unwrap_err() {
            PipelineError::RateLimitExceeded { retry_after_secs } => {
                assert!(retry_after_secs >= 1);
                assert!(retry_after_secs <= 3600);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
