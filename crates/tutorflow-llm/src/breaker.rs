//! Sliding-window circuit breaker, one per upstream model
//!
//! State machine: `closed → open → half_open → closed`. Closed tracks the
//! most recent call outcomes in a bounded window and trips when the failure
//! ratio crosses the configured threshold. Open rejects immediately until
//! the cooldown elapses, then admits exactly one probe; the probe's outcome
//! decides between closing and re-opening.
//!
//! State is process-local. Workers in one process share a breaker per
//! model via [`BreakerRegistry`]; no cross-process consensus exists or is
//! needed — each process discovers an unhealthy upstream on its own.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use tutorflow_config::BreakerConfig;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Admission decision for one prospective call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed normally.
    Allowed,
    /// Proceed as the single half-open probe; no retries.
    Probe,
    /// Rejected; the caller surfaces `circuit_open`.
    Rejected,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    /// Outcome ring: `true` = failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Per-model circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    model: String,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(model: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            config,
            model: model.into(),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Current state (transitions `open → half_open` lazily on inspection).
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    /// Decide whether a call may proceed.
    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|t| t.elapsed() >= Duration::from_secs(self.config.open_cooldown_s));
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(model = %self.model, "circuit half-open, admitting probe");
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.window.clear();
                inner.opened_at = None;
                inner.probe_in_flight = false;
                info!(model = %self.model, "circuit closed after successful probe");
            }
            _ => self.push_outcome(&mut inner, false),
        }
    }

    /// Record a failed call (transport-class failures only; schema errors
    /// say nothing about upstream health).
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                warn!(model = %self.model, "probe failed, circuit re-opened");
            }
            _ => self.push_outcome(&mut inner, true),
        }
    }

    fn push_outcome(&self, inner: &mut Inner, failed: bool) {
        inner.window.push_back(failed);
        while inner.window.len() > self.config.window {
            inner.window.pop_front();
        }
        if inner.state == BreakerState::Closed && self.should_trip(inner) {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.window.clear();
            warn!(
                model = %self.model,
                window = self.config.window,
                "failure ratio crossed threshold, circuit opened"
            );
        }
    }

    fn should_trip(&self, inner: &Inner) -> bool {
        if inner.window.len() < self.config.min_calls {
            return false;
        }
        let failures = inner.window.iter().filter(|f| **f).count();
        let ratio = failures as f64 / inner.window.len() as f64;
        ratio >= self.config.failure_ratio
    }
}

/// Process-wide map of breakers, one per model id.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for `model`, created on first use.
    #[must_use]
    pub fn for_model(&self, model: &str) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(model.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(model, self.config.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant_cooldown_config() -> BreakerConfig {
        BreakerConfig {
            window: 10,
            failure_ratio: 0.5,
            min_calls: 5,
            open_cooldown_s: 0,
        }
    }

    fn trip(breaker: &CircuitBreaker, failures: usize) {
        for _ in 0..failures {
            breaker.record_failure();
        }
    }

    #[test]
    fn test_closed_allows() {
        let breaker = CircuitBreaker::new("m", instant_cooldown_config());
        assert_eq!(breaker.admit(), Admission::Allowed);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("m", instant_cooldown_config());
        trip(&breaker, 5);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_below_min_calls_never_trips() {
        let breaker = CircuitBreaker::new("m", instant_cooldown_config());
        trip(&breaker, 4);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_mixed_outcomes_respect_ratio() {
        let breaker = CircuitBreaker::new("m", instant_cooldown_config());
        // 4 failures, 6 successes: ratio 0.4 < 0.5
        for i in 0..10 {
            if i % 2 == 0 && i < 8 {
                breaker.record_failure();
            } else {
                breaker.record_success();
            }
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_open_rejects_until_cooldown() {
        let config = BreakerConfig {
            open_cooldown_s: 3_600,
            ..instant_cooldown_config()
        };
        let breaker = CircuitBreaker::new("m", config);
        trip(&breaker, 5);
        assert_eq!(breaker.admit(), Admission::Rejected);
    }

    #[test]
    fn test_probe_success_closes() {
        let breaker = CircuitBreaker::new("m", instant_cooldown_config());
        trip(&breaker, 5);
        // Cooldown is zero, so the next admit is the probe
        assert_eq!(breaker.admit(), Admission::Probe);
        // A second caller while the probe is in flight is rejected
        assert_eq!(breaker.admit(), Admission::Rejected);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.admit(), Admission::Allowed);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("m", instant_cooldown_config());
        trip(&breaker, 5);
        assert_eq!(breaker.admit(), Admission::Probe);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_registry_shares_per_model() {
        let registry = BreakerRegistry::new(instant_cooldown_config());
        let a1 = registry.for_model("model-a");
        let a2 = registry.for_model("model-a");
        let b = registry.for_model("model-b");
        trip(&a1, 5);
        assert_eq!(a2.state(), BreakerState::Open);
        assert_eq!(b.state(), BreakerState::Closed);
    }
}
