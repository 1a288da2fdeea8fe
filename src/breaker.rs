//! Per-service circuit breakers for the call path.
//!
//! Hystrix-style three-state breaker:
//! - **Closed**: normal operation, calls flow through
//! - **Open**: too many failures, reject calls immediately
//! - **HalfOpen**: recovery probe, allow calls until enough succeed
//!
//! One breaker is tracked per target service; all state lives behind
//! synchronous locks so the hot path never awaits.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected.
    Open,
    /// Probing whether the service recovered.
    HalfOpen,
}

/// Configuration shared by all per-service breakers.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u64,
    /// Time to wait before probing an open breaker.
    pub reset_timeout: Duration,
    /// Successes in half-open before closing.
    pub success_threshold: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    failures: u64,
    successes: u64,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            successes: 0,
            opened_at: None,
        }
    }
}

/// Snapshot of one service's breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: BreakerState,
    pub failures: u64,
    pub successes: u64,
}

/// Statistics across all breakers.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub trips: u64,
    pub rejections: u64,
    pub open_breakers: usize,
    pub tracked_services: usize,
}

/// The set of per-service circuit breakers.
pub struct CircuitBreakerSet {
    config: BreakerConfig,
    breakers: DashMap<String, Breaker>,
    trips: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreakerSet {
    /// Creates a breaker set with the given configuration.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            trips: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Creates a breaker set with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(BreakerConfig::default())
    }

    /// Checks whether a call to the service should proceed.
    ///
    /// An open breaker transitions to half-open once the reset timeout
    /// has elapsed.
    pub fn allow(&self, service: &str) -> bool {
        let mut breaker = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(Breaker::new);

        match breaker.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed_enough = breaker
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.reset_timeout);

                if elapsed_enough {
                    breaker.state = BreakerState::HalfOpen;
                    breaker.successes = 0;
                    debug!(service = %service, "breaker half-open");
                    true
                } else {
                    self.rejections.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self, service: &str) {
        let Some(mut breaker) = self.breakers.get_mut(service) else {
            return;
        };

        match breaker.state {
            BreakerState::HalfOpen => {
                breaker.successes += 1;
                if breaker.successes >= self.config.success_threshold {
                    breaker.state = BreakerState::Closed;
                    breaker.failures = 0;
                    breaker.successes = 0;
                    breaker.opened_at = None;
                    debug!(service = %service, "breaker closed");
                }
            }
            BreakerState::Closed => {
                breaker.failures = 0;
            }
            BreakerState::Open => {}
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self, service: &str) {
        let mut breaker = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(Breaker::new);

        match breaker.state {
            BreakerState::Closed => {
                breaker.failures += 1;
                if breaker.failures >= self.config.failure_threshold {
                    breaker.state = BreakerState::Open;
                    breaker.opened_at = Some(Instant::now());
                    self.trips.fetch_add(1, Ordering::Relaxed);
                    warn!(service = %service, failures = breaker.failures, "breaker opened");
                }
            }
            BreakerState::HalfOpen => {
                breaker.state = BreakerState::Open;
                breaker.opened_at = Some(Instant::now());
                breaker.failures = 0;
                breaker.successes = 0;
                self.trips.fetch_add(1, Ordering::Relaxed);
                warn!(service = %service, "breaker reopened from half-open");
            }
            BreakerState::Open => {
                breaker.opened_at = Some(Instant::now());
            }
        }
    }

    /// Returns the current state for a service (closed when untracked).
    pub fn state(&self, service: &str) -> BreakerState {
        self.breakers
            .get(service)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Returns snapshots of all tracked breakers.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| BreakerSnapshot {
                service: entry.key().clone(),
                state: entry.state,
                failures: entry.failures,
                successes: entry.successes,
            })
            .collect()
    }

    /// Resets one breaker to closed. Returns `false` if untracked.
    pub fn reset(&self, service: &str) -> bool {
        match self.breakers.get_mut(service) {
            Some(mut breaker) => {
                *breaker = Breaker::new();
                true
            }
            None => false,
        }
    }

    /// Returns aggregate breaker statistics.
    pub fn stats(&self) -> BreakerStats {
        let open_breakers = self
            .breakers
            .iter()
            .filter(|b| b.state == BreakerState::Open)
            .count();

        BreakerStats {
            trips: self.trips.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            open_breakers,
            tracked_services: self.breakers.len(),
        }
    }

    /// Resets trip/rejection counters. Breaker states are untouched.
    pub fn reset_stats(&self) {
        self.trips.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
    }
}

impl Default for CircuitBreakerSet {
    fn default() -> Self {
        Self::with_defaults()
    }
}
