//! Retry engine with exponential backoff, jitter, and a retry budget.
//!
//! Wraps arbitrary fallible operations with bounded retries. A sliding
//! 10-second budget window caps the proportion of requests allowed to
//! retry so a failing dependency cannot trigger a retry storm.

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for retry behavior, registered per named operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts including the initial one.
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Cap on the computed delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to perturb delays with jitter.
    pub use_jitter: bool,
    /// Jitter amplitude as a fraction of the delay, in `[0, 1]`.
    pub jitter_factor: f64,
    /// Error signatures (codes, names, status strings, or message
    /// substrings) that make a failure retryable.
    pub retryable_errors: Vec<String>,
    /// Percentage of recent requests allowed to retry.
    pub budget_percent: f64,
    /// Overall deadline across all attempts.
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            use_jitter: true,
            jitter_factor: 0.2,
            retryable_errors: vec![
                "ETIMEDOUT".to_string(),
                "ECONNRESET".to_string(),
                "ECONNREFUSED".to_string(),
                "EPIPE".to_string(),
                "502".to_string(),
                "503".to_string(),
                "504".to_string(),
                "timeout".to_string(),
                "unavailable".to_string(),
            ],
            budget_percent: 20.0,
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Creates a retry configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of attempts (floored at 1).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    /// Sets the jitter amplitude (clamped to `[0, 1]`).
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Replaces the retryable error signatures.
    pub fn with_retryable_errors<I, S>(mut self, errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_errors = errors.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the retry budget percentage.
    pub fn with_budget_percent(mut self, percent: f64) -> Self {
        self.budget_percent = percent.max(0.0);
        self
    }

    /// Sets the overall timeout across attempts.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Checks whether an error message matches a retryable signature.
    ///
    /// Matching is case-insensitive: a signature matches if it equals or
    /// is contained in the error text, which covers error codes
    /// (`ETIMEDOUT`), numeric statuses (`503`), and message fragments.
    pub fn is_retryable(&self, error_text: &str) -> bool {
        let text = error_text.to_lowercase();
        self.retryable_errors
            .iter()
            .any(|sig| text.contains(&sig.to_lowercase()))
    }

    /// Computes the pre-sleep delay after the given 1-based attempt.
    ///
    /// `min(base * multiplier^(attempt-1), max)`, then jitter shifts the
    /// result by a uniform offset in `[-d*factor, +d*factor]`, floored at
    /// zero.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = attempt.saturating_sub(1) as i32;
        let delay_ms = (base_ms * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay.as_millis() as f64);

        let delay_ms = if self.use_jitter && self.jitter_factor > 0.0 {
            let amplitude = delay_ms * self.jitter_factor;
            let offset = rand::thread_rng().gen_range(-amplitude..=amplitude);
            (delay_ms + offset).max(0.0)
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms as u64)
    }
}

/// Sliding-window retry budget.
///
/// Tracks request and retry timestamps over a fixed window; the retry
/// rate is `retries / requests * 100` over that window.
#[derive(Debug)]
pub struct RetryBudget {
    window: Duration,
    requests: VecDeque<Instant>,
    retries: VecDeque<Instant>,
}

impl RetryBudget {
    /// Creates a budget over the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            requests: VecDeque::new(),
            retries: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.requests.front() {
            if now.duration_since(front) > self.window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        while let Some(&front) = self.retries.front() {
            if now.duration_since(front) > self.window {
                self.retries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Records an incoming request.
    pub fn record_request(&mut self, now: Instant) {
        self.prune(now);
        self.requests.push_back(now);
    }

    /// Records a retry attempt.
    pub fn record_retry(&mut self, now: Instant) {
        self.prune(now);
        self.retries.push_back(now);
    }

    /// Returns the current retry rate in percent.
    pub fn retry_rate(&mut self, now: Instant) -> f64 {
        self.prune(now);
        if self.requests.is_empty() {
            return 0.0;
        }
        self.retries.len() as f64 / self.requests.len() as f64 * 100.0
    }

    /// Whether a call may enter the retry loop under the given budget.
    pub fn allows_retry(&mut self, now: Instant, budget_percent: f64) -> bool {
        self.retry_rate(now) < budget_percent
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// Error returned when a wrapped operation ultimately fails.
#[derive(Debug)]
pub enum RetryError<E> {
    /// All attempts failed; carries the last underlying error.
    Exhausted { attempts: u32, last_error: E },
    /// The overall deadline was exceeded mid-retry.
    TimedOut { elapsed: Duration, last_error: E },
    /// The error did not match any retryable signature.
    NotRetryable { last_error: E },
}

impl<E> RetryError<E> {
    /// Returns the underlying error.
    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Exhausted { last_error, .. }
            | RetryError::TimedOut { last_error, .. }
            | RetryError::NotRetryable { last_error } => last_error,
        }
    }

    /// Consumes the wrapper and returns the underlying error.
    pub fn into_last_error(self) -> E {
        match self {
            RetryError::Exhausted { last_error, .. }
            | RetryError::TimedOut { last_error, .. }
            | RetryError::NotRetryable { last_error } => last_error,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Exhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "all {} attempts exhausted, last error: {}",
                attempts, last_error
            ),
            RetryError::TimedOut {
                elapsed,
                last_error,
            } => write!(
                f,
                "retry deadline exceeded after {}ms, last error: {}",
                elapsed.as_millis(),
                last_error
            ),
            RetryError::NotRetryable { last_error } => {
                write!(f, "non-retryable error: {}", last_error)
            }
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for RetryError<E> {}

/// Statistics about retry engine activity.
#[derive(Debug, Clone, Serialize)]
pub struct RetryStats {
    pub executions: u64,
    pub attempts: u64,
    pub retries: u64,
    pub successful_retries: u64,
    pub exhausted: u64,
    pub timed_out: u64,
    pub non_retryable: u64,
    pub budget_rejections: u64,
}

/// Retry engine holding named policies and the shared budget window.
pub struct RetryEngine {
    policies: DashMap<String, RetryConfig>,
    default_config: RetryConfig,
    budget: Mutex<RetryBudget>,
    executions: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    successful_retries: AtomicU64,
    exhausted: AtomicU64,
    timed_out: AtomicU64,
    non_retryable: AtomicU64,
    budget_rejections: AtomicU64,
}

impl RetryEngine {
    /// Creates an engine with the given fallback configuration.
    pub fn new(default_config: RetryConfig) -> Self {
        Self {
            policies: DashMap::new(),
            default_config,
            budget: Mutex::new(RetryBudget::default()),
            executions: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            successful_retries: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            non_retryable: AtomicU64::new(0),
            budget_rejections: AtomicU64::new(0),
        }
    }

    /// Creates an engine with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Registers a policy for a named operation, replacing any previous one.
    pub fn register_policy(&self, operation: impl Into<String>, config: RetryConfig) {
        let operation = operation.into();
        debug!(operation = %operation, max_attempts = config.max_attempts, "retry policy registered");
        self.policies.insert(operation, config);
    }

    /// Returns the registered policy for an operation, if any.
    pub fn policy(&self, operation: &str) -> Option<RetryConfig> {
        self.policies.get(operation).map(|c| c.clone())
    }

    /// Returns the number of registered policies.
    pub fn policy_count(&self) -> usize {
        self.policies.len()
    }

    fn resolve(&self, operation: &str, override_config: Option<&RetryConfig>) -> RetryConfig {
        override_config
            .cloned()
            .or_else(|| self.policy(operation))
            .unwrap_or_else(|| self.default_config.clone())
    }

    /// Executes an operation under the resolved retry policy.
    ///
    /// Resolution order: per-call override, then the policy registered
    /// for `operation`, then the engine default. When the budget window
    /// is saturated the operation runs exactly once; that downgrade is
    /// counted but never surfaced as an error.
    pub async fn execute<F, Fut, T, E>(
        &self,
        operation: &str,
        mut f: F,
        override_config: Option<&RetryConfig>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let config = self.resolve(operation, override_config);
        self.executions.fetch_add(1, Ordering::Relaxed);

        let start = Instant::now();
        let max_attempts = {
            let mut budget = self.budget.lock();
            budget.record_request(start);
            if budget.allows_retry(start, config.budget_percent) {
                config.max_attempts
            } else {
                self.budget_rejections.fetch_add(1, Ordering::Relaxed);
                debug!(
                    operation = %operation,
                    budget_percent = config.budget_percent,
                    "retry budget saturated, single attempt"
                );
                1
            }
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.attempts.fetch_add(1, Ordering::Relaxed);

            match f().await {
                Ok(result) => {
                    if attempt > 1 {
                        self.successful_retries.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            operation = %operation,
                            attempts = attempt,
                            "operation succeeded after retry"
                        );
                    }
                    return Ok(result);
                }
                Err(e) => {
                    let error_text = e.to_string();
                    let elapsed = start.elapsed();

                    if elapsed >= config.timeout {
                        self.timed_out.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            operation = %operation,
                            elapsed_ms = elapsed.as_millis(),
                            error = %error_text,
                            "retry deadline exceeded"
                        );
                        return Err(RetryError::TimedOut {
                            elapsed,
                            last_error: e,
                        });
                    }

                    if !config.is_retryable(&error_text) {
                        self.non_retryable.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            operation = %operation,
                            error = %error_text,
                            "non-retryable error"
                        );
                        return Err(RetryError::NotRetryable { last_error: e });
                    }

                    if attempt >= max_attempts {
                        self.exhausted.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            operation = %operation,
                            attempts = attempt,
                            error = %error_text,
                            "retry attempts exhausted"
                        );
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last_error: e,
                        });
                    }

                    self.retries.fetch_add(1, Ordering::Relaxed);
                    self.budget.lock().record_retry(Instant::now());

                    let delay = config.delay_for_attempt(attempt);
                    warn!(
                        operation = %operation,
                        attempt = attempt,
                        delay_ms = delay.as_millis(),
                        error = %error_text,
                        "retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Returns retry statistics.
    pub fn stats(&self) -> RetryStats {
        RetryStats {
            executions: self.executions.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            successful_retries: self.successful_retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            non_retryable: self.non_retryable.load(Ordering::Relaxed),
            budget_rejections: self.budget_rejections.load(Ordering::Relaxed),
        }
    }

    /// Resets activity counters. Registered policies are untouched.
    pub fn reset_stats(&self) {
        self.executions.store(0, Ordering::Relaxed);
        self.attempts.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.successful_retries.store(0, Ordering::Relaxed);
        self.exhausted.store(0, Ordering::Relaxed);
        self.timed_out.store(0, Ordering::Relaxed);
        self.non_retryable.store(0, Ordering::Relaxed);
        self.budget_rejections.store(0, Ordering::Relaxed);
    }
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert!(config.use_jitter);
        assert!(config.is_retryable("ETIMEDOUT"));
    }

    #[test]
    fn test_builder_clamps_invariants() {
        let config = RetryConfig::new()
            .with_max_attempts(0)
            .with_jitter_factor(1.5);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.jitter_factor, 1.0);

        let config = RetryConfig::new().with_jitter_factor(-0.5);
        assert_eq!(config.jitter_factor, 0.0);
    }

    #[test]
    fn test_is_retryable_matching() {
        let config = RetryConfig::new().with_retryable_errors(["ETIMEDOUT", "503", "unavailable"]);

        assert!(config.is_retryable("ETIMEDOUT"));
        assert!(config.is_retryable("request failed: etimedout"));
        assert!(config.is_retryable("upstream returned 503"));
        assert!(config.is_retryable("Service Unavailable"));
        assert!(!config.is_retryable("invalid input"));
    }

    #[test]
    fn test_delay_ladder_capped() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_max_delay(Duration::from_millis(5000))
            .with_jitter(false);

        let delays: Vec<u64> = (1..=7)
            .map(|a| config.delay_for_attempt(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200, 5000]);
    }

    #[test]
    fn test_jitter_bounds() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .with_jitter(true)
            .with_jitter_factor(0.5);

        for _ in 0..100 {
            let delay = config.delay_for_attempt(1).as_millis() as u64;
            assert!((50..=150).contains(&delay), "delay out of bounds: {}", delay);
        }
    }

    #[test]
    fn test_budget_window_rates() {
        let mut budget = RetryBudget::new(Duration::from_secs(10));
        let t0 = Instant::now();

        budget.record_request(t0);
        assert_eq!(budget.retry_rate(t0), 0.0);

        budget.record_retry(t0);
        assert_eq!(budget.retry_rate(t0), 100.0);
        assert!(!budget.allows_retry(t0, 50.0));

        // Outside the window both sides are pruned.
        let later = t0 + Duration::from_secs(11);
        assert_eq!(budget.retry_rate(later), 0.0);
        assert!(budget.allows_retry(later, 50.0));
    }

    #[tokio::test]
    async fn test_execute_success_first_attempt() {
        let engine = RetryEngine::with_defaults();
        let result = engine
            .execute("op", || async { Ok::<i32, String>(42) }, None)
            .await;

        assert_eq!(result.unwrap(), 42);
        let stats = engine.stats();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.retries, 0);
        assert_eq!(stats.successful_retries, 0);
    }

    #[tokio::test]
    async fn test_execute_retries_then_succeeds() {
        let engine = RetryEngine::with_defaults();
        let config = RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false);

        let calls = AtomicU32::new(0);
        let result = engine
            .execute(
                "op",
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err("ETIMEDOUT".to_string())
                        } else {
                            Ok(7)
                        }
                    }
                },
                Some(&config),
            )
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.stats().successful_retries, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_single_attempt() {
        let engine = RetryEngine::with_defaults();
        let config = RetryConfig::new()
            .with_max_attempts(5)
            .with_base_delay(Duration::from_millis(1));

        let calls = AtomicU32::new(0);
        let result: Result<i32, _> = engine
            .execute(
                "op",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("validation failed".to_string()) }
                },
                Some(&config),
            )
            .await;

        assert!(matches!(result, Err(RetryError::NotRetryable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stats().non_retryable, 1);
    }

    #[tokio::test]
    async fn test_exhausted_reports_attempts() {
        let engine = RetryEngine::with_defaults();
        let config = RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false);

        let result: Result<i32, _> = engine
            .execute(
                "op",
                || async { Err("ECONNRESET".to_string()) },
                Some(&config),
            )
            .await;

        match result.unwrap_err() {
            RetryError::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "ECONNRESET");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(engine.stats().exhausted, 1);
    }

    #[tokio::test]
    async fn test_overall_timeout_fails_fast() {
        let engine = RetryEngine::with_defaults();
        let config = RetryConfig::new()
            .with_max_attempts(50)
            .with_base_delay(Duration::from_millis(20))
            .with_jitter(false)
            .with_timeout(Duration::from_millis(50));

        let result: Result<i32, _> = engine
            .execute(
                "op",
                || async { Err("ETIMEDOUT".to_string()) },
                Some(&config),
            )
            .await;

        assert!(matches!(result, Err(RetryError::TimedOut { .. })));
        assert_eq!(engine.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_budget_saturation_forces_single_attempt() {
        let engine = RetryEngine::with_defaults();
        let config = RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false)
            .with_budget_percent(50.0);

        // Burn the budget: one request producing two retries (rate 200%).
        let _: Result<i32, _> = engine
            .execute(
                "op",
                || async { Err("ETIMEDOUT".to_string()) },
                Some(&config),
            )
            .await;
        assert_eq!(engine.stats().retries, 2);

        // Next call runs exactly once regardless of failure.
        let calls = AtomicU32::new(0);
        let result: Result<i32, _> = engine
            .execute(
                "op",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("ETIMEDOUT".to_string()) }
                },
                Some(&config),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stats().budget_rejections, 1);
    }

    #[tokio::test]
    async fn test_policy_resolution_order() {
        let engine = RetryEngine::with_defaults();
        engine.register_policy("op", RetryConfig::new().with_max_attempts(7));

        assert_eq!(engine.policy("op").unwrap().max_attempts, 7);
        assert!(engine.policy("other").is_none());

        let resolved = engine.resolve("op", None);
        assert_eq!(resolved.max_attempts, 7);

        let override_config = RetryConfig::new().with_max_attempts(2);
        let resolved = engine.resolve("op", Some(&override_config));
        assert_eq!(resolved.max_attempts, 2);

        let resolved = engine.resolve("other", None);
        assert_eq!(resolved.max_attempts, 3);
    }
}
