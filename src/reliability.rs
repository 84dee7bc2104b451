//! Error recovery: circuit breakers, retry policies and quarantine.
//!
//! Every lifecycle call the orchestrator makes goes through
//! [`ErrorRecovery::execute`] together with the component's own
//! [`ComponentGuard`]. The guard owns the breaker and the quarantine record;
//! the recovery layer owns the retry policy and is shared by all components.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::cancellation::CancellationToken;
use crate::config::duration_ms;
use crate::error::{DiError, DiResult};
use crate::key::Key;

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting a trial call
    #[serde(with = "duration_ms")]
    pub cooldown: Duration,
    /// A circuit that has not closed again within this window quarantines
    /// its component
    #[serde(with = "duration_ms")]
    pub max_open_before_quarantine: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_open_before_quarantine: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        })
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_transition: Instant,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_transition: Instant,
    /// When the circuit first opened; kept across half-open trials until
    /// the circuit closes again
    open_since: Option<Instant>,
    trial_in_flight: bool,
}

/// Per-component circuit breaker.
///
/// Opens after exactly `failure_threshold` consecutive failures. While open,
/// [`try_acquire`](Self::try_acquire) refuses every call. Once `cooldown`
/// has passed, exactly one trial call is admitted; its outcome closes the
/// circuit or re-opens it with a fresh cooldown.
///
/// # Examples
///
/// ```rust
/// use ferrous_conductor::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
/// use std::time::Duration;
///
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig {
///     failure_threshold: 2,
///     cooldown: Duration::from_secs(60),
///     ..Default::default()
/// });
///
/// assert!(breaker.try_acquire());
/// breaker.record_failure();
/// assert_eq!(breaker.state(), BreakerState::Closed);
/// breaker.record_failure();
/// assert_eq!(breaker.state(), BreakerState::Open);
/// assert!(!breaker.try_acquire());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_transition: Instant::now(),
                open_since: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open circuit whose cooldown has elapsed reads as
    /// `HalfOpen` even before the trial call is made.
    pub fn state(&self) -> BreakerState {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Open if inner.last_transition.elapsed() >= self.config.cooldown => {
                BreakerState::HalfOpen
            }
            state => state,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_transition: inner.last_transition,
            failure_threshold: self.config.failure_threshold,
            cooldown: self.config.cooldown,
        }
    }

    /// True while calls would be refused without invoking the operation.
    pub fn is_rejecting(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => inner.last_transition.elapsed() < self.config.cooldown,
            BreakerState::HalfOpen => inner.trial_in_flight,
        }
    }

    /// Asks permission to make one call.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if inner.last_transition.elapsed() < self.config.cooldown {
                    return false;
                }
                inner.state = BreakerState::HalfOpen;
                inner.last_transition = Instant::now();
                inner.trial_in_flight = true;
                tracing::debug!("circuit half-open, admitting trial call");
                true
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            inner.state = BreakerState::Closed;
            inner.last_transition = Instant::now();
            inner.open_since = None;
            tracing::info!("circuit closed");
        }
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.trial_in_flight = false;
        let open = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            BreakerState::Open => false,
        };
        if open {
            let now = Instant::now();
            inner.state = BreakerState::Open;
            inner.last_transition = now;
            inner.open_since.get_or_insert(now);
            tracing::warn!(failures = inner.consecutive_failures, "circuit opened");
        }
    }

    /// Gives back an admitted call that ended without a verdict, such as a
    /// cancelled one. Nothing is counted.
    pub fn release(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    /// How long the circuit has been away from `Closed`.
    pub fn open_for(&self) -> Option<Duration> {
        self.inner.lock().open_since.map(|since| since.elapsed())
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.last_transition = Instant::now();
        inner.open_since = None;
        inner.trial_in_flight = false;
    }
}

/// Why and when a component was quarantined.
#[derive(Debug, Clone)]
pub struct QuarantineRecord {
    /// The error that triggered quarantine
    pub cause: DiError,
    pub since: DateTime<Utc>,
}

/// Recovery state owned by one component: its breaker, its quarantine
/// record and the last real failure it reported.
#[derive(Debug)]
pub struct ComponentGuard {
    breaker: CircuitBreaker,
    quarantine: Mutex<Option<QuarantineRecord>>,
    last_failure: Mutex<Option<DiError>>,
}

impl ComponentGuard {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(config),
            quarantine: Mutex::new(None),
            last_failure: Mutex::new(None),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn quarantine(&self) -> Option<QuarantineRecord> {
        self.quarantine.lock().clone()
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantine.lock().is_some()
    }

    pub(crate) fn quarantine_with(&self, key: &Key, cause: DiError) {
        let mut slot = self.quarantine.lock();
        if slot.is_none() {
            tracing::warn!(%key, %cause, "component quarantined");
            *slot = Some(QuarantineRecord {
                cause,
                since: Utc::now(),
            });
        }
    }

    /// Clears quarantine and closes the breaker.
    pub fn reset(&self) {
        *self.quarantine.lock() = None;
        *self.last_failure.lock() = None;
        self.breaker.reset();
    }

    /// Error to return when a call is refused: `Quarantined` or
    /// `CircuitOpen`.
    pub fn gate(&self, key: &Key) -> DiResult<()> {
        if self.is_quarantined() {
            return Err(DiError::Quarantined(key.clone()));
        }
        if self.breaker.is_rejecting() {
            return Err(DiError::CircuitOpen(key.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Retry at once
    Immediate,
    /// Fixed `base_delay` between attempts
    Linear,
    /// `base_delay` doubled after every attempt, capped at `max_delay`
    Exponential,
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackoffStrategy::Immediate => "immediate",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Exponential => "exponential",
        })
    }
}

/// Retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub strategy: BackoffStrategy,
    /// Total attempts including the first call
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `[0.5, 1.0]`, never going
    /// below the delay used before it
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

/// Backoff schedule derived from a [`RetryConfig`].
///
/// ```rust
/// use ferrous_conductor::{BackoffStrategy, RetryConfig, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(RetryConfig {
///     strategy: BackoffStrategy::Exponential,
///     max_attempts: 6,
///     base_delay: Duration::from_millis(100),
///     max_delay: Duration::from_millis(500),
///     jitter: false,
/// });
///
/// let delays: Vec<_> = (1..=5).map(|n| policy.delay(n).as_millis()).collect();
/// assert_eq!(delays, [100, 200, 400, 500, 500]);
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Delay after failed attempt `attempt` (1-based), before jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let RetryConfig {
            base_delay,
            max_delay,
            ..
        } = self.config;
        match self.config.strategy {
            BackoffStrategy::Immediate => Duration::ZERO,
            BackoffStrategy::Linear => base_delay.min(max_delay),
            BackoffStrategy::Exponential => 1u32
                .checked_shl(attempt.saturating_sub(1))
                .and_then(|factor| base_delay.checked_mul(factor))
                .unwrap_or(max_delay)
                .min(max_delay),
        }
    }

    /// Delay to sleep after failed attempt `attempt`, with jitter applied
    /// when configured. `previous` is the delay slept before it; the result
    /// is never shorter, so a jittered schedule stays non-decreasing.
    pub fn next_delay(&self, attempt: u32, previous: Duration) -> Duration {
        let delay = self.delay(attempt);
        if !self.config.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::rng().random_range(0.5..=1.0);
        delay.mul_f64(factor).max(previous).min(self.config.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Progress of one retried operation.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub attempt: u32,
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    started: Instant,
    pub last_error: Option<DiError>,
    /// Backoff slept after the previous attempt
    pub last_delay: Duration,
}

impl RetryContext {
    fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            max_attempts: policy.max_attempts(),
            strategy: policy.config.strategy,
            started: Instant::now(),
            last_error: None,
            last_delay: Duration::ZERO,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Result of [`ErrorRecovery::execute`].
#[derive(Debug)]
pub struct RecoveryOutcome<T> {
    pub result: DiResult<T>,
    /// Calls that actually reached the operation
    pub attempts: u32,
    /// Every error seen, oldest first
    pub errors: Vec<DiError>,
    pub elapsed: Duration,
}

impl<T> RecoveryOutcome<T> {
    fn finish(ctx: RetryContext, errors: Vec<DiError>, result: DiResult<T>) -> Self {
        Self {
            result,
            attempts: ctx.attempt,
            elapsed: ctx.elapsed(),
            errors,
        }
    }
}

/// Breaker-gated retry loop shared by every component.
///
/// Per call:
///
/// 1. quarantined components fail with [`DiError::Quarantined`];
/// 2. a circuit that has stayed away from `Closed` longer than
///    `max_open_before_quarantine` quarantines the component;
/// 3. a refusing breaker fails with [`DiError::CircuitOpen`] without
///    invoking the operation;
/// 4. transient errors are retried with backoff until `max_attempts`;
///    fatal errors quarantine immediately; cancellation ends the loop.
#[derive(Debug, Clone)]
pub struct ErrorRecovery {
    policy: RetryPolicy,
}

impl ErrorRecovery {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` under `guard`. The closure receives the 1-based
    /// attempt number.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &Key,
        guard: &ComponentGuard,
        token: &CancellationToken,
        mut operation: F,
    ) -> RecoveryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DiResult<T>>,
    {
        let mut ctx = RetryContext::new(&self.policy);
        let mut errors = Vec::new();

        loop {
            if guard.is_quarantined() {
                let error = DiError::Quarantined(key.clone());
                errors.push(error.clone());
                return RecoveryOutcome::finish(ctx, errors, Err(error));
            }
            if token.is_cancelled() {
                let error = DiError::Cancelled(key.clone());
                errors.push(error.clone());
                return RecoveryOutcome::finish(ctx, errors, Err(error));
            }
            let max_open = guard.breaker.config().max_open_before_quarantine;
            if guard.breaker.open_for().is_some_and(|open| open >= max_open) {
                let cause = guard
                    .last_failure
                    .lock()
                    .clone()
                    .unwrap_or_else(|| DiError::CircuitOpen(key.clone()));
                guard.quarantine_with(key, cause);
                continue;
            }
            if !guard.breaker.try_acquire() {
                tracing::debug!(%key, "circuit open, call refused");
                let error = DiError::CircuitOpen(key.clone());
                errors.push(error.clone());
                return RecoveryOutcome::finish(ctx, errors, Err(error));
            }

            ctx.attempt += 1;
            let result = tokio::select! {
                result = operation(ctx.attempt) => result,
                _ = token.cancelled() => Err(DiError::Cancelled(key.clone())),
            };

            let error = match result {
                Ok(value) => {
                    guard.breaker.record_success();
                    return RecoveryOutcome::finish(ctx, errors, Ok(value));
                }
                Err(error) => error,
            };
            errors.push(error.clone());

            if !error.counts_as_failure() {
                guard.breaker.release();
                return RecoveryOutcome::finish(ctx, errors, Err(error));
            }

            guard.breaker.record_failure();
            *guard.last_failure.lock() = Some(error.clone());
            ctx.last_error = Some(error.clone());

            if error.is_fatal() {
                guard.quarantine_with(key, error.clone());
                return RecoveryOutcome::finish(ctx, errors, Err(error));
            }
            if ctx.exhausted() {
                return RecoveryOutcome::finish(ctx, errors, Err(error));
            }

            let delay = self.policy.next_delay(ctx.attempt, ctx.last_delay);
            ctx.last_delay = delay;
            tracing::debug!(
                %key,
                attempt = ctx.attempt,
                max_attempts = ctx.max_attempts,
                strategy = %ctx.strategy,
                ?delay,
                error = %error,
                "retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => {
                    let error = DiError::Cancelled(key.clone());
                    errors.push(error.clone());
                    return RecoveryOutcome::finish(ctx, errors, Err(error));
                }
            }
        }
    }
}

impl Default for ErrorRecovery {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
