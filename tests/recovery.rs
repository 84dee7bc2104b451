/// Error recovery integration tests
///
/// Circuit breaker thresholds, half-open trials, retry bounds, backoff
/// schedules and quarantine, both directly and through the container.

use ferrous_conductor::{
    async_trait, BackoffStrategy, BreakerState, CancellationToken, CircuitBreaker, CircuitBreakerConfig,
    Component, ComponentGuard, ComponentState, Container, Dependencies, DiError, Disposition, EngineConfig,
    ErrorRecovery,
    Factory, Key, LifecycleContext, Outcome, RetryConfig, RetryPolicy,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fails every initialization until `ready` is set or the call count
/// reaches `succeed_from`.
struct Flaky {
    calls: Arc<AtomicU32>,
    ready: Arc<AtomicBool>,
    fatal: bool,
    succeed_from: u32,
}

#[async_trait]
impl Component for Flaky {
    async fn initialize(&self, _ctx: &LifecycleContext) -> Outcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.ready.load(Ordering::SeqCst) || call >= self.succeed_from {
            Outcome::Success
        } else if self.fatal {
            Outcome::fatal("config invalid")
        } else {
            Outcome::transient("connection refused")
        }
    }
}

struct Harness {
    container: Container,
    key: Key,
    calls: Arc<AtomicU32>,
    ready: Arc<AtomicBool>,
    token: CancellationToken,
}

impl Harness {
    fn new(config: EngineConfig, fatal: bool) -> Self {
        Self::succeeding_from(config, fatal, u32::MAX)
    }

    fn succeeding_from(config: EngineConfig, fatal: bool, succeed_from: u32) -> Self {
        let container = Container::with_config(config).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let ready = Arc::new(AtomicBool::new(false));
        let (c, r) = (calls.clone(), ready.clone());
        container
            .register_singleton(
                "X",
                Dependencies::none(),
                0,
                Factory::component(move |_| {
                    Ok(Flaky {
                        calls: c.clone(),
                        ready: r.clone(),
                        fatal,
                        succeed_from,
                    })
                }),
            )
            .unwrap();
        Self {
            container,
            key: Key::named("X"),
            calls,
            ready,
            token: CancellationToken::new(),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

fn config(max_attempts: u32) -> EngineConfig {
    EngineConfig::builder()
        .max_attempts(max_attempts)
        .retry_strategy(BackoffStrategy::Immediate)
        .failure_threshold(3)
        .cooldown(Duration::from_secs(30))
        .max_open_before_quarantine(Duration::from_secs(300))
        .build()
        .unwrap()
}

// ===== Through the container =====

#[tokio::test(start_paused = true)]
async fn open_breaker_refuses_without_invoking_initializer() {
    let h = Harness::new(config(3), false);

    let report = h.container.initialize_all(&h.token).await.unwrap();
    let x = report.component(&h.key).unwrap();
    assert_eq!(x.state, ComponentState::Failed);
    assert_eq!(x.attempts, 3);
    assert_eq!(h.calls(), 3);
    assert_eq!(h.container.breaker_state(&h.key).unwrap().state, BreakerState::Open);

    assert!(matches!(h.container.resolve(&h.key), Err(DiError::CircuitOpen(_))));

    let fourth = h.container.initialize_component(&h.key, &h.token).await.unwrap();
    assert_eq!(fourth.state, ComponentState::Failed);
    assert_eq!(fourth.attempts, 0);
    assert!(matches!(fourth.last_error(), Some(DiError::CircuitOpen(_))));
    assert_eq!(h.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn separate_attempts_open_the_breaker_at_the_threshold() {
    let h = Harness::new(config(1), false);

    for expected in 1..=3 {
        let report = h.container.initialize_component(&h.key, &h.token).await.unwrap();
        assert_eq!(report.state, ComponentState::Failed);
        assert_eq!(h.calls(), expected);
    }
    assert_eq!(h.container.breaker_state(&h.key).unwrap().state, BreakerState::Open);

    let refused = h.container.initialize_component(&h.key, &h.token).await.unwrap();
    assert!(matches!(refused.last_error(), Some(DiError::CircuitOpen(_))));
    assert_eq!(h.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn repeated_passes_retry_failed_component_behind_the_breaker() {
    let config = EngineConfig::builder()
        .max_attempts(1)
        .retry_strategy(BackoffStrategy::Immediate)
        .failure_threshold(3)
        .cooldown(Duration::from_secs(30))
        .max_open_before_quarantine(Duration::from_secs(300))
        .abort_on_batch_failure(false)
        .build()
        .unwrap();
    let h = Harness::new(config, false);

    for expected in 1..=3 {
        let report = h.container.initialize_all(&h.token).await.unwrap();
        let x = report.component(&h.key).unwrap();
        assert_eq!(x.state, ComponentState::Failed);
        assert_eq!(x.disposition, Disposition::Failed);
        assert_eq!(x.attempts, 1);
        assert_eq!(h.calls(), expected);
    }
    assert_eq!(h.container.breaker_state(&h.key).unwrap().state, BreakerState::Open);

    let refused = h.container.initialize_all(&h.token).await.unwrap();
    let x = refused.component(&h.key).unwrap();
    assert_eq!(x.state, ComponentState::Failed);
    assert_eq!(x.attempts, 0);
    assert!(matches!(x.last_error(), Some(DiError::CircuitOpen(_))));
    assert_eq!(h.calls(), 3);

    h.ready.store(true, Ordering::SeqCst);
    tokio::time::advance(Duration::from_secs(30)).await;
    let recovered = h.container.initialize_all(&h.token).await.unwrap();
    let x = recovered.component(&h.key).unwrap();
    assert_eq!(x.state, ComponentState::Running);
    assert_eq!(x.disposition, Disposition::Completed);
    assert_eq!(h.calls(), 4);
    assert_eq!(h.container.breaker_state(&h.key).unwrap().state, BreakerState::Closed);
    assert!(h.container.resolve(&h.key).is_ok());
}

#[tokio::test(start_paused = true)]
async fn half_open_admits_exactly_one_trial() {
    let h = Harness::new(config(3), false);
    h.container.initialize_all(&h.token).await.unwrap();
    assert_eq!(h.calls(), 3);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(h.container.breaker_state(&h.key).unwrap().state, BreakerState::Open);

    let trial = h.container.initialize_component(&h.key, &h.token).await.unwrap();
    assert_eq!(h.calls(), 4);
    assert_eq!(trial.attempts, 1);
    assert!(matches!(trial.last_error(), Some(DiError::CircuitOpen(_))));
    assert_eq!(h.container.breaker_state(&h.key).unwrap().state, BreakerState::Open);

    tokio::time::advance(Duration::from_secs(30)).await;
    h.ready.store(true, Ordering::SeqCst);
    let recovered = h.container.initialize_component(&h.key, &h.token).await.unwrap();
    assert_eq!(recovered.state, ComponentState::Running);
    assert_eq!(h.calls(), 5);

    let breaker = h.container.breaker_state(&h.key).unwrap();
    assert_eq!(breaker.state, BreakerState::Closed);
    assert_eq!(breaker.consecutive_failures, 0);
    assert!(h.container.resolve(&h.key).is_ok());
}

#[tokio::test(start_paused = true)]
async fn breaker_open_too_long_quarantines() {
    let config = EngineConfig::builder()
        .max_attempts(3)
        .retry_strategy(BackoffStrategy::Immediate)
        .failure_threshold(3)
        .cooldown(Duration::from_secs(30))
        .max_open_before_quarantine(Duration::from_secs(60))
        .build()
        .unwrap();
    let h = Harness::new(config, false);
    h.container.initialize_all(&h.token).await.unwrap();

    tokio::time::advance(Duration::from_secs(30)).await;
    h.container.initialize_component(&h.key, &h.token).await.unwrap();
    assert_eq!(h.calls(), 4);
    assert!(!h.container.is_quarantined(&h.key));

    tokio::time::advance(Duration::from_secs(30)).await;
    let report = h.container.initialize_component(&h.key, &h.token).await.unwrap();
    assert!(report.quarantined);
    assert!(matches!(report.quarantine_cause, Some(DiError::TransientOperation { .. })));
    assert_eq!(h.calls(), 4);

    // stays quarantined whatever the breaker does
    tokio::time::advance(Duration::from_secs(600)).await;
    h.ready.store(true, Ordering::SeqCst);
    let again = h.container.initialize_component(&h.key, &h.token).await.unwrap();
    assert!(matches!(again.last_error(), Some(DiError::Quarantined(_))));
    assert_eq!(h.calls(), 4);

    h.container.reset(&h.key).unwrap();
    let report = h.container.initialize_component(&h.key, &h.token).await.unwrap();
    assert_eq!(report.state, ComponentState::Running);
    assert_eq!(h.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn fatal_outcome_quarantines_after_one_call() {
    let h = Harness::new(config(5), true);

    let report = h.container.initialize_all(&h.token).await.unwrap();
    let x = report.component(&h.key).unwrap();

    assert_eq!(h.calls(), 1);
    assert!(x.quarantined);
    assert!(report.quarantined().any(|c| c.key == h.key));
    assert!(matches!(h.container.resolve(&h.key), Err(DiError::Quarantined(_))));
    let record = h.container.quarantine(&h.key).unwrap();
    assert!(record.cause.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn transient_failures_recover_within_attempts() {
    let h = Harness::succeeding_from(config(3), false, 3);

    let report = h.container.initialize_all(&h.token).await.unwrap();
    let x = report.component(&h.key).unwrap();
    assert_eq!(x.state, ComponentState::Running);
    assert_eq!(x.attempts, 3);
    assert_eq!(x.errors.len(), 2);
    assert!(x.errors.iter().all(DiError::is_transient));
    // two failures stay under the threshold of three
    assert_eq!(h.container.breaker_state(&h.key).unwrap().state, BreakerState::Closed);
}

// ===== Direct =====

fn breaker(threshold: u32) -> CircuitBreaker {
    CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: threshold,
        cooldown: Duration::from_secs(5),
        max_open_before_quarantine: Duration::from_secs(3600),
    })
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn breaker_opens_at_exactly_the_threshold(threshold in 1u32..20) {
        let breaker = breaker(threshold);
        for _ in 1..threshold {
            prop_assert!(breaker.try_acquire());
            breaker.record_failure();
            prop_assert_eq!(breaker.state(), BreakerState::Closed);
        }
        prop_assert!(breaker.try_acquire());
        breaker.record_failure();
        prop_assert_eq!(breaker.state(), BreakerState::Open);
        prop_assert!(!breaker.try_acquire());
    }

    #[test]
    fn half_open_allows_one_concurrent_trial(callers in 2usize..10) {
        let rt = paused_runtime();
        rt.block_on(async {
            let breaker = breaker(1);
            breaker.record_failure();
            tokio::time::advance(Duration::from_secs(5)).await;
            let admitted = (0..callers).filter(|_| breaker.try_acquire()).count();
            prop_assert_eq!(admitted, 1);
            Ok(())
        })?;
    }

    #[test]
    fn retries_never_exceed_max_attempts(max_attempts in 1u32..8, threshold in 1u32..12) {
        let rt = paused_runtime();
        rt.block_on(async {
            let key = Key::named("op");
            let guard = ComponentGuard::new(CircuitBreakerConfig {
                failure_threshold: threshold,
                ..Default::default()
            });
            let recovery = ErrorRecovery::new(RetryPolicy::new(RetryConfig {
                strategy: BackoffStrategy::Exponential,
                max_attempts,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(200),
                jitter: true,
            }));
            let calls = AtomicU32::new(0);

            let outcome = recovery
                .execute(&key, &guard, &CancellationToken::new(), |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let key = key.clone();
                    async move {
                        Err::<(), _>(DiError::TransientOperation { key, message: "nope".into() })
                    }
                })
                .await;

            let made = calls.load(Ordering::SeqCst);
            prop_assert!(outcome.result.is_err());
            prop_assert_eq!(made, outcome.attempts);
            prop_assert_eq!(made, max_attempts.min(threshold));
            Ok(())
        })?;
    }

    #[test]
    fn exponential_backoff_is_monotone_and_capped(
        base_ms in 1u64..1_000,
        extra_ms in 0u64..60_000,
        attempts in 1u32..40,
    ) {
        let policy = RetryPolicy::new(RetryConfig {
            strategy: BackoffStrategy::Exponential,
            max_attempts: attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(base_ms + extra_ms),
            jitter: false,
        });
        let delays: Vec<_> = (1..=attempts).map(|n| policy.delay(n)).collect();
        prop_assert_eq!(delays[0], Duration::from_millis(base_ms));
        for pair in delays.windows(2) {
            prop_assert!(pair[0] <= pair[1]);
        }
        prop_assert!(delays.iter().all(|d| *d <= policy.config().max_delay));
    }

    #[test]
    fn jitter_stays_within_half_and_full_delay(base_ms in 1u64..500, attempt in 1u32..10) {
        let policy = RetryPolicy::new(RetryConfig {
            strategy: BackoffStrategy::Exponential,
            max_attempts: 10,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(30),
            jitter: true,
        });
        let full = policy.delay(attempt);
        let jittered = policy.next_delay(attempt, Duration::ZERO);
        let slack = Duration::from_micros(1);
        prop_assert!(jittered <= full + slack);
        prop_assert!(jittered + slack >= full / 2);
    }

    #[test]
    fn jittered_schedule_never_shrinks(
        base_ms in 1u64..200,
        extra_ms in 0u64..2_000,
        attempts in 1u32..24,
    ) {
        let policy = RetryPolicy::new(RetryConfig {
            strategy: BackoffStrategy::Exponential,
            max_attempts: attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(base_ms + extra_ms),
            jitter: true,
        });
        let mut previous = Duration::ZERO;
        for attempt in 1..=attempts {
            let delay = policy.next_delay(attempt, previous);
            prop_assert!(delay >= previous, "attempt {}: {:?} after {:?}", attempt, delay, previous);
            prop_assert!(delay <= policy.config().max_delay);
            previous = delay;
        }
    }
}
