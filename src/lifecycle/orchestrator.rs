//! Batch-by-batch lifecycle orchestration.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cancellation::CancellationToken;
use crate::config::EngineConfig;
use crate::descriptors::{Instance, ServiceDescriptor};
use crate::error::{DiError, DiResult};
use crate::graph::GraphMemo;
use crate::key::Key;
use crate::observer::{LifecycleObserver, Observers, Phase};
use crate::provider::{ResolutionCache, Scope};
use crate::reliability::{BreakerSnapshot, ComponentGuard, ErrorRecovery, QuarantineRecord, RetryPolicy};
use crate::scheduler::{self, InitializationPlan};

use super::report::{
    ComponentReport, ComponentStatus, Disposition, HealthEntry, HealthReport, HealthStatus,
    InitializationReport, ShutdownReport,
};
use super::{Component, ComponentState, LifecycleContext};

/// Orchestrator-owned record of one component.
pub(crate) struct ManagedComponent {
    key: Key,
    state: Mutex<ComponentState>,
    instance: Mutex<Option<Instance>>,
    guard: ComponentGuard,
    last_health: Mutex<Option<HealthStatus>>,
    failures: AtomicU32,
}

impl ManagedComponent {
    fn new(key: Key, config: &EngineConfig) -> Self {
        Self {
            key,
            state: Mutex::new(ComponentState::Uninitialized),
            instance: Mutex::new(None),
            guard: ComponentGuard::new(config.circuit_breaker.clone()),
            last_health: Mutex::new(None),
            failures: AtomicU32::new(0),
        }
    }

    fn state(&self) -> ComponentState {
        *self.state.lock()
    }

    /// Moves to `to` if the state machine allows it from the current state.
    fn transition(&self, to: ComponentState, observers: &Observers) -> DiResult<ComponentState> {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            if !from.can_transition_to(to) {
                return Err(DiError::IllegalTransition {
                    key: self.key.clone(),
                    from,
                    to,
                });
            }
            *state = to;
            from
        };
        if to == ComponentState::Failed {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        observers.transition(&self.key, from, to);
        Ok(from)
    }

    fn settle(&self, to: ComponentState, observers: &Observers) {
        if let Err(error) = self.transition(to, observers) {
            tracing::debug!(key = %self.key, %error, "transition skipped");
        }
    }

    /// Drives the component into `Failed` through legal transitions.
    fn fail(&self, observers: &Observers) {
        match self.state() {
            ComponentState::Uninitialized => self.settle(ComponentState::Initializing, observers),
            ComponentState::Running => self.settle(ComponentState::Degraded, observers),
            _ => {}
        }
        self.settle(ComponentState::Failed, observers);
    }

    fn component(&self) -> Option<Arc<dyn Component>> {
        self.instance
            .lock()
            .as_ref()
            .and_then(|instance| instance.lifecycle().cloned())
    }

    fn fill_quarantine(&self, report: &mut ComponentReport) {
        if let Some(record) = self.guard.quarantine() {
            report.quarantined = true;
            report.quarantine_cause = Some(record.cause);
        }
    }
}

/// Drives registered components through their lifecycle.
///
/// Owned by a [`Container`](crate::Container), which exposes its
/// operations. Components inside a batch run concurrently on the Tokio
/// runtime, bounded by `max_parallelism`; batches run strictly one after
/// another.
pub struct Orchestrator {
    config: EngineConfig,
    recovery: ErrorRecovery,
    cache: Arc<ResolutionCache>,
    /// Holds the orchestrator's own scoped and transient instances
    scope: Scope,
    graphs: Arc<GraphMemo>,
    components: RwLock<AHashMap<Key, Arc<ManagedComponent>>>,
    observers: Observers,
    limiter: Arc<Semaphore>,
    last_plan: Mutex<Option<InitializationPlan>>,
}

impl Orchestrator {
    pub(crate) fn new(config: EngineConfig, cache: Arc<ResolutionCache>, graphs: Arc<GraphMemo>) -> Self {
        Self {
            recovery: ErrorRecovery::new(RetryPolicy::new(config.retry.clone())),
            limiter: Arc::new(Semaphore::new(config.max_parallelism)),
            scope: Scope::new(cache.clone()),
            cache,
            graphs,
            components: RwLock::new(AHashMap::new()),
            observers: Observers::new(),
            last_plan: Mutex::new(None),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn add_observer(&self, observer: Arc<dyn LifecycleObserver>) {
        self.observers.add(observer);
    }

    /// The plan used by the last initialization or shutdown pass.
    pub fn last_plan(&self) -> Option<InitializationPlan> {
        self.last_plan.lock().clone()
    }

    /// Current state of `key`; registered but never started components read
    /// as `Uninitialized`.
    pub fn state_of(&self, key: &Key) -> Option<ComponentState> {
        match self.get(key) {
            Some(managed) => Some(managed.state()),
            None if self.cache.registry().contains(key) => Some(ComponentState::Uninitialized),
            None => None,
        }
    }

    pub fn breaker_state(&self, key: &Key) -> Option<BreakerSnapshot> {
        self.get(key).map(|managed| managed.guard.breaker().snapshot())
    }

    pub fn quarantine(&self, key: &Key) -> Option<QuarantineRecord> {
        self.get(key).and_then(|managed| managed.guard.quarantine())
    }

    pub fn is_quarantined(&self, key: &Key) -> bool {
        self.get(key).is_some_and(|managed| managed.guard.is_quarantined())
    }

    pub fn status(&self, key: &Key) -> Option<ComponentStatus> {
        self.get(key).map(|managed| ComponentStatus {
            key: key.clone(),
            state: managed.state(),
            last_health: *managed.last_health.lock(),
            failures: managed.failures.load(Ordering::Relaxed),
            breaker: managed.guard.breaker().snapshot(),
            quarantine: managed.guard.quarantine(),
        })
    }

    /// Refuses resolution of quarantined components and of components whose
    /// breaker is open.
    pub(crate) fn gate(&self, key: &Key) -> DiResult<()> {
        match self.get(key) {
            Some(managed) => managed.guard.gate(key),
            None => Ok(()),
        }
    }

    /// Clears quarantine and breaker state. A `Failed` component returns to
    /// `Uninitialized` and is rebuilt on its next initialization.
    pub fn reset(&self, key: &Key) -> DiResult<()> {
        let Some(managed) = self.get(key) else {
            return if self.cache.registry().contains(key) {
                Ok(())
            } else {
                Err(DiError::NotFound(key.clone()))
            };
        };
        managed.guard.reset();
        if managed.state() == ComponentState::Failed {
            self.forget_instance(&managed);
            managed.transition(ComponentState::Uninitialized, &self.observers)?;
        }
        tracing::info!(%key, "component reset");
        Ok(())
    }

    /// Initializes every registered component, batch by batch.
    ///
    /// Fails before touching any component when the graph is invalid.
    /// Per-component failures are contained in the report. `Failed`
    /// components get a fresh attempt unless they are quarantined or their
    /// breaker is still open.
    pub async fn initialize_all(self: &Arc<Self>, token: &CancellationToken) -> DiResult<InitializationReport> {
        let started = Instant::now();
        let (graph, errors) = self.graphs.get(self.cache.registry());
        if !errors.is_empty() {
            tracing::error!(errors = errors.len(), "dependency graph is invalid, nothing started");
            return Err(DiError::InvalidGraph(errors.to_vec()));
        }
        let plan = scheduler::plan(&graph)?;
        *self.last_plan.lock() = Some(plan.clone());

        let mut report = InitializationReport {
            plan: plan.clone(),
            components: Vec::with_capacity(plan.component_count()),
            aborted: false,
            cancelled: false,
            elapsed: Duration::ZERO,
        };

        for (index, batch) in plan.batches().iter().enumerate() {
            if report.aborted || token.is_cancelled() {
                report
                    .components
                    .extend(batch.iter().map(|key| self.not_attempted(key, index)));
                continue;
            }

            self.observers.batch_started(Phase::Initialize, index, batch);
            let handles: Vec<_> = batch
                .iter()
                .map(|key| {
                    let this = Arc::clone(self);
                    let key = key.clone();
                    let token = token.clone();
                    tokio::spawn(async move {
                        let blocked_by = this.failed_dependency(&key);
                        this.initialize_one(key, index, blocked_by, token).await
                    })
                })
                .collect();

            for (key, handle) in batch.iter().zip(handles) {
                let component = self.join(key, index, handle).await;
                debug_assert!(
                    component.disposition == Disposition::Unchanged || component.state.is_settled(),
                    "{} left its batch in {}",
                    key,
                    component.state
                );
                let critical = graph.node(key).is_some_and(|node| node.critical);
                if component.state == ComponentState::Failed && critical && self.config.abort_on_batch_failure {
                    report.aborted = true;
                }
                report.components.push(component);
            }

            if report.aborted {
                tracing::warn!(batch = index, "critical component failed, remaining batches aborted");
            }
        }

        report.cancelled = token.is_cancelled();
        report.elapsed = started.elapsed();
        tracing::info!(
            components = report.components.len(),
            failed = report.count(ComponentState::Failed),
            aborted = report.aborted,
            cancelled = report.cancelled,
            elapsed = ?report.elapsed,
            "initialization finished"
        );
        Ok(report)
    }

    /// Initializes a single component, with the same rules as one entry of
    /// [`initialize_all`](Self::initialize_all).
    pub async fn initialize_component(
        self: &Arc<Self>,
        key: &Key,
        token: &CancellationToken,
    ) -> DiResult<ComponentReport> {
        if !self.cache.registry().contains(key) {
            return Err(DiError::NotFound(key.clone()));
        }
        let batch = self
            .last_plan
            .lock()
            .as_ref()
            .and_then(|plan| plan.batch_index_of(key))
            .unwrap_or(0);

        let blocked_by = self.failed_dependency(key);
        Ok(Arc::clone(self)
            .initialize_one(key.clone(), batch, blocked_by, token.clone())
            .await)
    }

    /// Checks every `Running` and `Degraded` component concurrently.
    ///
    /// Cancellation ends checks still waiting or in flight with
    /// [`HealthStatus::Cancelled`] and leaves their state alone.
    pub async fn health_check_all(self: &Arc<Self>, token: &CancellationToken) -> HealthReport {
        let targets: Vec<_> = self
            .ordered_components()
            .into_iter()
            .filter(|managed| managed.state().is_active())
            .collect();

        let handles: Vec<_> = targets
            .iter()
            .map(|managed| {
                let this = Arc::clone(self);
                let managed = Arc::clone(managed);
                let token = token.clone();
                tokio::spawn(async move { this.check_one(managed, token).await })
            })
            .collect();

        let mut report = HealthReport::default();
        for (managed, handle) in targets.iter().zip(handles) {
            let entry = match handle.await {
                Ok(entry) => entry,
                Err(error) => {
                    let error = DiError::FatalOperation {
                        key: managed.key.clone(),
                        message: format!("health check task aborted: {}", error),
                    };
                    let previous = managed.state();
                    managed.fail(&self.observers);
                    HealthEntry {
                        key: managed.key.clone(),
                        previous,
                        state: managed.state(),
                        status: HealthStatus::Unhealthy,
                        attempts: 0,
                        errors: vec![error],
                        quarantined: managed.guard.is_quarantined(),
                    }
                }
            };
            report.components.push(entry);
        }
        report
    }

    /// Shuts components down in the reverse of the last plan.
    ///
    /// Best effort: a failing component is reported and never holds back
    /// later batches. Cancellation stops launching new batches.
    pub async fn shutdown_all(self: &Arc<Self>, token: &CancellationToken) -> ShutdownReport {
        let started = Instant::now();
        let plan = self.shutdown_plan().reversed();
        let mut report = ShutdownReport {
            plan: plan.clone(),
            components: Vec::with_capacity(plan.component_count()),
            cancelled: false,
            elapsed: Duration::ZERO,
        };

        for (index, batch) in plan.batches().iter().enumerate() {
            if token.is_cancelled() {
                report
                    .components
                    .extend(batch.iter().map(|key| self.not_attempted(key, index)));
                continue;
            }

            self.observers.batch_started(Phase::Shutdown, index, batch);
            let handles: Vec<_> = batch
                .iter()
                .map(|key| {
                    let this = Arc::clone(self);
                    let key = key.clone();
                    let token = token.clone();
                    tokio::spawn(async move { this.shutdown_one(key, index, token).await })
                })
                .collect();

            for (key, handle) in batch.iter().zip(handles) {
                report.components.push(self.join(key, index, handle).await);
            }
        }

        report.cancelled = token.is_cancelled();
        report.elapsed = started.elapsed();
        tracing::info!(
            stopped = report.stopped().len(),
            failed = report.failed().count(),
            cancelled = report.cancelled,
            "shutdown finished"
        );
        report
    }

    fn get(&self, key: &Key) -> Option<Arc<ManagedComponent>> {
        self.components.read().get(key).cloned()
    }

    fn managed(&self, key: &Key) -> Arc<ManagedComponent> {
        if let Some(managed) = self.get(key) {
            return managed;
        }
        self.components
            .write()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ManagedComponent::new(key.clone(), &self.config)))
            .clone()
    }

    /// Managed components in registration order.
    fn ordered_components(&self) -> Vec<Arc<ManagedComponent>> {
        let snapshot = self.cache.registry().snapshot();
        let components = self.components.read();
        snapshot
            .iter()
            .filter_map(|descriptor| components.get(&descriptor.key).cloned())
            .collect()
    }

    /// First required dependency of `key` that is currently `Failed`.
    fn failed_dependency(&self, key: &Key) -> Option<Key> {
        let descriptor = self.cache.registry().try_get(key)?;
        descriptor
            .dependencies
            .required_keys()
            .iter()
            .find(|dependency| {
                self.get(dependency)
                    .is_some_and(|managed| managed.state() == ComponentState::Failed)
            })
            .cloned()
    }

    /// Drops the orchestrator's instance and any cached copy so the next
    /// start builds a fresh one.
    fn forget_instance(&self, managed: &ManagedComponent) {
        *managed.instance.lock() = None;
        let keys = [managed.key.clone()];
        self.cache.invalidate(&keys);
        self.scope.invalidate(&keys);
    }

    fn timeout_for(&self, descriptor: &ServiceDescriptor) -> Duration {
        descriptor.timeout.unwrap_or(self.config.default_timeout)
    }

    async fn permit(&self, key: &Key, token: &CancellationToken) -> DiResult<OwnedSemaphorePermit> {
        tokio::select! {
            permit = Arc::clone(&self.limiter).acquire_owned() => {
                permit.map_err(|_| DiError::Cancelled(key.clone()))
            }
            _ = token.cancelled() => Err(DiError::Cancelled(key.clone())),
        }
    }

    fn not_attempted(&self, key: &Key, batch: usize) -> ComponentReport {
        let state = self.state_of(key).unwrap_or(ComponentState::Uninitialized);
        ComponentReport::new(key.clone(), batch, state, Disposition::NotAttempted)
    }

    async fn join(&self, key: &Key, batch: usize, handle: JoinHandle<ComponentReport>) -> ComponentReport {
        match handle.await {
            Ok(report) => report,
            Err(error) => {
                let managed = self.managed(key);
                managed.fail(&self.observers);
                let mut report = ComponentReport::new(key.clone(), batch, managed.state(), Disposition::Failed);
                report.errors.push(DiError::FatalOperation {
                    key: key.clone(),
                    message: format!("lifecycle task aborted: {}", error),
                });
                report
            }
        }
    }

    async fn initialize_one(
        self: Arc<Self>,
        key: Key,
        batch: usize,
        blocked_by: Option<Key>,
        token: CancellationToken,
    ) -> ComponentReport {
        let started = Instant::now();
        let managed = self.managed(&key);
        let mut report = ComponentReport::new(key.clone(), batch, managed.state(), Disposition::Unchanged);

        let Some(descriptor) = self.cache.registry().try_get(&key) else {
            report.errors.push(DiError::NotFound(key));
            return report;
        };

        match managed.state() {
            ComponentState::Uninitialized => {}
            ComponentState::Shutdown => {
                self.forget_instance(&managed);
                managed.settle(ComponentState::Uninitialized, &self.observers);
            }
            ComponentState::Failed => {
                // quarantined, or breaker still cooling down
                if let Err(error) = managed.guard.gate(&key) {
                    report.errors.push(error);
                    report.disposition = Disposition::Failed;
                    managed.fill_quarantine(&mut report);
                    return report;
                }
                self.forget_instance(&managed);
                managed.settle(ComponentState::Uninitialized, &self.observers);
            }
            _ => return report,
        }
        if managed.transition(ComponentState::Initializing, &self.observers).is_err() {
            report.state = managed.state();
            return report;
        }

        let result = self
            .start(&managed, &descriptor, blocked_by, &token, &mut report)
            .await;
        match result {
            Ok(()) => {
                managed.settle(ComponentState::Running, &self.observers);
                report.disposition = Disposition::Completed;
            }
            Err(error) => {
                tracing::warn!(%key, %error, "initialization failed");
                if report.errors.is_empty() {
                    report.errors.push(error);
                }
                *managed.instance.lock() = None;
                managed.settle(ComponentState::Failed, &self.observers);
                report.disposition = Disposition::Failed;
            }
        }

        report.state = managed.state();
        managed.fill_quarantine(&mut report);
        report.elapsed = started.elapsed();
        report
    }

    async fn start(
        &self,
        managed: &ManagedComponent,
        descriptor: &ServiceDescriptor,
        blocked_by: Option<Key>,
        token: &CancellationToken,
        report: &mut ComponentReport,
    ) -> DiResult<()> {
        let key = &managed.key;
        if let Some(dependency) = blocked_by {
            return Err(DiError::DependencyFailed {
                service: key.clone(),
                dependency,
            });
        }
        if managed.guard.is_quarantined() {
            return Err(DiError::Quarantined(key.clone()));
        }
        let _permit = self.permit(key, token).await?;
        if token.is_cancelled() {
            return Err(DiError::Cancelled(key.clone()));
        }

        let instance = self.scope.resolve(key)?;
        *managed.instance.lock() = Some(instance.clone());
        let Some(component) = instance.lifecycle().cloned() else {
            return Ok(());
        };

        let timeout = self.timeout_for(descriptor);
        let outcome = self
            .recovery
            .execute(key, &managed.guard, token, |attempt| {
                let component = component.clone();
                let ctx = LifecycleContext::new(key.clone(), attempt, timeout, token.clone());
                async move {
                    match tokio::time::timeout(timeout, component.initialize(&ctx)).await {
                        Ok(outcome) => outcome.into_result(ctx.key(), Phase::Initialize, timeout),
                        Err(_) => Err(DiError::OperationTimeout {
                            key: ctx.key().clone(),
                            phase: Phase::Initialize,
                            after: timeout,
                        }),
                    }
                }
            })
            .await;

        report.attempts = outcome.attempts;
        report.errors = outcome.errors;
        outcome.result
    }

    async fn check_one(self: Arc<Self>, managed: Arc<ManagedComponent>, token: CancellationToken) -> HealthEntry {
        let key = managed.key.clone();
        let previous = managed.state();
        let mut entry = HealthEntry {
            key: key.clone(),
            previous,
            state: previous,
            status: HealthStatus::Healthy,
            attempts: 0,
            errors: Vec::new(),
            quarantined: false,
        };

        let Some(component) = managed.component() else {
            *managed.last_health.lock() = Some(HealthStatus::Healthy);
            return entry;
        };
        if let Err(error) = managed.guard.gate(&key) {
            entry.status = HealthStatus::CircuitOpen;
            entry.errors.push(error);
            entry.quarantined = managed.guard.is_quarantined();
            *managed.last_health.lock() = Some(entry.status);
            return entry;
        }

        let _permit = match self.permit(&key, &token).await {
            Ok(permit) => permit,
            Err(error) => {
                entry.status = HealthStatus::Cancelled;
                entry.errors.push(error);
                return entry;
            }
        };
        let timeout = self
            .cache
            .registry()
            .try_get(&key)
            .map(|descriptor| self.timeout_for(&descriptor))
            .unwrap_or(self.config.default_timeout);

        let outcome = self
            .recovery
            .execute(&key, &managed.guard, &token, |_| {
                let component = component.clone();
                let key = key.clone();
                async move {
                    match tokio::time::timeout(timeout, component.health_check()).await {
                        Ok(outcome) => outcome.into_result(&key, Phase::HealthCheck, timeout),
                        Err(_) => Err(DiError::OperationTimeout {
                            key,
                            phase: Phase::HealthCheck,
                            after: timeout,
                        }),
                    }
                }
            })
            .await;

        entry.attempts = outcome.attempts;
        entry.errors = outcome.errors;
        match outcome.result {
            Ok(()) => {
                if managed.state() == ComponentState::Degraded {
                    managed.settle(ComponentState::Running, &self.observers);
                }
            }
            Err(DiError::Cancelled(_)) => {
                entry.status = HealthStatus::Cancelled;
                tracing::debug!(%key, "health check cancelled");
            }
            Err(error) => {
                entry.status = if outcome.attempts == 0 && matches!(error, DiError::CircuitOpen(_)) {
                    HealthStatus::CircuitOpen
                } else {
                    HealthStatus::Unhealthy
                };
                tracing::warn!(%key, %error, "health check failed");
                if managed.state() == ComponentState::Running {
                    managed.settle(ComponentState::Degraded, &self.observers);
                }
                if managed.guard.is_quarantined() {
                    managed.settle(ComponentState::Failed, &self.observers);
                }
            }
        }

        *managed.last_health.lock() = Some(entry.status);
        entry.state = managed.state();
        entry.quarantined = managed.guard.is_quarantined();
        entry
    }

    /// The last plan, recomputed when the registry changed since and the new
    /// graph is valid.
    fn shutdown_plan(&self) -> InitializationPlan {
        let registry = self.cache.registry();
        let last = self.last_plan.lock().clone();
        if let Some(plan) = &last {
            if plan.generation() == registry.generation() {
                return plan.clone();
            }
        }

        let (graph, errors) = self.graphs.get(registry);
        if errors.is_empty() {
            if let Ok(plan) = scheduler::plan(&graph) {
                *self.last_plan.lock() = Some(plan.clone());
                return plan;
            }
        }
        tracing::warn!("graph changed and is no longer valid, shutting down with the last plan");
        last.unwrap_or_default()
    }

    async fn shutdown_one(self: Arc<Self>, key: Key, batch: usize, token: CancellationToken) -> ComponentReport {
        let started = Instant::now();
        let Some(managed) = self.get(&key) else {
            return ComponentReport::new(key, batch, ComponentState::Uninitialized, Disposition::Unchanged);
        };
        let mut report = ComponentReport::new(key.clone(), batch, managed.state(), Disposition::Unchanged);
        if !managed.state().is_active() || managed.transition(ComponentState::ShuttingDown, &self.observers).is_err() {
            report.state = managed.state();
            return report;
        }

        let result = match self.permit(&key, &token).await {
            Err(error) => Err(error),
            Ok(_permit) => match managed.component() {
                None => Ok(()),
                Some(component) => {
                    report.attempts = 1;
                    let timeout = self
                        .cache
                        .registry()
                        .try_get(&key)
                        .map(|descriptor| self.timeout_for(&descriptor))
                        .unwrap_or(self.config.default_timeout);
                    let ctx = LifecycleContext::new(key.clone(), 1, timeout, token.clone());
                    tokio::select! {
                        result = tokio::time::timeout(timeout, component.shutdown(&ctx)) => match result {
                            Ok(outcome) => outcome.into_result(&key, Phase::Shutdown, timeout),
                            Err(_) => Err(DiError::OperationTimeout {
                                key: key.clone(),
                                phase: Phase::Shutdown,
                                after: timeout,
                            }),
                        },
                        _ = token.cancelled() => Err(DiError::Cancelled(key.clone())),
                    }
                }
            },
        };

        *managed.instance.lock() = None;
        match result {
            Ok(()) => {
                managed.settle(ComponentState::Shutdown, &self.observers);
                report.disposition = Disposition::Completed;
            }
            Err(error) => {
                tracing::warn!(%key, %error, "shutdown failed");
                report.errors.push(error);
                managed.settle(ComponentState::Failed, &self.observers);
                report.disposition = Disposition::Failed;
            }
        }
        report.state = managed.state();
        report.elapsed = started.elapsed();
        report
    }
}
