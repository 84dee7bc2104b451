//! The engine's public handle.

use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::config::EngineConfig;
use crate::descriptors::{Dependencies, Factory, Instance, ServiceDescriptor};
use crate::error::{DiError, DiResult};
use crate::graph::{DependencyGraph, GraphMemo, ValidationError};
use crate::key::Key;
use crate::lifecycle::{
    ComponentReport, ComponentState, ComponentStatus, HealthReport, InitializationReport, Orchestrator,
    ShutdownReport,
};
use crate::lifetime::Lifetime;
use crate::observer::LifecycleObserver;
use crate::provider::{ResolutionCache, Scope};
use crate::registration::Registry;
use crate::reliability::{BreakerSnapshot, QuarantineRecord};
use crate::scheduler::{self, InitializationPlan};

/// Registry, resolution cache and lifecycle orchestrator behind one handle.
///
/// Cloning is cheap and every clone shares the same state.
///
/// # Examples
///
/// ```rust
/// use ferrous_conductor::{CancellationToken, ComponentState, Container, Dependencies, Factory, Key};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// struct Config { url: &'static str }
/// struct Repo { url: &'static str }
///
/// let container = Container::new();
/// container.register_singleton("config", Dependencies::none(), 0, Factory::instance(Config { url: "db://local" })).unwrap();
/// container.register_singleton("repo", Dependencies::on(["config"]), 0, Factory::service(|ctx| {
///     let config = ctx.get::<Config>("config")?;
///     Ok(Repo { url: config.url })
/// })).unwrap();
///
/// let report = container.initialize_all(&CancellationToken::new()).await.unwrap();
/// assert!(report.is_success());
/// assert_eq!(report.plan.batches(), [vec![Key::named("config")], vec![Key::named("repo")]]);
///
/// let repo = container.resolve_as::<Repo>(&Key::named("repo")).unwrap();
/// assert_eq!(repo.url, "db://local");
/// assert_eq!(container.state_of(&Key::named("repo")), Some(ComponentState::Running));
/// # }
/// ```
#[derive(Clone)]
pub struct Container {
    registry: Arc<Registry>,
    cache: Arc<ResolutionCache>,
    graphs: Arc<GraphMemo>,
    orchestrator: Arc<Orchestrator>,
}

impl Container {
    /// Creates a container with the default configuration.
    pub fn new() -> Self {
        Self::build(EngineConfig::default())
    }

    /// Creates a container after validating `config`.
    pub fn with_config(config: EngineConfig) -> DiResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: EngineConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let cache = Arc::new(ResolutionCache::new(registry.clone()));
        let graphs = Arc::new(GraphMemo::new());
        let orchestrator = Arc::new(Orchestrator::new(config, cache.clone(), graphs.clone()));
        Self {
            registry,
            cache,
            graphs,
            orchestrator,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        self.orchestrator.config()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResolutionCache> {
        &self.cache
    }

    pub fn add_observer(&self, observer: Arc<dyn LifecycleObserver>) {
        self.orchestrator.add_observer(observer);
    }

    // ----- Registration -----

    pub fn register(&self, descriptor: ServiceDescriptor) -> DiResult<Arc<ServiceDescriptor>> {
        self.registry.register(descriptor)
    }

    pub fn register_singleton(
        &self,
        key: impl Into<Key>,
        dependencies: Dependencies,
        priority: i32,
        factory: Factory,
    ) -> DiResult<Arc<ServiceDescriptor>> {
        self.register_with(key, Lifetime::Singleton, dependencies, priority, factory)
    }

    pub fn register_scoped(
        &self,
        key: impl Into<Key>,
        dependencies: Dependencies,
        priority: i32,
        factory: Factory,
    ) -> DiResult<Arc<ServiceDescriptor>> {
        self.register_with(key, Lifetime::Scoped, dependencies, priority, factory)
    }

    pub fn register_transient(
        &self,
        key: impl Into<Key>,
        dependencies: Dependencies,
        priority: i32,
        factory: Factory,
    ) -> DiResult<Arc<ServiceDescriptor>> {
        self.register_with(key, Lifetime::Transient, dependencies, priority, factory)
    }

    fn register_with(
        &self,
        key: impl Into<Key>,
        lifetime: Lifetime,
        dependencies: Dependencies,
        priority: i32,
        factory: Factory,
    ) -> DiResult<Arc<ServiceDescriptor>> {
        self.register(
            ServiceDescriptor::new(key, lifetime, factory)
                .with_dependencies(dependencies)
                .with_priority(priority),
        )
    }

    /// Swaps in a new descriptor for an existing key and returns the old one.
    ///
    /// Cached instances of the key and of everything that depends on it,
    /// directly or transitively, are dropped along with the cached graph.
    /// Components already running keep their current instance.
    pub fn replace(&self, descriptor: ServiceDescriptor) -> DiResult<Arc<ServiceDescriptor>> {
        let key = descriptor.key.clone();
        let (graph, _) = self.graphs.get(&self.registry);
        let previous = self.registry.replace(descriptor)?;

        let mut stale = graph.transitive_dependents(&key);
        stale.insert(0, key.clone());
        let dropped = self.cache.invalidate(&stale);
        self.graphs.clear();
        tracing::info!(%key, invalidated = stale.len(), dropped, "descriptor replaced");
        Ok(previous)
    }

    // ----- Resolution -----

    /// Resolves `key` from the root.
    ///
    /// Refused while the key's breaker is open or the key is quarantined.
    pub fn resolve(&self, key: &Key) -> DiResult<Instance> {
        self.orchestrator.gate(key)?;
        self.cache.resolve(key)
    }

    pub fn try_resolve(&self, key: &Key) -> Option<Instance> {
        self.resolve(key).ok()
    }

    pub fn resolve_as<T: Send + Sync + 'static>(&self, key: &Key) -> DiResult<Arc<T>> {
        self.resolve(key)?.downcast::<T>().ok_or_else(|| DiError::TypeMismatch {
            key: key.clone(),
            expected: std::any::type_name::<T>(),
        })
    }

    /// Opens a scope for scoped registrations.
    pub fn create_scope(&self) -> Scope {
        Scope::new(self.cache.clone())
    }

    // ----- Graph -----

    /// The graph of the current registrations and its validation errors.
    pub fn graph(&self) -> (Arc<DependencyGraph>, Vec<ValidationError>) {
        let (graph, errors) = self.graphs.get(&self.registry);
        (graph, errors.to_vec())
    }

    /// Fails with [`DiError::InvalidGraph`] if any registration is unsatisfiable.
    pub fn validate(&self) -> DiResult<()> {
        let (_, errors) = self.graphs.get(&self.registry);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DiError::InvalidGraph(errors.to_vec()))
        }
    }

    /// The initialization plan for the current registrations.
    pub fn plan(&self) -> DiResult<InitializationPlan> {
        self.validate()?;
        let (graph, _) = self.graphs.get(&self.registry);
        scheduler::plan(&graph)
    }

    // ----- Lifecycle -----

    pub async fn initialize_all(&self, token: &CancellationToken) -> DiResult<InitializationReport> {
        self.orchestrator.initialize_all(token).await
    }

    pub async fn initialize_component(&self, key: &Key, token: &CancellationToken) -> DiResult<ComponentReport> {
        self.orchestrator.initialize_component(key, token).await
    }

    pub async fn health_check_all(&self, token: &CancellationToken) -> HealthReport {
        self.orchestrator.health_check_all(token).await
    }

    pub async fn shutdown_all(&self, token: &CancellationToken) -> ShutdownReport {
        self.orchestrator.shutdown_all(token).await
    }

    pub fn reset(&self, key: &Key) -> DiResult<()> {
        self.orchestrator.reset(key)
    }

    pub fn state_of(&self, key: &Key) -> Option<ComponentState> {
        self.orchestrator.state_of(key)
    }

    pub fn status(&self, key: &Key) -> Option<ComponentStatus> {
        self.orchestrator.status(key)
    }

    pub fn breaker_state(&self, key: &Key) -> Option<BreakerSnapshot> {
        self.orchestrator.breaker_state(key)
    }

    pub fn is_quarantined(&self, key: &Key) -> bool {
        self.orchestrator.is_quarantined(key)
    }

    pub fn quarantine(&self, key: &Key) -> Option<QuarantineRecord> {
        self.orchestrator.quarantine(key)
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_before_initialization_builds_singleton() {
        let container = Container::new();
        container
            .register_singleton("n", Dependencies::none(), 0, Factory::instance(7u32))
            .unwrap();
        assert_eq!(*container.resolve_as::<u32>(&Key::named("n")).unwrap(), 7);
        assert_eq!(container.state_of(&Key::named("n")), Some(ComponentState::Uninitialized));
        assert_eq!(container.state_of(&Key::named("missing")), None);
    }

    #[test]
    fn resolve_as_reports_type_mismatch() {
        let container = Container::new();
        container
            .register_singleton("n", Dependencies::none(), 0, Factory::instance(7u32))
            .unwrap();
        assert!(matches!(
            container.resolve_as::<String>(&Key::named("n")),
            Err(DiError::TypeMismatch { .. })
        ));
        assert!(container.try_resolve(&Key::named("absent")).is_none());
    }

    #[test]
    fn plan_rejects_invalid_graph() {
        let container = Container::new();
        container
            .register_singleton("a", Dependencies::on(["ghost"]), 0, Factory::instance(()))
            .unwrap();
        assert!(matches!(container.plan(), Err(DiError::InvalidGraph(errors)) if errors.len() == 1));
    }

    #[test]
    fn replace_invalidates_dependents() {
        let container = Container::new();
        container
            .register_singleton("base", Dependencies::none(), 0, Factory::instance(1u32))
            .unwrap();
        container
            .register_singleton(
                "top",
                Dependencies::on(["base"]),
                0,
                Factory::service(|ctx| Ok(*ctx.get::<u32>("base")? + 10)),
            )
            .unwrap();
        assert_eq!(*container.resolve_as::<u32>(&Key::named("top")).unwrap(), 11);

        container
            .replace(ServiceDescriptor::singleton("base", Factory::instance(5u32)))
            .unwrap();
        assert_eq!(*container.resolve_as::<u32>(&Key::named("top")).unwrap(), 15);
    }
}
