//! # ferrous-conductor
//!
//! Dependency-ordered lifecycle orchestration for in-process components.
//!
//! ## Features
//!
//! - **Explicit dependencies**: every registration declares what it needs up front
//! - **Graph validation**: missing dependencies and cycles are reported before anything starts
//! - **Batched startup**: components come up layer by layer, concurrently inside a layer
//! - **Reverse shutdown**: teardown walks the same plan backwards
//! - **Circuit breakers and retries**: per-component failure isolation with quarantine
//! - **Resolution cache**: singleton, scoped and transient lifetimes with lock-free reads
//!
//! ## Quick Start
//!
//! ```rust
//! use ferrous_conductor::{
//!     async_trait, CancellationToken, Component, Container, Dependencies, Factory, Key,
//!     LifecycleContext, Outcome,
//! };
//!
//! struct Database;
//!
//! #[async_trait]
//! impl Component for Database {
//!     async fn initialize(&self, _ctx: &LifecycleContext) -> Outcome {
//!         Outcome::Success
//!     }
//! }
//!
//! struct Api;
//!
//! #[async_trait]
//! impl Component for Api {}
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let container = Container::new();
//! container.register_singleton("db", Dependencies::none(), 0, Factory::component(|_| Ok(Database))).unwrap();
//! container.register_singleton("api", Dependencies::on(["db"]), 0, Factory::component(|_| Ok(Api))).unwrap();
//!
//! let token = CancellationToken::new();
//! let report = container.initialize_all(&token).await.unwrap();
//! assert!(report.is_success());
//!
//! let shutdown = container.shutdown_all(&token).await;
//! assert_eq!(shutdown.stopped(), [Key::named("api"), Key::named("db")]);
//! # }
//! ```
//!
//! ## Service Lifetimes
//!
//! - **Singleton**: Created once and shared for the life of the container
//! - **Scoped**: Created once per [`Scope`]
//! - **Transient**: Created fresh on every resolution
//!
//! ## Failure Handling
//!
//! Lifecycle hooks return an [`Outcome`]. Transient failures and timeouts are
//! retried according to [`RetryConfig`]; consecutive failures open the
//! component's [`CircuitBreaker`]; fatal failures quarantine the component
//! until [`Container::reset`]. A failing component never takes the engine
//! down: its failure is reported in the [`InitializationReport`].

pub mod cancellation;
pub mod config;
pub mod container;
pub mod descriptors;
pub mod error;
pub mod graph;
pub mod key;
pub mod lifecycle;
pub mod lifetime;
pub mod observer;
pub mod provider;
pub mod registration;
pub mod reliability;
pub mod scheduler;

pub use async_trait::async_trait;

pub use cancellation::CancellationToken;
pub use config::{EngineConfig, EngineConfigBuilder};
pub use container::Container;
pub use descriptors::{AnyArc, Dependencies, Factory, Instance, ServiceDescriptor};
pub use error::{DiError, DiResult};
pub use graph::{DependencyGraph, GraphNode, ValidationError};
pub use key::{key_of_type, Key};
pub use lifecycle::{
    Component, ComponentReport, ComponentState, ComponentStatus, Disposition, Failure, HealthEntry, HealthReport,
    HealthStatus, InitializationReport, LifecycleContext, Orchestrator, Outcome, Severity, ShutdownReport,
};
pub use lifetime::Lifetime;
pub use observer::{LifecycleEvent, LifecycleObserver, Phase, RecordingObserver, TracingObserver};
pub use provider::{ResolutionCache, ResolverContext, Scope};
pub use registration::{Registry, RegistrySnapshot};
pub use reliability::{
    BackoffStrategy, BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakerConfig, ComponentGuard,
    ErrorRecovery, QuarantineRecord, RecoveryOutcome, RetryConfig, RetryContext, RetryPolicy,
};
pub use scheduler::{plan, InitializationPlan};
