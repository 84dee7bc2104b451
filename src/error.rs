//! Error types for the registry, graph builder and lifecycle engine.

use std::time::Duration;

use crate::graph::ValidationError;
use crate::key::Key;
use crate::lifecycle::ComponentState;
use crate::lifetime::Lifetime;
use crate::observer::Phase;

/// Errors produced by the container and its lifecycle engine.
///
/// The variants follow the engine's error taxonomy:
///
/// | Variant | Class |
/// |---|---|
/// | `CircularDependency`, `MissingRequiredDependency`, `InvalidGraph` | fatal, build time |
/// | `OperationTimeout`, `TransientOperation` | transient, retried |
/// | `FatalOperation` | fatal, never retried, quarantines |
/// | `CircuitOpen` | fail-fast, not a failure of the component |
/// | `Cancelled` | propagates immediately, never retried |
///
/// # Examples
///
/// ```rust
/// use ferrous_conductor::{DiError, Key};
///
/// let cycle = DiError::CircularDependency {
///     cycle: vec![Key::named("a"), Key::named("b"), Key::named("a")],
/// };
/// assert_eq!(cycle.to_string(), "circular dependency: a -> b -> a");
///
/// let timeout = DiError::TransientOperation { key: Key::named("db"), message: "refused".into() };
/// assert!(timeout.is_transient());
/// ```
#[derive(Debug, Clone, thiserror::Error)]
pub enum DiError {
    /// Dependency cycle; first and last element are the same key
    #[error("circular dependency: {}", join_keys(.cycle))]
    CircularDependency { cycle: Vec<Key> },

    /// A required dependency is not registered
    #[error("{service} requires {dependency}, which is not registered")]
    MissingRequiredDependency { service: Key, dependency: Key },

    /// Graph validation failed; nothing was started
    #[error("dependency graph is invalid: {}", join_validation(.0))]
    InvalidGraph(Vec<ValidationError>),

    #[error("{0} is already registered")]
    DuplicateRegistration(Key),

    #[error("service not found: {0}")]
    NotFound(Key),

    #[error("type mismatch for {key}: expected {expected}")]
    TypeMismatch { key: Key, expected: &'static str },

    /// Scoped service resolved outside of a scope
    #[error("{key} has {lifetime} lifetime and cannot be resolved here")]
    WrongLifetime { key: Key, lifetime: Lifetime },

    #[error("max resolution depth {0} exceeded")]
    DepthExceeded(usize),

    /// A lifecycle hook overran its timeout
    #[error("{key} {phase} timed out after {after:?}")]
    OperationTimeout { key: Key, phase: Phase, after: Duration },

    #[error("{key} failed (transient): {message}")]
    TransientOperation { key: Key, message: String },

    #[error("{key} failed (fatal): {message}")]
    FatalOperation { key: Key, message: String },

    #[error("circuit open for {0}")]
    CircuitOpen(Key),

    #[error("{0} was cancelled")]
    Cancelled(Key),

    #[error("{0} is quarantined")]
    Quarantined(Key),

    /// A required dependency ended in `Failed`, so the dependent was never started
    #[error("{service} not started: dependency {dependency} failed")]
    DependencyFailed { service: Key, dependency: Key },

    #[error("illegal transition for {key}: {from} -> {to}")]
    IllegalTransition {
        key: Key,
        from: ComponentState,
        to: ComponentState,
    },

    /// Factory returned an error while constructing an instance
    #[error("factory for {key} failed: {message}")]
    Factory { key: Key, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DiError {
    /// Errors the retry policy may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DiError::OperationTimeout { .. } | DiError::TransientOperation { .. }
        )
    }

    /// Errors that send a component straight to quarantine: anything that is a
    /// real failure of the component but not classified as transient.
    pub fn is_fatal(&self) -> bool {
        self.counts_as_failure() && !self.is_transient()
    }

    /// Errors that count against a circuit breaker.
    pub(crate) fn counts_as_failure(&self) -> bool {
        !matches!(
            self,
            DiError::CircuitOpen(_) | DiError::Cancelled(_) | DiError::Quarantined(_)
        )
    }
}

fn join_keys(keys: &[Key]) -> String {
    keys.iter()
        .map(Key::display_name)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn join_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for container operations.
pub type DiResult<T> = Result<T, DiError>;
