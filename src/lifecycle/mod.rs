//! Component lifecycle: states, hooks and outcomes.
//!
//! Components implement [`Component`] and are registered with
//! [`Factory::component`](crate::Factory::component). The orchestrator drives
//! each one through the [`ComponentState`] machine, one batch of the
//! initialization plan at a time.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancellation::CancellationToken;
use crate::error::{DiError, DiResult};
use crate::key::Key;
use crate::observer::Phase;

pub mod orchestrator;
pub mod report;

pub use orchestrator::Orchestrator;
pub use report::{
    ComponentReport, ComponentStatus, Disposition, HealthEntry, HealthReport, HealthStatus, InitializationReport,
    ShutdownReport,
};

/// Lifecycle state of a managed component.
///
/// ```text
/// Uninitialized -> Initializing -> Running <-> Degraded -> ShuttingDown -> Shutdown
///                       |                         |              |
///                       +--------> Failed <-------+--------------+
/// ```
///
/// `Running -> ShuttingDown` is allowed as well. `Failed -> Uninitialized`
/// (operator reset) and `Shutdown -> Uninitialized` (recreation on the next
/// initialization) restart the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentState {
    Uninitialized,
    Initializing,
    Running,
    Degraded,
    ShuttingDown,
    Shutdown,
    Failed,
}

impl ComponentState {
    pub fn can_transition_to(self, to: ComponentState) -> bool {
        use ComponentState::*;
        matches!(
            (self, to),
            (Uninitialized, Initializing)
                | (Initializing, Running)
                | (Initializing, Failed)
                | (Running, Degraded)
                | (Running, ShuttingDown)
                | (Degraded, Running)
                | (Degraded, ShuttingDown)
                | (Degraded, Failed)
                | (ShuttingDown, Shutdown)
                | (ShuttingDown, Failed)
                | (Shutdown, Uninitialized)
                | (Failed, Uninitialized)
        )
    }

    /// `Running` or `Degraded`.
    pub fn is_active(self) -> bool {
        matches!(self, ComponentState::Running | ComponentState::Degraded)
    }

    /// States a batch may finish in.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            ComponentState::Running | ComponentState::Degraded | ComponentState::Failed
        )
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ComponentState::Uninitialized => "uninitialized",
            ComponentState::Initializing => "initializing",
            ComponentState::Running => "running",
            ComponentState::Degraded => "degraded",
            ComponentState::ShuttingDown => "shutting-down",
            ComponentState::Shutdown => "shutdown",
            ComponentState::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Worth retrying
    Transient,
    /// Retrying will not help; quarantines the component
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub severity: Severity,
    pub message: String,
}

/// Result of a lifecycle hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(Failure),
    /// The component gave up waiting on something itself
    Timeout,
}

impl Outcome {
    pub fn transient(message: impl Into<String>) -> Self {
        Outcome::Failure(Failure {
            severity: Severity::Transient,
            message: message.into(),
        })
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Outcome::Failure(Failure {
            severity: Severity::Fatal,
            message: message.into(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Maps the outcome of a `phase` hook to the engine's error taxonomy.
    pub fn into_result(self, key: &Key, phase: Phase, timeout: Duration) -> DiResult<()> {
        match self {
            Outcome::Success => Ok(()),
            Outcome::Failure(Failure {
                severity: Severity::Transient,
                message,
            }) => Err(DiError::TransientOperation {
                key: key.clone(),
                message,
            }),
            Outcome::Failure(Failure {
                severity: Severity::Fatal,
                message,
            }) => Err(DiError::FatalOperation {
                key: key.clone(),
                message,
            }),
            Outcome::Timeout => Err(DiError::OperationTimeout {
                key: key.clone(),
                phase,
                after: timeout,
            }),
        }
    }
}

impl<E: std::error::Error> From<Result<(), E>> for Outcome {
    /// `Err` becomes a transient failure carrying the error message.
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Outcome::Success,
            Err(e) => Outcome::transient(e.to_string()),
        }
    }
}

/// Information handed to `initialize` and `shutdown`.
#[derive(Debug, Clone)]
pub struct LifecycleContext {
    key: Key,
    attempt: u32,
    timeout: Duration,
    token: CancellationToken,
}

impl LifecycleContext {
    pub fn new(key: Key, attempt: u32, timeout: Duration, token: CancellationToken) -> Self {
        Self {
            key,
            attempt,
            timeout,
            token,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// 1-based attempt number of this call.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Time the call has before it is abandoned.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Lifecycle hooks of a managed component.
///
/// All hooks default to [`Outcome::Success`]. The engine interprets only the
/// outcome; a call that outlives its timeout counts as a transient failure.
///
/// # Examples
///
/// ```rust
/// use ferrous_conductor::{async_trait, Component, LifecycleContext, Outcome};
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// #[derive(Default)]
/// struct Pool { open: AtomicBool }
///
/// #[async_trait]
/// impl Component for Pool {
///     async fn initialize(&self, _ctx: &LifecycleContext) -> Outcome {
///         self.open.store(true, Ordering::SeqCst);
///         Outcome::Success
///     }
///
///     async fn health_check(&self) -> Outcome {
///         if self.open.load(Ordering::SeqCst) { Outcome::Success } else { Outcome::transient("closed") }
///     }
///
///     async fn shutdown(&self, _ctx: &LifecycleContext) -> Outcome {
///         self.open.store(false, Ordering::SeqCst);
///         Outcome::Success
///     }
/// }
/// ```
#[async_trait]
pub trait Component: Send + Sync + 'static {
    async fn initialize(&self, _ctx: &LifecycleContext) -> Outcome {
        Outcome::Success
    }

    async fn health_check(&self) -> Outcome {
        Outcome::Success
    }

    async fn shutdown(&self, _ctx: &LifecycleContext) -> Outcome {
        Outcome::Success
    }
}
