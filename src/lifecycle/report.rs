//! Reports returned by the orchestrator.

use std::time::Duration;

use crate::error::DiError;
use crate::key::Key;
use crate::lifecycle::ComponentState;
use crate::reliability::{BreakerSnapshot, QuarantineRecord};
use crate::scheduler::InitializationPlan;

/// What happened to a component during one orchestrator pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The lifecycle operation ran and succeeded
    Completed,
    /// Left as it was: already in the target state, or not eligible
    Unchanged,
    /// The operation ran, or was refused, and the component ended `Failed`
    Failed,
    /// Its batch was never launched because of an abort or cancellation
    NotAttempted,
}

/// Final state of one component and how it got there.
#[derive(Debug, Clone)]
pub struct ComponentReport {
    pub key: Key,
    /// Batch index within the plan of this pass
    pub batch: usize,
    pub state: ComponentState,
    pub disposition: Disposition,
    /// Calls that reached the component's hook
    pub attempts: u32,
    /// Every error seen, oldest first
    pub errors: Vec<DiError>,
    pub quarantined: bool,
    /// Error that caused quarantine
    pub quarantine_cause: Option<DiError>,
    pub elapsed: Duration,
}

impl ComponentReport {
    pub(crate) fn new(key: Key, batch: usize, state: ComponentState, disposition: Disposition) -> Self {
        Self {
            key,
            batch,
            state,
            disposition,
            attempts: 0,
            errors: Vec::new(),
            quarantined: false,
            quarantine_cause: None,
            elapsed: Duration::ZERO,
        }
    }

    /// The error that decided the outcome.
    pub fn last_error(&self) -> Option<&DiError> {
        self.errors.last()
    }
}

/// Result of [`initialize_all`](crate::Container::initialize_all).
#[derive(Debug, Clone)]
pub struct InitializationReport {
    pub plan: InitializationPlan,
    /// One entry per planned component, in plan order
    pub components: Vec<ComponentReport>,
    /// Later batches were skipped after a critical failure
    pub aborted: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl InitializationReport {
    pub fn component(&self, key: &Key) -> Option<&ComponentReport> {
        self.components.iter().find(|c| &c.key == key)
    }

    pub fn state_of(&self, key: &Key) -> Option<ComponentState> {
        self.component(key).map(|c| c.state)
    }

    /// True when every component ended `Running` or `Degraded`.
    pub fn is_success(&self) -> bool {
        !self.aborted && !self.cancelled && self.components.iter().all(|c| c.state.is_active())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ComponentReport> {
        self.components.iter().filter(|c| c.state == ComponentState::Failed)
    }

    pub fn quarantined(&self) -> impl Iterator<Item = &ComponentReport> {
        self.components.iter().filter(|c| c.quarantined)
    }

    pub fn count(&self, state: ComponentState) -> usize {
        self.components.iter().filter(|c| c.state == state).count()
    }
}

/// Outcome of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// Not checked: the breaker refused the call
    CircuitOpen,
    /// Cancelled before the check finished; state left as it was
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct HealthEntry {
    pub key: Key,
    pub previous: ComponentState,
    pub state: ComponentState,
    pub status: HealthStatus,
    pub attempts: u32,
    pub errors: Vec<DiError>,
    pub quarantined: bool,
}

/// Result of [`health_check_all`](crate::Container::health_check_all).
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub components: Vec<HealthEntry>,
}

impl HealthReport {
    pub fn entry(&self, key: &Key) -> Option<&HealthEntry> {
        self.components.iter().find(|c| &c.key == key)
    }

    pub fn is_healthy(&self) -> bool {
        self.components.iter().all(|c| c.status == HealthStatus::Healthy)
    }

    pub fn unhealthy(&self) -> impl Iterator<Item = &HealthEntry> {
        self.components
            .iter()
            .filter(|c| c.status != HealthStatus::Healthy)
    }
}

/// Point-in-time view of one managed component.
#[derive(Debug, Clone)]
pub struct ComponentStatus {
    pub key: Key,
    pub state: ComponentState,
    /// Outcome of the most recent health check, if any ran
    pub last_health: Option<HealthStatus>,
    /// Times the component has entered `Failed`
    pub failures: u32,
    pub breaker: BreakerSnapshot,
    pub quarantine: Option<QuarantineRecord>,
}

/// Result of [`shutdown_all`](crate::Container::shutdown_all).
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// The reversed plan that was walked
    pub plan: InitializationPlan,
    pub components: Vec<ComponentReport>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn component(&self, key: &Key) -> Option<&ComponentReport> {
        self.components.iter().find(|c| &c.key == key)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ComponentReport> {
        self.components
            .iter()
            .filter(|c| c.disposition == Disposition::Failed)
    }

    /// Components that were not running and were left alone.
    pub fn skipped(&self) -> impl Iterator<Item = &ComponentReport> {
        self.components
            .iter()
            .filter(|c| c.disposition == Disposition::Unchanged)
    }

    /// Keys that completed shutdown, in the order they are listed.
    pub fn stopped(&self) -> Vec<Key> {
        self.components
            .iter()
            .filter(|c| c.disposition == Disposition::Completed)
            .map(|c| c.key.clone())
            .collect()
    }
}
