//! Lifecycle event observation.
//!
//! Every state transition the orchestrator makes is reported to the
//! registered [`LifecycleObserver`]s as a [`LifecycleEvent`]. This is the
//! engine's only outward side channel; structured `tracing` output is
//! provided by [`TracingObserver`], which every container installs.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::key::Key;
use crate::lifecycle::ComponentState;

/// A single component state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub key: Key,
    pub from: ComponentState,
    pub to: ComponentState,
    pub at: DateTime<Utc>,
}

/// Which orchestrator pass a call or batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Initialize,
    HealthCheck,
    Shutdown,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Phase::Initialize => "initialization",
            Phase::HealthCheck => "health check",
            Phase::Shutdown => "shutdown",
        })
    }
}

/// Receives lifecycle events.
///
/// Calls are made synchronously from orchestrator tasks, possibly from
/// several threads at once. Keep implementations cheap.
///
/// # Examples
///
/// ```rust
/// use ferrous_conductor::{LifecycleEvent, LifecycleObserver};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// #[derive(Default)]
/// struct Counter(AtomicUsize);
///
/// impl LifecycleObserver for Counter {
///     fn on_transition(&self, _event: &LifecycleEvent) {
///         self.0.fetch_add(1, Ordering::Relaxed);
///     }
/// }
/// ```
pub trait LifecycleObserver: Send + Sync {
    fn on_transition(&self, event: &LifecycleEvent);

    /// Called before a batch is launched.
    fn on_batch_started(&self, _phase: Phase, _index: usize, _keys: &[Key]) {}
}

/// Emits every event as a `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl LifecycleObserver for TracingObserver {
    fn on_transition(&self, event: &LifecycleEvent) {
        match event.to {
            ComponentState::Failed => {
                tracing::warn!(key = %event.key, from = %event.from, to = %event.to, "component failed")
            }
            ComponentState::Degraded => {
                tracing::warn!(key = %event.key, from = %event.from, to = %event.to, "component degraded")
            }
            _ => tracing::info!(key = %event.key, from = %event.from, to = %event.to, "state transition"),
        }
    }

    fn on_batch_started(&self, phase: Phase, index: usize, keys: &[Key]) {
        tracing::debug!(?phase, batch = index, size = keys.len(), "batch started");
    }
}

/// Keeps every event in memory, in arrival order.
///
/// ```rust
/// use ferrous_conductor::{ComponentState, Key, LifecycleEvent, LifecycleObserver, RecordingObserver};
///
/// let recorder = RecordingObserver::new();
/// recorder.on_transition(&LifecycleEvent {
///     key: Key::named("db"),
///     from: ComponentState::Uninitialized,
///     to: ComponentState::Initializing,
///     at: chrono::Utc::now(),
/// });
/// assert_eq!(recorder.states_of(&Key::named("db")), [ComponentState::Initializing]);
/// ```
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    /// Target states `key` went through, in order.
    pub fn states_of(&self, key: &Key) -> Vec<ComponentState> {
        self.events
            .lock()
            .iter()
            .filter(|e| &e.key == key)
            .map(|e| e.to)
            .collect()
    }

    /// Keys in the order they reached `state`.
    pub fn reached(&self, state: ComponentState) -> Vec<Key> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.to == state)
            .map(|e| e.key.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl LifecycleObserver for RecordingObserver {
    fn on_transition(&self, event: &LifecycleEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Registered observers. Adding one swaps in a new list.
pub(crate) struct Observers {
    observers: ArcSwap<Vec<Arc<dyn LifecycleObserver>>>,
    add: Mutex<()>,
}

impl Observers {
    pub(crate) fn new() -> Self {
        let tracing: Arc<dyn LifecycleObserver> = Arc::new(TracingObserver);
        Self {
            observers: ArcSwap::from_pointee(vec![tracing]),
            add: Mutex::new(()),
        }
    }

    pub(crate) fn add(&self, observer: Arc<dyn LifecycleObserver>) {
        let _guard = self.add.lock();
        let mut next = (**self.observers.load()).clone();
        next.push(observer);
        self.observers.store(Arc::new(next));
    }

    pub(crate) fn transition(&self, key: &Key, from: ComponentState, to: ComponentState) {
        let event = LifecycleEvent {
            key: key.clone(),
            from,
            to,
            at: Utc::now(),
        };
        for observer in self.observers.load().iter() {
            observer.on_transition(&event);
        }
    }

    pub(crate) fn batch_started(&self, phase: Phase, index: usize, keys: &[Key]) {
        for observer in self.observers.load().iter() {
            observer.on_batch_started(phase, index, keys);
        }
    }
}

impl Default for Observers {
    fn default() -> Self {
        Self::new()
    }
}
