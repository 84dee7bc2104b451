//! Descriptor registry with a single write path and lock-free reads.

use std::sync::Arc;

use ahash::AHashMap;
use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::descriptors::ServiceDescriptor;
use crate::error::{DiError, DiResult};
use crate::key::Key;

/// Immutable view of every registration at one point in time.
///
/// Readers hold a snapshot for as long as they need it; writers build a new
/// one and swap it in, so a reader never observes a half-applied change.
#[derive(Default)]
pub struct RegistrySnapshot {
    descriptors: AHashMap<Key, Arc<ServiceDescriptor>>,
    order: Vec<Key>,
    generation: u64,
}

impl RegistrySnapshot {
    pub fn get(&self, key: &Key) -> Option<&Arc<ServiceDescriptor>> {
        self.descriptors.get(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.descriptors.contains_key(key)
    }

    /// Descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceDescriptor>> {
        self.order.iter().filter_map(|key| self.descriptors.get(key))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Incremented by every successful mutation.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Thread-safe map of registered descriptors.
///
/// `register` and `replace` are serialized through one mutex and publish a
/// fresh [`RegistrySnapshot`] with an atomic pointer swap; `try_get` and
/// `snapshot` never take a lock.
///
/// # Examples
///
/// ```rust
/// use ferrous_conductor::{DiError, Factory, Key, Registry, ServiceDescriptor};
///
/// let registry = Registry::new();
/// registry.register(ServiceDescriptor::singleton("a", Factory::instance(1u32))).unwrap();
///
/// let duplicate = registry.register(ServiceDescriptor::singleton("a", Factory::instance(2u32)));
/// assert!(matches!(duplicate, Err(DiError::DuplicateRegistration(_))));
///
/// let previous = registry.replace(ServiceDescriptor::singleton("a", Factory::instance(3u32))).unwrap();
/// assert!(registry.try_get(&Key::named("a")).unwrap().revision() > previous.revision());
/// ```
pub struct Registry {
    current: ArcSwap<RegistrySnapshot>,
    write: Mutex<u64>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RegistrySnapshot::default()),
            write: Mutex::new(0),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    /// Lock-free descriptor lookup.
    pub fn try_get(&self, key: &Key) -> Option<Arc<ServiceDescriptor>> {
        self.current.load().get(key).cloned()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.current.load().contains(key)
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> Vec<Arc<ServiceDescriptor>> {
        self.current.load().iter().cloned().collect()
    }

    /// Adds a new descriptor.
    ///
    /// Fails with [`DiError::DuplicateRegistration`] if the key is taken; use
    /// [`replace`](Self::replace) to swap an existing one.
    pub fn register(&self, mut descriptor: ServiceDescriptor) -> DiResult<Arc<ServiceDescriptor>> {
        let mut next_sequence = self.write.lock();
        let current = self.current.load_full();
        if current.contains(&descriptor.key) {
            return Err(DiError::DuplicateRegistration(descriptor.key));
        }

        let generation = current.generation + 1;
        descriptor.sequence = *next_sequence;
        descriptor.revision = generation;
        *next_sequence += 1;

        let descriptor = Arc::new(descriptor);
        let mut descriptors = current.descriptors.clone();
        let mut order = current.order.clone();
        descriptors.insert(descriptor.key.clone(), descriptor.clone());
        order.push(descriptor.key.clone());

        self.current.store(Arc::new(RegistrySnapshot {
            descriptors,
            order,
            generation,
        }));
        tracing::debug!(key = %descriptor.key, lifetime = %descriptor.lifetime, "registered");
        Ok(descriptor)
    }

    /// Atomically swaps the descriptor registered under the same key and
    /// returns the previous one. The key keeps its registration position.
    pub fn replace(&self, mut descriptor: ServiceDescriptor) -> DiResult<Arc<ServiceDescriptor>> {
        let _guard = self.write.lock();
        let current = self.current.load_full();
        let previous = current
            .get(&descriptor.key)
            .cloned()
            .ok_or_else(|| DiError::NotFound(descriptor.key.clone()))?;

        let generation = current.generation + 1;
        descriptor.sequence = previous.sequence;
        descriptor.revision = generation;

        let descriptor = Arc::new(descriptor);
        let mut descriptors = current.descriptors.clone();
        descriptors.insert(descriptor.key.clone(), descriptor.clone());

        self.current.store(Arc::new(RegistrySnapshot {
            descriptors,
            order: current.order.clone(),
            generation,
        }));
        tracing::debug!(key = %descriptor.key, revision = generation, "replaced");
        Ok(previous)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
