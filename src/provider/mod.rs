//! Instance resolution and caching.
//!
//! [`ResolutionCache`] sits beside the [`Registry`] and builds instances on
//! demand. Singletons live in the root cache, scoped instances in a
//! [`Scope`], and transients are never cached.
//!
//! Every cached slot remembers the descriptor revision it was built from.
//! Replacing a descriptor bumps its revision, so a stale slot is rebuilt on
//! its next resolution even if nobody invalidated it explicitly.

use std::sync::Arc;

use ahash::AHashMap;
use arc_swap::ArcSwap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::descriptors::{Instance, ServiceDescriptor};
use crate::error::{DiError, DiResult};
use crate::key::Key;
use crate::lifetime::Lifetime;
use crate::registration::Registry;

pub mod context;
pub mod scope;

pub use context::ResolverContext;
pub use scope::Scope;

use context::{ResolutionPath, ResolveAny};

struct Slot {
    revision: u64,
    cell: OnceCell<Instance>,
}

impl Slot {
    fn new(revision: u64) -> Self {
        Self {
            revision,
            cell: OnceCell::new(),
        }
    }
}

/// Copy-on-write map of construction slots.
///
/// Lookups are a single atomic load. Creating a slot takes the write lock,
/// but building the instance happens inside the slot's `OnceCell`, so two
/// threads resolving the same key run the factory once and two threads
/// resolving different keys never wait on each other.
#[derive(Default)]
pub(crate) struct SlotMap {
    slots: ArcSwap<AHashMap<Key, Arc<Slot>>>,
    write: Mutex<()>,
}

impl SlotMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &Key, revision: u64) -> Arc<Slot> {
        if let Some(slot) = self.slots.load().get(key) {
            if slot.revision == revision {
                return slot.clone();
            }
        }

        let _guard = self.write.lock();
        let current = self.slots.load_full();
        if let Some(slot) = current.get(key) {
            if slot.revision == revision {
                return slot.clone();
            }
        }
        let slot = Arc::new(Slot::new(revision));
        let mut next = (*current).clone();
        next.insert(key.clone(), slot.clone());
        self.slots.store(Arc::new(next));
        slot
    }

    /// Returns the cached instance, building it with `build` on first use.
    fn get_or_build<F>(&self, descriptor: &ServiceDescriptor, build: F) -> DiResult<Instance>
    where
        F: FnOnce() -> DiResult<Instance>,
    {
        let slot = self.slot(&descriptor.key, descriptor.revision);
        slot.cell.get_or_try_init(build).cloned()
    }

    /// Already-built instance for `key` at `revision`.
    pub(crate) fn peek(&self, key: &Key, revision: u64) -> Option<Instance> {
        self.slots
            .load()
            .get(key)
            .filter(|slot| slot.revision == revision)
            .and_then(|slot| slot.cell.get().cloned())
    }

    pub(crate) fn invalidate(&self, keys: &[Key]) -> usize {
        let _guard = self.write.lock();
        let current = self.slots.load_full();
        if !keys.iter().any(|key| current.contains_key(key)) {
            return 0;
        }
        let mut next = (*current).clone();
        let removed = keys.iter().filter(|key| next.remove(*key).is_some()).count();
        self.slots.store(Arc::new(next));
        removed
    }

    pub(crate) fn clear(&self) {
        let _guard = self.write.lock();
        self.slots.store(Arc::new(AHashMap::new()));
    }

    /// Number of slots holding a built instance.
    pub(crate) fn built(&self) -> usize {
        self.slots
            .load()
            .values()
            .filter(|slot| slot.cell.get().is_some())
            .count()
    }
}

/// Root resolution cache.
///
/// # Examples
///
/// ```rust
/// use ferrous_conductor::{Factory, Key, Registry, ResolutionCache, ServiceDescriptor};
/// use std::sync::Arc;
///
/// let registry = Arc::new(Registry::new());
/// registry.register(ServiceDescriptor::singleton("answer", Factory::service(|_| Ok(42u32)))).unwrap();
///
/// let cache = Arc::new(ResolutionCache::new(registry));
/// let first = cache.resolve(&Key::named("answer")).unwrap();
/// let second = cache.resolve(&Key::named("answer")).unwrap();
/// assert!(first.ptr_eq(&second));
/// assert_eq!(*first.downcast::<u32>().unwrap(), 42);
/// ```
pub struct ResolutionCache {
    registry: Arc<Registry>,
    singletons: SlotMap,
}

impl ResolutionCache {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            singletons: SlotMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Resolves `key` from the root.
    ///
    /// Scoped services cannot be resolved here and fail with
    /// [`DiError::WrongLifetime`]; use a [`Scope`].
    pub fn resolve(&self, key: &Key) -> DiResult<Instance> {
        let path = ResolutionPath::new();
        self.resolve_in(key, &path)
    }

    /// The cached singleton for `key`, if it has been built at the current
    /// revision.
    pub fn peek(&self, key: &Key) -> Option<Instance> {
        let descriptor = self.registry.try_get(key)?;
        self.singletons.peek(key, descriptor.revision)
    }

    /// Drops cached singletons for `keys`. Returns how many were removed.
    pub fn invalidate(&self, keys: &[Key]) -> usize {
        let removed = self.singletons.invalidate(keys);
        if removed > 0 {
            tracing::debug!(removed, "invalidated cached singletons");
        }
        removed
    }

    pub fn clear(&self) {
        self.singletons.clear();
    }

    /// Number of singletons currently built.
    pub fn cached_count(&self) -> usize {
        self.singletons.built()
    }

    fn descriptor(&self, key: &Key) -> DiResult<Arc<ServiceDescriptor>> {
        self.registry
            .try_get(key)
            .ok_or_else(|| DiError::NotFound(key.clone()))
    }

    /// Shared resolution logic for the root and for scopes.
    ///
    /// Singletons are always built against the root so they can never capture
    /// a scoped instance.
    pub(crate) fn resolve_with(
        &self,
        key: &Key,
        path: &ResolutionPath,
        scope: Option<(&dyn ResolveAny, &SlotMap)>,
    ) -> DiResult<Instance> {
        let descriptor = self.descriptor(key)?;
        if descriptor.lifetime == Lifetime::Singleton {
            if let Some(hit) = self.singletons.peek(key, descriptor.revision) {
                return Ok(hit);
            }
        }

        let _guard = path.enter(key)?;
        match descriptor.lifetime {
            Lifetime::Singleton => self.singletons.get_or_build(&descriptor, || {
                tracing::trace!(%key, "building singleton");
                descriptor.construct(&ResolverContext::new(self, path))
            }),
            Lifetime::Scoped => {
                let (resolver, slots) = scope.ok_or_else(|| DiError::WrongLifetime {
                    key: key.clone(),
                    lifetime: Lifetime::Scoped,
                })?;
                slots.get_or_build(&descriptor, || {
                    descriptor.construct(&ResolverContext::new(resolver, path))
                })
            }
            Lifetime::Transient => {
                let resolver: &dyn ResolveAny = match scope {
                    Some((resolver, _)) => resolver,
                    None => self,
                };
                descriptor.construct(&ResolverContext::new(resolver, path))
            }
        }
    }
}

impl ResolveAny for ResolutionCache {
    fn resolve_in(&self, key: &Key, path: &ResolutionPath) -> DiResult<Instance> {
        self.resolve_with(key, path, None)
    }
}
