//! Scoped resolution.

use std::sync::Arc;

use crate::descriptors::Instance;
use crate::error::{DiError, DiResult};
use crate::key::Key;

use super::context::{ResolutionPath, ResolveAny};
use super::{ResolutionCache, SlotMap};

/// Child resolution context with its own cache for scoped services.
///
/// - **Singleton**: resolved and cached by the root (shared across scopes)
/// - **Scoped**: resolved and cached inside this scope
/// - **Transient**: built fresh on every resolution
///
/// Dropping the scope drops its scoped instances.
///
/// # Examples
///
/// ```rust
/// use ferrous_conductor::{Container, Dependencies, Factory, Key};
///
/// struct RequestId(u64);
///
/// let container = Container::new();
/// container.register_scoped("request", Dependencies::none(), 0,
///     Factory::service(|_| Ok(RequestId(7)))).unwrap();
///
/// let scope = container.create_scope();
/// let a = scope.resolve(&Key::named("request")).unwrap();
/// let b = scope.resolve(&Key::named("request")).unwrap();
/// assert!(a.ptr_eq(&b));
///
/// let other = container.create_scope();
/// assert!(!a.ptr_eq(&other.resolve(&Key::named("request")).unwrap()));
/// ```
pub struct Scope {
    root: Arc<ResolutionCache>,
    slots: SlotMap,
}

impl Scope {
    pub fn new(root: Arc<ResolutionCache>) -> Self {
        Self {
            root,
            slots: SlotMap::new(),
        }
    }

    pub fn resolve(&self, key: &Key) -> DiResult<Instance> {
        let path = ResolutionPath::new();
        self.resolve_in(key, &path)
    }

    /// Resolves and downcasts.
    pub fn resolve_as<T: Send + Sync + 'static>(&self, key: &Key) -> DiResult<Arc<T>> {
        self.resolve(key)?.downcast::<T>().ok_or(DiError::TypeMismatch {
            key: key.clone(),
            expected: std::any::type_name::<T>(),
        })
    }

    /// Drops scoped instances for `keys`.
    pub fn invalidate(&self, keys: &[Key]) -> usize {
        self.slots.invalidate(keys)
    }

    /// Number of scoped instances built in this scope.
    pub fn cached_count(&self) -> usize {
        self.slots.built()
    }
}

impl ResolveAny for Scope {
    fn resolve_in(&self, key: &Key, path: &ResolutionPath) -> DiResult<Instance> {
        self.root.resolve_with(key, path, Some((self, &self.slots)))
    }
}
