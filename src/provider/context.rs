//! Resolver context handed to factories.

use std::cell::RefCell;
use std::sync::Arc;

use crate::descriptors::Instance;
use crate::error::{DiError, DiResult};
use crate::key::Key;

const MAX_DEPTH: usize = 1024;

/// Keys currently being constructed on this call chain.
#[derive(Default)]
pub(crate) struct ResolutionPath {
    stack: RefCell<Vec<Key>>,
}

impl ResolutionPath {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Pushes `key`, failing if it is already being constructed further up.
    pub(crate) fn enter(&self, key: &Key) -> DiResult<PathGuard<'_>> {
        let mut stack = self.stack.borrow_mut();
        if let Some(start) = stack.iter().position(|k| k == key) {
            let mut cycle = stack[start..].to_vec();
            cycle.push(key.clone());
            return Err(DiError::CircularDependency { cycle });
        }
        if stack.len() >= MAX_DEPTH {
            return Err(DiError::DepthExceeded(stack.len()));
        }
        stack.push(key.clone());
        Ok(PathGuard { path: self })
    }
}

pub(crate) struct PathGuard<'a> {
    path: &'a ResolutionPath,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        self.path.stack.borrow_mut().pop();
    }
}

/// Something instances can be resolved from: the root cache or a scope.
pub(crate) trait ResolveAny: Send + Sync {
    fn resolve_in(&self, key: &Key, path: &ResolutionPath) -> DiResult<Instance>;
}

/// Context passed to factory functions for resolving their dependencies.
///
/// Resolution through the context tracks the construction path, so an
/// undeclared cycle between factories surfaces as
/// [`DiError::CircularDependency`] instead of a deadlock.
///
/// # Examples
///
/// ```
/// use ferrous_conductor::{Container, Dependencies, Factory, Key};
/// use std::sync::Arc;
///
/// struct Database { url: String }
/// struct UserService { db: Arc<Database> }
///
/// let container = Container::new();
/// container.register_singleton("db", Dependencies::none(), 0,
///     Factory::instance(Database { url: "postgres://localhost".into() })).unwrap();
/// container.register_transient("users", Dependencies::on(["db"]), 0,
///     Factory::service(|ctx| Ok(UserService { db: ctx.get::<Database>("db")? }))).unwrap();
///
/// let users = container.resolve_as::<UserService>(&Key::named("users")).unwrap();
/// assert_eq!(users.db.url, "postgres://localhost");
/// ```
pub struct ResolverContext<'a> {
    resolver: &'a dyn ResolveAny,
    path: &'a ResolutionPath,
}

impl<'a> ResolverContext<'a> {
    pub(crate) fn new(resolver: &'a dyn ResolveAny, path: &'a ResolutionPath) -> Self {
        Self { resolver, path }
    }

    /// Resolves an untyped instance.
    pub fn resolve(&self, key: impl Into<Key>) -> DiResult<Instance> {
        self.resolver.resolve_in(&key.into(), self.path)
    }

    /// Resolves and downcasts a dependency.
    pub fn get<T: Send + Sync + 'static>(&self, key: impl Into<Key>) -> DiResult<Arc<T>> {
        let key = key.into();
        let instance = self.resolver.resolve_in(&key, self.path)?;
        instance.downcast::<T>().ok_or(DiError::TypeMismatch {
            key,
            expected: std::any::type_name::<T>(),
        })
    }

    /// Like [`get`](Self::get), but an unregistered key yields `Ok(None)`.
    pub fn get_optional<T: Send + Sync + 'static>(&self, key: impl Into<Key>) -> DiResult<Option<Arc<T>>> {
        match self.get::<T>(key) {
            Ok(value) => Ok(Some(value)),
            Err(DiError::NotFound(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }
}
