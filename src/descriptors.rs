//! Service descriptors: registration metadata for every component.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;

use crate::error::DiResult;
use crate::key::Key;
use crate::lifecycle::Component;
use crate::lifetime::Lifetime;
use crate::provider::ResolverContext;

/// Type-erased shared value stored by the resolution cache.
pub type AnyArc = Arc<dyn Any + Send + Sync>;

/// A resolved object.
///
/// Carries the type-erased value and, for components registered through
/// [`Factory::component`], the lifecycle handle the orchestrator drives.
/// Cloning is cheap and preserves identity.
#[derive(Clone)]
pub struct Instance {
    value: AnyArc,
    component: Option<Arc<dyn Component>>,
}

impl Instance {
    /// Wraps a plain value with no lifecycle hooks.
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wraps an already shared value with no lifecycle hooks.
    pub fn from_arc<T: Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self {
            value: value as AnyArc,
            component: None,
        }
    }

    /// Wraps a value that the orchestrator drives through its lifecycle.
    pub fn component<T: Component>(value: T) -> Self {
        let shared = Arc::new(value);
        Self {
            value: shared.clone() as AnyArc,
            component: Some(shared as Arc<dyn Component>),
        }
    }

    pub fn value(&self) -> &AnyArc {
        &self.value
    }

    /// Lifecycle handle, if the instance is a component.
    pub fn lifecycle(&self) -> Option<&Arc<dyn Component>> {
        self.component.as_ref()
    }

    /// Downcasts to the concrete type.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }

    /// Identity comparison: true when both wrap the same allocation.
    pub fn ptr_eq(&self, other: &Instance) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.value) as *const (),
            Arc::as_ptr(&other.value) as *const (),
        )
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("ptr", &(Arc::as_ptr(&self.value) as *const ()))
            .field("component", &self.component.is_some())
            .finish()
    }
}

type FactoryFn = dyn for<'a> Fn(&ResolverContext<'a>) -> DiResult<Instance> + Send + Sync;

/// Construction recipe for a descriptor.
///
/// Factories receive a [`ResolverContext`] to pull their declared
/// dependencies. They never run during graph building or planning.
///
/// # Examples
///
/// ```rust
/// use ferrous_conductor::{Factory, Key};
/// use std::sync::Arc;
///
/// struct Config { url: String }
/// struct Pool { config: Arc<Config> }
///
/// let config = Factory::instance(Config { url: "postgres://localhost".into() });
/// let pool = Factory::service(|ctx| {
///     Ok(Pool { config: ctx.get::<Config>(&Key::named("config"))? })
/// });
/// # let _ = (config, pool);
/// ```
#[derive(Clone)]
pub struct Factory(Arc<FactoryFn>);

impl Factory {
    /// Factory producing a plain service value.
    pub fn service<T, F>(factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: for<'a> Fn(&ResolverContext<'a>) -> DiResult<T> + Send + Sync + 'static,
    {
        Self(Arc::new(move |ctx| factory(ctx).map(Instance::new)))
    }

    /// Factory producing a lifecycle-managed component.
    pub fn component<T, F>(factory: F) -> Self
    where
        T: Component,
        F: for<'a> Fn(&ResolverContext<'a>) -> DiResult<T> + Send + Sync + 'static,
    {
        Self(Arc::new(move |ctx| factory(ctx).map(Instance::component)))
    }

    /// Factory handing out one prebuilt value.
    pub fn instance<T: Send + Sync + 'static>(value: T) -> Self {
        let shared = Arc::new(value);
        Self(Arc::new(move |_| Ok(Instance::from_arc(shared.clone()))))
    }

    /// Factory from a closure that builds the [`Instance`] itself.
    pub fn raw<F>(factory: F) -> Self
    where
        F: for<'a> Fn(&ResolverContext<'a>) -> DiResult<Instance> + Send + Sync + 'static,
    {
        Self(Arc::new(factory))
    }

    pub(crate) fn invoke(&self, ctx: &ResolverContext<'_>) -> DiResult<Instance> {
        (self.0)(ctx)
    }
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Factory")
    }
}

/// Explicit dependency declaration of a descriptor.
///
/// Required dependencies must be registered or graph validation fails;
/// optional ones are ordered before the dependent when present and silently
/// dropped when not.
///
/// ```rust
/// use ferrous_conductor::{Dependencies, Key};
///
/// let deps = Dependencies::new()
///     .require("database")
///     .optional("metrics");
/// assert_eq!(deps.required_keys(), &[Key::named("database")]);
/// assert_eq!(deps.optional_keys(), &[Key::named("metrics")]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Dependencies {
    required: SmallVec<[Key; 4]>,
    optional: SmallVec<[Key; 4]>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    /// No dependencies.
    pub fn none() -> Self {
        Self::default()
    }

    /// All given keys as required dependencies.
    pub fn on<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        Self {
            required: keys.into_iter().map(Into::into).collect(),
            optional: SmallVec::new(),
        }
    }

    pub fn require(mut self, key: impl Into<Key>) -> Self {
        self.required.push(key.into());
        self
    }

    pub fn optional(mut self, key: impl Into<Key>) -> Self {
        self.optional.push(key.into());
        self
    }

    pub fn required_keys(&self) -> &[Key] {
        &self.required
    }

    pub fn optional_keys(&self) -> &[Key] {
        &self.optional
    }

    /// Required keys followed by optional keys, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, bool)> {
        self.required
            .iter()
            .map(|k| (k, true))
            .chain(self.optional.iter().map(|k| (k, false)))
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.optional.is_empty()
    }
}

/// Registration metadata for one service or component.
///
/// Descriptors are immutable once registered: the registry stamps a
/// registration sequence and revision, then shares them as
/// `Arc<ServiceDescriptor>`. Replacing a key registers a new descriptor with a
/// higher revision; cached instances built from an older revision are
/// discarded.
///
/// # Examples
///
/// ```rust
/// use ferrous_conductor::{Dependencies, Factory, Key, Lifetime, ServiceDescriptor};
///
/// struct Mailer;
///
/// let descriptor = ServiceDescriptor::new("mailer", Lifetime::Singleton, Factory::service(|_| Ok(Mailer)))
///     .with_dependencies(Dependencies::new().require("smtp").optional("metrics"))
///     .with_priority(10)
///     .non_critical();
///
/// assert_eq!(descriptor.key, Key::named("mailer"));
/// assert_eq!(descriptor.priority, 10);
/// assert!(!descriptor.critical);
/// ```
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub key: Key,
    pub lifetime: Lifetime,
    /// Ordering tiebreaker inside a batch; higher starts first
    pub priority: i32,
    pub dependencies: Dependencies,
    /// Whether a failure of this component halts later batches when
    /// `abort_on_batch_failure` is enabled
    pub critical: bool,
    /// Per-call lifecycle timeout; the engine default applies when unset
    pub timeout: Option<Duration>,
    factory: Factory,
    pub(crate) sequence: u64,
    pub(crate) revision: u64,
}

impl ServiceDescriptor {
    pub fn new(key: impl Into<Key>, lifetime: Lifetime, factory: Factory) -> Self {
        Self {
            key: key.into(),
            lifetime,
            priority: 0,
            dependencies: Dependencies::none(),
            critical: true,
            timeout: None,
            factory,
            sequence: 0,
            revision: 0,
        }
    }

    pub fn singleton(key: impl Into<Key>, factory: Factory) -> Self {
        Self::new(key, Lifetime::Singleton, factory)
    }

    pub fn scoped(key: impl Into<Key>, factory: Factory) -> Self {
        Self::new(key, Lifetime::Scoped, factory)
    }

    pub fn transient(key: impl Into<Key>, factory: Factory) -> Self {
        Self::new(key, Lifetime::Transient, factory)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Dependencies) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Lets later batches continue even when this component fails.
    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Position in registration order. Replacing keeps the original position.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Bumped every time the key is replaced.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn type_name(&self) -> &str {
        self.key.display_name()
    }

    pub(crate) fn construct(&self, ctx: &ResolverContext<'_>) -> DiResult<Instance> {
        self.factory.invoke(ctx)
    }
}
