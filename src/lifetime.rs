//! Service lifetime definitions.

use serde::{Deserialize, Serialize};

/// Lifetime policy of a registered service.
///
/// Controls how the resolution cache treats instances built from a
/// descriptor:
///
/// - **Singleton**: built once, shared for the container's lifetime. The
///   lifecycle orchestrator initializes the very instance `resolve` returns.
/// - **Scoped**: built once per [`Scope`](crate::Scope), shared inside it.
/// - **Transient**: built on every resolution, never cached.
///
/// # Examples
///
/// ```rust
/// use ferrous_conductor::{Container, Dependencies, Factory, Key};
/// use std::sync::Arc;
///
/// struct Clock;
///
/// let container = Container::new();
/// container
///     .register_singleton(Key::named("clock"), Dependencies::none(), 0, Factory::service(|_| Ok(Clock)))
///     .unwrap();
///
/// let a = container.resolve_as::<Clock>(&Key::named("clock")).unwrap();
/// let b = container.resolve_as::<Clock>(&Key::named("clock")).unwrap();
/// assert!(Arc::ptr_eq(&a, &b));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifetime {
    /// Single instance per container, cached until replaced
    Singleton,
    /// Single instance per scope
    Scoped,
    /// New instance per resolution
    Transient,
}

impl Lifetime {
    /// Whether instances of this lifetime are ever cached.
    pub fn is_cached(self) -> bool {
        !matches!(self, Lifetime::Transient)
    }
}

impl std::fmt::Display for Lifetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Lifetime::Singleton => "singleton",
            Lifetime::Scoped => "scoped",
            Lifetime::Transient => "transient",
        };
        f.write_str(name)
    }
}
