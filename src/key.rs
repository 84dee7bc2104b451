//! Service key types for the component registry.

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

/// Logical identity of a registered service or component.
///
/// Keys come in two flavours:
///
/// - **Type**: derived from a Rust type, for registrations that are looked up
///   by what they are (`key_of_type::<Database>()`).
/// - **Named**: a free-form string, for components that are wired by name
///   (`Key::named("cache")`), which is how most lifecycle graphs are declared.
///
/// Equality and hashing only look at the identity part: the type name carried
/// by [`Key::Type`] is diagnostic and never compared.
///
/// # Examples
///
/// ```rust
/// use ferrous_conductor::{Key, key_of_type};
///
/// struct Database;
///
/// let by_type = key_of_type::<Database>();
/// let by_name = Key::named("database");
///
/// assert!(by_type.display_name().ends_with("Database"));
/// assert_eq!(by_name.display_name(), "database");
/// assert_eq!(by_name, Key::from("database"));
/// assert_ne!(by_type, by_name);
/// ```
#[derive(Debug, Clone)]
pub enum Key {
    /// Concrete type key with TypeId and name for diagnostics
    Type(TypeId, &'static str),
    /// Named component key
    Named(Arc<str>),
}

impl Key {
    /// Creates a named key.
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Key::Named(name.into())
    }

    /// Human-readable name used in logs, reports and error messages.
    pub fn display_name(&self) -> &str {
        match self {
            Key::Type(_, name) => name,
            Key::Named(name) => name,
        }
    }

    /// Returns true for keys created with [`Key::named`].
    pub fn is_named(&self) -> bool {
        matches!(self, Key::Named(_))
    }
}

impl PartialEq for Key {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Key::Type(a, _), Key::Type(b, _)) => a == b,
            (Key::Named(a), Key::Named(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Key {}

impl std::hash::Hash for Key {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Key::Type(id, _) => {
                0u8.hash(state);
                id.hash(state);
            }
            Key::Named(name) => {
                1u8.hash(state);
                name.hash(state);
            }
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::named(name)
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::named(name)
    }
}

impl From<&Key> for Key {
    fn from(key: &Key) -> Self {
        key.clone()
    }
}

/// Creates the type key for `T`.
#[inline]
pub fn key_of_type<T: 'static>() -> Key {
    Key::Type(TypeId::of::<T>(), std::any::type_name::<T>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn type_keys_compare_by_type_id_only() {
        let a = Key::Type(TypeId::of::<u32>(), "u32");
        let b = Key::Type(TypeId::of::<u32>(), "renamed");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn named_and_type_keys_never_collide() {
        let named = Key::named("u32");
        let typed = key_of_type::<u32>();
        assert_ne!(named, typed);
        assert!(named.is_named());
        assert!(!typed.is_named());
    }

    #[test]
    fn display_uses_name() {
        assert_eq!(Key::named("cache").to_string(), "cache");
        assert_eq!(key_of_type::<String>().to_string(), "alloc::string::String");
    }
}
