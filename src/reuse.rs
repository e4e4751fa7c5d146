//! Reuse (lifetime) policies

use std::fmt;
use std::sync::Arc;

/// Name of a scope, used by [`Reuse::ScopedTo`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ScopeName(Arc<str>);

impl ScopeName {
    /// Create a scope name.
    #[inline]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The name as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ScopeName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ScopeName {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl fmt::Debug for ScopeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for ScopeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a constructed instance is cached relative to the scope chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Reuse {
    /// New instance on every resolve
    #[default]
    Transient,

    /// One instance in the root scope, shared by every scope
    Singleton,

    /// One instance per current (innermost) scope
    Scoped,

    /// One instance per nearest scope with the given name
    ScopedTo(ScopeName),
}

impl Reuse {
    /// Shortcut for [`Reuse::ScopedTo`].
    #[inline]
    pub fn scoped_to(name: impl Into<ScopeName>) -> Self {
        Reuse::ScopedTo(name.into())
    }

    /// Relative lifespan used by the captive-dependency check.
    ///
    /// A service must not depend on anything with a smaller lifespan.
    #[inline]
    pub fn lifespan(&self) -> u32 {
        match self {
            Reuse::Transient => 0,
            Reuse::Scoped | Reuse::ScopedTo(_) => 100,
            Reuse::Singleton => 1000,
        }
    }

    /// Whether instances are cached at all.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Reuse::Transient)
    }
}

impl fmt::Display for Reuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reuse::Transient => f.write_str("transient"),
            Reuse::Singleton => f.write_str("singleton"),
            Reuse::Scoped => f.write_str("scoped"),
            Reuse::ScopedTo(name) => write!(f, "scoped to '{name}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifespans_are_ordered() {
        assert!(Reuse::Transient.lifespan() < Reuse::Scoped.lifespan());
        assert!(Reuse::Scoped.lifespan() < Reuse::Singleton.lifespan());
        assert_eq!(
            Reuse::Scoped.lifespan(),
            Reuse::scoped_to("request").lifespan()
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Reuse::scoped_to("request").to_string(), "scoped to 'request'");
        assert_eq!(Reuse::default(), Reuse::Transient);
    }
}
