//! Error types for registration and resolution

use thiserror::Error;

/// Boxed error returned by fallible constructors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse classification of [`DiError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid registration call, reported by `register`
    Configuration,
    /// No registration, wrapper or open generic matched
    Unresolved,
    /// More than one candidate and no tie-break
    AmbiguousMatch,
    /// Cycle in the non-deferred dependency graph
    RecursiveDependency,
    /// A longer-lived service would capture a shorter-lived one, or the
    /// scope its reuse needs is not available
    CaptiveDependency,
    /// The constructor or factory function itself failed
    Construction,
    /// Scope lifecycle violation
    Scope,
}

/// Errors that can occur during registration and resolution
#[derive(Error, Debug)]
pub enum DiError {
    /// Registration descriptor was rejected
    #[error("Invalid registration of {service}: {reason}")]
    Configuration {
        service: &'static str,
        reason: String,
    },

    /// Service was not found in the registry
    #[error("Unable to resolve {service}{}", key_suffix(.key))]
    Unresolved {
        service: &'static str,
        key: Option<String>,
    },

    /// More than one registration matched a single-instance request
    #[error("Ambiguous match for {service}: {candidates} candidates and no way to pick one")]
    AmbiguousMatch {
        service: &'static str,
        candidates: usize,
    },

    /// Circular dependency detected while building the request graph
    #[error("Recursive dependency detected: {}", .path.join(" -> "))]
    RecursiveDependency { path: Vec<&'static str> },

    /// Dependency lives shorter than the service that holds it
    #[error("Dependency {dependency} ({dependency_reuse}) would be captured by {holder} ({holder_reuse})")]
    CaptiveDependency {
        holder: &'static str,
        holder_reuse: String,
        dependency: &'static str,
        dependency_reuse: String,
    },

    /// Scoped service requested with no open scope
    #[error("No current scope available to hold {service}")]
    NoCurrentScope { service: &'static str },

    /// Named scope not found in the scope chain
    #[error("No open scope named '{name}' for {service}")]
    ScopeNotFound { service: &'static str, name: String },

    /// Constructor or factory failed
    #[error("Failed to construct {}: {source}", .path.join(" -> "))]
    Construction {
        path: Vec<&'static str>,
        #[source]
        source: BoxError,
    },

    /// Resolution attempted from a scope that was already disposed
    #[error("Scope {scope} has been disposed")]
    ScopeDisposed { scope: String },

    /// Parent scope was dropped
    #[error("Parent scope has been dropped")]
    ParentDropped,

    /// Container is locked and cannot be modified
    #[error("Container is locked - cannot register new services")]
    Locked,

    /// Stored instance did not have the requested type
    #[error("Resolved instance is not a {expected}")]
    TypeMismatch { expected: &'static str },
}

fn key_suffix(key: &Option<String>) -> String {
    match key {
        Some(key) => format!(" with key {key}"),
        None => String::new(),
    }
}

impl DiError {
    /// Create an Unresolved error for a type
    #[inline]
    pub fn unresolved<T: ?Sized + 'static>() -> Self {
        Self::Unresolved {
            service: std::any::type_name::<T>(),
            key: None,
        }
    }

    /// Create a Configuration error
    #[inline]
    pub fn configuration(service: &'static str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            service,
            reason: reason.into(),
        }
    }

    /// Create a Construction error from a constructor failure
    #[inline]
    pub fn construction(service: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Construction {
            path: vec![service],
            source: source.into(),
        }
    }

    /// Create a TypeMismatch error
    #[inline]
    pub fn type_mismatch<T: ?Sized + 'static>() -> Self {
        Self::TypeMismatch {
            expected: std::any::type_name::<T>(),
        }
    }

    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } | Self::Locked => ErrorKind::Configuration,
            Self::Unresolved { .. } | Self::TypeMismatch { .. } => ErrorKind::Unresolved,
            Self::AmbiguousMatch { .. } => ErrorKind::AmbiguousMatch,
            Self::RecursiveDependency { .. } => ErrorKind::RecursiveDependency,
            Self::CaptiveDependency { .. }
            | Self::NoCurrentScope { .. }
            | Self::ScopeNotFound { .. } => ErrorKind::CaptiveDependency,
            Self::Construction { .. } => ErrorKind::Construction,
            Self::ScopeDisposed { .. } | Self::ParentDropped => ErrorKind::Scope,
        }
    }

    /// Prepend the service being built to the resolution path of a
    /// construction error. Other errors pass through untouched.
    pub(crate) fn within(mut self, service: &'static str) -> Self {
        if let Self::Construction { path, .. } = &mut self {
            if path.first() != Some(&service) {
                path.insert(0, service);
            }
        }
        self
    }
}

/// Result type alias for DI operations
pub type Result<T> = std::result::Result<T, DiError>;
