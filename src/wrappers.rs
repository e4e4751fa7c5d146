//! Built-in wrapper types
//!
//! Wrappers change how an underlying service is delivered without any
//! registration of their own:
//!
//! - [`Lazy<T>`] - resolved on first [`Lazy::get`], then cached
//! - [`Func<T>`] - resolved on every [`Func::call`]
//! - [`FuncWith<A, T>`] - like `Func`, with a runtime argument of type `A`
//! - [`Many<W>`] - every matching registration, in registration order
//! - [`Meta<T>`] - the instance plus its registration metadata
//! - [`Keyed<T>`] - the instance plus its registration key
//!
//! `Lazy`, `Func` and `FuncWith` are deferred: the dependency graph stops at
//! them, so they break construction cycles.

use crate::inject::{Deferred, Dependency, Inject, Resolved, Wrapper};
use crate::service::{Injectable, Instance, ServiceKey};
use crate::{DiError, Metadata, Result};
use once_cell::sync::OnceCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

fn unexpected<T: ?Sized + 'static>() -> DiError {
    DiError::type_mismatch::<T>()
}

// =============================================================================
// Lazy
// =============================================================================

/// Service resolved on first access and cached afterwards.
///
/// Resolution happens against the scope the `Lazy` was produced in, so a
/// `Lazy` must not outlive that scope.
pub struct Lazy<T: ?Sized> {
    deferred: Deferred,
    value: OnceCell<Arc<T>>,
}

impl<T: ?Sized + Injectable> Lazy<T> {
    /// Resolve (once) and return the service.
    pub fn get(&self) -> Result<Arc<T>> {
        self.value
            .get_or_try_init(|| self.resolve())
            .map(Arc::clone)
    }

    /// Whether the service has been resolved already.
    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.value.get().is_some()
    }

    fn resolve(&self) -> Result<Arc<T>> {
        self.deferred
            .call(&[])?
            .downcast::<T>()
            .ok_or_else(unexpected::<T>)
    }
}

impl<T: ?Sized + Injectable> Inject for Lazy<T> {
    fn dependency() -> Dependency {
        Dependency::of::<T>().wrapped(Wrapper::Lazy)
    }

    fn from_resolved(resolved: Resolved) -> Result<Self> {
        match resolved {
            Resolved::Lazy(deferred) => Ok(Self {
                deferred,
                value: OnceCell::new(),
            }),
            _ => Err(unexpected::<Self>()),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lazy")
            .field("service", &std::any::type_name::<T>())
            .field("resolved", &self.value.get().is_some())
            .finish()
    }
}

// =============================================================================
// Func / FuncWith
// =============================================================================

/// Factory that resolves the service on every call.
pub struct Func<T: ?Sized> {
    deferred: Deferred,
    _marker: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized + Injectable> Func<T> {
    /// Resolve the service now.
    ///
    /// Transient services come back as a new instance each time; reused
    /// ones come back from their cache.
    pub fn call(&self) -> Result<Arc<T>> {
        self.deferred
            .call(&[])?
            .downcast::<T>()
            .ok_or_else(unexpected::<T>)
    }
}

impl<T: ?Sized> Clone for Func<T> {
    fn clone(&self) -> Self {
        Self {
            deferred: self.deferred.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized + Injectable> Inject for Func<T> {
    fn dependency() -> Dependency {
        Dependency::of::<T>().wrapped(Wrapper::Func)
    }

    fn from_resolved(resolved: Resolved) -> Result<Self> {
        match resolved {
            Resolved::Func(deferred) => Ok(Self {
                deferred,
                _marker: PhantomData,
            }),
            _ => Err(unexpected::<Self>()),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Func<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Func")
            .field("service", &std::any::type_name::<T>())
            .finish()
    }
}

/// Factory taking one runtime argument.
///
/// Any dependency of type `Arc<A>` in the service's graph is bound to the
/// argument instead of being resolved from the registry.
///
/// # Example
///
/// ```rust
/// use ioc_engine::{Container, FuncWith};
/// use std::sync::Arc;
///
/// struct RequestId(u64);
/// struct Handler { id: Arc<RequestId> }
///
/// let container = Container::new();
/// container.transient(|id: Arc<RequestId>| Handler { id }).unwrap();
///
/// let factory = container.get::<FuncWith<RequestId, Handler>>().unwrap();
/// assert_eq!(factory.call(RequestId(7)).unwrap().id.0, 7);
/// ```
pub struct FuncWith<A, T: ?Sized> {
    deferred: Deferred,
    _marker: PhantomData<fn(A) -> Arc<T>>,
}

impl<A: Injectable, T: ?Sized + Injectable> FuncWith<A, T> {
    /// Resolve the service with `argument` bound.
    pub fn call(&self, argument: A) -> Result<Arc<T>> {
        self.call_shared(Arc::new(argument))
    }

    /// Resolve the service with an already shared argument.
    pub fn call_shared(&self, argument: Arc<A>) -> Result<Arc<T>> {
        self.deferred
            .call(&[Instance::new(argument)])?
            .downcast::<T>()
            .ok_or_else(unexpected::<T>)
    }
}

impl<A, T: ?Sized> Clone for FuncWith<A, T> {
    fn clone(&self) -> Self {
        Self {
            deferred: self.deferred.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: Injectable, T: ?Sized + Injectable> Inject for FuncWith<A, T> {
    fn dependency() -> Dependency {
        Dependency::of::<T>().wrapped(Wrapper::FuncWith(crate::ServiceType::of::<A>()))
    }

    fn from_resolved(resolved: Resolved) -> Result<Self> {
        match resolved {
            Resolved::Func(deferred) => Ok(Self {
                deferred,
                _marker: PhantomData,
            }),
            _ => Err(unexpected::<Self>()),
        }
    }
}

impl<A, T: ?Sized> fmt::Debug for FuncWith<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncWith")
            .field("argument", &std::any::type_name::<A>())
            .field("service", &std::any::type_name::<T>())
            .finish()
    }
}

// =============================================================================
// Many
// =============================================================================

/// Every registration of a service, in registration order.
///
/// The element type is itself a wrapper request, e.g. `Many<Arc<dyn Plugin>>`
/// or `Many<Lazy<dyn Plugin>>`. A service that is being constructed is left
/// out of its own `Many`, so composites can aggregate their siblings.
#[derive(Debug, Clone)]
pub struct Many<W> {
    items: Vec<W>,
}

impl<W> Many<W> {
    /// Number of items.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no registration matched.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate over the items.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, W> {
        self.items.iter()
    }

    /// Take the items out.
    #[inline]
    pub fn into_vec(self) -> Vec<W> {
        self.items
    }
}

impl<W> std::ops::Deref for Many<W> {
    type Target = [W];

    fn deref(&self) -> &[W] {
        &self.items
    }
}

impl<W> IntoIterator for Many<W> {
    type Item = W;
    type IntoIter = std::vec::IntoIter<W>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, W> IntoIterator for &'a Many<W> {
    type Item = &'a W;
    type IntoIter = std::slice::Iter<'a, W>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<W: Inject> Inject for Many<W> {
    fn dependency() -> Dependency {
        W::dependency().wrapped(Wrapper::Many)
    }

    fn from_resolved(resolved: Resolved) -> Result<Self> {
        match resolved {
            Resolved::Many(values) => Ok(Self {
                items: values
                    .into_iter()
                    .map(W::from_resolved)
                    .collect::<Result<_>>()?,
            }),
            _ => Err(unexpected::<Self>()),
        }
    }
}

// =============================================================================
// Meta / Keyed
// =============================================================================

/// Service paired with the metadata attached to its registration.
pub struct Meta<T: ?Sized> {
    value: Arc<T>,
    metadata: Option<Metadata>,
}

impl<T: ?Sized> Meta<T> {
    /// The service instance.
    #[inline]
    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    /// The registration metadata, if it is an `M`.
    pub fn metadata<M: 'static>(&self) -> Option<&M> {
        self.metadata.as_ref()?.downcast_ref::<M>()
    }

    /// Split into the instance and the raw metadata.
    pub fn into_parts(self) -> (Arc<T>, Option<Metadata>) {
        (self.value, self.metadata)
    }
}

impl<T: ?Sized + Injectable> Inject for Meta<T> {
    fn dependency() -> Dependency {
        Dependency::of::<T>().wrapped(Wrapper::Meta)
    }

    fn from_resolved(resolved: Resolved) -> Result<Self> {
        match resolved {
            Resolved::Meta(inner, metadata) => Ok(Self {
                value: inner.into_arc::<T>()?,
                metadata,
            }),
            _ => Err(unexpected::<Self>()),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Meta<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meta")
            .field("service", &std::any::type_name::<T>())
            .field("has_metadata", &self.metadata.is_some())
            .finish()
    }
}

/// Service paired with the key it was registered under.
pub struct Keyed<T: ?Sized> {
    value: Arc<T>,
    key: ServiceKey,
}

impl<T: ?Sized> Keyed<T> {
    /// The service instance.
    #[inline]
    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    /// The registration key.
    #[inline]
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }
}

impl<T: ?Sized + Injectable> Inject for Keyed<T> {
    fn dependency() -> Dependency {
        Dependency::of::<T>().wrapped(Wrapper::Keyed)
    }

    fn from_resolved(resolved: Resolved) -> Result<Self> {
        match resolved {
            Resolved::Keyed(inner, key) => Ok(Self {
                value: inner.into_arc::<T>()?,
                key,
            }),
            _ => Err(unexpected::<Self>()),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Keyed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyed")
            .field("service", &std::any::type_name::<T>())
            .field("key", &self.key)
            .finish()
    }
}
