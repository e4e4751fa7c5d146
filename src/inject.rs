//! Injection descriptors
//!
//! Constructor metadata is declared statically: a constructor takes a
//! value implementing [`Dependencies`] (a tuple of [`Inject`] values), and
//! each element describes one parameter with a [`Dependency`]. The request
//! graph builder reads those descriptors instead of inspecting types at
//! runtime.
//!
//! # Example
//!
//! ```rust
//! use ioc_engine::{Container, Inject, Lazy, Reuse, Service};
//! use std::sync::Arc;
//!
//! struct Config {
//!     url: String,
//! }
//!
//! struct Database {
//!     config: Arc<Config>,
//! }
//!
//! impl Service for Database {
//!     type Dependencies = (Arc<Config>,);
//!
//!     fn create((config,): Self::Dependencies) -> Self {
//!         Database { config }
//!     }
//! }
//!
//! let container = Container::new();
//! container.instance(Config { url: "postgres://localhost".into() }).unwrap();
//! container.register_service::<Database>(Reuse::Singleton).unwrap();
//!
//! let db = container.get::<Lazy<Database>>().unwrap();
//! assert_eq!(db.get().unwrap().config.url, "postgres://localhost");
//! ```

use crate::service::{Instance, Injectable, ServiceKey, ServiceType};
use crate::{Container, DiError, Metadata, Result};
use std::sync::Arc;

/// What to do when a request has no matching registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IfUnresolved {
    /// Fail with [`DiError::Unresolved`]
    #[default]
    Throw,
    /// Produce nothing instead of failing
    ReturnDefault,
}

/// Built-in wrapper around an underlying service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Wrapper {
    /// Every matching registration
    Many,
    /// Resolved once, on first access
    Lazy,
    /// Resolved on every call
    Func,
    /// Resolved on every call, with one runtime argument of the given type
    FuncWith(ServiceType),
    /// Paired with the registration metadata
    Meta,
    /// Paired with the registration key
    Keyed,
}

impl Wrapper {
    /// Wrappers that defer construction and so break dependency cycles.
    #[inline]
    pub fn is_deferred(&self) -> bool {
        matches!(self, Wrapper::Lazy | Wrapper::Func | Wrapper::FuncWith(_))
    }
}

/// Descriptor of one constructor parameter or top-level request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub(crate) service: ServiceType,
    pub(crate) key: ServiceKey,
    pub(crate) wrappers: Vec<Wrapper>,
    pub(crate) if_unresolved: IfUnresolved,
}

impl Dependency {
    /// Plain required dependency on `T`.
    #[inline]
    pub fn of<T: ?Sized + Injectable>() -> Self {
        Self {
            service: ServiceType::of::<T>(),
            key: ServiceKey::Default,
            wrappers: Vec::new(),
            if_unresolved: IfUnresolved::Throw,
        }
    }

    /// Same dependency wrapped in `wrapper` (outermost).
    #[inline]
    pub fn wrapped(mut self, wrapper: Wrapper) -> Self {
        self.wrappers.insert(0, wrapper);
        self
    }

    /// Same dependency with an explicit key.
    #[inline]
    pub fn keyed(mut self, key: impl Into<ServiceKey>) -> Self {
        self.key = key.into();
        self
    }

    /// Same dependency with a different unresolved policy.
    #[inline]
    pub fn with_if_unresolved(mut self, if_unresolved: IfUnresolved) -> Self {
        self.if_unresolved = if_unresolved;
        self
    }

    /// The underlying service type (inside any wrappers).
    pub fn service(&self) -> ServiceType {
        self.service
    }

    /// The requested key.
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    /// Wrapper chain, outermost first.
    pub fn wrappers(&self) -> &[Wrapper] {
        &self.wrappers
    }

    /// Unresolved policy.
    pub fn if_unresolved(&self) -> IfUnresolved {
        self.if_unresolved
    }

    /// Whether this parameter sits behind a Lazy/Func boundary.
    pub fn is_deferred(&self) -> bool {
        self.wrappers.iter().any(Wrapper::is_deferred)
    }
}

/// Handle that resolves a deferred request against the scope it was
/// created in.
#[derive(Clone)]
pub struct Deferred {
    resolve: Arc<dyn Fn(&[Instance]) -> Result<Instance> + Send + Sync>,
}

impl Deferred {
    pub(crate) fn new<F>(resolve: F) -> Self
    where
        F: Fn(&[Instance]) -> Result<Instance> + Send + Sync + 'static,
    {
        Self {
            resolve: Arc::new(resolve),
        }
    }

    #[inline]
    pub(crate) fn call(&self, arguments: &[Instance]) -> Result<Instance> {
        (self.resolve)(arguments)
    }
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Deferred")
    }
}

/// Erased value produced by a resolution plan.
#[derive(Debug, Clone)]
pub enum Resolved {
    /// A constructed or cached instance
    Instance(Instance),
    /// Optional request with no match
    Missing,
    /// Deferred, resolved at most once by the consumer
    Lazy(Deferred),
    /// Deferred, resolved on each call by the consumer
    Func(Deferred),
    /// All matches, in registration order
    Many(Vec<Resolved>),
    /// Value paired with registration metadata
    Meta(Box<Resolved>, Option<Metadata>),
    /// Value paired with its registration key
    Keyed(Box<Resolved>, ServiceKey),
}

impl Resolved {
    /// Unwrap a plain instance of `T`.
    pub(crate) fn into_arc<T: ?Sized + Injectable>(self) -> Result<Arc<T>> {
        match self {
            Resolved::Instance(instance) => instance
                .downcast::<T>()
                .ok_or_else(DiError::type_mismatch::<T>),
            Resolved::Missing => Err(DiError::unresolved::<T>()),
            _ => Err(DiError::type_mismatch::<T>()),
        }
    }
}

/// Types that can be injected as a constructor parameter or requested
/// from a container with [`Container::get`].
pub trait Inject: Sized + Send + 'static {
    /// Descriptor of the request this type stands for.
    fn dependency() -> Dependency;

    /// Rebuild the typed value from what the plan produced.
    fn from_resolved(resolved: Resolved) -> Result<Self>;
}

impl<T: ?Sized + Injectable> Inject for Arc<T> {
    #[inline]
    fn dependency() -> Dependency {
        Dependency::of::<T>()
    }

    #[inline]
    fn from_resolved(resolved: Resolved) -> Result<Self> {
        resolved.into_arc::<T>()
    }
}

impl<T: ?Sized + Injectable> Inject for Option<Arc<T>> {
    #[inline]
    fn dependency() -> Dependency {
        Dependency::of::<T>().with_if_unresolved(IfUnresolved::ReturnDefault)
    }

    #[inline]
    fn from_resolved(resolved: Resolved) -> Result<Self> {
        match resolved {
            Resolved::Missing => Ok(None),
            other => other.into_arc::<T>().map(Some),
        }
    }
}

// =============================================================================
// Dependencies - constructor parameter lists
// =============================================================================

/// Ordered constructor parameter list.
///
/// Implemented for `()`, for every single [`Inject`] type, and for tuples
/// of up to 12 [`Inject`] values.
pub trait Dependencies: Sized + Send + 'static {
    /// Parameter descriptors, in order.
    fn dependencies() -> Vec<Dependency>;

    /// Rebuild the typed parameters from resolved values, in order.
    fn from_resolved(values: Vec<Resolved>) -> Result<Self>;
}

impl Dependencies for () {
    #[inline]
    fn dependencies() -> Vec<Dependency> {
        Vec::new()
    }

    #[inline]
    fn from_resolved(_values: Vec<Resolved>) -> Result<Self> {
        Ok(())
    }
}

fn next_value(values: &mut std::vec::IntoIter<Resolved>) -> Result<Resolved> {
    values
        .next()
        .ok_or_else(|| DiError::type_mismatch::<Resolved>())
}

macro_rules! impl_dependencies_single {
    ($([$($g:tt)*] $ty:ty),+ $(,)?) => {
        $(
            impl<$($g)*> Dependencies for $ty {
                #[inline]
                fn dependencies() -> Vec<Dependency> {
                    vec![<$ty as Inject>::dependency()]
                }

                #[inline]
                fn from_resolved(values: Vec<Resolved>) -> Result<Self> {
                    let mut values = values.into_iter();
                    <$ty as Inject>::from_resolved(next_value(&mut values)?)
                }
            }
        )+
    };
}

impl_dependencies_single!(
    [T: ?Sized + Injectable] Arc<T>,
    [T: ?Sized + Injectable] Option<Arc<T>>,
    [T: ?Sized + Injectable] crate::Lazy<T>,
    [T: ?Sized + Injectable] crate::Func<T>,
    [A: Injectable, T: ?Sized + Injectable] crate::FuncWith<A, T>,
    [W: Inject] crate::Many<W>,
    [T: ?Sized + Injectable] crate::Meta<T>,
    [T: ?Sized + Injectable] crate::Keyed<T>,
);

macro_rules! impl_dependencies_tuple {
    ($($T:ident),+) => {
        impl<$($T: Inject),+> Dependencies for ($($T,)+) {
            #[inline]
            fn dependencies() -> Vec<Dependency> {
                vec![$($T::dependency()),+]
            }

            #[inline]
            fn from_resolved(values: Vec<Resolved>) -> Result<Self> {
                let mut values = values.into_iter();
                Ok(($($T::from_resolved(next_value(&mut values)?)?,)+))
            }
        }
    };
}

impl_dependencies_tuple!(A);
impl_dependencies_tuple!(A, B);
impl_dependencies_tuple!(A, B, C);
impl_dependencies_tuple!(A, B, C, D);
impl_dependencies_tuple!(A, B, C, D, E);
impl_dependencies_tuple!(A, B, C, D, E, F);
impl_dependencies_tuple!(A, B, C, D, E, F, G);
impl_dependencies_tuple!(A, B, C, D, E, F, G, H);
impl_dependencies_tuple!(A, B, C, D, E, F, G, H, I);
impl_dependencies_tuple!(A, B, C, D, E, F, G, H, I, J);
impl_dependencies_tuple!(A, B, C, D, E, F, G, H, I, J, K);
impl_dependencies_tuple!(A, B, C, D, E, F, G, H, I, J, K, L);

// =============================================================================
// Service / ServiceModule
// =============================================================================

/// A service that declares its constructor statically.
///
/// Register it with [`Container::register_service`] or
/// [`crate::Made::service`].
pub trait Service: Injectable + Sized {
    /// The constructor parameters.
    type Dependencies: Dependencies;

    /// Create a new instance given the resolved dependencies.
    fn create(deps: Self::Dependencies) -> Self;
}

/// A module that groups related registrations.
///
/// # Example
///
/// ```rust
/// use ioc_engine::{Container, Result, Reuse, Service, ServiceModule};
///
/// struct Clock;
///
/// impl Service for Clock {
///     type Dependencies = ();
///     fn create(_: ()) -> Self { Clock }
/// }
///
/// struct TimeModule;
///
/// impl ServiceModule for TimeModule {
///     fn register(container: &Container) -> Result<()> {
///         container.register_service::<Clock>(Reuse::Singleton)
///     }
/// }
///
/// let container = Container::new();
/// TimeModule::register(&container).unwrap();
/// assert!(container.is_registered::<Clock>());
/// ```
pub trait ServiceModule {
    /// Register all services in this module.
    fn register(container: &Container) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Func, Keyed, Lazy, Many, Meta};

    trait Sink: Send + Sync {}

    struct Logger;

    #[test]
    fn test_descriptors_for_wrappers() {
        let plain = <Arc<Logger> as Inject>::dependency();
        assert_eq!(plain.service(), ServiceType::of::<Logger>());
        assert!(plain.wrappers().is_empty());
        assert_eq!(plain.if_unresolved(), IfUnresolved::Throw);

        let optional = <Option<Arc<dyn Sink>> as Inject>::dependency();
        assert_eq!(optional.service(), ServiceType::of::<dyn Sink>());
        assert_eq!(optional.if_unresolved(), IfUnresolved::ReturnDefault);

        let lazies = <Many<Lazy<Logger>> as Inject>::dependency();
        assert_eq!(lazies.wrappers(), &[Wrapper::Many, Wrapper::Lazy]);
        assert!(lazies.is_deferred());

        let metas = <Many<Meta<Logger>> as Inject>::dependency();
        assert_eq!(metas.wrappers(), &[Wrapper::Many, Wrapper::Meta]);
        assert!(!metas.is_deferred());

        assert_eq!(<Func<Logger> as Inject>::dependency().wrappers(), &[Wrapper::Func]);
        assert_eq!(<Keyed<Logger> as Inject>::dependency().wrappers(), &[Wrapper::Keyed]);
    }

    #[test]
    fn test_tuple_dependencies_keep_order() {
        let deps = <(Arc<Logger>, Option<Arc<dyn Sink>>, Lazy<Logger>) as Dependencies>::dependencies();
        assert_eq!(deps.len(), 3);
        assert_eq!(deps[0].service(), ServiceType::of::<Logger>());
        assert_eq!(deps[1].service(), ServiceType::of::<dyn Sink>());
        assert_eq!(deps[2].wrappers(), &[Wrapper::Lazy]);
    }

    #[test]
    fn test_from_resolved() {
        let logger = Arc::new(Logger);
        let values = vec![
            Resolved::Instance(Instance::new(logger.clone())),
            Resolved::Missing,
        ];
        let (first, second) =
            <(Arc<Logger>, Option<Arc<dyn Sink>>) as Dependencies>::from_resolved(values).unwrap();
        assert!(Arc::ptr_eq(&first, &logger));
        assert!(second.is_none());

        let err = <Arc<Logger> as Dependencies>::from_resolved(vec![Resolved::Missing]).err().unwrap();
        assert!(matches!(err, DiError::Unresolved { .. }));
    }
}
