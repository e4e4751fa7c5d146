//! Factories and registration descriptors
//!
//! A [`Made`] describes how to construct an implementation: its parameter
//! descriptors plus a build function. A [`Registration`] pairs a factory
//! with the service it satisfies, a key, a [`Reuse`] policy and [`Setup`]
//! metadata.
//!
//! Factories are stored as an enum rather than trait objects: either a
//! pre-built instance or a type-erased constructor.

use crate::inject::{Dependencies, Dependency, IfUnresolved, Resolved, Service};
use crate::registry::IfAlreadyRegistered;
use crate::reuse::{Reuse, ScopeName};
use crate::scope::{Created, Dispose, Disposer};
use crate::service::{Injectable, Instance, ServiceKey, ServiceType};
use crate::{BoxError, DiError, Result};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metadata object attached to a registration.
pub type Metadata = Arc<dyn Any + Send + Sync>;

/// Predicate deciding whether a registration applies to a request.
pub type Condition = Arc<dyn Fn(&RequestInfo<'_>) -> bool + Send + Sync>;

// =============================================================================
// Made
// =============================================================================

struct Built<S: ?Sized> {
    value: Arc<S>,
    disposer: Option<Disposer>,
}

type BuildFn<S> = Arc<dyn Fn(Vec<Resolved>) -> Result<Built<S>> + Send + Sync>;

/// Construction descriptor for a service of type `S`.
///
/// # Examples
///
/// ```rust
/// use ioc_engine::{Container, Made, Registration};
/// use std::sync::Arc;
///
/// trait Storage: Send + Sync {
///     fn name(&self) -> &str;
/// }
///
/// struct Memory;
/// impl Storage for Memory {
///     fn name(&self) -> &str { "memory" }
/// }
///
/// let made = Made::of(|(): ()| Memory).cast(|m: Arc<Memory>| m as Arc<dyn Storage>);
///
/// let container = Container::new();
/// container.register(Registration::singleton(made)).unwrap();
/// assert_eq!(container.resolve::<dyn Storage>().unwrap().name(), "memory");
/// ```
pub struct Made<S: ?Sized> {
    implementation: ServiceType,
    parameters: Vec<Dependency>,
    build: BuildFn<S>,
    disposable: bool,
    invalid: Option<String>,
}

impl<I: Injectable> Made<I> {
    /// Construct with an infallible function of the declared dependencies.
    pub fn of<D, F>(construct: F) -> Self
    where
        D: Dependencies,
        F: Fn(D) -> I + Send + Sync + 'static,
    {
        Self {
            implementation: ServiceType::of::<I>(),
            parameters: D::dependencies(),
            build: Arc::new(move |values| {
                let deps = D::from_resolved(values)?;
                Ok(Built {
                    value: Arc::new(construct(deps)),
                    disposer: None,
                })
            }),
            disposable: false,
            invalid: None,
        }
    }

    /// Construct with a fallible function. Its error is reported as
    /// [`DiError::Construction`] with the resolution path.
    pub fn try_of<D, E, F>(construct: F) -> Self
    where
        D: Dependencies,
        E: Into<BoxError>,
        F: Fn(D) -> std::result::Result<I, E> + Send + Sync + 'static,
    {
        Self {
            implementation: ServiceType::of::<I>(),
            parameters: D::dependencies(),
            build: Arc::new(move |values| {
                let deps = D::from_resolved(values)?;
                let value = construct(deps)
                    .map_err(|e| DiError::construction(std::any::type_name::<I>(), e))?;
                Ok(Built {
                    value: Arc::new(value),
                    disposer: None,
                })
            }),
            disposable: false,
            invalid: None,
        }
    }

    /// Construct through [`Service::create`].
    pub fn service() -> Self
    where
        I: Service,
    {
        Self::of(I::create)
    }

    /// Have the owning scope call [`Dispose::dispose`] on every instance.
    pub fn disposable(self) -> Self
    where
        I: Dispose,
    {
        let build = self.build;
        Self {
            build: Arc::new(move |values| {
                let mut built = build(values)?;
                let value = Arc::clone(&built.value);
                built.disposer = Some(Box::new(move || value.dispose()));
                Ok(built)
            }),
            disposable: true,
            ..self
        }
    }
}

impl<S: ?Sized + Injectable> Made<S> {
    /// Expose the constructed value as another service type, usually a
    /// trait object: `made.cast(|x: Arc<Impl>| x as Arc<dyn Trait>)`.
    pub fn cast<T, F>(self, cast: F) -> Made<T>
    where
        T: ?Sized + Injectable,
        F: Fn(Arc<S>) -> Arc<T> + Send + Sync + 'static,
    {
        let build = self.build;
        Made {
            implementation: self.implementation,
            parameters: self.parameters,
            build: Arc::new(move |values| {
                let built = build(values)?;
                Ok(Built {
                    value: cast(built.value),
                    disposer: built.disposer,
                })
            }),
            disposable: self.disposable,
            invalid: self.invalid,
        }
    }

    /// Resolve parameter `index` with an explicit key.
    pub fn with_key(mut self, index: usize, key: impl Into<ServiceKey>) -> Self {
        match self.parameters.get_mut(index) {
            Some(parameter) => parameter.key = key.into(),
            None => self.invalid = Some(format!("no constructor parameter at position {index}")),
        }
        self
    }

    /// Override the unresolved policy of parameter `index`.
    ///
    /// Only meaningful for parameters whose type can represent absence,
    /// such as `Option<Arc<T>>`.
    pub fn with_if_unresolved(mut self, index: usize, if_unresolved: IfUnresolved) -> Self {
        match self.parameters.get_mut(index) {
            Some(parameter) => parameter.if_unresolved = if_unresolved,
            None => self.invalid = Some(format!("no constructor parameter at position {index}")),
        }
        self
    }

    /// The implementation type actually constructed.
    pub fn implementation(&self) -> ServiceType {
        self.implementation
    }

    /// Constructor parameter descriptors.
    pub fn parameters(&self) -> &[Dependency] {
        &self.parameters
    }

    fn into_constructor(self) -> Constructor {
        let build = self.build;
        Constructor {
            implementation: self.implementation,
            parameters: self.parameters,
            build: Arc::new(move |values| {
                let built = build(values)?;
                Ok(Created {
                    instance: Instance::new(built.value),
                    disposer: built.disposer,
                })
            }),
            disposable: self.disposable,
            invalid: self.invalid,
        }
    }
}

impl<S: ?Sized> Clone for Made<S> {
    fn clone(&self) -> Self {
        Self {
            implementation: self.implementation,
            parameters: self.parameters.clone(),
            build: Arc::clone(&self.build),
            disposable: self.disposable,
            invalid: self.invalid.clone(),
        }
    }
}

impl<S: ?Sized> fmt::Debug for Made<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Made")
            .field("implementation", &self.implementation)
            .field("parameters", &self.parameters.len())
            .field("disposable", &self.disposable)
            .finish()
    }
}

/// Type-erased constructor stored in a registration.
pub(crate) struct Constructor {
    pub(crate) implementation: ServiceType,
    pub(crate) parameters: Vec<Dependency>,
    build: Arc<dyn Fn(Vec<Resolved>) -> Result<Created> + Send + Sync>,
    pub(crate) disposable: bool,
    invalid: Option<String>,
}

impl Constructor {
    #[inline]
    pub(crate) fn construct(&self, values: Vec<Resolved>) -> Result<Created> {
        (self.build)(values)
    }

    /// Position of the parameter that receives the decorated instance.
    pub(crate) fn decoratee(&self, service: ServiceType) -> Option<usize> {
        self.parameters.iter().position(|p| {
            p.service == service && p.key.is_default() && p.wrappers.is_empty()
        })
    }
}

/// How a registration produces its value.
pub(crate) enum FactoryKind {
    /// Pre-built instance
    Instance(Instance),
    /// Constructor run according to the reuse policy
    Constructor(Constructor),
}

// =============================================================================
// Setup / RequestInfo
// =============================================================================

/// Read-only view of a request, handed to registration conditions.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    pub(crate) service: ServiceType,
    pub(crate) key: &'a ServiceKey,
    pub(crate) parent: Option<ServiceType>,
    pub(crate) parent_implementation: Option<ServiceType>,
    pub(crate) depth: usize,
}

impl RequestInfo<'_> {
    /// The requested service type.
    pub fn service(&self) -> ServiceType {
        self.service
    }

    /// The requested key.
    pub fn key(&self) -> &ServiceKey {
        self.key
    }

    /// Service type of the consumer, or `None` for a top-level request.
    pub fn parent(&self) -> Option<ServiceType> {
        self.parent
    }

    /// Implementation type of the consumer.
    pub fn parent_implementation(&self) -> Option<ServiceType> {
        self.parent_implementation
    }

    /// Nesting depth, 0 for a top-level request.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether this request is being injected into `P`.
    pub fn is_injected_into<P: ?Sized + 'static>(&self) -> bool {
        self.parent.is_some_and(|p| p.is::<P>())
            || self.parent_implementation.is_some_and(|p| p.is::<P>())
    }
}

/// Registration setup: condition, decorator flag and metadata.
#[derive(Clone, Default)]
pub struct Setup {
    condition: Option<Condition>,
    decorator: bool,
    metadata: Option<Metadata>,
    track_disposable_transient: bool,
}

impl Setup {
    /// Whether a condition restricts this registration.
    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }

    /// Whether this is a decorator.
    pub fn is_decorator(&self) -> bool {
        self.decorator
    }

    /// Attached metadata object.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Whether disposable transients are tracked for this registration.
    pub fn tracks_disposable_transient(&self) -> bool {
        self.track_disposable_transient
    }

    pub(crate) fn allows(&self, info: &RequestInfo<'_>) -> bool {
        self.condition.as_ref().is_none_or(|condition| condition(info))
    }
}

impl fmt::Debug for Setup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Setup")
            .field("conditional", &self.condition.is_some())
            .field("decorator", &self.decorator)
            .field("metadata", &self.metadata.is_some())
            .field("track_disposable_transient", &self.track_disposable_transient)
            .finish()
    }
}

// =============================================================================
// Registration
// =============================================================================

/// Stable identifier of a registration. Also names its reuse slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(u64);

impl RegistrationId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    #[inline]
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A factory bound to a service type, key, reuse policy and setup.
///
/// # Examples
///
/// ```rust
/// use ioc_engine::{Container, Made, Registration, Reuse};
/// use std::sync::Arc;
///
/// struct Connection { dsn: &'static str }
///
/// let container = Container::new();
/// container.register(
///     Registration::new(Made::of(|(): ()| Connection { dsn: "primary" }), Reuse::Singleton)
///         .keyed("primary"),
/// ).unwrap();
///
/// let conn = container.resolve_keyed::<Connection>("primary").unwrap();
/// assert_eq!(conn.dsn, "primary");
/// ```
pub struct Registration {
    pub(crate) id: RegistrationId,
    pub(crate) service: ServiceType,
    pub(crate) key: ServiceKey,
    pub(crate) factory: FactoryKind,
    pub(crate) reuse: Reuse,
    pub(crate) setup: Setup,
    pub(crate) if_already_registered: Option<IfAlreadyRegistered>,
}

impl Registration {
    /// Register `made` under its service type with the given reuse.
    pub fn new<S: ?Sized + Injectable>(made: Made<S>, reuse: Reuse) -> Self {
        Self {
            id: RegistrationId::next(),
            service: ServiceType::of::<S>(),
            key: ServiceKey::Default,
            factory: FactoryKind::Constructor(made.into_constructor()),
            reuse,
            setup: Setup::default(),
            if_already_registered: None,
        }
    }

    /// New instance per resolve.
    #[inline]
    pub fn transient<S: ?Sized + Injectable>(made: Made<S>) -> Self {
        Self::new(made, Reuse::Transient)
    }

    /// One instance in the root scope.
    #[inline]
    pub fn singleton<S: ?Sized + Injectable>(made: Made<S>) -> Self {
        Self::new(made, Reuse::Singleton)
    }

    /// One instance per current scope.
    #[inline]
    pub fn scoped<S: ?Sized + Injectable>(made: Made<S>) -> Self {
        Self::new(made, Reuse::Scoped)
    }

    /// One instance per nearest scope named `name`.
    #[inline]
    pub fn scoped_to<S: ?Sized + Injectable>(made: Made<S>, name: impl Into<ScopeName>) -> Self {
        Self::new(made, Reuse::ScopedTo(name.into()))
    }

    /// A pre-built instance, always a singleton.
    pub fn instance<S: ?Sized + Injectable>(value: Arc<S>) -> Self {
        Self {
            id: RegistrationId::next(),
            service: ServiceType::of::<S>(),
            key: ServiceKey::Default,
            factory: FactoryKind::Instance(Instance::new(value)),
            reuse: Reuse::Singleton,
            setup: Setup::default(),
            if_already_registered: None,
        }
    }

    /// A decorator: its constructor receives the decorated instance as a
    /// plain `Arc<S>` parameter and returns the replacement.
    pub fn decorator<S: ?Sized + Injectable>(made: Made<S>) -> Self {
        let mut registration = Self::new(made, Reuse::Transient);
        registration.setup.decorator = true;
        registration
    }

    /// Register under an explicit key.
    pub fn keyed(mut self, key: impl Into<ServiceKey>) -> Self {
        self.key = key.into();
        self
    }

    /// Change the reuse policy.
    pub fn with_reuse(mut self, reuse: Reuse) -> Self {
        self.reuse = reuse;
        self
    }

    /// Apply only to requests the predicate accepts.
    ///
    /// A matching conditional registration wins over unconditional ones.
    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&RequestInfo<'_>) -> bool + Send + Sync + 'static,
    {
        self.setup.condition = Some(Arc::new(condition));
        self
    }

    /// Attach a metadata object, exposed through [`crate::Meta`].
    pub fn with_metadata<M: Any + Send + Sync>(mut self, metadata: M) -> Self {
        self.setup.metadata = Some(Arc::new(metadata));
        self
    }

    /// Let the resolving scope dispose transient instances.
    pub fn track_disposable_transient(mut self) -> Self {
        self.setup.track_disposable_transient = true;
        self
    }

    /// Override the container's default policy for this registration.
    pub fn if_already_registered(mut self, policy: IfAlreadyRegistered) -> Self {
        self.if_already_registered = Some(policy);
        self
    }

    /// Stable identifier.
    #[inline]
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    /// Service type this registration satisfies.
    #[inline]
    pub fn service(&self) -> ServiceType {
        self.service
    }

    /// Registration key.
    #[inline]
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    /// Reuse policy.
    #[inline]
    pub fn reuse(&self) -> &Reuse {
        &self.reuse
    }

    /// Setup metadata.
    #[inline]
    pub fn setup(&self) -> &Setup {
        &self.setup
    }

    /// Whether this is a decorator.
    #[inline]
    pub fn is_decorator(&self) -> bool {
        self.setup.decorator
    }

    /// Concrete implementation type; the service type for instances.
    pub fn implementation(&self) -> ServiceType {
        match &self.factory {
            FactoryKind::Instance(_) => self.service,
            FactoryKind::Constructor(c) => c.implementation,
        }
    }

    /// Constructor parameter descriptors; empty for instances.
    pub fn parameters(&self) -> &[Dependency] {
        match &self.factory {
            FactoryKind::Instance(_) => &[],
            FactoryKind::Constructor(c) => &c.parameters,
        }
    }

    /// Reject inconsistent descriptors before they reach the registry.
    pub(crate) fn validate(&self, track_disposable_transients: bool) -> Result<()> {
        let service = self.service.name();

        if let Reuse::ScopedTo(name) = &self.reuse {
            if name.as_str().is_empty() {
                return Err(DiError::configuration(service, "scope name must not be empty"));
            }
        }

        let constructor = match &self.factory {
            FactoryKind::Instance(_) => {
                if self.setup.decorator {
                    return Err(DiError::configuration(service, "a decorator needs a constructor"));
                }
                if self.reuse != Reuse::Singleton {
                    return Err(DiError::configuration(
                        service,
                        format!("an instance registration cannot be {}", self.reuse),
                    ));
                }
                return Ok(());
            }
            FactoryKind::Constructor(c) => c,
        };

        if let Some(reason) = &constructor.invalid {
            return Err(DiError::configuration(service, reason.clone()));
        }

        if self.setup.decorator {
            if !self.key.is_default() {
                return Err(DiError::configuration(service, "a decorator cannot be keyed"));
            }
            if constructor.decoratee(self.service).is_none() {
                return Err(DiError::configuration(
                    service,
                    "a decorator must take the decorated service as a plain parameter",
                ));
            }
        } else if constructor
            .parameters
            .iter()
            .any(|p| p.service == self.service && p.key == self.key && p.wrappers.is_empty())
        {
            return Err(DiError::configuration(service, "the constructor depends on itself"));
        }

        if constructor.disposable
            && self.reuse.is_transient()
            && !self.setup.track_disposable_transient
            && !track_disposable_transients
        {
            return Err(DiError::configuration(
                service,
                "a disposable transient is never disposed unless it is tracked",
            ));
        }

        Ok(())
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("key", &self.key)
            .field("implementation", &self.implementation())
            .field("reuse", &self.reuse)
            .field("setup", &self.setup)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    trait Shape: Send + Sync {
        fn sides(&self) -> u32;
    }

    struct Square;

    impl Shape for Square {
        fn sides(&self) -> u32 {
            4
        }
    }

    struct Handle(Arc<AtomicBool>);

    impl Dispose for Handle {
        fn dispose(&self) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_made_cast_builds_trait_object() {
        let made = Made::of(|(): ()| Square).cast(|s: Arc<Square>| s as Arc<dyn Shape>);
        assert!(made.implementation().is::<Square>());

        let constructor = made.into_constructor();
        let created = constructor.construct(Vec::new()).unwrap();
        assert_eq!(created.instance.downcast::<dyn Shape>().unwrap().sides(), 4);
        assert!(created.disposer.is_none());
    }

    #[test]
    fn test_try_of_reports_construction_error() {
        let made = Made::try_of(|(): ()| Err::<Square, _>("no sides"));
        let err = match made.into_constructor().construct(Vec::new()) {
            Err(err) => err,
            Ok(_) => panic!("expected a failure"),
        };
        assert!(matches!(err, DiError::Construction { .. }));
        assert!(err.to_string().contains("no sides"));
    }

    #[test]
    fn test_disposable_survives_cast() {
        let flag = Arc::new(AtomicBool::new(false));
        let inner = flag.clone();
        let made = Made::of(move |(): ()| Handle(inner.clone()))
            .disposable()
            .cast(|h: Arc<Handle>| h as Arc<dyn Dispose>);

        let created = made.into_constructor().construct(Vec::new()).unwrap();
        (created.disposer.unwrap())();
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_validation() {
        let bad_index = Registration::transient(Made::of(|(): ()| Square).with_key(3, "x"));
        assert!(bad_index.validate(false).is_err());

        let keyed_decorator = Registration::decorator(Made::of(|inner: Arc<Square>| {
            let _ = inner;
            Square
        }))
        .keyed("k");
        assert!(keyed_decorator.validate(false).is_err());

        let not_a_decorator = Registration::decorator(Made::of(|(): ()| Square));
        assert!(not_a_decorator.validate(false).is_err());

        let empty_scope = Registration::scoped_to(Made::of(|(): ()| Square), "");
        assert!(empty_scope.validate(false).is_err());

        let transient_instance = Registration::instance(Arc::new(Square)).with_reuse(Reuse::Transient);
        assert!(transient_instance.validate(false).is_err());

        let flag = Arc::new(AtomicBool::new(false));
        let untracked = Registration::transient(
            Made::of(move |(): ()| Handle(flag.clone())).disposable(),
        );
        assert!(untracked.validate(false).is_err());
        assert!(untracked.validate(true).is_ok());

        let ok = Registration::singleton(Made::of(|(): ()| Square)).keyed("k");
        assert!(ok.validate(false).is_ok());
    }

    #[test]
    fn test_registration_ids_are_unique() {
        let a = Registration::transient(Made::of(|(): ()| Square));
        let b = Registration::transient(Made::of(|(): ()| Square));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.service(), ServiceType::of::<Square>());
    }
}
