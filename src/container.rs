//! Resolver facade
//!
//! The `Container` is the entry point: it accepts registrations, opens
//! scopes and resolves services. Every handle points at one scope of a
//! shared core (registry, rules and root scope). Opening a scope returns a
//! new handle; dropping the last handle of a scope disposes it.

use crate::factory::{Made, Registration};
use crate::generic::OpenGeneric;
use crate::inject::{Dependencies, Dependency, IfUnresolved, Inject, Resolved, Service};
use crate::plan::Frame;
use crate::registry::Registry;
use crate::request::{Request, RequestBuilder};
use crate::reuse::{Reuse, ScopeName};
use crate::rules::Rules;
use crate::scope::Scope;
use crate::service::{Injectable, Instance, ServiceKey, ServiceType};
use crate::{DiError, Result};
use std::marker::PhantomData;
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// State shared by every scope of one container.
pub(crate) struct Core {
    registry: Registry,
    rules: Rules,
    root: Arc<Scope>,
}

impl Core {
    #[inline]
    pub(crate) fn root(&self) -> &Arc<Scope> {
        &self.root
    }

    /// Look up (or build and cache) the plan for `request` and run it in
    /// `scope`.
    pub(crate) fn resolve_request(
        self: &Arc<Self>,
        scope: &Arc<Scope>,
        request: &Request,
        arguments: &[Instance],
    ) -> Result<Resolved> {
        scope.ensure_active()?;
        let snapshot = self.registry.snapshot();

        let plan = match snapshot.plans.get(request) {
            Some(plan) => {
                #[cfg(feature = "logging")]
                trace!(
                    target: "ioc_engine",
                    service = request.service.name(),
                    "Plan cache hit"
                );

                plan
            }
            None => {
                let expr = RequestBuilder::new(&snapshot, &self.rules, request).build()?;
                snapshot.plans.insert(request.clone(), expr)
            }
        };

        plan.invoke(
            Frame {
                core: self,
                scope,
                arguments,
            },
            &self.rules,
        )
    }
}

/// Registration and resolution entry point.
///
/// Cloning a `Container` is cheap and shares the same scope.
///
/// # Examples
///
/// ```rust
/// use ioc_engine::Container;
/// use std::sync::Arc;
///
/// struct Config { url: String }
/// struct Repository { config: Arc<Config> }
///
/// let container = Container::new();
/// container.instance(Config { url: "postgres://localhost".into() }).unwrap();
/// container.singleton(|config: Arc<Config>| Repository { config }).unwrap();
///
/// let repo = container.resolve::<Repository>().unwrap();
/// assert_eq!(repo.config.url, "postgres://localhost");
/// ```
#[derive(Clone)]
pub struct Container {
    core: Arc<Core>,
    scope: Arc<Scope>,
}

impl Container {
    /// Create a new root container with default rules.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ioc_engine::Container;
    /// let container = Container::new();
    /// assert_eq!(container.depth(), 0);
    /// ```
    #[inline]
    pub fn new() -> Self {
        Self::with_rules(Rules::default())
    }

    /// Create a new root container with the given rules.
    pub fn with_rules(rules: Rules) -> Self {
        #[cfg(feature = "logging")]
        debug!(target: "ioc_engine", ?rules, "Creating new root container");

        let root = Scope::root();
        Self {
            core: Arc::new(Core {
                registry: Registry::new(),
                rules,
                root: Arc::clone(&root),
            }),
            scope: root,
        }
    }

    /// Derive a container with changed rules.
    ///
    /// The derived container starts with the current registrations and
    /// shares singletons and this handle's scope, but keeps its own
    /// registry and plan cache from then on.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ioc_engine::{Container, PlanBackend};
    ///
    /// let container = Container::new();
    /// let interpreted = container.with(|rules| rules.with_plan_backend(PlanBackend::Interpreted));
    /// assert_eq!(interpreted.rules().plan_backend(), PlanBackend::Interpreted);
    /// ```
    pub fn with(&self, configure: impl FnOnce(Rules) -> Rules) -> Self {
        let rules = configure(self.core.rules.clone());

        #[cfg(feature = "logging")]
        debug!(target: "ioc_engine", ?rules, "Deriving container with new rules");

        Self {
            core: Arc::new(Core {
                registry: self.core.registry.fork(),
                rules,
                root: Arc::clone(&self.core.root),
            }),
            scope: Arc::clone(&self.scope),
        }
    }

    /// Container rules.
    #[inline]
    pub fn rules(&self) -> &Rules {
        &self.core.rules
    }

    // =========================================================================
    // Scopes
    // =========================================================================

    /// Open an unnamed child scope.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ioc_engine::{Container, Made, Registration};
    /// use std::sync::Arc;
    ///
    /// struct RequestState;
    ///
    /// let root = Container::new();
    /// root.scoped(|(): ()| RequestState).unwrap();
    ///
    /// let request = root.open_scope().unwrap();
    /// let a = request.resolve::<RequestState>().unwrap();
    /// let b = request.resolve::<RequestState>().unwrap();
    /// assert!(Arc::ptr_eq(&a, &b));
    ///
    /// // Scoped services need an open scope
    /// assert!(root.resolve::<RequestState>().is_err());
    /// ```
    pub fn open_scope(&self) -> Result<Self> {
        Ok(Self {
            core: Arc::clone(&self.core),
            scope: self.scope.child(None)?,
        })
    }

    /// Open a child scope named `name`, targeted by [`Reuse::ScopedTo`].
    pub fn open_named_scope(&self, name: impl Into<ScopeName>) -> Result<Self> {
        Ok(Self {
            core: Arc::clone(&self.core),
            scope: self.scope.child(Some(name.into()))?,
        })
    }

    /// Dispose this handle's scope now instead of on drop.
    ///
    /// Disposing the root scope disposes singletons.
    pub fn dispose(&self) {
        self.scope.dispose();
    }

    /// The scope this handle resolves from.
    #[inline]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Get the scope depth (0 = root).
    #[inline]
    pub fn depth(&self) -> u32 {
        self.scope.depth()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Add one registration.
    pub fn register(&self, registration: Registration) -> Result<()> {
        self.register_many([registration])
    }

    /// Add several registrations atomically: either all are applied or,
    /// on the first error, none.
    pub fn register_many<I>(&self, registrations: I) -> Result<()>
    where
        I: IntoIterator<Item = Registration>,
    {
        let registrations: Vec<Registration> = registrations.into_iter().collect();
        let track = self.core.rules.track_disposable_transients();
        for registration in &registrations {
            registration.validate(track)?;
        }

        #[cfg(feature = "logging")]
        let count = registrations.len();

        #[cfg_attr(not(feature = "logging"), allow(unused_variables))]
        let stored = self
            .core
            .registry
            .register_all(registrations, self.core.rules.if_already_registered())?;

        #[cfg(feature = "logging")]
        debug!(target: "ioc_engine", count, stored, "Registered services");

        Ok(())
    }

    /// Start a fluent batch, applied atomically by [`RegistrationBatch::done`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ioc_engine::{Container, Made, Registration};
    ///
    /// struct Cache;
    /// struct Clock;
    ///
    /// let container = Container::new();
    /// container
    ///     .register_batch()
    ///     .add(Registration::singleton(Made::of(|(): ()| Cache)))
    ///     .add(Registration::transient(Made::of(|(): ()| Clock)))
    ///     .done()
    ///     .unwrap();
    ///
    /// assert!(container.is_registered::<Cache>());
    /// assert!(container.is_registered::<Clock>());
    /// ```
    pub fn register_batch(&self) -> RegistrationBatch<'_> {
        RegistrationBatch {
            container: self,
            registrations: Vec::new(),
        }
    }

    /// Add an open-generic family.
    pub fn register_generic(&self, family: OpenGeneric) -> Result<()> {
        #[cfg(feature = "logging")]
        debug!(target: "ioc_engine", definition = family.definition(), "Registered open generic");

        let family = family.tracking_disposable_transients(self.core.rules.track_disposable_transients());
        self.core.registry.register_generic(family)
    }

    /// Register a pre-built instance as a singleton.
    pub fn instance<T: Injectable>(&self, value: T) -> Result<()> {
        self.register(Registration::instance(Arc::new(value)))
    }

    /// Register an already shared instance (possibly a trait object).
    pub fn instance_arc<T: ?Sized + Injectable>(&self, value: Arc<T>) -> Result<()> {
        self.register(Registration::instance(value))
    }

    /// Register a constructor as a singleton.
    pub fn singleton<T, D, F>(&self, construct: F) -> Result<()>
    where
        T: Injectable,
        D: Dependencies,
        F: Fn(D) -> T + Send + Sync + 'static,
    {
        self.register(Registration::singleton(Made::of(construct)))
    }

    /// Register a constructor as a transient.
    pub fn transient<T, D, F>(&self, construct: F) -> Result<()>
    where
        T: Injectable,
        D: Dependencies,
        F: Fn(D) -> T + Send + Sync + 'static,
    {
        self.register(Registration::transient(Made::of(construct)))
    }

    /// Register a constructor as scoped.
    pub fn scoped<T, D, F>(&self, construct: F) -> Result<()>
    where
        T: Injectable,
        D: Dependencies,
        F: Fn(D) -> T + Send + Sync + 'static,
    {
        self.register(Registration::scoped(Made::of(construct)))
    }

    /// Register a [`Service`] implementation with the given reuse.
    pub fn register_service<S: Service>(&self, reuse: Reuse) -> Result<()> {
        self.register(Registration::new(Made::<S>::service(), reuse))
    }

    /// Remove the default registrations of `T`. Returns whether any existed.
    pub fn unregister<T: ?Sized + Injectable>(&self) -> Result<bool> {
        self.unregister_keyed::<T>(ServiceKey::Default)
    }

    /// Remove the registrations of `T` under `key`.
    pub fn unregister_keyed<T: ?Sized + Injectable>(&self, key: impl Into<ServiceKey>) -> Result<bool> {
        self.core
            .registry
            .unregister(ServiceType::of::<T>(), &key.into())
    }

    /// Whether `T` has a default registration.
    pub fn is_registered<T: ?Sized + Injectable>(&self) -> bool {
        self.is_registered_keyed::<T>(ServiceKey::Default)
    }

    /// Whether `T` has a registration under `key`.
    pub fn is_registered_keyed<T: ?Sized + Injectable>(&self, key: impl Into<ServiceKey>) -> bool {
        self.core
            .registry
            .snapshot()
            .contains(&ServiceType::of::<T>(), &key.into())
    }

    /// Current registrations of `T` (decorators excluded), in order.
    pub fn registrations<T: ?Sized + Injectable>(&self) -> Vec<Arc<Registration>> {
        self.core
            .registry
            .snapshot()
            .registrations(&ServiceType::of::<T>())
            .to_vec()
    }

    /// Number of service types with at least one registration.
    pub fn len(&self) -> usize {
        self.core.registry.snapshot().service_count()
    }

    /// Check if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock the container to prevent further registrations.
    ///
    /// Useful for ensuring no services are registered after app initialization.
    #[inline]
    pub fn lock(&self) {
        self.core.registry.lock();
    }

    /// Check if the container is locked.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.core.registry.is_locked()
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Resolve any injectable request: `Arc<T>`, `Option<Arc<T>>`,
    /// `Lazy<T>`, `Func<T>`, `Many<W>`, `Meta<T>`, ...
    pub fn get<D: Inject>(&self) -> Result<D> {
        self.fetch(D::dependency())
    }

    /// Resolve the default registration of `T`.
    #[inline]
    pub fn resolve<T: ?Sized + Injectable>(&self) -> Result<Arc<T>> {
        self.get::<Arc<T>>()
    }

    /// Resolve the registration of `T` under `key`.
    pub fn resolve_keyed<T: ?Sized + Injectable>(&self, key: impl Into<ServiceKey>) -> Result<Arc<T>> {
        self.fetch(Dependency::of::<T>().keyed(key))
    }

    /// Resolve `T`, or `Ok(None)` when nothing is registered.
    ///
    /// Other failures (construction, cycles, ...) are still errors.
    pub fn try_resolve<T: ?Sized + Injectable>(&self) -> Result<Option<Arc<T>>> {
        self.get::<Option<Arc<T>>>()
    }

    /// Resolve with an explicit key and unresolved policy.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ioc_engine::{Container, IfUnresolved, ServiceKey};
    ///
    /// struct Missing;
    ///
    /// let container = Container::new();
    /// let none = container
    ///     .resolve_with::<Missing>(ServiceKey::Default, IfUnresolved::ReturnDefault)
    ///     .unwrap();
    /// assert!(none.is_none());
    ///
    /// assert!(container
    ///     .resolve_with::<Missing>(ServiceKey::Default, IfUnresolved::Throw)
    ///     .is_err());
    /// ```
    pub fn resolve_with<T: ?Sized + Injectable>(
        &self,
        key: impl Into<ServiceKey>,
        if_unresolved: IfUnresolved,
    ) -> Result<Option<Arc<T>>> {
        let dependency = Dependency::of::<T>()
            .keyed(key)
            .with_if_unresolved(if_unresolved);
        match self.execute(&Request::root(dependency))? {
            Resolved::Missing => Ok(None),
            other => other.into_arc::<T>().map(Some),
        }
    }

    /// Every registration of `T`, resolved lazily in registration order.
    pub fn resolve_many<T: ?Sized + Injectable>(&self) -> Services<T> {
        self.resolve_many_keyed(ServiceKey::Default)
    }

    /// Every registration of `T` under `key`; the default key means all.
    pub fn resolve_many_keyed<T: ?Sized + Injectable>(&self, key: impl Into<ServiceKey>) -> Services<T> {
        Services {
            container: self.clone(),
            key: key.into(),
            _marker: PhantomData,
        }
    }

    fn fetch<D: Inject>(&self, dependency: Dependency) -> Result<D> {
        #[cfg(feature = "logging")]
        trace!(
            target: "ioc_engine",
            service = dependency.service().name(),
            scope = %self.scope.id(),
            "Resolving service"
        );

        D::from_resolved(self.execute(&Request::root(dependency))?)
    }

    #[inline]
    fn execute(&self, request: &Request) -> Result<Resolved> {
        self.core.resolve_request(&self.scope, request, &[])
    }

    #[cfg(test)]
    pub(crate) fn cached_plans(&self) -> (usize, usize) {
        self.core.registry.snapshot().plans.len()
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("service_count", &self.len())
            .field("scope", &self.scope)
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Fluent batch registration builder.
pub struct RegistrationBatch<'a> {
    container: &'a Container,
    registrations: Vec<Registration>,
}

impl RegistrationBatch<'_> {
    /// Queue a registration and continue the chain.
    #[inline]
    pub fn add(mut self, registration: Registration) -> Self {
        self.registrations.push(registration);
        self
    }

    /// Apply every queued registration atomically.
    pub fn done(self) -> Result<()> {
        self.container.register_many(self.registrations)
    }
}

// =============================================================================
// Services - lazy ResolveMany
// =============================================================================

/// Lazily resolved collection of every registration of `T`.
///
/// Each call to [`Services::iter`] re-reads the current registrations, so
/// services registered after the collection was created are included.
///
/// # Examples
///
/// ```rust
/// use ioc_engine::{Container, Made, Registration};
/// use std::sync::Arc;
///
/// trait Plugin: Send + Sync { fn name(&self) -> &'static str; }
/// struct Audit;
/// impl Plugin for Audit { fn name(&self) -> &'static str { "audit" } }
/// struct Metrics;
/// impl Plugin for Metrics { fn name(&self) -> &'static str { "metrics" } }
///
/// let container = Container::new();
/// let plugins = container.resolve_many::<dyn Plugin>();
///
/// container.register(Registration::singleton(
///     Made::of(|(): ()| Audit).cast(|p: Arc<Audit>| p as Arc<dyn Plugin>),
/// ).keyed("audit")).unwrap();
/// container.register(Registration::singleton(
///     Made::of(|(): ()| Metrics).cast(|p: Arc<Metrics>| p as Arc<dyn Plugin>),
/// ).keyed("metrics")).unwrap();
///
/// let names: Vec<_> = plugins.iter().map(|p| p.unwrap().name()).collect();
/// assert_eq!(names, ["audit", "metrics"]);
/// ```
pub struct Services<T: ?Sized> {
    container: Container,
    key: ServiceKey,
    _marker: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized + Injectable> Services<T> {
    /// Enumerate against the current registrations.
    pub fn iter(&self) -> ServicesIter<T> {
        let core = &self.container.core;
        let snapshot = core.registry.snapshot();
        let service = ServiceType::of::<T>();
        let request = Request::root(Dependency::of::<T>().keyed(self.key.clone()));

        let (pending, failure) = match RequestBuilder::new(&snapshot, &core.rules, &request)
            .collect_many(service, &self.key)
        {
            Ok(found) => (found.iter().map(|r| Request::pinned(r)).collect(), None),
            Err(err) => (Vec::new(), Some(err)),
        };

        ServicesIter {
            container: self.container.clone(),
            pending: pending.into_iter(),
            failure,
            _marker: PhantomData,
        }
    }

    /// Resolve everything now.
    pub fn to_vec(&self) -> Result<Vec<Arc<T>>> {
        self.iter().collect()
    }
}

impl<T: ?Sized> std::fmt::Debug for Services<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("service", &std::any::type_name::<T>())
            .field("key", &self.key)
            .finish()
    }
}

impl<'a, T: ?Sized + Injectable> IntoIterator for &'a Services<T> {
    type Item = Result<Arc<T>>;
    type IntoIter = ServicesIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over [`Services`]; each step resolves one registration.
pub struct ServicesIter<T: ?Sized> {
    container: Container,
    pending: std::vec::IntoIter<Request>,
    failure: Option<DiError>,
    _marker: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized + Injectable> Iterator for ServicesIter<T> {
    type Item = Result<Arc<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.failure.take() {
            return Some(Err(err));
        }
        let request = self.pending.next()?;
        Some(
            self.container
                .execute(&request)
                .and_then(Resolved::into_arc::<T>),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let extra = usize::from(self.failure.is_some());
        let (low, high) = self.pending.size_hint();
        (low + extra, high.map(|h| h + extra))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Dispose;
    use crate::{ErrorKind, Func, FuncWith, Keyed, Lazy, Many, Meta, PlanBackend};
    use parking_lot::Mutex;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // =========================================================================
    // Reuse
    // =========================================================================

    struct Config;

    #[test]
    fn test_singleton_identical_at_every_depth() {
        let root = Container::new();
        root.singleton(|(): ()| Config).unwrap();

        let scope = root.open_scope().unwrap();
        let nested = scope.open_scope().unwrap();

        let a = root.resolve::<Config>().unwrap();
        let b = scope.resolve::<Config>().unwrap();
        let c = nested.resolve::<Config>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));
        assert_eq!(nested.depth(), 2);
    }

    #[test]
    fn test_transient_distinct() {
        let container = Container::new();
        container.transient(|(): ()| Config).unwrap();

        let a = container.resolve::<Config>().unwrap();
        let b = container.resolve::<Config>().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_scoped_per_scope() {
        let root = Container::new();
        root.scoped(|(): ()| Config).unwrap();

        let s1 = root.open_scope().unwrap();
        let s2 = root.open_scope().unwrap();
        let a = s1.resolve::<Config>().unwrap();
        let b = s1.resolve::<Config>().unwrap();
        let c = s2.resolve::<Config>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        assert!(matches!(
            root.resolve::<Config>(),
            Err(DiError::NoCurrentScope { .. })
        ));
    }

    #[test]
    fn test_scoped_to_named_scope() {
        let root = Container::new();
        root.register(Registration::scoped_to(Made::of(|(): ()| Config), "request"))
            .unwrap();

        let request = root.open_named_scope("request").unwrap();
        let inner = request.open_scope().unwrap();
        let a = request.resolve::<Config>().unwrap();
        let b = inner.resolve::<Config>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = root.open_scope().unwrap();
        let err = other.resolve::<Config>().err().unwrap();
        assert!(matches!(err, DiError::ScopeNotFound { .. }));
        assert_eq!(err.kind(), ErrorKind::CaptiveDependency);
    }

    // =========================================================================
    // Scenario: singleton / transient / scoped services behind trait objects
    // =========================================================================

    trait SingletonService: Send + Sync {}
    trait TransientService: Send + Sync {}
    trait ScopedService: Send + Sync {
        fn singleton(&self) -> &Arc<dyn SingletonService>;
        fn transient(&self) -> &Arc<dyn TransientService>;
    }

    struct SingletonImpl;
    impl SingletonService for SingletonImpl {}

    struct TransientImpl;
    impl TransientService for TransientImpl {}

    struct ScopedImpl {
        singleton: Arc<dyn SingletonService>,
        transient: Arc<dyn TransientService>,
    }

    impl ScopedService for ScopedImpl {
        fn singleton(&self) -> &Arc<dyn SingletonService> {
            &self.singleton
        }
        fn transient(&self) -> &Arc<dyn TransientService> {
            &self.transient
        }
    }

    fn scenario() -> Container {
        let container = Container::new();
        container
            .register_many([
                Registration::singleton(
                    Made::of(|(): ()| SingletonImpl)
                        .cast(|s: Arc<SingletonImpl>| s as Arc<dyn SingletonService>),
                ),
                Registration::transient(
                    Made::of(|(): ()| TransientImpl)
                        .cast(|s: Arc<TransientImpl>| s as Arc<dyn TransientService>),
                ),
                Registration::scoped(
                    Made::of(
                        |(singleton, transient): (Arc<dyn SingletonService>, Arc<dyn TransientService>)| {
                            ScopedImpl { singleton, transient }
                        },
                    )
                    .cast(|s: Arc<ScopedImpl>| s as Arc<dyn ScopedService>),
                ),
            ])
            .unwrap();
        container
    }

    #[test]
    fn test_scenario_scoped_holds_transient_per_scope() {
        let container = scenario();

        let first = container.open_scope().unwrap();
        let a = first.resolve::<dyn ScopedService>().unwrap();
        let b = first.resolve::<dyn ScopedService>().unwrap();
        assert!(Arc::ptr_eq(a.transient(), b.transient()));

        let second = container.open_scope().unwrap();
        let c = second.resolve::<dyn ScopedService>().unwrap();
        assert!(!Arc::ptr_eq(a.transient(), c.transient()));
        assert!(Arc::ptr_eq(a.singleton(), c.singleton()));
    }

    // =========================================================================
    // Disposal
    // =========================================================================

    struct Tracked {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Dispose for Tracked {
        fn dispose(&self) {
            self.log.lock().push(self.name);
        }
    }

    struct First(#[allow(dead_code)] Arc<Tracked>);
    struct Second(#[allow(dead_code)] Arc<Tracked>);

    fn tracked(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Made<Tracked> {
        let log = Arc::clone(log);
        Made::of(move |(): ()| Tracked {
            name,
            log: Arc::clone(&log),
        })
        .disposable()
    }

    #[test]
    fn test_dispose_reverse_order_and_only_own_instances() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let root = Container::new();
        root.register_many([
            Registration::scoped(tracked("a", &log)).keyed("a"),
            Registration::scoped(tracked("b", &log)).keyed("b"),
            Registration::singleton(tracked("root", &log)).keyed("root"),
        ])
        .unwrap();

        let scope = root.open_scope().unwrap();
        let other = root.open_scope().unwrap();
        scope.resolve_keyed::<Tracked>("a").unwrap();
        scope.resolve_keyed::<Tracked>("root").unwrap();
        scope.resolve_keyed::<Tracked>("b").unwrap();
        other.resolve_keyed::<Tracked>("a").unwrap();

        scope.dispose();
        assert_eq!(*log.lock(), vec!["b", "a"]);

        assert!(matches!(
            scope.resolve_keyed::<Tracked>("a"),
            Err(DiError::ScopeDisposed { .. })
        ));

        drop(other);
        assert_eq!(*log.lock(), vec!["b", "a", "a"]);

        root.dispose();
        assert_eq!(*log.lock(), vec!["b", "a", "a", "root"]);
    }

    #[test]
    fn test_dependencies_disposed_after_dependents() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let root = Container::new();
        let outer_log = Arc::clone(&log);
        root.register_many([
            Registration::scoped(tracked("inner", &log)),
            Registration::scoped(
                Made::of(move |_inner: Arc<Tracked>| Tracked {
                    name: "outer",
                    log: Arc::clone(&outer_log),
                })
                .disposable()
                .cast(|t: Arc<Tracked>| t as Arc<dyn Dispose>),
            ),
        ])
        .unwrap();

        let scope = root.open_scope().unwrap();
        scope.resolve::<dyn Dispose>().unwrap();
        drop(scope);
        assert_eq!(*log.lock(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_disposable_transient_tracking() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let root = Container::new();
        assert!(matches!(
            root.register(Registration::transient(tracked("t", &log))),
            Err(DiError::Configuration { .. })
        ));

        root.register(Registration::transient(tracked("t", &log)).track_disposable_transient())
            .unwrap();
        let scope = root.open_scope().unwrap();
        scope.resolve::<Tracked>().unwrap();
        scope.resolve::<Tracked>().unwrap();
        scope.dispose();
        assert_eq!(log.lock().len(), 2);
    }

    // =========================================================================
    // Cycles and deferred wrappers
    // =========================================================================

    #[allow(dead_code)]
    struct Ping(Arc<Pong>);
    #[allow(dead_code)]
    struct Pong(Arc<Ping>);

    struct A {
        b: Arc<B>,
    }
    struct B {
        a: Lazy<A>,
    }

    #[test]
    fn test_cycle_detected_and_broken_by_lazy() {
        let container = Container::new();
        container.transient(Ping).unwrap();
        container.transient(Pong).unwrap();
        let err = container.resolve::<Ping>().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::RecursiveDependency);

        let container = Container::new();
        container.singleton(|b: Arc<B>| A { b }).unwrap();
        container.singleton(|a: Lazy<A>| B { a }).unwrap();

        let a = container.resolve::<A>().unwrap();
        assert!(!a.b.a.is_resolved());
        let again = a.b.a.get().unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert!(a.b.a.is_resolved());
    }

    #[test]
    fn test_func_creates_new_instances() {
        let container = Container::new();
        container.transient(|(): ()| Config).unwrap();

        let factory = container.get::<Func<Config>>().unwrap();
        let a = factory.call().unwrap();
        let b = factory.call().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    struct Port(u16);
    struct Server {
        port: Arc<Port>,
        #[allow(dead_code)]
        config: Arc<Config>,
    }

    #[test]
    fn test_func_with_binds_argument() {
        let container = Container::new();
        container.singleton(|(): ()| Config).unwrap();
        container
            .transient(|(port, config): (Arc<Port>, Arc<Config>)| Server { port, config })
            .unwrap();

        let factory = container.get::<FuncWith<Port, Server>>().unwrap();
        assert_eq!(factory.call(Port(8080)).unwrap().port.0, 8080);
        assert_eq!(factory.call(Port(9090)).unwrap().port.0, 9090);

        // Without the argument the port is unresolvable
        assert!(container.resolve::<Server>().is_err());
    }

    struct Settings {
        #[allow(dead_code)]
        port: Arc<Port>,
    }
    struct Listener {
        #[allow(dead_code)]
        settings: Arc<Settings>,
    }

    #[test]
    fn test_func_with_argument_cannot_reach_a_reused_service() {
        let container = Container::new();
        container.singleton(|port: Arc<Port>| Settings { port }).unwrap();
        container.transient(|settings: Arc<Settings>| Listener { settings }).unwrap();

        let factory = container.get::<FuncWith<Port, Listener>>().unwrap();
        let err = factory.call(Port(8080)).err().unwrap();
        assert!(matches!(err, DiError::CaptiveDependency { .. }));

        // Nothing was cached, so a later call fails the same way
        assert!(factory.call(Port(9090)).is_err());
        assert_eq!(container.scope().cached(), 0);
    }

    #[test]
    fn test_lazy_of_unregistered_fails_at_plan_time() {
        let container = Container::new();
        assert!(matches!(
            container.get::<Lazy<Config>>(),
            Err(DiError::Unresolved { .. })
        ));
    }

    // =========================================================================
    // Keys, Many, Meta, conditions, decorators
    // =========================================================================

    trait Handler: Send + Sync {
        fn name(&self) -> String;
    }

    struct Named(&'static str);

    impl Handler for Named {
        fn name(&self) -> String {
            self.0.to_string()
        }
    }

    fn handler(name: &'static str) -> Made<dyn Handler> {
        Made::of(move |(): ()| Named(name)).cast(|h: Arc<Named>| h as Arc<dyn Handler>)
    }

    #[test]
    fn test_resolve_many_in_registration_order() {
        let container = Container::new();
        container
            .register_many([
                Registration::transient(handler("one")).keyed("1"),
                Registration::transient(handler("two")).keyed("2"),
            ])
            .unwrap();

        let all = container.resolve_many::<dyn Handler>();
        let names: Vec<String> = all.iter().map(|h| h.unwrap().name()).collect();
        assert_eq!(names, ["one", "two"]);

        // Restartable and sees later registrations
        container
            .register(Registration::transient(handler("three")).keyed("3"))
            .unwrap();
        assert_eq!(all.to_vec().unwrap().len(), 3);

        let many = container.get::<Many<Keyed<dyn Handler>>>().unwrap();
        let keys: Vec<&ServiceKey> = many.iter().map(|k| k.key()).collect();
        assert_eq!(keys, [&ServiceKey::from("1"), &ServiceKey::from("2"), &ServiceKey::from("3")]);

        let only_two = container.resolve_many_keyed::<dyn Handler>("2").to_vec().unwrap();
        assert_eq!(only_two.len(), 1);
        assert_eq!(only_two[0].name(), "two");
    }

    #[test]
    fn test_keyed_and_default_are_separate() {
        let container = Container::new();
        container
            .register_many([
                Registration::singleton(handler("default")),
                Registration::singleton(handler("primary")).keyed("primary"),
            ])
            .unwrap();

        assert_eq!(container.resolve::<dyn Handler>().unwrap().name(), "default");
        assert_eq!(
            container.resolve_keyed::<dyn Handler>("primary").unwrap().name(),
            "primary"
        );
        assert!(container.resolve_keyed::<dyn Handler>("missing").is_err());
        assert!(container.is_registered_keyed::<dyn Handler>("primary"));
    }

    #[test]
    fn test_meta_exposes_registration_metadata() {
        let container = Container::new();
        container
            .register(Registration::singleton(handler("audit")).with_metadata(42u32))
            .unwrap();

        let meta = container.get::<Meta<dyn Handler>>().unwrap();
        assert_eq!(meta.value().name(), "audit");
        assert_eq!(meta.metadata::<u32>(), Some(&42));
    }

    struct Consumer {
        handler: Arc<dyn Handler>,
    }
    struct Other {
        handler: Arc<dyn Handler>,
    }

    #[test]
    fn test_condition_beats_unconditional() {
        let container = Container::new();
        container
            .register_many([
                Registration::transient(handler("general")),
                Registration::transient(handler("special"))
                    .when(|info| info.is_injected_into::<Consumer>()),
            ])
            .unwrap();
        container.transient(|handler: Arc<dyn Handler>| Consumer { handler }).unwrap();
        container.transient(|handler: Arc<dyn Handler>| Other { handler }).unwrap();

        assert_eq!(container.resolve::<Consumer>().unwrap().handler.name(), "special");
        assert_eq!(container.resolve::<Other>().unwrap().handler.name(), "general");
        assert_eq!(container.resolve::<dyn Handler>().unwrap().name(), "general");
    }

    struct Eager {
        handler: Arc<dyn Handler>,
    }
    struct OnDemand {
        handler: Lazy<dyn Handler>,
    }

    #[test]
    fn test_condition_sees_the_consumer_through_lazy() {
        let container = Container::new();
        container
            .register_many([
                Registration::transient(handler("general")),
                Registration::transient(handler("special")).when(|info| {
                    info.is_injected_into::<Eager>() || info.is_injected_into::<OnDemand>()
                }),
            ])
            .unwrap();
        container.transient(|handler: Arc<dyn Handler>| Eager { handler }).unwrap();
        container.transient(|handler: Lazy<dyn Handler>| OnDemand { handler }).unwrap();

        let eager = container.resolve::<Eager>().unwrap();
        let on_demand = container.resolve::<OnDemand>().unwrap();
        assert_eq!(eager.handler.name(), "special");
        assert_eq!(on_demand.handler.get().unwrap().name(), "special");

        // A top-level Lazy has no consumer
        let top = container.get::<Lazy<dyn Handler>>().unwrap();
        assert_eq!(top.get().unwrap().name(), "general");
    }

    #[test]
    fn test_two_matching_conditions_are_ambiguous() {
        let container = Container::new();
        container
            .register_many([
                Registration::transient(handler("x")).when(|_| true),
                Registration::transient(handler("y")).when(|_| true),
            ])
            .unwrap();
        assert_eq!(
            container.resolve::<dyn Handler>().err().unwrap().kind(),
            ErrorKind::AmbiguousMatch
        );
    }

    struct Prefixed {
        inner: Arc<dyn Handler>,
        prefix: &'static str,
    }

    impl Handler for Prefixed {
        fn name(&self) -> String {
            format!("{}({})", self.prefix, self.inner.name())
        }
    }

    fn prefixed(prefix: &'static str) -> Registration {
        Registration::decorator(
            Made::of(move |inner: Arc<dyn Handler>| Prefixed { inner, prefix })
                .cast(|p: Arc<Prefixed>| p as Arc<dyn Handler>),
        )
    }

    #[test]
    fn test_decorators_apply_in_registration_order() {
        let container = Container::new();
        container
            .register_many([
                Registration::transient(handler("core")),
                prefixed("log"),
                prefixed("retry"),
            ])
            .unwrap();
        assert_eq!(container.resolve::<dyn Handler>().unwrap().name(), "retry(log(core))");

        let many = container.get::<Many<Arc<dyn Handler>>>().unwrap();
        assert_eq!(many[0].name(), "retry(log(core))");
        // Decorators are not services of their own
        assert_eq!(many.len(), 1);
    }

    #[test]
    fn test_reused_decorator_keeps_one_instance_per_key() {
        let container = Container::new();
        container
            .register_many([
                Registration::singleton(handler("a")).keyed("a"),
                Registration::singleton(handler("b")).keyed("b"),
                prefixed("wrap").with_reuse(Reuse::Singleton),
            ])
            .unwrap();

        let a = container.resolve_keyed::<dyn Handler>("a").unwrap();
        let b = container.resolve_keyed::<dyn Handler>("b").unwrap();
        assert_eq!(a.name(), "wrap(a)");
        assert_eq!(b.name(), "wrap(b)");
        assert!(Arc::ptr_eq(&a, &container.resolve_keyed::<dyn Handler>("a").unwrap()));

        let scope = container.open_scope().unwrap();
        assert!(Arc::ptr_eq(&b, &scope.resolve_keyed::<dyn Handler>("b").unwrap()));
    }

    #[test]
    fn test_singleton_decorator_cannot_wrap_a_scoped_service() {
        let container = Container::new();
        container
            .register_many([
                Registration::scoped(handler("per-request")),
                prefixed("cached").with_reuse(Reuse::Singleton),
            ])
            .unwrap();

        let scope = container.open_scope().unwrap();
        let err = scope.resolve::<dyn Handler>().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::CaptiveDependency);
    }

    struct Composite {
        parts: Many<Arc<dyn Handler>>,
    }

    impl Handler for Composite {
        fn name(&self) -> String {
            self.parts.iter().map(|p| p.name()).collect::<Vec<_>>().join("+")
        }
    }

    #[test]
    fn test_composite_skips_itself() {
        let container = Container::new();
        container
            .register_many([
                Registration::transient(handler("a")).keyed("a"),
                Registration::transient(handler("b")).keyed("b"),
                Registration::transient(
                    Made::of(|parts: Many<Arc<dyn Handler>>| Composite { parts })
                        .cast(|c: Arc<Composite>| c as Arc<dyn Handler>),
                ),
            ])
            .unwrap();
        assert_eq!(container.resolve::<dyn Handler>().unwrap().name(), "a+b");
    }

    // =========================================================================
    // Registration policies
    // =========================================================================

    #[test]
    fn test_if_already_registered_policies() {
        let container = Container::new();
        container.register(Registration::singleton(handler("first"))).unwrap();
        container.register(Registration::singleton(handler("second"))).unwrap();
        assert_eq!(container.registrations::<dyn Handler>().len(), 2);
        assert_eq!(container.resolve::<dyn Handler>().unwrap().name(), "second");

        container
            .register(
                Registration::singleton(handler("kept"))
                    .if_already_registered(crate::IfAlreadyRegistered::KeepExisting),
            )
            .unwrap();
        assert_eq!(container.resolve::<dyn Handler>().unwrap().name(), "second");

        container
            .register(
                Registration::singleton(handler("replaced"))
                    .if_already_registered(crate::IfAlreadyRegistered::ReplaceOnSameKey),
            )
            .unwrap();
        assert_eq!(container.registrations::<dyn Handler>().len(), 1);
        assert_eq!(container.resolve::<dyn Handler>().unwrap().name(), "replaced");

        let err = container
            .register(
                Registration::singleton(handler("thrown"))
                    .if_already_registered(crate::IfAlreadyRegistered::ThrowIfSameKey),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_register_many_is_atomic() {
        let container = Container::new();
        let result = container.register_many([
            Registration::singleton(handler("ok")),
            Registration::decorator(Made::of(|(): ()| Config)),
        ]);
        assert!(result.is_err());
        assert!(container.is_empty());
    }

    #[test]
    fn test_unregister_and_lock() {
        let container = Container::new();
        container.singleton(|(): ()| Config).unwrap();
        assert!(container.unregister::<Config>().unwrap());
        assert!(!container.is_registered::<Config>());

        container.lock();
        assert!(matches!(
            container.singleton(|(): ()| Config),
            Err(DiError::Locked)
        ));
    }

    // =========================================================================
    // Optional resolution and errors
    // =========================================================================

    #[test]
    fn test_throw_vs_return_default() {
        let container = Container::new();
        let err = container.resolve::<Config>().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Unresolved);
        assert!(container.try_resolve::<Config>().unwrap().is_none());
        assert!(
            container
                .resolve_with::<Config>(ServiceKey::Default, IfUnresolved::ReturnDefault)
                .unwrap()
                .is_none()
        );
    }

    struct Flaky;
    struct UsesFlaky(#[allow(dead_code)] Arc<Flaky>);
    struct Top(#[allow(dead_code)] Arc<UsesFlaky>);

    #[test]
    fn test_construction_error_carries_path() {
        let container = Container::new();
        container
            .register(Registration::transient(Made::try_of(|(): ()| {
                Err::<Flaky, _>("database unreachable")
            })))
            .unwrap();
        container.transient(UsesFlaky).unwrap();
        container.transient(Top).unwrap();

        let err = container.resolve::<Top>().err().unwrap();
        match &err {
            DiError::Construction { path, .. } => {
                assert_eq!(path.len(), 3);
                assert!(path[0].ends_with("Top"));
                assert!(path[2].ends_with("Flaky"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(err.to_string().contains("database unreachable"));
    }

    #[test]
    fn test_optional_dependency_swallows_only_missing() {
        struct Optional(Option<Arc<Config>>);

        let container = Container::new();
        container.transient(|c: Option<Arc<Config>>| Optional(c)).unwrap();
        assert!(container.resolve::<Optional>().unwrap().0.is_none());

        container.singleton(|(): ()| Config).unwrap();
        assert!(container.resolve::<Optional>().unwrap().0.is_some());
    }

    // =========================================================================
    // Plan cache and backends
    // =========================================================================

    #[test]
    fn test_registration_invalidates_plans() {
        let container = Container::new();
        container.register(Registration::singleton(handler("old"))).unwrap();
        assert_eq!(container.resolve::<dyn Handler>().unwrap().name(), "old");
        assert_eq!(container.cached_plans().0, 1);

        container.register(Registration::singleton(handler("new"))).unwrap();
        assert_eq!(container.cached_plans().0, 0);
        assert_eq!(container.resolve::<dyn Handler>().unwrap().name(), "new");
    }

    #[test]
    fn test_with_rules_starts_a_fresh_plan_cache() {
        let container = Container::new();
        container
            .register_batch()
            .add(Registration::singleton(handler("default")))
            .add(Registration::singleton(handler("audit")).keyed("audit"))
            .done()
            .unwrap();
        let shared = container.resolve::<dyn Handler>().unwrap();
        assert_eq!(container.cached_plans().0, 1);

        let interpreted = container.with(|rules| rules.with_plan_backend(PlanBackend::Interpreted));
        assert_eq!(interpreted.cached_plans().0, 0);
        assert!(Arc::ptr_eq(&interpreted.resolve::<dyn Handler>().unwrap(), &shared));

        // The fork owns its registrations from here on
        assert!(interpreted.unregister_keyed::<dyn Handler>("audit").unwrap());
        assert!(!interpreted.is_registered_keyed::<dyn Handler>("audit"));
        assert!(container.is_registered_keyed::<dyn Handler>("audit"));
        assert_eq!(container.cached_plans().0, 1);
    }

    #[test]
    fn test_equivalent_requests_share_a_plan() {
        let container = Container::new();
        container.singleton(|(): ()| Config).unwrap();

        container.resolve::<Config>().unwrap();
        container.try_resolve::<Config>().unwrap();
        assert_eq!(container.cached_plans(), (2, 1));
    }

    #[test]
    fn test_backends_agree() {
        let counter = Arc::new(AtomicUsize::new(0));
        let base = Container::new();
        let created = Arc::clone(&counter);
        base.transient(move |(): ()| {
            created.fetch_add(1, Ordering::SeqCst);
            Config
        })
        .unwrap();
        base.singleton(|c: Arc<Config>| Server { port: Arc::new(Port(1)), config: c })
            .unwrap();

        let interpreted = base.with(|rules| rules.with_plan_backend(PlanBackend::Interpreted));
        let compiled = base.with(|rules| rules.with_plan_backend(PlanBackend::Compiled));

        for container in [&interpreted, &compiled] {
            let a = container.resolve::<Config>().unwrap();
            let b = container.resolve::<Config>().unwrap();
            assert!(!Arc::ptr_eq(&a, &b));
        }

        // Singletons are shared by derived containers
        let s1 = interpreted.resolve::<Server>().unwrap();
        let s2 = compiled.resolve::<Server>().unwrap();
        assert!(Arc::ptr_eq(&s1, &s2));
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_compilation_threshold() {
        let container = Container::with_rules(Rules::default().with_compilation_threshold(3));
        container.transient(|(): ()| Config).unwrap();

        let request = Request::root(Dependency::of::<Config>());
        for _ in 0..2 {
            container.resolve::<Config>().unwrap();
        }
        let snapshot = container.core.registry.snapshot();
        assert!(!snapshot.plans.get(&request).unwrap().is_compiled());

        container.resolve::<Config>().unwrap();
        assert!(snapshot.plans.get(&request).unwrap().is_compiled());
    }

    // =========================================================================
    // Concurrency
    // =========================================================================

    struct Expensive;

    #[test]
    fn test_concurrent_singleton_constructed_once() {
        for backend in [PlanBackend::Compiled, PlanBackend::Interpreted] {
            let constructed = Arc::new(AtomicUsize::new(0));
            let container = Container::with_rules(Rules::default().with_plan_backend(backend));
            let counter = Arc::clone(&constructed);
            container
                .singleton(move |(): ()| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    Expensive
                })
                .unwrap();

            let threads = 16;
            let barrier = Barrier::new(threads);
            let instances: Vec<Arc<Expensive>> = std::thread::scope(|s| {
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let container = container.clone();
                        let barrier = &barrier;
                        s.spawn(move || {
                            let scope = container.open_scope().unwrap();
                            barrier.wait();
                            scope.resolve::<Expensive>().unwrap()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            assert_eq!(constructed.load(Ordering::SeqCst), 1);
            assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
        }
    }

    #[test]
    fn test_container_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Container>();
        assert_send_sync::<Services<dyn Handler>>();
        assert_send_sync::<Lazy<dyn Handler>>();
    }
}
