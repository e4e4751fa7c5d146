//! Request graph builder
//!
//! Turns a [`Request`] into a resolution [`Expr`] against one registry
//! snapshot:
//!
//! 1. runtime arguments bound by `FuncWith` win for plain requests
//! 2. closed registrations matching the service, key and condition
//! 3. built-in wrappers (`Many`, `Lazy`, `Func`, `FuncWith`, `Meta`, `Keyed`)
//! 4. open-generic families, when no closed registration matched
//!
//! Single-instance requests with several candidates prefer the one
//! matching condition; otherwise the container's default selection rule
//! decides. Decorators wrap the selected node in registration order.
//!
//! Cycles are detected over registration identity along the non-deferred
//! path. Deferred wrappers stop the walk and get their own request, built
//! and cached when first invoked.

use crate::factory::{FactoryKind, Registration, RegistrationId, RequestInfo};
use crate::inject::{Dependency, IfUnresolved, Wrapper};
use crate::plan::{DeferredKind, Expr};
use crate::registry::Snapshot;
use crate::reuse::Reuse;
use crate::rules::{DefaultSelection, Rules};
use crate::scope::SlotKey;
use crate::service::{ServiceKey, ServiceType};
use crate::{DiError, Result};
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::trace;

/// Identity of a resolution request; the plan cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Request {
    pub(crate) service: ServiceType,
    pub(crate) key: ServiceKey,
    pub(crate) wrappers: Vec<Wrapper>,
    pub(crate) if_unresolved: IfUnresolved,
    pub(crate) arguments: Vec<ServiceType>,
    pub(crate) parent: Option<ServiceType>,
    pub(crate) parent_implementation: Option<ServiceType>,
    pub(crate) depth: usize,
    pub(crate) pinned: Option<RegistrationId>,
}

impl Request {
    /// Top-level request for a dependency descriptor.
    pub(crate) fn root(dependency: Dependency) -> Self {
        Self {
            service: dependency.service,
            key: dependency.key,
            wrappers: dependency.wrappers,
            if_unresolved: dependency.if_unresolved,
            arguments: Vec::new(),
            parent: None,
            parent_implementation: None,
            depth: 0,
            pinned: None,
        }
    }

    /// Request for exactly one registration.
    pub(crate) fn pinned(registration: &Registration) -> Self {
        Self {
            service: registration.service,
            key: registration.key.clone(),
            wrappers: Vec::new(),
            if_unresolved: IfUnresolved::Throw,
            arguments: Vec::new(),
            parent: None,
            parent_implementation: None,
            depth: 0,
            pinned: Some(registration.id),
        }
    }
}

pub(crate) fn unresolved(service: ServiceType, key: &ServiceKey) -> DiError {
    DiError::Unresolved {
        service: service.name(),
        key: key.key().map(|k| format!("{k:?}")),
    }
}

struct PathEntry {
    id: RegistrationId,
    service: ServiceType,
    implementation: ServiceType,
    reuse: Reuse,
}

/// Builds the expression for one request. Not shared across threads.
pub(crate) struct RequestBuilder<'a> {
    snapshot: &'a Snapshot,
    rules: &'a Rules,
    request: &'a Request,
    path: Vec<PathEntry>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(snapshot: &'a Snapshot, rules: &'a Rules, request: &'a Request) -> Self {
        Self {
            snapshot,
            rules,
            request,
            path: Vec::new(),
        }
    }

    pub(crate) fn build(mut self) -> Result<Expr> {
        let request = self.request;

        #[cfg(feature = "logging")]
        trace!(
            target: "ioc_engine",
            service = request.service.name(),
            key = ?request.key,
            wrappers = ?request.wrappers,
            "Building resolution plan"
        );

        match request.pinned {
            Some(id) => {
                let registration = self.find_pinned(request.service, &request.key, id)?;
                self.decorated(&registration)
            }
            None => self.dependency(
                request.service,
                &request.key,
                &request.wrappers,
                request.if_unresolved,
            ),
        }
    }

    /// Candidate registrations for a `Many`, in registration order.
    ///
    /// A default key collects every key; an explicit key only its own.
    pub(crate) fn collect_many(&self, service: ServiceType, key: &ServiceKey) -> Result<Vec<Arc<Registration>>> {
        let info = self.info(service, key);
        let mut found: Vec<Arc<Registration>> = self
            .snapshot
            .registrations(&service)
            .iter()
            .filter(|r| key.is_default() || &r.key == key)
            .filter(|r| r.setup.allows(&info))
            .cloned()
            .collect();

        for closed in self.close_generics(service)? {
            if (key.is_default() || &closed.key == key) && closed.setup.allows(&info) {
                found.push(closed);
            }
        }
        Ok(found)
    }

    fn dependency(
        &mut self,
        service: ServiceType,
        key: &ServiceKey,
        wrappers: &[Wrapper],
        if_unresolved: IfUnresolved,
    ) -> Result<Expr> {
        let Some((wrapper, _)) = wrappers.split_first() else {
            return self.plain(service, key, if_unresolved);
        };

        match wrapper {
            Wrapper::Many => self.many(service, key, &wrappers[1..]),
            Wrapper::Lazy | Wrapper::Func | Wrapper::FuncWith(_) => {
                if self.candidates(service, key)?.is_empty() {
                    return Err(unresolved(service, key));
                }
                let request = Request::root(Dependency {
                    service,
                    key: key.clone(),
                    wrappers: Vec::new(),
                    if_unresolved: IfUnresolved::Throw,
                });
                Ok(self.deferred(*wrapper, request))
            }
            Wrapper::Meta | Wrapper::Keyed => {
                let registration = self
                    .select(service, key)?
                    .ok_or_else(|| unresolved(service, key))?;
                self.wrap_selected(&registration, wrappers)
            }
        }
    }

    fn plain(&mut self, service: ServiceType, key: &ServiceKey, if_unresolved: IfUnresolved) -> Result<Expr> {
        if key.is_default() {
            if let Some(index) = self.request.arguments.iter().position(|a| *a == service) {
                // A reused instance would keep the first call's argument.
                if let Some(holder) = self.path.iter().rev().find(|e| !e.reuse.is_transient()) {
                    return Err(DiError::CaptiveDependency {
                        holder: holder.service.name(),
                        holder_reuse: holder.reuse.to_string(),
                        dependency: service.name(),
                        dependency_reuse: "runtime argument".to_string(),
                    });
                }
                return Ok(Expr::Argument(index));
            }
        }

        match self.select(service, key)? {
            Some(registration) => self.decorated(&registration),
            None if if_unresolved == IfUnresolved::ReturnDefault => Ok(Expr::Missing),
            None => Err(unresolved(service, key)),
        }
    }

    fn many(&mut self, service: ServiceType, key: &ServiceKey, item_wrappers: &[Wrapper]) -> Result<Expr> {
        let registrations = self.collect_many(service, key)?;
        let mut items = Vec::with_capacity(registrations.len());
        for registration in registrations {
            // Composites see their siblings, not themselves.
            if self.path.iter().any(|e| e.id == registration.id) {
                continue;
            }
            items.push(self.wrap_selected(&registration, item_wrappers)?);
        }
        Ok(Expr::Many(items))
    }

    fn wrap_selected(&mut self, registration: &Arc<Registration>, wrappers: &[Wrapper]) -> Result<Expr> {
        match wrappers.first() {
            None => self.decorated(registration),
            Some(Wrapper::Meta) => Ok(Expr::Meta {
                inner: Box::new(self.decorated(registration)?),
                metadata: registration.setup.metadata().cloned(),
            }),
            Some(Wrapper::Keyed) => Ok(Expr::Keyed {
                inner: Box::new(self.decorated(registration)?),
                key: registration.key.clone(),
            }),
            Some(wrapper @ (Wrapper::Lazy | Wrapper::Func | Wrapper::FuncWith(_))) => {
                Ok(self.deferred(*wrapper, Request::pinned(registration)))
            }
            Some(Wrapper::Many) => Err(DiError::configuration(
                registration.service.name(),
                "Many cannot be nested inside another wrapper",
            )),
        }
    }

    /// Deferred node for `request`. The request inherits the consumer
    /// chain so conditions see the same parent and depth at call time.
    fn deferred(&self, wrapper: Wrapper, mut request: Request) -> Expr {
        let (parent, parent_implementation) = self.parent();
        request.parent = parent;
        request.parent_implementation = parent_implementation;
        request.depth = self.depth();

        let kind = match wrapper {
            Wrapper::Lazy => DeferredKind::Lazy,
            Wrapper::FuncWith(argument) => {
                request.arguments.push(argument);
                DeferredKind::Func
            }
            _ => DeferredKind::Func,
        };
        Expr::Deferred {
            kind,
            request: Arc::new(request),
        }
    }

    // =========================================================================
    // Selection
    // =========================================================================

    /// Consumer service and implementation of the request being built.
    fn parent(&self) -> (Option<ServiceType>, Option<ServiceType>) {
        match self.path.last() {
            Some(entry) => (Some(entry.service), Some(entry.implementation)),
            None => (self.request.parent, self.request.parent_implementation),
        }
    }

    /// Nesting depth, counted across deferral boundaries.
    fn depth(&self) -> usize {
        self.request.depth + self.path.len()
    }

    fn info<'k>(&self, service: ServiceType, key: &'k ServiceKey) -> RequestInfo<'k> {
        let (parent, parent_implementation) = self.parent();
        RequestInfo {
            service,
            key,
            parent,
            parent_implementation,
            depth: self.depth(),
        }
    }

    fn close_generics(&self, service: ServiceType) -> Result<Vec<Arc<Registration>>> {
        let Some(definition) = service.generic_definition() else {
            return Ok(Vec::new());
        };
        let mut closed = Vec::new();
        for family in self.snapshot.generics(definition) {
            if let Some(registration) = family.close(&service)? {
                closed.push(registration);
            }
        }
        Ok(closed)
    }

    /// Registrations that may serve a single-instance request.
    fn candidates(&self, service: ServiceType, key: &ServiceKey) -> Result<Vec<Arc<Registration>>> {
        let info = self.info(service, key);
        let found: Vec<Arc<Registration>> = self
            .snapshot
            .registrations(&service)
            .iter()
            .filter(|r| &r.key == key && r.setup.allows(&info))
            .cloned()
            .collect();
        if !found.is_empty() {
            return Ok(found);
        }

        Ok(self
            .close_generics(service)?
            .into_iter()
            .filter(|r| &r.key == key && r.setup.allows(&info))
            .collect())
    }

    fn select(&self, service: ServiceType, key: &ServiceKey) -> Result<Option<Arc<Registration>>> {
        let mut candidates = self.candidates(service, key)?;
        if candidates.len() <= 1 {
            return Ok(candidates.pop());
        }

        let mut conditional = candidates.iter().filter(|r| r.setup.is_conditional());
        match (conditional.next(), conditional.next()) {
            (Some(only), None) => return Ok(Some(Arc::clone(only))),
            (Some(_), Some(_)) => {
                return Err(DiError::AmbiguousMatch {
                    service: service.name(),
                    candidates: 2 + conditional.count(),
                });
            }
            _ => {}
        }

        match self.rules.default_selection() {
            DefaultSelection::LastRegisteredWins => Ok(candidates.pop()),
            DefaultSelection::RequireUnique => Err(DiError::AmbiguousMatch {
                service: service.name(),
                candidates: candidates.len(),
            }),
        }
    }

    fn find_pinned(&self, service: ServiceType, key: &ServiceKey, id: RegistrationId) -> Result<Arc<Registration>> {
        if let Some(found) = self.snapshot.registrations(&service).iter().find(|r| r.id == id) {
            return Ok(Arc::clone(found));
        }
        self.close_generics(service)?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| unresolved(service, key))
    }

    // =========================================================================
    // Registration nodes
    // =========================================================================

    /// The registration's node wrapped by every applicable decorator.
    fn decorated(&mut self, registration: &Arc<Registration>) -> Result<Expr> {
        let mut node = self.registration(registration, None)?;

        let info = self.info(registration.service, &registration.key);
        let decorators: Vec<Arc<Registration>> = self
            .snapshot
            .decorators(&registration.service)
            .iter()
            .filter(|d| d.setup.allows(&info))
            .cloned()
            .collect();

        for decorator in &decorators {
            self.check_decorator(decorator, registration)?;
            node = self.registration(decorator, Some((registration.id, node)))?;
        }
        Ok(node)
    }

    /// Build a constructor node. A decorator gets the decorated node and
    /// the id of the registration it wraps, which names its reuse slot.
    fn registration(
        &mut self,
        registration: &Arc<Registration>,
        decoratee: Option<(RegistrationId, Expr)>,
    ) -> Result<Expr> {
        let constructor = match &registration.factory {
            FactoryKind::Instance(instance) => {
                return Ok(Expr::Instance {
                    id: registration.id,
                    instance: instance.clone(),
                });
            }
            FactoryKind::Constructor(constructor) => constructor,
        };

        if self.path.iter().any(|e| e.id == registration.id) {
            let mut path: Vec<&'static str> = self.path.iter().map(|e| e.service.name()).collect();
            path.push(registration.service.name());
            return Err(DiError::RecursiveDependency { path });
        }
        self.check_captive(registration)?;

        let (slot, decoratee_index, mut decoratee) = match decoratee {
            Some((decorated, node)) => (
                SlotKey::decorating(registration.id.id(), decorated.id()),
                constructor.decoratee(registration.service),
                Some(node),
            ),
            None => (SlotKey::of(registration.id.id()), None, None),
        };

        self.path.push(PathEntry {
            id: registration.id,
            service: registration.service,
            implementation: constructor.implementation,
            reuse: registration.reuse.clone(),
        });

        let mut args = Vec::with_capacity(constructor.parameters.len());
        let mut failure = None;
        for (index, parameter) in constructor.parameters.iter().enumerate() {
            let arg = if decoratee_index == Some(index) {
                decoratee.take().ok_or_else(|| {
                    DiError::configuration(registration.service.name(), "decorated instance used twice")
                })
            } else {
                self.dependency(
                    parameter.service,
                    &parameter.key,
                    &parameter.wrappers,
                    parameter.if_unresolved,
                )
            };
            match arg {
                Ok(arg) => args.push(arg),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        self.path.pop();
        if let Some(err) = failure {
            return Err(err);
        }

        Ok(Expr::Construct {
            registration: Arc::clone(registration),
            slot,
            args,
        })
    }

    /// A reused decorator must not outlive the reused instance it wraps.
    fn check_decorator(&self, decorator: &Registration, decorated: &Registration) -> Result<()> {
        if !self.rules.captive_dependency_check()
            || decorator.reuse.is_transient()
            || decorated.reuse.is_transient()
        {
            return Ok(());
        }
        if decorated.reuse.lifespan() < decorator.reuse.lifespan() {
            return Err(DiError::CaptiveDependency {
                holder: decorator.service.name(),
                holder_reuse: decorator.reuse.to_string(),
                dependency: decorated.service.name(),
                dependency_reuse: decorated.reuse.to_string(),
            });
        }
        Ok(())
    }

    fn check_captive(&self, registration: &Registration) -> Result<()> {
        if !self.rules.captive_dependency_check() || registration.reuse.is_transient() {
            return Ok(());
        }
        let Some(holder) = self.path.iter().rev().find(|e| !e.reuse.is_transient()) else {
            return Ok(());
        };
        if registration.reuse.lifespan() < holder.reuse.lifespan() {
            return Err(DiError::CaptiveDependency {
                holder: holder.service.name(),
                holder_reuse: holder.reuse.to_string(),
                dependency: registration.service.name(),
                dependency_reuse: registration.reuse.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::Made;
    use crate::inject::Inject;
    use crate::registry::{IfAlreadyRegistered, Registry};
    use crate::{Lazy, Many};

    #[allow(dead_code)]
    struct A(Arc<B>);
    #[allow(dead_code)]
    struct B(Arc<A>);
    #[allow(dead_code)]
    struct C(Lazy<D>);
    #[allow(dead_code)]
    struct D(Arc<C>);
    #[allow(dead_code)]
    struct Holder(Arc<Leaf>);
    struct Leaf;

    fn registry(registrations: Vec<Registration>) -> Registry {
        let registry = Registry::new();
        registry
            .register_all(registrations, IfAlreadyRegistered::AppendNewKey)
            .unwrap();
        registry
    }

    fn build<T: Inject>(registry: &Registry, rules: &Rules) -> Result<Expr> {
        let snapshot = registry.snapshot();
        let request = Request::root(T::dependency());
        RequestBuilder::new(&snapshot, rules, &request).build()
    }

    #[test]
    fn test_cycle_is_reported_with_path() {
        let registry = registry(vec![
            Registration::transient(Made::of(A)),
            Registration::transient(Made::of(B)),
        ]);
        match build::<Arc<A>>(&registry, &Rules::default()) {
            Err(DiError::RecursiveDependency { path }) => {
                assert_eq!(path.len(), 3);
                assert!(path[0].ends_with("::A"));
                assert!(path[1].ends_with("::B"));
                assert!(path[2].ends_with("::A"));
            }
            Err(other) => panic!("unexpected {other:?}"),
            Ok(_) => panic!("expected a cycle"),
        }
    }

    #[test]
    fn test_lazy_edge_breaks_cycle() {
        let registry = registry(vec![
            Registration::transient(Made::of(C)),
            Registration::transient(Made::of(D)),
        ]);
        assert!(matches!(
            build::<Arc<D>>(&registry, &Rules::default()),
            Ok(Expr::Construct { .. })
        ));
        assert!(build::<Arc<C>>(&registry, &Rules::default()).is_ok());
    }

    #[test]
    fn test_captive_dependency() {
        let registry = registry(vec![
            Registration::singleton(Made::of(Holder)),
            Registration::scoped(Made::of(|(): ()| Leaf)),
        ]);
        assert!(matches!(
            build::<Arc<Holder>>(&registry, &Rules::default()),
            Err(DiError::CaptiveDependency { .. })
        ));

        let relaxed = Rules::default().with_captive_dependency_check(false);
        assert!(build::<Arc<Holder>>(&registry, &relaxed).is_ok());
    }

    #[test]
    fn test_transient_between_singleton_and_scoped_is_still_captive() {
        let registry = registry(vec![
            Registration::singleton(Made::of(|_b: Arc<B>| Leaf)),
            Registration::transient(Made::of(|_h: Arc<Holder>| B(dangling()))),
            Registration::scoped(Made::of(Holder)),
        ]);
        assert!(matches!(
            build::<Arc<Leaf>>(&registry, &Rules::default()),
            Err(DiError::CaptiveDependency { .. })
        ));
    }

    fn dangling<T>() -> Arc<T> {
        unreachable!("plans are only built, never executed, in these tests")
    }

    #[test]
    fn test_selection_rules() {
        let registry = registry(vec![
            Registration::transient(Made::of(|(): ()| Leaf)),
            Registration::transient(Made::of(|(): ()| Leaf)),
        ]);
        assert!(build::<Arc<Leaf>>(&registry, &Rules::default()).is_ok());

        let strict = Rules::default().with_default_selection(DefaultSelection::RequireUnique);
        assert!(matches!(
            build::<Arc<Leaf>>(&registry, &strict),
            Err(DiError::AmbiguousMatch { candidates: 2, .. })
        ));
        assert!(matches!(
            build::<Many<Arc<Leaf>>>(&registry, &strict),
            Ok(Expr::Many(items)) if items.len() == 2
        ));
    }

    #[test]
    fn test_missing_optional_is_not_an_error() {
        let registry = registry(Vec::new());
        assert!(matches!(
            build::<Option<Arc<Leaf>>>(&registry, &Rules::default()),
            Ok(Expr::Missing)
        ));
        assert!(matches!(
            build::<Arc<Leaf>>(&registry, &Rules::default()),
            Err(DiError::Unresolved { .. })
        ));
        assert!(matches!(
            build::<Lazy<Leaf>>(&registry, &Rules::default()),
            Err(DiError::Unresolved { .. })
        ));
    }
}
