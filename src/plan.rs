//! Resolution plans
//!
//! The request builder produces an [`Expr`] tree. A [`Plan`] wraps it for
//! execution by one of two backends:
//!
//! - **Interpreted** - walk the tree on every call
//! - **Compiled** - lower the tree once into nested closures and call those
//!
//! Both backends share the construction and reuse logic below, so they
//! produce the same results. Plans are cached per registry snapshot, keyed
//! by request; structurally identical plans are stored once and shared.

use crate::container::Core;
use crate::factory::{FactoryKind, Metadata, Registration, RegistrationId};
use crate::inject::{Deferred, Resolved};
use crate::request::{Request, unresolved};
use crate::reuse::Reuse;
use crate::rules::{PlanBackend, Rules};
use crate::scope::{Created, Scope, SlotKey};
use crate::service::{Instance, ServiceKey};
use crate::{DiError, Result};
use ahash::RandomState;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// Deferred wrapper flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum DeferredKind {
    Lazy,
    Func,
}

/// Resolution expression.
pub(crate) enum Expr {
    /// Pre-built instance registration
    Instance {
        id: RegistrationId,
        instance: Instance,
    },
    /// Run a constructor under its registration's reuse policy
    Construct {
        registration: Arc<Registration>,
        slot: SlotKey,
        args: Vec<Expr>,
    },
    /// Runtime argument passed to a `FuncWith`
    Argument(usize),
    /// Optional dependency with no match
    Missing,
    Many(Vec<Expr>),
    /// Resolve `request` later, from the current scope
    Deferred {
        kind: DeferredKind,
        request: Arc<Request>,
    },
    Meta {
        inner: Box<Expr>,
        metadata: Option<Metadata>,
    },
    Keyed {
        inner: Box<Expr>,
        key: ServiceKey,
    },
}

// =============================================================================
// Shape - structural identity of an expression
// =============================================================================

#[derive(Clone, PartialEq, Eq, Hash)]
enum Token {
    Instance(RegistrationId),
    Construct(SlotKey, usize),
    Argument(usize),
    Missing,
    Many(usize),
    Deferred(DeferredKind, Arc<Request>),
    Meta,
    Keyed(ServiceKey),
}

/// Pre-order token list; equal shapes resolve identically.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct Shape(Vec<Token>);

impl Shape {
    pub(crate) fn of(expr: &Expr) -> Self {
        let mut tokens = Vec::new();
        Self::collect(expr, &mut tokens);
        Self(tokens)
    }

    fn collect(expr: &Expr, tokens: &mut Vec<Token>) {
        match expr {
            Expr::Instance { id, .. } => tokens.push(Token::Instance(*id)),
            Expr::Construct { slot, args, .. } => {
                tokens.push(Token::Construct(*slot, args.len()));
                for arg in args {
                    Self::collect(arg, tokens);
                }
            }
            Expr::Argument(index) => tokens.push(Token::Argument(*index)),
            Expr::Missing => tokens.push(Token::Missing),
            Expr::Many(items) => {
                tokens.push(Token::Many(items.len()));
                for item in items {
                    Self::collect(item, tokens);
                }
            }
            Expr::Deferred { kind, request } => {
                tokens.push(Token::Deferred(*kind, Arc::clone(request)));
            }
            Expr::Meta { inner, .. } => {
                tokens.push(Token::Meta);
                Self::collect(inner, tokens);
            }
            Expr::Keyed { inner, key } => {
                tokens.push(Token::Keyed(key.clone()));
                Self::collect(inner, tokens);
            }
        }
    }
}

// =============================================================================
// Execution
// =============================================================================

/// Execution context: the container core, the scope resolving, and any
/// runtime arguments.
#[derive(Clone, Copy)]
pub(crate) struct Frame<'a> {
    pub(crate) core: &'a Arc<Core>,
    pub(crate) scope: &'a Arc<Scope>,
    pub(crate) arguments: &'a [Instance],
}

fn argument(frame: Frame<'_>, index: usize) -> Result<Resolved> {
    frame
        .arguments
        .get(index)
        .cloned()
        .map(Resolved::Instance)
        .ok_or_else(|| DiError::configuration("runtime argument", format!("missing argument {index}")))
}

fn run<F>(registration: &Registration, frame: Frame<'_>, evaluate_args: &F) -> Result<Created>
where
    F: Fn(Frame<'_>) -> Result<Vec<Resolved>>,
{
    let FactoryKind::Constructor(constructor) = &registration.factory else {
        return Err(DiError::configuration(registration.service.name(), "not a constructor"));
    };
    let implementation = constructor.implementation.name();

    #[cfg(feature = "logging")]
    trace!(
        target: "ioc_engine",
        service = registration.service.name(),
        implementation,
        reuse = %registration.reuse,
        "Constructing instance"
    );

    let values = evaluate_args(frame).map_err(|e| e.within(implementation))?;
    constructor.construct(values).map_err(|e| e.within(implementation))
}

/// Construct (or fetch) the instance of `registration` according to its
/// reuse. Reused instances get their dependencies from the scope that
/// owns them.
fn construct<F>(
    registration: &Registration,
    slot: SlotKey,
    frame: Frame<'_>,
    evaluate_args: F,
) -> Result<Resolved>
where
    F: Fn(Frame<'_>) -> Result<Vec<Resolved>>,
{
    let service = registration.service.name();

    let instance = match &registration.reuse {
        Reuse::Transient => {
            let created = run(registration, frame, &evaluate_args)?;
            if let Some(disposer) = created.disposer {
                frame.scope.track(service, disposer)?;
            }
            created.instance
        }
        Reuse::Singleton => {
            let root = frame.core.root();
            root.get_or_create(slot, service, || {
                run(registration, Frame { scope: root, ..frame }, &evaluate_args)
            })?
        }
        Reuse::Scoped => {
            if frame.scope.is_root() {
                return Err(DiError::NoCurrentScope { service });
            }
            frame
                .scope
                .get_or_create(slot, service, || run(registration, frame, &evaluate_args))?
        }
        Reuse::ScopedTo(name) => {
            let target = frame.scope.find_named(name)?.ok_or_else(|| DiError::ScopeNotFound {
                service,
                name: name.to_string(),
            })?;
            target.get_or_create(slot, service, || {
                run(registration, Frame { scope: &target, ..frame }, &evaluate_args)
            })?
        }
    };
    Ok(Resolved::Instance(instance))
}

/// Handle that resolves `request` later against the same core and scope.
fn deferred(kind: DeferredKind, request: &Arc<Request>, frame: Frame<'_>) -> Resolved {
    let core = Arc::downgrade(frame.core);
    let scope = Arc::downgrade(frame.scope);
    let scope_id = frame.scope.id();
    let request = Arc::clone(request);

    let handle = Deferred::new(move |arguments| {
        let core = core.upgrade().ok_or(DiError::ParentDropped)?;
        let scope = scope.upgrade().ok_or_else(|| DiError::ScopeDisposed {
            scope: scope_id.to_string(),
        })?;
        match core.resolve_request(&scope, &request, arguments)? {
            Resolved::Instance(instance) => Ok(instance),
            _ => Err(unresolved(request.service, &request.key)),
        }
    });

    match kind {
        DeferredKind::Lazy => Resolved::Lazy(handle),
        DeferredKind::Func => Resolved::Func(handle),
    }
}

fn interpret(expr: &Expr, frame: Frame<'_>) -> Result<Resolved> {
    match expr {
        Expr::Instance { instance, .. } => Ok(Resolved::Instance(instance.clone())),
        Expr::Construct {
            registration,
            slot,
            args,
        } => construct(registration, *slot, frame, |frame| {
            args.iter().map(|arg| interpret(arg, frame)).collect()
        }),
        Expr::Argument(index) => argument(frame, *index),
        Expr::Missing => Ok(Resolved::Missing),
        Expr::Many(items) => items
            .iter()
            .map(|item| interpret(item, frame))
            .collect::<Result<_>>()
            .map(Resolved::Many),
        Expr::Deferred { kind, request } => Ok(deferred(*kind, request, frame)),
        Expr::Meta { inner, metadata } => Ok(Resolved::Meta(
            Box::new(interpret(inner, frame)?),
            metadata.clone(),
        )),
        Expr::Keyed { inner, key } => Ok(Resolved::Keyed(
            Box::new(interpret(inner, frame)?),
            key.clone(),
        )),
    }
}

type Compiled = Box<dyn Fn(Frame<'_>) -> Result<Resolved> + Send + Sync>;

/// Lower an expression into closures, resolving the tree walk up front.
fn compile(expr: &Expr) -> Compiled {
    match expr {
        Expr::Instance { instance, .. } => {
            let instance = instance.clone();
            Box::new(move |_: Frame<'_>| Ok(Resolved::Instance(instance.clone())))
        }
        Expr::Construct {
            registration,
            slot,
            args,
        } => {
            let registration = Arc::clone(registration);
            let slot = *slot;
            let args: Vec<Compiled> = args.iter().map(compile).collect();
            Box::new(move |frame: Frame<'_>| {
                construct(&registration, slot, frame, |frame| {
                    args.iter().map(|arg| arg(frame)).collect()
                })
            })
        }
        Expr::Argument(index) => {
            let index = *index;
            Box::new(move |frame: Frame<'_>| argument(frame, index))
        }
        Expr::Missing => Box::new(|_: Frame<'_>| Ok(Resolved::Missing)),
        Expr::Many(items) => {
            let items: Vec<Compiled> = items.iter().map(compile).collect();
            Box::new(move |frame: Frame<'_>| {
                items
                    .iter()
                    .map(|item| item(frame))
                    .collect::<Result<_>>()
                    .map(Resolved::Many)
            })
        }
        Expr::Deferred { kind, request } => {
            let kind = *kind;
            let request = Arc::clone(request);
            Box::new(move |frame: Frame<'_>| Ok(deferred(kind, &request, frame)))
        }
        Expr::Meta { inner, metadata } => {
            let inner = compile(inner);
            let metadata = metadata.clone();
            Box::new(move |frame: Frame<'_>| Ok(Resolved::Meta(Box::new(inner(frame)?), metadata.clone())))
        }
        Expr::Keyed { inner, key } => {
            let inner = compile(inner);
            let key = key.clone();
            Box::new(move |frame: Frame<'_>| Ok(Resolved::Keyed(Box::new(inner(frame)?), key.clone())))
        }
    }
}

/// A cached, executable resolution plan.
pub(crate) struct Plan {
    expr: Expr,
    compiled: OnceCell<Compiled>,
    uses: AtomicU32,
}

impl Plan {
    fn new(expr: Expr) -> Self {
        Self {
            expr,
            compiled: OnceCell::new(),
            uses: AtomicU32::new(0),
        }
    }

    pub(crate) fn invoke(&self, frame: Frame<'_>, rules: &Rules) -> Result<Resolved> {
        if let Some(compiled) = self.compiled.get() {
            return compiled(frame);
        }

        if rules.plan_backend() == PlanBackend::Compiled {
            let uses = self.uses.fetch_add(1, Ordering::Relaxed) + 1;
            if uses >= rules.compilation_threshold() {
                let compiled = self.compiled.get_or_init(|| {
                    #[cfg(feature = "logging")]
                    debug!(target: "ioc_engine", uses, "Compiled resolution plan");

                    compile(&self.expr)
                });
                return compiled(frame);
            }
        }

        interpret(&self.expr, frame)
    }

    #[cfg(test)]
    pub(crate) fn is_compiled(&self) -> bool {
        self.compiled.get().is_some()
    }
}

/// Plans of one registry snapshot.
pub(crate) struct PlanCache {
    requests: DashMap<Request, Arc<Plan>, RandomState>,
    shapes: DashMap<Shape, Arc<Plan>, RandomState>,
}

impl PlanCache {
    pub(crate) fn new() -> Self {
        Self {
            requests: DashMap::with_hasher(RandomState::new()),
            shapes: DashMap::with_hasher(RandomState::new()),
        }
    }

    #[inline]
    pub(crate) fn get(&self, request: &Request) -> Option<Arc<Plan>> {
        self.requests.get(request).map(|plan| Arc::clone(plan.value()))
    }

    /// Cache `expr` for `request`. When another request already produced
    /// the same shape, or another thread won the race for this request,
    /// the existing plan is returned and `expr` is dropped.
    pub(crate) fn insert(&self, request: Request, expr: Expr) -> Arc<Plan> {
        let shape = Shape::of(&expr);
        let plan = Arc::clone(
            self.shapes
                .entry(shape)
                .or_insert_with(|| Arc::new(Plan::new(expr)))
                .value(),
        );
        let plan = Arc::clone(self.requests.entry(request).or_insert(plan).value());

        #[cfg(feature = "logging")]
        trace!(
            target: "ioc_engine",
            requests = self.requests.len(),
            shapes = self.shapes.len(),
            "Cached resolution plan"
        );

        plan
    }

    /// Number of distinct requests and distinct plans.
    #[cfg(test)]
    pub(crate) fn len(&self) -> (usize, usize) {
        (self.requests.len(), self.shapes.len())
    }
}
