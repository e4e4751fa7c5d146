//! Scopes: reuse caches and disposal
//!
//! Every container handle points at a [`Scope`]. The root scope holds
//! singletons; child scopes hold scoped instances and the disposables of
//! transients resolved through them. Scopes form a chain through weak
//! parent links, so a child never keeps its parent alive.
//!
//! Each reused registration owns one slot per scope. A slot is filled at
//! most once: readers take the lock-free path once it is set, and the
//! first writer constructs under a per-slot lock while the others wait.

use crate::reuse::ScopeName;
use crate::service::Instance;
use crate::{DiError, Result};
use ahash::RandomState;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// Unique scope identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    #[inline]
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

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

/// Services that release resources when their owning scope is disposed.
///
/// Register the implementation with [`crate::Made::disposable`] to have
/// the owning scope call [`Dispose::dispose`] exactly once.
pub trait Dispose: Send + Sync {
    /// Release resources.
    fn dispose(&self);
}

/// Deferred disposal action recorded by a scope.
pub(crate) type Disposer = Box<dyn FnOnce() + Send>;

/// Output of one constructor run.
pub(crate) struct Created {
    pub(crate) instance: Instance,
    pub(crate) disposer: Option<Disposer>,
}

/// Identity of a reuse slot.
///
/// A registration owns one slot per scope. A reused decorator owns one per
/// registration it decorates, so every key keeps its own decorated instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotKey {
    registration: u64,
    decorated: Option<u64>,
}

impl SlotKey {
    #[inline]
    pub(crate) fn of(registration: u64) -> Self {
        Self {
            registration,
            decorated: None,
        }
    }

    #[inline]
    pub(crate) fn decorating(decorator: u64, decorated: u64) -> Self {
        Self {
            registration: decorator,
            decorated: Some(decorated),
        }
    }
}

struct Slot {
    value: OnceCell<Instance>,
    init: ReentrantMutex<Cell<bool>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            value: OnceCell::new(),
            init: ReentrantMutex::new(Cell::new(false)),
        }
    }
}

/// Clears the in-progress flag even if the constructor panics.
struct Initializing<'a>(&'a Cell<bool>);

impl<'a> Initializing<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for Initializing<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// A node in the scope chain.
pub struct Scope {
    id: ScopeId,
    name: Option<ScopeName>,
    parent: Option<Weak<Scope>>,
    depth: u32,
    slots: DashMap<SlotKey, Arc<Slot>, RandomState>,
    disposers: Mutex<Vec<(&'static str, Disposer)>>,
    disposed: AtomicBool,
}

impl Scope {
    /// Create a root scope.
    pub(crate) fn root() -> Arc<Self> {
        let scope = Arc::new(Self::new(None, None, 0));

        #[cfg(feature = "logging")]
        debug!(target: "ioc_engine", scope = %scope.id, "Created root scope");

        scope
    }

    fn new(name: Option<ScopeName>, parent: Option<Weak<Scope>>, depth: u32) -> Self {
        Self {
            id: ScopeId::next(),
            name,
            parent,
            depth,
            slots: DashMap::with_hasher(RandomState::new()),
            disposers: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Open a child scope.
    pub(crate) fn child(self: &Arc<Self>, name: Option<ScopeName>) -> Result<Arc<Self>> {
        self.ensure_active()?;
        let child = Arc::new(Self::new(name, Some(Arc::downgrade(self)), self.depth + 1));

        #[cfg(feature = "logging")]
        debug!(
            target: "ioc_engine",
            scope = %child.id,
            parent = %self.id,
            name = child.name.as_ref().map(ScopeName::as_str),
            depth = child.depth,
            "Opened scope"
        );

        Ok(child)
    }

    /// Unique identifier.
    #[inline]
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Scope name, if it was opened with one.
    #[inline]
    pub fn name(&self) -> Option<&ScopeName> {
        self.name.as_ref()
    }

    /// Distance from the root scope.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Whether this is the root scope.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Whether [`Scope::dispose`] has run.
    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Number of reused instances currently cached here.
    pub fn cached(&self) -> usize {
        self.slots.iter().filter(|slot| slot.value.get().is_some()).count()
    }

    /// The parent scope, or `None` at the root.
    pub fn parent(&self) -> Result<Option<Arc<Scope>>> {
        match &self.parent {
            None => Ok(None),
            Some(weak) => weak.upgrade().map(Some).ok_or(DiError::ParentDropped),
        }
    }

    /// Nearest scope named `name`, starting with this one.
    pub(crate) fn find_named(self: &Arc<Self>, name: &ScopeName) -> Result<Option<Arc<Scope>>> {
        let mut current = Some(Arc::clone(self));
        while let Some(scope) = current {
            if scope.name.as_ref() == Some(name) {
                return Ok(Some(scope));
            }
            current = scope.parent()?;
        }
        Ok(None)
    }

    #[inline]
    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(DiError::ScopeDisposed {
                scope: self.id.to_string(),
            });
        }
        Ok(())
    }

    /// Return the cached instance for `slot`, constructing it at most once.
    ///
    /// Re-entering the same slot on the same thread means the instance
    /// depends on itself and fails with [`DiError::RecursiveDependency`].
    pub(crate) fn get_or_create<F>(&self, slot: SlotKey, service: &'static str, create: F) -> Result<Instance>
    where
        F: FnOnce() -> Result<Created>,
    {
        self.ensure_active()?;

        let cell = match self.slots.get(&slot) {
            Some(existing) => Arc::clone(existing.value()),
            None => Arc::clone(
                self.slots
                    .entry(slot)
                    .or_insert_with(|| Arc::new(Slot::new()))
                    .value(),
            ),
        };

        if let Some(instance) = cell.value.get() {
            #[cfg(feature = "logging")]
            trace!(target: "ioc_engine", service, scope = %self.id, "Reused cached instance");

            return Ok(instance.clone());
        }

        let guard = cell.init.lock();
        if guard.get() {
            return Err(DiError::RecursiveDependency {
                path: vec![service, service],
            });
        }
        if let Some(instance) = cell.value.get() {
            return Ok(instance.clone());
        }

        let created = {
            let _initializing = Initializing::enter(&guard);
            create()?
        };

        if let Some(disposer) = created.disposer {
            self.disposers.lock().push((service, disposer));
        }
        let instance = cell.value.get_or_init(|| created.instance).clone();

        #[cfg(feature = "logging")]
        debug!(target: "ioc_engine", service, scope = %self.id, "Cached new instance");

        Ok(instance)
    }

    /// Record a disposer for an instance this scope does not cache.
    pub(crate) fn track(&self, service: &'static str, disposer: Disposer) -> Result<()> {
        self.ensure_active()?;
        self.disposers.lock().push((service, disposer));
        Ok(())
    }

    /// Dispose every tracked instance in reverse creation order.
    ///
    /// Runs at most once; later calls are no-ops. Cached instances are
    /// dropped afterwards and further resolution from this scope fails.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let disposers = std::mem::take(&mut *self.disposers.lock());

        #[cfg(feature = "logging")]
        debug!(
            target: "ioc_engine",
            scope = %self.id,
            count = disposers.len(),
            "Disposing scope"
        );

        for (_service, disposer) in disposers.into_iter().rev() {
            #[cfg(feature = "logging")]
            trace!(target: "ioc_engine", service = _service, scope = %self.id, "Disposing instance");

            disposer();
        }
        self.slots.clear();
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("depth", &self.depth)
            .field("cached", &self.cached())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
