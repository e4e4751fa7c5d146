//! Registration storage
//!
//! Registrations live in an immutable [`Snapshot`] published through an
//! `ArcSwap`. Readers load the current snapshot without locking; writers
//! serialize on a mutex, copy the affected entries and publish a new
//! snapshot. Every snapshot owns its own plan cache, so any change to the
//! registrations invalidates previously built plans.

use crate::factory::Registration;
use crate::generic::OpenGeneric;
use crate::plan::PlanCache;
use crate::service::{ServiceKey, ServiceType};
use crate::{DiError, Result};
use ahash::RandomState;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// What `register` does when the service already has a registration with
/// the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IfAlreadyRegistered {
    /// Keep both. Default registrations accumulate; a duplicate explicit
    /// key is still rejected.
    #[default]
    AppendNewKey,
    /// Reject the new registration
    ThrowIfSameKey,
    /// The new registration takes the old one's place
    ReplaceOnSameKey,
    /// Silently ignore the new registration
    KeepExisting,
}

/// Registrations of one service type.
#[derive(Default, Clone)]
pub(crate) struct ServiceEntry {
    registrations: Vec<Arc<Registration>>,
    decorators: Vec<Arc<Registration>>,
}

impl ServiceEntry {
    /// Apply `registration` under `policy`. Returns whether it was stored.
    fn add(&mut self, registration: Registration, policy: IfAlreadyRegistered) -> Result<bool> {
        if registration.setup.is_decorator() {
            self.decorators.push(Arc::new(registration));
            return Ok(true);
        }

        let service = registration.service.name();
        let same_key: Vec<usize> = self
            .registrations
            .iter()
            .enumerate()
            .filter(|(_, existing)| existing.key == registration.key)
            .map(|(i, _)| i)
            .collect();

        let Some(&first) = same_key.first() else {
            self.registrations.push(Arc::new(registration));
            return Ok(true);
        };

        match policy {
            IfAlreadyRegistered::AppendNewKey if registration.key.is_default() => {
                self.registrations.push(Arc::new(registration));
                Ok(true)
            }
            IfAlreadyRegistered::AppendNewKey | IfAlreadyRegistered::ThrowIfSameKey => {
                Err(DiError::configuration(
                    service,
                    format!("already registered with key {:?}", registration.key),
                ))
            }
            IfAlreadyRegistered::ReplaceOnSameKey => {
                self.registrations[first] = Arc::new(registration);
                for &stale in same_key[1..].iter().rev() {
                    self.registrations.remove(stale);
                }
                Ok(true)
            }
            IfAlreadyRegistered::KeepExisting => Ok(false),
        }
    }

    fn remove(&mut self, key: &ServiceKey) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| &r.key != key);
        before != self.registrations.len()
    }
}

/// Immutable view of every registration.
pub(crate) struct Snapshot {
    services: HashMap<ServiceType, Arc<ServiceEntry>, RandomState>,
    generics: HashMap<&'static str, Vec<Arc<OpenGeneric>>, RandomState>,
    version: u64,
    pub(crate) plans: PlanCache,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            services: HashMap::with_hasher(RandomState::new()),
            generics: HashMap::with_hasher(RandomState::new()),
            version: 0,
            plans: PlanCache::new(),
        }
    }

    /// Copy with a fresh plan cache and the next version.
    fn successor(&self) -> Self {
        Self {
            services: self.services.clone(),
            generics: self.generics.clone(),
            version: self.version + 1,
            plans: PlanCache::new(),
        }
    }

    /// Registration counter, bumped on every publish.
    #[cfg(test)]
    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    /// Non-decorator registrations of `service`, in registration order.
    pub(crate) fn registrations(&self, service: &ServiceType) -> &[Arc<Registration>] {
        self.services
            .get(service)
            .map_or(&[], |entry| entry.registrations.as_slice())
    }

    /// Decorators of `service`, in registration order.
    pub(crate) fn decorators(&self, service: &ServiceType) -> &[Arc<Registration>] {
        self.services
            .get(service)
            .map_or(&[], |entry| entry.decorators.as_slice())
    }

    /// Open-generic families for a generic definition path.
    pub(crate) fn generics(&self, definition: &str) -> &[Arc<OpenGeneric>] {
        self.generics.get(definition).map_or(&[], Vec::as_slice)
    }

    pub(crate) fn contains(&self, service: &ServiceType, key: &ServiceKey) -> bool {
        self.registrations(service).iter().any(|r| &r.key == key)
    }

    pub(crate) fn service_count(&self) -> usize {
        self.services
            .values()
            .filter(|entry| !entry.registrations.is_empty())
            .count()
    }
}

/// Copy-on-write registry shared by every scope of a container.
pub(crate) struct Registry {
    current: ArcSwap<Snapshot>,
    write: Mutex<()>,
    locked: AtomicBool,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::empty()),
            write: Mutex::new(()),
            locked: AtomicBool::new(false),
        }
    }

    /// Independent registry with the same registrations and an empty
    /// plan cache.
    pub(crate) fn fork(&self) -> Self {
        Self {
            current: ArcSwap::from_pointee(self.current.load().successor()),
            write: Mutex::new(()),
            locked: AtomicBool::new(self.is_locked()),
        }
    }

    /// Current snapshot.
    #[inline]
    pub(crate) fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    #[inline]
    pub(crate) fn lock(&self) {
        self.locked.store(true, Ordering::Release);

        #[cfg(feature = "logging")]
        debug!(target: "ioc_engine", "Registry locked - no more registrations allowed");
    }

    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Apply every registration or none of them.
    pub(crate) fn register_all(
        &self,
        registrations: Vec<Registration>,
        default_policy: IfAlreadyRegistered,
    ) -> Result<usize> {
        self.mutate(|next| {
            let mut stored = 0;
            for registration in registrations {
                let policy = registration.if_already_registered.unwrap_or(default_policy);

                #[cfg(feature = "logging")]
                trace!(
                    target: "ioc_engine",
                    service = registration.service.name(),
                    key = ?registration.key,
                    reuse = %registration.reuse,
                    ?policy,
                    "Applying registration"
                );

                let mut entry = next
                    .services
                    .get(&registration.service)
                    .map(|e| ServiceEntry::clone(e))
                    .unwrap_or_default();
                let service = registration.service;
                if entry.add(registration, policy)? {
                    stored += 1;
                }
                next.services.insert(service, Arc::new(entry));
            }
            Ok(stored)
        })
    }

    pub(crate) fn register_generic(&self, family: OpenGeneric) -> Result<()> {
        self.mutate(|next| {
            next.generics
                .entry(family.definition())
                .or_default()
                .push(Arc::new(family));
            Ok(())
        })
    }

    /// Remove the registrations of `service` under `key`.
    pub(crate) fn unregister(&self, service: ServiceType, key: &ServiceKey) -> Result<bool> {
        self.mutate(|next| {
            let Some(existing) = next.services.get(&service) else {
                return Ok(false);
            };
            let mut entry = ServiceEntry::clone(existing);
            let removed = entry.remove(key);
            next.services.insert(service, Arc::new(entry));
            Ok(removed)
        })
    }

    /// Run `change` against a copy of the current snapshot and publish it
    /// only if it succeeds.
    fn mutate<T>(&self, change: impl FnOnce(&mut Snapshot) -> Result<T>) -> Result<T> {
        if self.is_locked() {
            return Err(DiError::Locked);
        }
        let _writer = self.write.lock();
        if self.is_locked() {
            return Err(DiError::Locked);
        }

        let mut next = self.current.load().successor();
        let result = change(&mut next)?;

        #[cfg(feature = "logging")]
        debug!(
            target: "ioc_engine",
            version = next.version,
            services = next.service_count(),
            "Published registry snapshot"
        );

        self.current.store(Arc::new(next));
        Ok(result)
    }
}
