//! Open-generic registrations
//!
//! Rust has no runtime generic instantiation, so an open-generic family is
//! a definition path (e.g. `app::Repository`) plus a closer that produces
//! a registration for a requested closed type such as
//! `app::Repository<app::User>`. Closed registrations are created once
//! per closed type and then reused, so their identity (and reuse slot) is
//! stable across requests.
//!
//! # Example
//!
//! ```rust
//! use ioc_engine::{Container, Made, OpenGeneric};
//! use std::marker::PhantomData;
//!
//! struct Repository<T>(PhantomData<T>);
//!
//! impl<T: 'static> Repository<T> {
//!     fn entity(&self) -> &'static str { std::any::type_name::<T>() }
//! }
//!
//! struct User;
//! struct Order;
//!
//! let family = OpenGeneric::of::<Repository<()>>()
//!     .singleton::<Repository<User>>(Made::of(|(): ()| Repository(PhantomData)))
//!     .singleton::<Repository<Order>>(Made::of(|(): ()| Repository(PhantomData)))
//!     .build();
//!
//! let container = Container::new();
//! container.register_generic(family).unwrap();
//!
//! let users = container.resolve::<Repository<User>>().unwrap();
//! assert!(users.entity().ends_with("User"));
//! ```

use crate::factory::{Made, Registration};
use crate::reuse::Reuse;
use crate::service::{Injectable, ServiceType};
use crate::{DiError, Result};
use ahash::RandomState;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::debug;

type Closer = Arc<dyn Fn(&ServiceType) -> Option<Registration> + Send + Sync>;

/// A family of registrations sharing one generic definition.
pub struct OpenGeneric {
    definition: &'static str,
    closer: Closer,
    closed: DashMap<ServiceType, Option<Arc<Registration>>, RandomState>,
    track_disposable_transients: bool,
}

impl OpenGeneric {
    /// Family with a custom closer.
    ///
    /// `definition` is the path before the generic arguments, as reported
    /// by [`ServiceType::generic_definition`]. The closer returns `None`
    /// for closed types it cannot serve.
    pub fn new<F>(definition: &'static str, closer: F) -> Self
    where
        F: Fn(&ServiceType) -> Option<Registration> + Send + Sync + 'static,
    {
        Self {
            definition,
            closer: Arc::new(closer),
            closed: DashMap::with_hasher(RandomState::new()),
            track_disposable_transients: false,
        }
    }

    /// Start a table-driven family whose definition is taken from any
    /// closed sample type, e.g. `Repository<()>`.
    pub fn of<Sample: ?Sized + 'static>() -> OpenGenericBuilder {
        let sample = ServiceType::of::<Sample>();
        OpenGenericBuilder {
            definition: sample.generic_definition().unwrap_or(sample.name()),
            closers: HashMap::with_hasher(RandomState::new()),
        }
    }

    /// The generic definition path.
    #[inline]
    pub fn definition(&self) -> &'static str {
        self.definition
    }

    /// Validate closed registrations under the registering container's
    /// `track_disposable_transients` rule.
    pub(crate) fn tracking_disposable_transients(mut self, enabled: bool) -> Self {
        self.track_disposable_transients = enabled;
        self
    }

    /// Closed registration for `service`, created on first request.
    pub(crate) fn close(&self, service: &ServiceType) -> Result<Option<Arc<Registration>>> {
        if let Some(cached) = self.closed.get(service) {
            return Ok(cached.clone());
        }

        let closed = match (self.closer)(service) {
            Some(registration) if registration.service != *service => {
                return Err(DiError::configuration(
                    service.name(),
                    format!(
                        "open generic {} closed it as {}",
                        self.definition,
                        registration.service.name()
                    ),
                ));
            }
            Some(registration) => {
                registration.validate(self.track_disposable_transients)?;

                #[cfg(feature = "logging")]
                debug!(
                    target: "ioc_engine",
                    definition = self.definition,
                    service = service.name(),
                    "Closed open generic"
                );

                Some(Arc::new(registration))
            }
            None => None,
        };

        Ok(self.closed.entry(*service).or_insert(closed).clone())
    }
}

impl fmt::Debug for OpenGeneric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenGeneric")
            .field("definition", &self.definition)
            .field("closed", &self.closed.len())
            .finish()
    }
}

/// Builder of a table-driven [`OpenGeneric`].
pub struct OpenGenericBuilder {
    definition: &'static str,
    closers: HashMap<ServiceType, Arc<dyn Fn() -> Registration + Send + Sync>, RandomState>,
}

impl OpenGenericBuilder {
    /// Serve closed type `T` with `made` and `reuse`.
    pub fn close<T: ?Sized + Injectable>(mut self, made: Made<T>, reuse: Reuse) -> Self {
        self.closers.insert(
            ServiceType::of::<T>(),
            Arc::new(move || Registration::new(made.clone(), reuse.clone())),
        );
        self
    }

    /// Serve closed type `T` as a singleton.
    pub fn singleton<T: ?Sized + Injectable>(self, made: Made<T>) -> Self {
        self.close(made, Reuse::Singleton)
    }

    /// Serve closed type `T` as a transient.
    pub fn transient<T: ?Sized + Injectable>(self, made: Made<T>) -> Self {
        self.close(made, Reuse::Transient)
    }

    /// Finish the family.
    pub fn build(self) -> OpenGeneric {
        let closers = self.closers;
        OpenGeneric::new(self.definition, move |service| {
            closers.get(service).map(|make| make())
        })
    }
}
