//! # IoC Engine - Dependency Injection Container Engine for Rust
//!
//! A runtime inversion-of-control container: services are registered with
//! a construction recipe and a reuse policy, and resolved as fully built
//! object graphs.
//!
//! ## Features
//!
//! - **Reuse policies** - transient, singleton, scoped and scoped-to-name
//! - **Scopes** - nested lifetimes with deterministic, reverse-order disposal
//! - **Wrappers** - `Lazy`, `Func`, `FuncWith`, `Many`, `Meta` and `Keyed`
//!   injection out of the box
//! - **Keys, conditions and decorators** - pick or wrap implementations per
//!   request
//! - **Open generics** - one registration family serving many closed types
//! - **Cached plans** - each request is analyzed once, then replayed
//!   through an interpreter or compiled closures
//! - **Observable** - optional tracing integration with JSON or pretty output
//!
//! ## Quick Start
//!
//! ```rust
//! use ioc_engine::Container;
//! use std::sync::Arc;
//!
//! struct Database {
//!     url: String,
//! }
//!
//! struct UserService {
//!     db: Arc<Database>,
//! }
//!
//! let container = Container::new();
//!
//! // Register services
//! container.instance(Database { url: "postgres://localhost".into() }).unwrap();
//! container.singleton(|db: Arc<Database>| UserService { db }).unwrap();
//!
//! // Resolve - returns Arc<T>
//! let users = container.resolve::<UserService>().unwrap();
//! assert_eq!(users.db.url, "postgres://localhost");
//! ```
//!
//! ## Service Lifetimes
//!
//! ```rust
//! use ioc_engine::Container;
//! use std::sync::Arc;
//!
//! struct Config { debug: bool }
//! struct RequestContext { config: Arc<Config> }
//! struct Handler { context: Arc<RequestContext> }
//!
//! let root = Container::new();
//!
//! // Singleton - one instance, shared by every scope
//! root.singleton(|(): ()| Config { debug: true }).unwrap();
//!
//! // Scoped - one instance per open scope
//! root.scoped(|config: Arc<Config>| RequestContext { config }).unwrap();
//!
//! // Transient - new instance every time
//! root.transient(|context: Arc<RequestContext>| Handler { context }).unwrap();
//!
//! let request = root.open_scope().unwrap();
//! let a = request.resolve::<Handler>().unwrap();
//! let b = request.resolve::<Handler>().unwrap();
//! assert!(!Arc::ptr_eq(&a, &b));
//! assert!(Arc::ptr_eq(&a.context, &b.context));
//! assert!(a.context.config.debug);
//! ```
//!
//! ## Deferred Resolution
//!
//! ```rust
//! use ioc_engine::{Container, Lazy};
//! use std::sync::Arc;
//!
//! struct Parent { child: Arc<Child> }
//! struct Child { parent: Lazy<Parent> }
//!
//! let container = Container::new();
//! container.singleton(|child: Arc<Child>| Parent { child }).unwrap();
//! container.singleton(|parent: Lazy<Parent>| Child { parent }).unwrap();
//!
//! let parent = container.resolve::<Parent>().unwrap();
//! let same = parent.child.parent.get().unwrap();
//! assert!(Arc::ptr_eq(&parent, &same));
//! ```

mod container;
mod error;
mod factory;
mod generic;
mod inject;
#[cfg(feature = "logging")]
pub mod logging;
mod plan;
mod registry;
mod request;
mod reuse;
mod rules;
mod scope;
mod service;
mod wrappers;

pub use container::{Container, RegistrationBatch, Services, ServicesIter};
pub use error::{BoxError, DiError, ErrorKind, Result};
pub use factory::{Condition, Made, Metadata, Registration, RegistrationId, RequestInfo, Setup};
pub use generic::{OpenGeneric, OpenGenericBuilder};
pub use inject::{
    Deferred, Dependencies, Dependency, IfUnresolved, Inject, Resolved, Service, ServiceModule,
    Wrapper,
};
pub use registry::IfAlreadyRegistered;
pub use reuse::{Reuse, ScopeName};
pub use rules::{DefaultSelection, PlanBackend, Rules};
pub use scope::{Dispose, Scope, ScopeId};
pub use service::{Injectable, Instance, Key, ServiceKey, ServiceType};
pub use wrappers::{Func, FuncWith, Keyed, Lazy, Many, Meta};

// Re-export tracing macros for convenience when logging feature is enabled
#[cfg(feature = "logging")]
pub use tracing::{debug, error, info, trace, warn};

// Re-export for convenience
pub use std::sync::Arc;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Container, DiError, Dispose, Func, FuncWith, Injectable, Keyed, Lazy, Made, Many, Meta,
        Registration, Result, Reuse, Rules, Service, ServiceModule,
    };
    pub use std::sync::Arc;
}
