//! Example walking through reuse, scopes and disposal with engine logging
//!
//! Run with pretty logging (development):
//! ```bash
//! cargo run --example scopes --features logging-pretty
//! ```
//!
//! Run with JSON logging (production):
//! ```bash
//! cargo run --example scopes --features logging-json
//! ```

use ioc_engine::{Container, Dispose, Func, Lazy, Made, Many, Registration, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_REQUEST: AtomicU64 = AtomicU64::new(1);

struct Config {
    database_url: String,
}

struct ConnectionPool {
    url: String,
}

impl Dispose for ConnectionPool {
    fn dispose(&self) {
        println!("  [App] closing pool {}", self.url);
    }
}

struct RequestContext {
    id: u64,
}

impl Dispose for RequestContext {
    fn dispose(&self) {
        println!("  [App] request {} finished", self.id);
    }
}

struct UserRepository {
    pool: Arc<ConnectionPool>,
    context: Arc<RequestContext>,
}

trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;
}

struct Auth;
impl Middleware for Auth {
    fn name(&self) -> &'static str {
        "auth"
    }
}

struct Compression;
impl Middleware for Compression {
    fn name(&self) -> &'static str {
        "compression"
    }
}

struct Pipeline {
    middleware: Many<Arc<dyn Middleware>>,
    repositories: Func<UserRepository>,
}

fn register(container: &Container) -> Result<()> {
    container.instance(Config {
        database_url: "postgres://localhost/app".into(),
    })?;

    container
        .register_batch()
        .add(Registration::singleton(
            Made::of(|config: Arc<Config>| ConnectionPool {
                url: config.database_url.clone(),
            })
            .disposable(),
        ))
        .add(Registration::scoped(
            Made::of(|(): ()| RequestContext {
                id: NEXT_REQUEST.fetch_add(1, Ordering::SeqCst),
            })
            .disposable(),
        ))
        .add(Registration::transient(Made::of(
            |(pool, context): (Arc<ConnectionPool>, Arc<RequestContext>)| UserRepository {
                pool,
                context,
            },
        )))
        .add(
            Registration::singleton(Made::of(|(): ()| Auth).cast(|m: Arc<Auth>| m as Arc<dyn Middleware>))
                .keyed("auth"),
        )
        .add(
            Registration::singleton(
                Made::of(|(): ()| Compression).cast(|m: Arc<Compression>| m as Arc<dyn Middleware>),
            )
            .keyed("compression"),
        )
        .done()?;

    container.scoped(|(middleware, repositories): (Many<Arc<dyn Middleware>>, Func<UserRepository>)| {
        Pipeline {
            middleware,
            repositories,
        }
    })
}

fn main() -> Result<()> {
    #[cfg(feature = "logging")]
    ioc_engine::logging::init();

    println!("=== IoC Engine Scopes Demo ===\n");

    let root = Container::new();
    register(&root)?;
    root.lock();

    for _ in 0..2 {
        let request = root.open_named_scope("request")?;
        let pipeline = request.resolve::<Pipeline>()?;

        let names: Vec<_> = pipeline.middleware.iter().map(|m| m.name()).collect();
        println!("  [App] middleware: {}", names.join(" -> "));

        let first = pipeline.repositories.call()?;
        let second = pipeline.repositories.call()?;
        println!(
            "  [App] request {} on {} (shared context: {})",
            first.context.id,
            first.pool.url,
            Arc::ptr_eq(&first.context, &second.context)
        );

        // Dropping the last handle disposes the scope
    }

    let pool: Lazy<ConnectionPool> = root.get()?;
    println!("  [App] pool resolved lazily: {}", pool.get()?.url);

    // Missing services are an error, unless asked for optionally
    assert!(root.try_resolve::<String>()?.is_none());

    root.dispose();

    println!("\n=== Demo Complete ===");
    println!("\nTip: Use --features logging-json for production (JSON output)");
    println!("     Use --features logging-pretty for development (colorful output)");
    Ok(())
}
