#![no_main]

//! Fuzz target for scope trees and disposal
//!
//! Opens, resolves from and disposes random scopes, checking reuse
//! identity and that every disposable is disposed exactly once.

use arbitrary::Arbitrary;
use ioc_engine::{Container, DiError, Dispose, Made, Registration};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

static CREATED: AtomicUsize = AtomicUsize::new(0);
static DISPOSED: AtomicUsize = AtomicUsize::new(0);

struct Singleton;

struct PerScope;

impl Dispose for PerScope {
    fn dispose(&self) {
        DISPOSED.fetch_add(1, Ordering::SeqCst);
    }
}

#[allow(dead_code)]
struct PerRequest(Arc<PerScope>);

#[derive(Debug, Arbitrary)]
enum ScopedOp {
    Open { parent: u8 },
    OpenNamed { parent: u8 },
    ResolveSingleton { scope: u8 },
    ResolveScoped { scope: u8 },
    ResolveRequest { scope: u8 },
    Dispose { scope: u8 },
    Drop { scope: u8 },
}

fn pick(scopes: &[Container], index: u8) -> Option<&Container> {
    if scopes.is_empty() {
        None
    } else {
        scopes.get(index as usize % scopes.len())
    }
}

fuzz_target!(|ops: Vec<ScopedOp>| {
    CREATED.store(0, Ordering::SeqCst);
    DISPOSED.store(0, Ordering::SeqCst);

    let root = Container::new();
    root.register_many([
        Registration::singleton(Made::of(|(): ()| Singleton)),
        Registration::scoped(
            Made::of(|(): ()| {
                CREATED.fetch_add(1, Ordering::SeqCst);
                PerScope
            })
            .disposable(),
        ),
        Registration::scoped_to(Made::of(PerRequest), "request"),
    ])
    .unwrap();
    let singleton = root.resolve::<Singleton>().unwrap();

    let mut scopes: Vec<Container> = Vec::new();

    for op in ops.into_iter().take(100) {
        match op {
            ScopedOp::Open { parent } => {
                let parent = pick(&scopes, parent).unwrap_or(&root);
                if let Ok(scope) = parent.open_scope() {
                    assert_eq!(scope.depth(), parent.depth() + 1);
                    scopes.push(scope);
                }
            }
            ScopedOp::OpenNamed { parent } => {
                let parent = pick(&scopes, parent).unwrap_or(&root);
                if let Ok(scope) = parent.open_named_scope("request") {
                    scopes.push(scope);
                }
            }
            ScopedOp::ResolveSingleton { scope } => {
                if let Some(scope) = pick(&scopes, scope) {
                    match scope.resolve::<Singleton>() {
                        Ok(resolved) => assert!(Arc::ptr_eq(&resolved, &singleton)),
                        Err(err) => assert!(matches!(err, DiError::ScopeDisposed { .. })),
                    }
                }
            }
            ScopedOp::ResolveScoped { scope } => {
                if let Some(scope) = pick(&scopes, scope) {
                    if let (Ok(a), Ok(b)) = (scope.resolve::<PerScope>(), scope.resolve::<PerScope>()) {
                        assert!(Arc::ptr_eq(&a, &b));
                    }
                }
            }
            ScopedOp::ResolveRequest { scope } => {
                if let Some(scope) = pick(&scopes, scope) {
                    match scope.resolve::<PerRequest>() {
                        Ok(_) => {}
                        Err(DiError::ScopeNotFound { .. } | DiError::ScopeDisposed { .. }) => {}
                        Err(other) => panic!("unexpected {other}"),
                    }
                }
            }
            ScopedOp::Dispose { scope } => {
                if let Some(scope) = pick(&scopes, scope) {
                    scope.dispose();
                    assert!(scope.scope().is_disposed());
                }
            }
            ScopedOp::Drop { scope } => {
                if !scopes.is_empty() {
                    let index = scope as usize % scopes.len();
                    scopes.swap_remove(index);
                }
            }
        }
        assert!(DISPOSED.load(Ordering::SeqCst) <= CREATED.load(Ordering::SeqCst));
    }

    drop(scopes);
    root.dispose();
    assert_eq!(DISPOSED.load(Ordering::SeqCst), CREATED.load(Ordering::SeqCst));
});
