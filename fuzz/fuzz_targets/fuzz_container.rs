#![no_main]

//! Fuzz target for registration policies and resolution
//!
//! Applies random registrations under random policies and checks that
//! resolution agrees with a simple model of the registry.

use arbitrary::Arbitrary;
use ioc_engine::{Container, DiError, IfAlreadyRegistered, Made, Registration, ServiceKey};
use libfuzzer_sys::fuzz_target;

#[derive(Debug)]
struct Value(u8);

#[derive(Debug, Clone, Copy, Arbitrary)]
enum Policy {
    AppendNewKey,
    ThrowIfSameKey,
    ReplaceOnSameKey,
    KeepExisting,
}

impl From<Policy> for IfAlreadyRegistered {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::AppendNewKey => Self::AppendNewKey,
            Policy::ThrowIfSameKey => Self::ThrowIfSameKey,
            Policy::ReplaceOnSameKey => Self::ReplaceOnSameKey,
            Policy::KeepExisting => Self::KeepExisting,
        }
    }
}

#[derive(Debug, Arbitrary)]
enum ContainerOp {
    Register { value: u8, key: Option<u8>, policy: Policy, transient: bool },
    Unregister { key: Option<u8> },
    Resolve { key: Option<u8> },
    ResolveMany,
    Lock,
}

fn service_key(key: Option<u8>) -> ServiceKey {
    key.map_or(ServiceKey::Default, ServiceKey::from)
}

fuzz_target!(|ops: Vec<ContainerOp>| {
    let container = Container::new();
    // (key, value) in registration order
    let mut model: Vec<(Option<u8>, u8)> = Vec::new();
    let mut locked = false;

    for op in ops.into_iter().take(200) {
        match op {
            ContainerOp::Register { value, key, policy, transient } => {
                let made = Made::of(move |(): ()| Value(value));
                let registration = if transient {
                    Registration::transient(made)
                } else {
                    Registration::singleton(made)
                };
                let result = container.register(
                    registration
                        .keyed(service_key(key))
                        .if_already_registered(policy.into()),
                );

                if locked {
                    assert!(matches!(result, Err(DiError::Locked)));
                    continue;
                }

                let existing = model.iter().position(|(k, _)| *k == key);
                match (policy, existing) {
                    (_, None) => {
                        assert!(result.is_ok());
                        model.push((key, value));
                    }
                    (Policy::AppendNewKey, Some(_)) if key.is_none() => {
                        assert!(result.is_ok());
                        model.push((key, value));
                    }
                    (Policy::AppendNewKey | Policy::ThrowIfSameKey, Some(_)) => assert!(result.is_err()),
                    (Policy::ReplaceOnSameKey, Some(first)) => {
                        assert!(result.is_ok());
                        model[first] = (key, value);
                        let mut kept = false;
                        model.retain(|(k, _)| {
                            if *k != key {
                                return true;
                            }
                            !std::mem::replace(&mut kept, true)
                        });
                    }
                    (Policy::KeepExisting, Some(_)) => assert!(result.is_ok()),
                }
            }
            ContainerOp::Unregister { key } => {
                let result = container.unregister_keyed::<Value>(service_key(key));
                if locked {
                    assert!(result.is_err());
                } else {
                    let had = model.iter().any(|(k, _)| *k == key);
                    assert_eq!(result.unwrap(), had);
                    model.retain(|(k, _)| *k != key);
                }
            }
            ContainerOp::Resolve { key } => {
                let expected = model.iter().rev().find(|(k, _)| *k == key).map(|(_, v)| *v);
                match (container.resolve_keyed::<Value>(service_key(key)), expected) {
                    (Ok(resolved), Some(value)) => assert_eq!(resolved.0, value),
                    (Err(DiError::Unresolved { .. }), None) => {}
                    (other, expected) => panic!("resolved {other:?}, expected {expected:?}"),
                }
            }
            ContainerOp::ResolveMany => {
                let all = container.resolve_many::<Value>().to_vec().unwrap();
                let values: Vec<u8> = all.iter().map(|v| v.0).collect();
                let expected: Vec<u8> = model.iter().map(|(_, v)| *v).collect();
                assert_eq!(values, expected);
            }
            ContainerOp::Lock => {
                container.lock();
                locked = true;
            }
        }
    }
});
