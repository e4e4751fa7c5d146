//! Service identity: types, keys and type-erased instances
//!
//! A service is identified by its [`ServiceType`] plus a [`ServiceKey`].
//! The unkeyed default is itself a reserved key value, so several
//! registrations may coexist per type and be told apart by key.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Marker trait for types that can be registered and resolved.
///
/// This is automatically implemented for all types that are
/// `Send + Sync + 'static`, including trait objects such as
/// `dyn Repository`. You never need to implement this manually.
pub trait Injectable: Send + Sync + 'static {
    /// Returns the type name for debugging
    #[inline]
    fn type_name_of() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }
}

// Blanket implementation - everything that's Send + Sync + 'static is Injectable
impl<T: ?Sized + Send + Sync + 'static> Injectable for T {}

// =============================================================================
// ServiceType
// =============================================================================

/// Runtime identity of a service or implementation type.
///
/// Equality and hashing use the `TypeId` only; the name is kept for
/// diagnostics and for matching open-generic definitions.
#[derive(Clone, Copy)]
pub struct ServiceType {
    id: TypeId,
    name: &'static str,
}

impl ServiceType {
    /// Identity of `T`.
    #[inline]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The underlying `TypeId`.
    #[inline]
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified type name.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Check whether this is the identity of `T`.
    #[inline]
    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }

    /// The generic definition path, e.g. `app::Repo` for `app::Repo<app::User>`.
    ///
    /// Returns `None` for non-generic types.
    pub fn generic_definition(&self) -> Option<&'static str> {
        let open = self.name.find('<')?;
        Some(&self.name[..open])
    }

    /// Names of the top-level generic arguments, in order.
    pub fn type_arguments(&self) -> Vec<&'static str> {
        let Some(open) = self.name.find('<') else {
            return Vec::new();
        };
        let Some(close) = self.name.rfind('>') else {
            return Vec::new();
        };
        let inner = &self.name[open + 1..close];

        let mut arguments = Vec::new();
        let mut depth = 0usize;
        let mut start = 0usize;
        for (i, c) in inner.char_indices() {
            match c {
                '<' | '(' | '[' => depth += 1,
                '>' | ')' | ']' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    arguments.push(inner[start..i].trim());
                    start = i + 1;
                }
                _ => {}
            }
        }
        let last = inner[start..].trim();
        if !last.is_empty() {
            arguments.push(last);
        }
        arguments
    }
}

impl PartialEq for ServiceType {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceType {}

impl Hash for ServiceType {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Object-safe comparison support for erased key values.
trait KeyValue: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn eq_key(&self, other: &dyn KeyValue) -> bool;
    fn hash_key(&self, state: &mut dyn Hasher);
}

impl<K> KeyValue for K
where
    K: Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_key(&self, other: &dyn KeyValue) -> bool {
        other.as_any().downcast_ref::<K>() == Some(self)
    }

    fn hash_key(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<K>().hash(&mut state);
        self.hash(&mut state);
    }
}

/// A service key: any comparable value.
///
/// # Examples
///
/// ```rust
/// use ioc_engine::Key;
///
/// #[derive(Debug, PartialEq, Eq, Hash)]
/// enum Region { Eu, Us }
///
/// assert_eq!(Key::from("primary"), Key::from("primary"));
/// assert_ne!(Key::from(1u32), Key::from(1u64));
/// assert_eq!(Key::new(Region::Eu), Key::new(Region::Eu));
/// assert_ne!(Key::new(Region::Eu), Key::new(Region::Us));
/// ```
#[derive(Clone)]
pub struct Key(Arc<dyn KeyValue>);

impl Key {
    /// Wrap any comparable value as a key.
    pub fn new<K>(value: K) -> Self
    where
        K: Eq + Hash + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(value))
    }

    /// Borrow the key value as `K`, if it has that type.
    pub fn downcast_ref<K: 'static>(&self) -> Option<&K> {
        self.0.as_any().downcast_ref::<K>()
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_key(other.0.as_ref())
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_key(state);
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

macro_rules! impl_key_from {
    ($($t:ty),+) => {
        $(
            impl From<$t> for Key {
                #[inline]
                fn from(value: $t) -> Self {
                    Key::new(value)
                }
            }
        )+
    };
}

impl_key_from!(&'static str, String, char, bool, u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

/// Key part of a service identity.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum ServiceKey {
    /// The reserved unkeyed value
    Default,
    /// An explicit key
    Keyed(Key),
}

impl ServiceKey {
    /// Is this the unkeyed default?
    #[inline]
    pub fn is_default(&self) -> bool {
        matches!(self, ServiceKey::Default)
    }

    /// The explicit key, if any.
    #[inline]
    pub fn key(&self) -> Option<&Key> {
        match self {
            ServiceKey::Default => None,
            ServiceKey::Keyed(key) => Some(key),
        }
    }
}

impl Default for ServiceKey {
    fn default() -> Self {
        ServiceKey::Default
    }
}

impl<K: Into<Key>> From<K> for ServiceKey {
    #[inline]
    fn from(key: K) -> Self {
        ServiceKey::Keyed(key.into())
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKey::Default => f.write_str("<default>"),
            ServiceKey::Keyed(key) => fmt::Debug::fmt(key, f),
        }
    }
}

// =============================================================================
// Instance
// =============================================================================

/// A type-erased service instance.
///
/// Internally holds an `Arc<T>` for the service type `T` it was
/// registered under, so trait-object services survive erasure.
#[derive(Clone)]
pub struct Instance {
    value: Arc<dyn Any + Send + Sync>,
}

impl Instance {
    /// Erase a shared instance of service type `T`.
    #[inline]
    pub fn new<T: ?Sized + Injectable>(value: Arc<T>) -> Self {
        Self {
            value: Arc::new(value),
        }
    }

    /// Recover the typed instance, if this is a `T`.
    #[inline]
    pub fn downcast<T: ?Sized + Injectable>(&self) -> Option<Arc<T>> {
        self.value.downcast_ref::<Arc<T>>().cloned()
    }

    /// Whether two handles point at the same instance.
    #[inline]
    pub fn ptr_eq(&self, other: &Instance) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("ptr", &Arc::as_ptr(&self.value))
            .finish()
    }
}
