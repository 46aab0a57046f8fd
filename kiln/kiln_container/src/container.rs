//! Capability containers.

use std::any::{type_name, Any};
use std::borrow::{Borrow, Cow};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kiln_core::error::ContainerError;
use kiln_core::id::ContainerId;
use parking_lot::RwLock;
use tracing::trace;

/// A resolved capability value.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Builds a capability value, optionally resolving other capabilities from
/// the same container.
pub type Factory = Arc<dyn Fn(&Container) -> Instance + Send + Sync>;

/// Name under which a capability is bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapabilityKey(Cow<'static, str>);

impl CapabilityKey {
    /// A key from a static name.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// A key from an owned name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CapabilityKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for CapabilityKey {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for CapabilityKey {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for CapabilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a key produces its value.
#[derive(Clone)]
enum Binding {
    /// A fixed value
    Instance(Instance),

    /// A fresh value on every resolution
    Factory(Factory),

    /// Built on first resolution, then reused
    Shared {
        factory: Factory,
        cached: Option<Instance>,
    },
}

impl Binding {
    fn kind(&self) -> &'static str {
        match self {
            Self::Instance(_) => "instance",
            Self::Factory(_) => "factory",
            Self::Shared { .. } => "shared",
        }
    }
}

/// One bootstrapped application instance.
///
/// Bindings are interior-mutable so that a container can be populated and
/// rebound through a shared `Arc<Container>`. Factories run without any
/// lock held, so a factory may resolve other capabilities of the same
/// container.
///
/// # Examples
///
/// ```
/// use kiln_container::Container;
///
/// let container = Container::new();
/// container.instance("greeting", String::from("hello"));
/// container.bind("counter", |_| 0u32);
///
/// let greeting = container.resolve::<String>("greeting").unwrap();
/// assert_eq!(greeting.as_str(), "hello");
/// assert!(container.has("counter"));
/// ```
pub struct Container {
    id: ContainerId,
    bindings: RwLock<HashMap<CapabilityKey, Binding>>,
}

impl Container {
    /// Create an empty container with a fresh identity.
    pub fn new() -> Self {
        Self {
            id: ContainerId::new(),
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// The container's identity.
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Bind a factory that builds a fresh value on every resolution.
    pub fn bind<T, F>(&self, key: impl Into<CapabilityKey>, factory: F)
    where
        T: Any + Send + Sync,
        F: Fn(&Container) -> T + Send + Sync + 'static,
    {
        self.insert(key.into(), Binding::Factory(erase(factory)));
    }

    /// Bind a factory whose first result is cached and reused.
    pub fn singleton<T, F>(&self, key: impl Into<CapabilityKey>, factory: F)
    where
        T: Any + Send + Sync,
        F: Fn(&Container) -> T + Send + Sync + 'static,
    {
        self.insert(
            key.into(),
            Binding::Shared {
                factory: erase(factory),
                cached: None,
            },
        );
    }

    /// Bind a fixed value.
    pub fn instance<T>(&self, key: impl Into<CapabilityKey>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.insert(key.into(), Binding::Instance(Arc::new(value)));
    }

    /// Bind an already type-erased value, replacing any existing binding.
    pub fn set_instance(&self, key: impl Into<CapabilityKey>, value: Instance) {
        self.insert(key.into(), Binding::Instance(value));
    }

    /// Replace the binding under `key` with one of the same kind built from
    /// `factory`.
    ///
    /// A fixed value is rebuilt now. A per-resolution factory keeps building
    /// fresh values, and a singleton goes back to being built lazily on its
    /// next resolution, so the container behaves as it did when first booted.
    pub(crate) fn rebind(&self, key: &CapabilityKey, factory: &Factory) {
        let lazy = match self.bindings.read().get(key.as_str()) {
            Some(Binding::Factory(_)) => Some(Binding::Factory(Arc::clone(factory))),
            Some(Binding::Shared { .. }) => Some(Binding::Shared {
                factory: Arc::clone(factory),
                cached: None,
            }),
            _ => None,
        };
        // The factory runs with no lock held.
        let binding = lazy.unwrap_or_else(|| Binding::Instance(factory(self)));
        self.insert(key.clone(), binding);
    }

    /// Remove the binding under `key`.
    pub(crate) fn unbind(&self, key: &str) -> bool {
        trace!(container = %self.id, key, "Unbinding capability");
        self.bindings.write().remove(key).is_some()
    }

    fn insert(&self, key: CapabilityKey, binding: Binding) {
        trace!(container = %self.id, key = %key, kind = binding.kind(), "Binding capability");
        self.bindings.write().insert(key, binding);
    }

    /// Whether anything is bound under `key`.
    pub fn has(&self, key: &str) -> bool {
        self.bindings.read().contains_key(key)
    }

    /// All bound keys, sorted.
    pub fn keys(&self) -> Vec<CapabilityKey> {
        let mut keys: Vec<_> = self.bindings.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    /// Whether the container has no bindings.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a capability without committing to its type.
    pub fn resolve_any(&self, key: &str) -> Result<Instance, ContainerError> {
        let binding = self
            .bindings
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| ContainerError::NotBound(key.to_string()))?;

        match binding {
            Binding::Instance(value) => Ok(value),
            Binding::Factory(factory) => Ok(factory(self)),
            Binding::Shared {
                cached: Some(value),
                ..
            } => Ok(value),
            Binding::Shared {
                factory,
                cached: None,
            } => {
                let built = factory(self);
                let mut bindings = self.bindings.write();
                match bindings.get_mut(key) {
                    // First writer wins if two resolutions raced.
                    Some(Binding::Shared { cached, .. }) => {
                        Ok(Arc::clone(cached.get_or_insert(built)))
                    }
                    // Rebound while the factory ran; the new binding is not ours to fill.
                    _ => Ok(built),
                }
            }
        }
    }

    /// Resolve a capability as `T`.
    pub fn resolve<T>(&self, key: &str) -> Result<Arc<T>, ContainerError>
    where
        T: Any + Send + Sync,
    {
        self.resolve_any(key)?
            .downcast::<T>()
            .map_err(|_| ContainerError::TypeMismatch {
                key: key.to_string(),
                expected: type_name::<T>(),
            })
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("keys", &self.keys())
            .finish()
    }
}

/// Type-erase a typed factory.
pub(crate) fn erase<T, F>(factory: F) -> Factory
where
    T: Any + Send + Sync,
    F: Fn(&Container) -> T + Send + Sync + 'static,
{
    Arc::new(move |container: &Container| Arc::new(factory(container)) as Instance)
}
