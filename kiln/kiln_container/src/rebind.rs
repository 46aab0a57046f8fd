//! Rebind tables.
//!
//! A rebind table names the capabilities whose values must not survive a
//! request. Every time a container is recycled, each listed capability is
//! rebuilt by its factory and rebound in place, discarding whatever the
//! previous request left behind.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use kiln_core::error::{BootstrapError, ContainerError};
use tracing::{error, trace};

use crate::container::{erase, CapabilityKey, Container, Factory};

/// Immutable list of capabilities to rebuild on recycle.
///
/// Built once at startup with [`RebindTable::builder`] and shared by the
/// pool for its whole lifetime.
///
/// # Examples
///
/// ```
/// use kiln_container::{Container, RebindTable};
///
/// let table = RebindTable::builder()
///     .rebind("request_log", |_| Vec::<String>::new())
///     .build();
///
/// let container = Container::new();
/// container.instance("request_log", vec![String::from("stale")]);
/// table.validate(&container).unwrap();
///
/// table.apply(&container).unwrap();
/// assert!(container.resolve::<Vec<String>>("request_log").unwrap().is_empty());
/// ```
#[derive(Clone)]
pub struct RebindTable {
    entries: Arc<[(CapabilityKey, Factory)]>,
}

impl RebindTable {
    /// An empty table. Recycling applies no rebinding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a table.
    pub fn builder() -> RebindTableBuilder {
        RebindTableBuilder::default()
    }

    /// The keys this table rebinds, in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &CapabilityKey> + '_ {
        self.entries.iter().map(|(key, _)| key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check that every key is bound in `container`.
    ///
    /// Run once per container at startup, so that recycling never has to
    /// deal with a key that was never part of the application.
    pub fn validate(&self, container: &Container) -> Result<(), BootstrapError> {
        match self.keys().find(|key| !container.has(key.as_str())) {
            Some(key) => Err(BootstrapError::UnknownCapability {
                capability: key.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Rebuild and rebind every listed capability of `container`.
    ///
    /// Each capability keeps the kind it was bound with. A factory that
    /// panics leaves its capability unbound rather than holding the previous
    /// request's value; the remaining entries are still rebuilt and the
    /// first failure is returned.
    pub fn apply(&self, container: &Container) -> Result<(), ContainerError> {
        let mut failure = None;
        for (key, factory) in self.entries.iter() {
            trace!(container = %container.id(), key = %key, "Rebinding capability");
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| container.rebind(key, factory))) {
                let reason = panic_message(payload.as_ref());
                error!(container = %container.id(), key = %key, reason = %reason, "Rebind factory panicked");
                container.unbind(key.as_str());
                failure.get_or_insert(ContainerError::RebindFailed {
                    key: key.to_string(),
                    reason,
                });
            }
        }
        failure.map_or(Ok(()), Err)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Default for RebindTable {
    fn default() -> Self {
        Self {
            entries: Arc::from(Vec::new()),
        }
    }
}

impl fmt::Debug for RebindTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

/// Builder for [`RebindTable`].
#[derive(Default)]
pub struct RebindTableBuilder {
    entries: Vec<(CapabilityKey, Factory)>,
}

impl RebindTableBuilder {
    /// Rebuild `key` with `factory` on every recycle.
    ///
    /// Naming a key twice keeps the later factory.
    pub fn rebind<T, F>(mut self, key: impl Into<CapabilityKey>, factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&Container) -> T + Send + Sync + 'static,
    {
        let key = key.into();
        let factory = erase(factory);
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = factory,
            None => self.entries.push((key, factory)),
        }
        self
    }

    /// Freeze the table.
    pub fn build(self) -> RebindTable {
        RebindTable {
            entries: self.entries.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    type Log = Mutex<Vec<String>>;

    fn app() -> Container {
        let container = Container::new();
        container.instance("log", Log::default());
        container.instance("config", String::from("static"));
        container
    }

    #[test]
    fn test_apply_replaces_listed_values() {
        let table = RebindTable::builder().rebind("log", |_| Log::default()).build();
        let container = app();

        let before = container.resolve::<Log>("log").unwrap();
        before.lock().push("request 1".into());
        let config_before = container.resolve::<String>("config").unwrap();

        table.apply(&container).unwrap();

        let after = container.resolve::<Log>("log").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(after.lock().is_empty());

        let config_after = container.resolve::<String>("config").unwrap();
        assert!(Arc::ptr_eq(&config_before, &config_after));
    }

    #[test]
    fn test_validate_rejects_unknown_key() {
        let table = RebindTable::builder()
            .rebind("log", |_| Log::default())
            .rebind("session", |_| 0u64)
            .build();

        let err = table.validate(&app()).unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::UnknownCapability { capability } if capability == "session"
        ));
    }

    #[test]
    fn test_duplicate_key_keeps_last_factory() {
        let table = RebindTable::builder()
            .rebind("config", |_| String::from("first"))
            .rebind("config", |_| String::from("second"))
            .build();
        assert_eq!(table.len(), 1);

        let container = app();
        table.apply(&container).unwrap();
        assert_eq!(container.resolve::<String>("config").unwrap().as_str(), "second");
    }

    #[test]
    fn test_panicking_factory_unbinds_capability() {
        let table = RebindTable::builder()
            .rebind("log", |_| -> Log { panic!("log store offline") })
            .rebind("config", |_| String::from("fresh"))
            .build();
        let container = app();
        container.resolve::<Log>("log").unwrap().lock().push("stale".into());

        let err = table.apply(&container).unwrap_err();
        assert!(matches!(
            err,
            ContainerError::RebindFailed { key, reason } if key == "log" && reason == "log store offline"
        ));

        assert!(!container.has("log"));
        assert_eq!(container.resolve::<String>("config").unwrap().as_str(), "fresh");
    }

    #[test]
    fn test_empty_table_is_noop() {
        let table = RebindTable::new();
        let container = app();
        let before = container.resolve::<Log>("log").unwrap();

        assert!(table.is_empty());
        table.validate(&container).unwrap();
        table.apply(&container).unwrap();

        assert!(Arc::ptr_eq(&before, &container.resolve::<Log>("log").unwrap()));
    }
}
