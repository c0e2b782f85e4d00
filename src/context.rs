//! Process-lifetime shared state for plugins.

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, RwLock},
};

/// A value stored in the [`GlobalContext`]. Anything `Send + Sync` goes:
/// database pools, caches, counters.
pub type SharedValue = Arc<dyn Any + Send + Sync>;

/// String-keyed map for cross-connection plugin state.
///
/// Owned by the [`Server`](crate::server::Server) and handed to plugins on
/// every hook invocation, so two servers in one process never share state.
/// Writers and readers may interleave across sessions; the only ordering
/// guarantee is last write wins.
#[derive(Default)]
pub struct GlobalContext {
    entries: RwLock<HashMap<String, SharedValue>>,
}

impl GlobalContext {
    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Panics
    /// Panics if the internal lock is poisoned.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.entries
            .write()
            .expect("global context lock poisoned")
            .insert(key.into(), Arc::new(value));
    }

    /// Fetch the value under `key`, downcast to `T`. `None` if the key is
    /// absent or holds a different type.
    ///
    /// # Panics
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.entries
            .read()
            .expect("global context lock poisoned")
            .get(key)
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Remove the value under `key`. Returns whether a value was present.
    ///
    /// # Panics
    /// Panics if the internal lock is poisoned.
    pub fn delete(&self, key: &str) -> bool {
        self.entries
            .write()
            .expect("global context lock poisoned")
            .remove(key)
            .is_some()
    }

    /// # Panics
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .expect("global context lock poisoned")
            .contains_key(key)
    }
}
