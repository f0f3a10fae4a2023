use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// In-memory snapshots of model state, keyed by an explicit name.
///
/// Meant for the "keep the best weights, roll back at the end" pattern of an
/// early-stopping fit; nothing touches the disk.
#[derive(Debug)]
pub struct WeightCache<S> {
    entries: Mutex<HashMap<String, S>>,
}

impl<S> Default for WeightCache<S> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<S: Clone> WeightCache<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot `state` under `key`, replacing any previous snapshot.
    pub fn save_weights(&self, key: &str, state: &S) {
        debug!("Caching weights under '{key}'");
        self.lock().insert(key.to_string(), state.clone());
    }

    /// Copy of the snapshot under `key`.
    pub fn restore_weights(&self, key: &str) -> Option<S> {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<S> {
        self.lock().remove(key)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, S>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
