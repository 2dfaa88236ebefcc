//! # Process-wide plugin-id → state mapping.
//!
//! Thin wrapper over a concurrent map. All operations return synchronously;
//! there are no blocking semantics to reason about. Writes for a given id
//! are expected to come from that id's supervisor only; the map itself does
//! not enforce this, the reconciler's single-supervisor-per-id invariant does.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::state::PluginState;
use crate::syntest::PluginId;

/// Thread-safe mapping from plugin-id to the plugin's state snapshot.
///
/// Cheap to clone; clones share the underlying map.
#[derive(Clone, Default)]
pub struct StateMap {
    inner: Arc<DashMap<PluginId, PluginState>>,
}

impl StateMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the state for `id`, if present.
    pub fn get(&self, id: &PluginId) -> Option<PluginState> {
        self.inner.get(id).map(|e| e.value().clone())
    }

    /// Stores (or replaces) the state for `id`.
    pub fn set(&self, id: PluginId, state: PluginState) {
        self.inner.insert(id, state);
    }

    /// Removes the state for `id`, if present.
    pub fn delete(&self, id: &PluginId) {
        self.inner.remove(id);
    }

    /// Returns a consistent shallow copy of the whole map.
    pub fn snapshot(&self) -> HashMap<PluginId, PluginState> {
        self.inner
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Number of tracked plugins.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when no plugin is tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
