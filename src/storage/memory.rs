//! # In-process reference store.
//!
//! [`MemoryStore`] implements the full store contract against process-local
//! maps. It exists for unit/integration tests and local demos; a production
//! deployment plugs a networked backend in behind the same trait.
//!
//! Mutators (`put_test_config`, `remove_test_config`) fire a config-event
//! signal, so a reconciler wired to this store reacts to changes the same
//! way it would against a real pub/sub backend. `set_unreachable` makes
//! every operation fail, for exercising the agent's fatal paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::StoreError;
use crate::events::TestRunResult;
use crate::state::PluginState;
use crate::storage::{SynTestStore, VersionMap};
use crate::syntest::{PluginId, SynTestConfig};

const SIGNAL_FANOUT: usize = 16;

/// In-memory implementation of [`SynTestStore`].
pub struct MemoryStore {
    configs: DashMap<String, (String, SynTestConfig)>,
    test_runs: DashMap<PluginId, Vec<TestRunResult>>,
    deleted_runs: Mutex<Vec<PluginId>>,
    agent_status: DashMap<String, HashMap<PluginId, PluginState>>,
    agent_events: Mutex<Vec<String>>,
    signals: broadcast::Sender<String>,
    unreachable: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_FANOUT);
        Self {
            configs: DashMap::new(),
            test_runs: DashMap::new(),
            deleted_runs: Mutex::new(Vec::new()),
            agent_status: DashMap::new(),
            agent_events: Mutex::new(Vec::new()),
            signals,
            unreachable: AtomicBool::new(false),
        }
    }

    /// Stores (or replaces) a test config at the given version and fires a
    /// config signal.
    pub fn put_test_config(&self, name: &str, version: &str, config: SynTestConfig) {
        self.configs
            .insert(name.to_string(), (version.to_string(), config));
        self.signal();
    }

    /// Removes a test config and fires a config signal.
    pub fn remove_test_config(&self, name: &str) {
        self.configs.remove(name);
        self.signal();
    }

    /// Fires an advisory config signal without changing anything.
    pub fn signal(&self) {
        let _ = self.signals.send("config".to_string());
    }

    /// Makes every subsequent operation fail (or succeed again).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Results persisted so far for one plugin-id.
    pub fn test_runs_for(&self, plugin_id: &PluginId) -> Vec<TestRunResult> {
        self.test_runs
            .get(plugin_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Plugin-ids whose run info was deleted, in call order.
    pub fn deleted_run_info(&self) -> Vec<PluginId> {
        lock(&self.deleted_runs).clone()
    }

    /// Presence messages published so far, in call order.
    pub fn agent_events(&self) -> Vec<String> {
        lock(&self.agent_events).clone()
    }

    /// The last written status snapshot for an agent, if any.
    pub fn agent_status_for(&self, agent_id: &str) -> Option<HashMap<PluginId, PluginState>> {
        self.agent_status.get(agent_id).map(|e| e.value().clone())
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "memory store marked unreachable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SynTestStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_reachable()
    }

    async fn fetch_all_test_configs(&self) -> Result<VersionMap, StoreError> {
        self.check_reachable()?;
        Ok(self
            .configs
            .iter()
            .map(|e| (e.key().clone(), e.value().0.clone()))
            .collect())
    }

    async fn fetch_test_config(&self, name: &str) -> Result<SynTestConfig, StoreError> {
        self.check_reachable()?;
        self.configs
            .get(name)
            .map(|e| e.value().1.clone())
            .ok_or_else(|| StoreError::NotFound {
                key: format!("test-config/{name}"),
            })
    }

    async fn subscribe_to_config_events(
        &self,
        ctx: CancellationToken,
        tx: mpsc::Sender<String>,
    ) -> Result<(), StoreError> {
        self.check_reachable()?;
        let mut rx = self.signals.subscribe();
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                msg = rx.recv() => match msg {
                    Ok(signal) => {
                        if tx.try_send(signal).is_err() {
                            // Signals are advisory; a full consumer already
                            // has a diff pending.
                            warn!("config signal dropped, consumer busy");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(StoreError::SubscriptionClosed)
                    }
                },
            }
        }
    }

    async fn new_agent_event(&self, message: &str) -> Result<(), StoreError> {
        self.check_reachable()?;
        lock(&self.agent_events).push(message.to_string());
        Ok(())
    }

    async fn delete_agent_status(&self, agent_id: &str) -> Result<(), StoreError> {
        self.check_reachable()?;
        self.agent_status.remove(agent_id);
        Ok(())
    }

    async fn write_test_run_info(
        &self,
        plugin_id: &PluginId,
        result: &TestRunResult,
    ) -> Result<(), StoreError> {
        self.check_reachable()?;
        self.test_runs
            .entry(plugin_id.clone())
            .or_default()
            .push(result.clone());
        Ok(())
    }

    async fn delete_all_test_run_info(&self, plugin_id: &PluginId) -> Result<(), StoreError> {
        self.check_reachable()?;
        self.test_runs.remove(plugin_id);
        lock(&self.deleted_runs).push(plugin_id.clone());
        Ok(())
    }

    async fn write_agent_status(
        &self,
        agent_id: &str,
        snapshot: &HashMap<PluginId, PluginState>,
    ) -> Result<(), StoreError> {
        self.check_reachable()?;
        self.agent_status
            .insert(agent_id.to_string(), snapshot.clone());
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
