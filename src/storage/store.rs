//! # The external-store contract.
//!
//! The agent only ever talks to the shared store through this trait, so the
//! backend can vary (the reference [`MemoryStore`](super::MemoryStore) for
//! tests, a networked key-value/pub-sub store in production) without the
//! reconciler knowing.
//!
//! ## Persisted layout (shape, not encoding)
//! ```text
//! agent-status/{agent-id}      → state snapshot
//! test-run/{plugin-id}/…       → results
//! test-config/{name}           → versioned config
//! agent event stream           → presence messages
//! ```
//!
//! ## Rules
//! - `fetch_all_test_configs` is the cheap version-only listing the
//!   reconciler diffs against; full configs are fetched per test.
//! - Config-event signals are advisory: the payload only says "diff now",
//!   and consumers must tolerate coalesced or dropped signals.
//! - Every operation is cancellation-safe at the call boundary; callers wrap
//!   cleanup writes in short timeouts instead of trusting the backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::events::TestRunResult;
use crate::state::PluginState;
use crate::syntest::{PluginId, SynTestConfig};

/// Version-only listing of all test configs: test-name → version string.
pub type VersionMap = HashMap<String, String>;

/// Operations the agent consumes from the shared store.
#[async_trait]
pub trait SynTestStore: Send + Sync {
    /// Cheap health probe; failure at a sync tick is fatal to the agent.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Lists every test config's current version.
    async fn fetch_all_test_configs(&self) -> Result<VersionMap, StoreError>;

    /// Fetches one full test config by name.
    async fn fetch_test_config(&self, name: &str) -> Result<SynTestConfig, StoreError>;

    /// Forwards advisory config-change signals into `tx` until `ctx` is
    /// cancelled.
    ///
    /// Long-running; the caller spawns it. Signals that do not fit into `tx`
    /// may be dropped: every signal means the same thing ("diff now"), so
    /// coalescing is harmless.
    async fn subscribe_to_config_events(
        &self,
        ctx: CancellationToken,
        tx: mpsc::Sender<String>,
    ) -> Result<(), StoreError>;

    /// Publishes a presence message on the agent event stream.
    async fn new_agent_event(&self, message: &str) -> Result<(), StoreError>;

    /// Removes the agent's status entry.
    async fn delete_agent_status(&self, agent_id: &str) -> Result<(), StoreError>;

    /// Appends one test-run result under the plugin-id.
    async fn write_test_run_info(
        &self,
        plugin_id: &PluginId,
        result: &TestRunResult,
    ) -> Result<(), StoreError>;

    /// Removes everything stored under the plugin-id.
    async fn delete_all_test_run_info(&self, plugin_id: &PluginId) -> Result<(), StoreError>;

    /// Replaces the agent's status entry with a fresh state snapshot.
    async fn write_agent_status(
        &self,
        agent_id: &str,
        snapshot: &HashMap<PluginId, PluginState>,
    ) -> Result<(), StoreError>;
}

/// Shared handle to a store implementation.
pub type StoreRef = Arc<dyn SynTestStore>;
