//! # Synthetic-test data model.
//!
//! Defines the two identifiers that everything else hangs off:
//!
//! - [`PluginId`] — the fleet-wide identity of one (agent, test) pair.
//! - [`SynTestConfig`] — the declarative test definition fetched from the
//!   external store.
//!
//! ## Rules
//! - A [`PluginId`] is immutable once computed: `agent-id + "/" + test-name`.
//! - Runtime identity fields injected by the agent use a `$` prefix, on the
//!   assumption that cluster labels never start with `$`.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::RunTimeInfo;

/// Runtime key for the node the agent runs on.
pub const RUNTIME_NODE_NAME: &str = "$nodeName";
/// Runtime key for the agent id.
pub const RUNTIME_AGENT_ID: &str = "$agentId";
/// Runtime key for the agent's pod name.
pub const RUNTIME_POD_NAME: &str = "$podName";
/// Runtime key for the agent's namespace.
pub const RUNTIME_AGENT_NAMESPACE: &str = "$agentNamespace";

/// Fleet-wide identifier of one (agent, test) pair.
///
/// Computed once as `agent-id + "/" + test-name` and never mutated.
/// Used as the key of the [`StateMap`](crate::state::StateMap), in persisted
/// result paths, and on every [`TestRunResult`](crate::events::TestRunResult).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(String);

impl PluginId {
    /// Computes the id for a test running on the given agent.
    pub fn compute(agent_id: &str, test_name: &str) -> Self {
        Self(format!("{agent_id}/{test_name}"))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the test-name component (the segment after the last `/`).
    pub fn test_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PluginId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Declarative synthetic-test definition, as stored in the external store.
///
/// The reconciler fetches these by name, filters them through the agent
/// selector, and hands matching ones to a
/// [`PluginSupervisor`](crate::plugins::PluginSupervisor).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SynTestConfig {
    /// Unique test name within the store.
    pub name: String,
    /// Which registered plugin implements this test.
    pub plugin_name: String,
    /// Namespace the test belongs to.
    pub namespace: String,
    /// Shell-style glob matched against the agent's node name (empty = any).
    pub node_selector: String,
    /// Labels that must all be present on the agent's pod (empty = any).
    pub pod_label_selector: HashMap<String, String>,
    /// Restart policy string; unrecognised values fall back to `Always`.
    pub plugin_restart_policy: String,
    /// Free-form parameters handed to the plugin. The agent injects its
    /// identity under `$`-prefixed keys before starting the supervisor.
    pub runtime: HashMap<String, String>,
}

impl SynTestConfig {
    /// Injects the agent's runtime identity and pod labels into `runtime`.
    ///
    /// Called by the reconciler just before a supervisor is started, so the
    /// plugin can see where it is running without talking to the API server.
    pub fn inject_runtime(&mut self, runtime: &RunTimeInfo, agent_id: &str) {
        self.runtime
            .insert(RUNTIME_NODE_NAME.into(), runtime.node_name.clone());
        self.runtime
            .insert(RUNTIME_AGENT_ID.into(), agent_id.to_string());
        self.runtime
            .insert(RUNTIME_POD_NAME.into(), runtime.pod_name.clone());
        self.runtime.insert(
            RUNTIME_AGENT_NAMESPACE.into(),
            runtime.namespace.clone(),
        );
        for (k, v) in &runtime.pod_labels {
            self.runtime.insert(k.clone(), v.clone());
        }
    }
}
