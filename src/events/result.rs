//! # Test-run results flowing through the broadcaster.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::syntest::PluginId;

/// Outcome of one synthetic-test iteration.
///
/// Published by a plugin (via its
/// [`ResultEmitter`](crate::plugins::ResultEmitter)) and fanned out to every
/// broadcaster subscriber. The broadcaster treats the payload as opaque.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestRunResult {
    /// Which (agent, test) pair produced this result.
    pub plugin_id: PluginId,
    /// When the iteration finished (unix seconds).
    pub timestamp: u64,
    /// Whether the iteration passed.
    pub passed: bool,
    /// Free-form detail payload (diagnostics, measured values, logs).
    pub details: String,
}

impl TestRunResult {
    /// Creates a result stamped with the current wall-clock time.
    pub fn now(plugin_id: PluginId, passed: bool, details: impl Into<String>) -> Self {
        Self {
            plugin_id,
            timestamp: unix_seconds(),
            passed,
            details: details.into(),
        }
    }
}

/// Current wall-clock time as unix seconds.
pub(crate) fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
