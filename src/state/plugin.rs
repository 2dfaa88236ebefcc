//! # Lifecycle state of one supervised plugin.
//!
//! [`PluginState`] is the snapshot other components read: the supervisor is
//! the only writer for its id, everyone else (status writeback, exporter,
//! operators) sees copies taken through the [`StateMap`](super::StateMap).
//!
//! ## Counter semantics
//! `restarts` and `total_restarts` start at `-1` and are incremented on every
//! entry to the Running phase, so the first run observes `0` and the backoff
//! sequence starts at its base delay. `restarts` is reset to `0` after a
//! sufficiently long Running phase; `total_restarts` never decreases.

use serde::{Deserialize, Serialize};

use crate::syntest::SynTestConfig;

/// Lifecycle phase of a supervised plugin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginStatus {
    /// Supervisor created but the first run has not started yet.
    #[default]
    Unknown,
    /// A run is in progress.
    Running,
    /// The last run ended and the supervisor is sleeping before a restart.
    RestartBackOff,
    /// The plugin exited cleanly and the policy forbids a restart (terminal).
    NotRunning,
    /// The plugin failed and the policy forbids a restart (terminal).
    Error,
}

impl PluginStatus {
    /// Returns a short stable label.
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginStatus::Unknown => "unknown",
            PluginStatus::Running => "running",
            PluginStatus::RestartBackOff => "restart_backoff",
            PluginStatus::NotRunning => "not_running",
            PluginStatus::Error => "error",
        }
    }

    /// True for the two states a supervisor never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PluginStatus::NotRunning | PluginStatus::Error)
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one plugin's lifecycle, keyed by plugin-id in the state map.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PluginState {
    /// Current lifecycle phase.
    pub status: PluginStatus,
    /// Message describing the current phase (e.g. the last run error).
    pub status_msg: String,
    /// The previous status message, rotated out on each transition.
    pub last_msg: String,
    /// Restarts in the current run streak; reset after a long stable run.
    pub restarts: i64,
    /// Restarts over the state's whole lifetime; monotone non-decreasing.
    pub total_restarts: i64,
    /// Wall-clock start of the current Running phase (unix seconds).
    ///
    /// For display only; the supervisor measures run length monotonically.
    pub running_since: Option<u64>,
    /// The config this plugin is running with.
    pub config: SynTestConfig,
}

impl PluginState {
    /// Creates the initial state recorded before the supervisor's first run.
    pub fn new(config: SynTestConfig) -> Self {
        Self {
            status: PluginStatus::Unknown,
            status_msg: String::new(),
            last_msg: String::new(),
            restarts: -1,
            total_restarts: -1,
            running_since: None,
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_unknown_with_counters_primed() {
        let s = PluginState::new(SynTestConfig::default());
        assert_eq!(s.status, PluginStatus::Unknown);
        assert_eq!(s.restarts, -1);
        assert_eq!(s.total_restarts, -1);
        assert!(s.running_since.is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(PluginStatus::NotRunning.is_terminal());
        assert!(PluginStatus::Error.is_terminal());
        assert!(!PluginStatus::Running.is_terminal());
        assert!(!PluginStatus::RestartBackOff.is_terminal());
        assert!(!PluginStatus::Unknown.is_terminal());
    }
}
