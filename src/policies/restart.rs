//! # Restart policies for plugin supervisors.
//!
//! [`RestartPolicy`] determines whether a plugin is restarted after its run
//! returns.
//!
//! - [`RestartPolicy::Always`] the plugin is restarted unconditionally (default).
//! - [`RestartPolicy::Never`] the plugin runs once; a clean exit is terminal
//!   `NotRunning`, a failure is terminal `Error`.
//! - [`RestartPolicy::OnError`] the plugin is restarted only after a failure;
//!   a clean exit is terminal `NotRunning`.
//!
//! Policies arrive as free-form strings in test configs; parsing is lenient
//! because a typo in one test definition must not take the test down. It
//! falls back to `Always` with a warning.

use tracing::warn;

/// Policy controlling whether a plugin is restarted after its run returns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Restart unconditionally after every run (default).
    #[default]
    Always,
    /// Run once and stop, whatever the outcome.
    Never,
    /// Restart only after a failed run.
    OnError,
}

impl RestartPolicy {
    /// Parses a config string.
    ///
    /// Unrecognised values, the empty string included, warn and yield the
    /// default.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Always" => RestartPolicy::Always,
            "Never" => RestartPolicy::Never,
            "OnError" => RestartPolicy::OnError,
            other => {
                warn!(
                    policy = other,
                    default = RestartPolicy::Always.as_str(),
                    "restartPolicy not supported, using default"
                );
                RestartPolicy::Always
            }
        }
    }

    /// Returns the canonical config string.
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::Always => "Always",
            RestartPolicy::Never => "Never",
            RestartPolicy::OnError => "OnError",
        }
    }
}
