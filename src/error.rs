//! # Error types used by the agent runtime, the store adapter, and plugins.
//!
//! This module defines three error enums, one per layer:
//!
//! - [`AgentError`] — conditions that concern the agent as a whole. Most of
//!   these are fatal at startup (bad config, missing identity) or escalate
//!   to the single fatal-exit path at steady state (store unreachable).
//! - [`StoreError`] — failures of individual external-store operations.
//! - [`PluginError`] — failures of a single plugin run; these feed the
//!   per-plugin restart policy and are never fatal to the agent.
//!
//! All types provide `as_label` for stable snake_case labels in logs and
//! metrics.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the agent runtime itself.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AgentError {
    /// The YAML config file could not be read.
    #[error("error reading config file {path}: {source}")]
    ConfigRead {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The YAML config file could not be parsed.
    #[error("error parsing config yaml {path}: {source}")]
    ConfigParse {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying parse error.
        source: serde_yaml::Error,
    },

    /// A required identity variable is absent from the environment.
    #[error("{var} missing from env")]
    MissingEnv {
        /// Name of the missing variable.
        var: &'static str,
    },

    /// The pod label file could not be read.
    #[error("error reading label file {path}: {source}")]
    LabelFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The discovery label is absent or not set to `"true"`.
    #[error("pod needs label {label} set to 'true'")]
    DiscoveryLabelMissing {
        /// The required label key.
        label: &'static str,
    },

    /// A duration field in the config is zero or missing.
    #[error("{field} must be a positive value")]
    NonPositiveDuration {
        /// The offending config field.
        field: &'static str,
    },

    /// A test's node selector is not a valid wildcard pattern.
    ///
    /// Never fatal: the reconciler logs this and skips the test.
    #[error("malformed node selector pattern '{pattern}'")]
    MalformedSelector {
        /// The rejected pattern.
        pattern: String,
    },

    /// The Prometheus exporter could not be created.
    #[error("error creating prometheus exporter: {reason}")]
    ExporterInit {
        /// Human-readable cause.
        reason: String,
    },

    /// An external-store condition that makes the agent meaningless.
    #[error("external store failure: {0}")]
    Store(#[from] StoreError),
}

impl AgentError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            AgentError::ConfigRead { .. } => "agent_config_read",
            AgentError::ConfigParse { .. } => "agent_config_parse",
            AgentError::MissingEnv { .. } => "agent_missing_env",
            AgentError::LabelFile { .. } => "agent_label_file",
            AgentError::DiscoveryLabelMissing { .. } => "agent_discovery_label",
            AgentError::NonPositiveDuration { .. } => "agent_bad_duration",
            AgentError::MalformedSelector { .. } => "agent_malformed_selector",
            AgentError::ExporterInit { .. } => "agent_exporter_init",
            AgentError::Store(_) => "agent_store",
        }
    }
}

/// Errors raised by external-store operations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or the call failed outright.
    #[error("store unavailable: {reason}")]
    Unavailable {
        /// Human-readable cause.
        reason: String,
    },

    /// The requested key does not exist.
    #[error("key not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// The config-event subscription ended unexpectedly.
    #[error("config event subscription closed")]
    SubscriptionClosed,

    /// A value could not be encoded for persistence.
    #[error("encode failure: {reason}")]
    Encode {
        /// Human-readable cause.
        reason: String,
    },
}

impl StoreError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            StoreError::Unavailable { .. } => "store_unavailable",
            StoreError::NotFound { .. } => "store_not_found",
            StoreError::SubscriptionClosed => "store_subscription_closed",
            StoreError::Encode { .. } => "store_encode",
        }
    }
}

/// Errors produced by a single plugin run.
///
/// A failed run is routed into the plugin's restart policy; it never
/// escalates past its supervisor.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PluginError {
    /// The run failed; the restart policy decides what happens next.
    #[error("plugin run failed: {reason}")]
    Fail {
        /// Human-readable cause, surfaced in the plugin's status message.
        reason: String,
    },
}

impl PluginError {
    /// Convenience constructor for [`PluginError::Fail`].
    pub fn fail(reason: impl Into<String>) -> Self {
        PluginError::Fail {
            reason: reason.into(),
        }
    }

    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            PluginError::Fail { .. } => "plugin_failed",
        }
    }
}
