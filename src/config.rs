//! # Agent configuration and bootstrap.
//!
//! [`AgentConfig`] is loaded in two steps:
//!
//! 1. Parse the YAML config file (camelCase keys, durations as positive
//!    integer seconds).
//! 2. Resolve the agent's runtime identity from the environment
//!    (`NODE_NAME`, `POD_NAME`, `NAMESPACE`) and the pod label file.
//!
//! Both steps are fatal on failure: an agent without identity or with a
//! non-positive sync frequency is meaningless, so [`AgentConfig::load`]
//! returns an error and the embedding binary exits.
//!
//! ## Label file
//! UTF-8 text, one `key=value` per line (the downward-API format). Blank
//! lines are ignored; lines without exactly one `=` are warned about and
//! skipped. The discovery label [`DISCOVER_LABEL`] must be present with the
//! value `"true"`, otherwise the pod is not meant to run an agent.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::AgentError;

/// Default location of the pod label file (kubernetes downward API volume).
pub const DEFAULT_LABEL_FILE: &str = "/etc/podinfo/labels";

/// Label that must be set to `"true"` for the agent to start.
pub const DISCOVER_LABEL: &str = "synagent.io/discover";

/// When to echo a finished plugin run's log output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrintPluginLogs {
    /// Only after a failed run.
    OnFail,
    /// Never (default).
    #[default]
    Never,
    /// After every run.
    Always,
}

impl PrintPluginLogs {
    /// Normalises a raw config string; anything unrecognised becomes `Never`.
    pub fn normalize(raw: &str) -> Self {
        match raw {
            "onFail" => PrintPluginLogs::OnFail,
            "always" => PrintPluginLogs::Always,
            _ => PrintPluginLogs::Never,
        }
    }
}

/// Prometheus exporter settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrometheusConfig {
    /// Listen address for the metrics endpoint; empty disables the exporter.
    pub server_address: String,
}

/// Runtime identity of this agent, resolved from the environment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunTimeInfo {
    /// Node the agent's pod is scheduled on (`NODE_NAME`).
    pub node_name: String,
    /// The agent's pod name (`POD_NAME`).
    pub pod_name: String,
    /// The agent's namespace (`NAMESPACE`).
    pub namespace: String,
    /// Labels parsed from the pod label file.
    pub pod_labels: HashMap<String, String>,
}

/// Raw YAML shape of the agent config file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AgentConfigFile {
    watch_own_namespace_only: bool,
    label_file_location: String,
    /// Seconds between periodic sync ticks; must be positive.
    sync_frequency: u64,
    /// Seconds to wait for in-flight results during shutdown; must be positive.
    grace_period: u64,
    prometheus: PrometheusConfig,
    /// Implementation-specific store settings, passed through opaquely.
    storage: HashMap<String, serde_yaml::Value>,
    print_plugin_logs: String,
    debug_mode: bool,
}

/// Effective agent configuration: file settings plus resolved identity.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Only consider tests whose namespace equals the agent's.
    pub watch_own_namespace_only: bool,
    /// Path of the pod label file.
    pub label_file_location: String,
    /// Interval of the periodic sync tick.
    pub sync_frequency: Duration,
    /// Shutdown delay that lets in-flight results drain.
    pub grace_period: Duration,
    /// Prometheus exporter settings.
    pub prometheus: PrometheusConfig,
    /// Implementation-specific store settings, passed through opaquely.
    pub storage: HashMap<String, serde_yaml::Value>,
    /// When to echo plugin run logs.
    pub print_plugin_logs: PrintPluginLogs,
    /// Extra diagnostics in the exporter and supervisors.
    pub debug_mode: bool,
    /// Resolved runtime identity.
    pub runtime: RunTimeInfo,
    /// This agent's fleet-wide id (`AGENT_ID` env, or `pod-name/namespace`).
    pub agent_id: String,
}

impl Default for AgentConfig {
    /// Test-friendly defaults; production configs come from [`AgentConfig::load`].
    fn default() -> Self {
        Self {
            watch_own_namespace_only: false,
            label_file_location: DEFAULT_LABEL_FILE.to_string(),
            sync_frequency: Duration::from_secs(30),
            grace_period: Duration::from_secs(3),
            prometheus: PrometheusConfig::default(),
            storage: HashMap::new(),
            print_plugin_logs: PrintPluginLogs::Never,
            debug_mode: false,
            runtime: RunTimeInfo::default(),
            agent_id: String::new(),
        }
    }
}

impl AgentConfig {
    /// Loads the YAML config file and resolves the agent's identity.
    ///
    /// Fatal on: unreadable/invalid YAML, missing `NODE_NAME` / `POD_NAME` /
    /// `NAMESPACE`, unreadable label file, missing discovery label, or a
    /// non-positive `syncFrequency` / `gracePeriod`.
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let raw = std::fs::read_to_string(path).map_err(|source| AgentError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let file: AgentConfigFile =
            serde_yaml::from_str(&raw).map_err(|source| AgentError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;

        let label_file = if file.label_file_location.is_empty() {
            DEFAULT_LABEL_FILE.to_string()
        } else {
            file.label_file_location.clone()
        };

        let mut runtime = RunTimeInfo {
            node_name: require_env("NODE_NAME")?,
            pod_name: require_env("POD_NAME")?,
            namespace: require_env("NAMESPACE")?,
            pod_labels: HashMap::new(),
        };
        runtime.pod_labels = parse_label_file(Path::new(&label_file))?;

        match runtime.pod_labels.get(DISCOVER_LABEL) {
            Some(v) if v == "true" => {}
            _ => {
                return Err(AgentError::DiscoveryLabelMissing {
                    label: DISCOVER_LABEL,
                })
            }
        }

        let agent_id = match std::env::var("AGENT_ID") {
            Ok(id) if !id.is_empty() => id,
            _ => format!("{}/{}", runtime.pod_name, runtime.namespace),
        };

        let cfg = Self {
            watch_own_namespace_only: file.watch_own_namespace_only,
            label_file_location: label_file,
            sync_frequency: Duration::from_secs(file.sync_frequency),
            grace_period: Duration::from_secs(file.grace_period),
            prometheus: file.prometheus,
            storage: file.storage,
            print_plugin_logs: PrintPluginLogs::normalize(&file.print_plugin_logs),
            debug_mode: file.debug_mode,
            runtime,
            agent_id,
        };
        cfg.validate()?;

        info!(agent_id = %cfg.agent_id, "agent identity resolved");
        debug!(config = ?cfg, "running with config");
        Ok(cfg)
    }

    /// Validates duration fields; both must be strictly positive.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.grace_period.is_zero() {
            return Err(AgentError::NonPositiveDuration {
                field: "gracePeriod",
            });
        }
        if self.sync_frequency.is_zero() {
            return Err(AgentError::NonPositiveDuration {
                field: "syncFrequency",
            });
        }
        Ok(())
    }
}

fn require_env(var: &'static str) -> Result<String, AgentError> {
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(AgentError::MissingEnv { var }),
    }
}

/// Parses the pod label file into a label map.
///
/// Lines without exactly one `=` are warned about and skipped.
pub fn parse_label_file(path: &Path) -> Result<HashMap<String, String>, AgentError> {
    debug!(file = %path.display(), "parsing label file");
    let data = std::fs::read_to_string(path).map_err(|source| AgentError::LabelFile {
        path: path.to_path_buf(),
        source,
    })?;

    let mut labels = HashMap::new();
    for line in data.lines() {
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, '=');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(k), Some(v), None) => {
                labels.insert(k.to_string(), v.to_string());
            }
            _ => {
                warn!(line, "invalid label line");
            }
        }
    }
    Ok(labels)
}

/// Initialises the global tracing subscriber from the `LOG_LEVEL` env var.
///
/// Unparseable or absent values fall back to `info`. Safe to call more than
/// once; later calls are no-ops.
pub fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_default();
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
