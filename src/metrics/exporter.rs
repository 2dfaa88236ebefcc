//! # PrometheusExporter: metrics endpoint for test results.
//!
//! Subscribes to the [`Broadcaster`] and maintains one gauge family per
//! currently-tracked test (`synagent_syntest_<name>_status`, `1` = last run
//! passed, `0` = failed), plus agent-level counters for processed and
//! dropped results.
//!
//! Families are created lazily from incoming results. When the reconciler
//! signals a config change, the exporter swaps in a fresh registry: families
//! for deleted tests stop being exported, families for surviving tests
//! reappear with their next result.
//!
//! The HTTP endpoint serves `GET /metrics` as the Prometheus text exposition
//! at the configured address; creation fails if the address cannot be bound,
//! which is fatal to the agent.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, GaugeVec, IntCounter, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::events::{Broadcaster, TestRunResult, DEFAULT_SUBSCRIBER_CAPACITY};

type SharedRegistry = Arc<RwLock<Registry>>;

/// Exposes test-run results as Prometheus metrics over HTTP.
pub struct PrometheusExporter {
    agent_id: String,
    debug_mode: bool,
    registry: SharedRegistry,
    listener: Option<TcpListener>,
    families: HashMap<String, GaugeVec>,
    results_total: IntCounter,
    failed_total: IntCounter,
}

impl PrometheusExporter {
    /// Binds the metrics endpoint and prepares an empty registry.
    ///
    /// Fails if the address cannot be bound or the base collectors cannot be
    /// registered; both are fatal conditions for the agent.
    pub async fn new(
        agent_id: impl Into<String>,
        address: &str,
        debug_mode: bool,
    ) -> Result<Self, AgentError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| AgentError::ExporterInit {
                reason: format!("cannot bind {address}: {e}"),
            })?;

        let registry = Registry::new();
        let (results_total, failed_total) = register_base_collectors(&registry)?;

        info!(address, "prometheus exporter listening");
        Ok(Self {
            agent_id: agent_id.into(),
            debug_mode,
            registry: Arc::new(RwLock::new(registry)),
            listener: Some(listener),
            families: HashMap::new(),
            results_total,
            failed_total,
        })
    }

    /// Runs until cancellation: serves `/metrics`, records incoming results,
    /// and re-registers families when the config-change channel signals.
    pub async fn run(
        mut self,
        token: CancellationToken,
        broadcaster: &Broadcaster,
        mut config_change: mpsc::Receiver<()>,
    ) {
        let router = Router::new()
            .route("/metrics", get(serve_metrics))
            .with_state(self.registry.clone());
        let server = self.listener.take().map(|listener| {
            let server_token = token.clone();
            tokio::spawn(async move {
                let shutdown = server_token.cancelled_owned();
                if let Err(e) = axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    warn!(err = %e, "metrics server terminated");
                }
            })
        });

        let mut sub = broadcaster.subscribe(DEFAULT_SUBSCRIBER_CAPACITY);
        loop {
            select! {
                _ = token.cancelled() => break,
                received = sub.recv() => match received {
                    Some(result) => self.record(&result),
                    None => break,
                },
                signal = config_change.recv() => match signal {
                    Some(()) => self.reregister(),
                    None => break,
                },
            }
        }

        broadcaster.unsubscribe(sub.handle());
        if let Some(server) = server {
            let _ = server.await;
        }
        info!("prometheus exporter finished");
    }

    /// Updates the per-test family (creating it on first sight) and the
    /// agent-level counters.
    fn record(&mut self, result: &TestRunResult) {
        if self.debug_mode {
            debug!(plugin_id = %result.plugin_id, passed = result.passed, "recording result");
        }
        self.results_total.inc();
        if !result.passed {
            self.failed_total.inc();
        }

        let test = result.plugin_id.test_name().to_string();
        if !self.families.contains_key(&test) && !self.register_family(&test) {
            return;
        }
        let Some(family) = self.families.get(&test) else {
            return;
        };
        family
            .with_label_values(&[result.plugin_id.as_str(), &self.agent_id])
            .set(if result.passed { 1.0 } else { 0.0 });
    }

    /// Swaps in a fresh registry so families for deleted tests disappear.
    ///
    /// Surviving tests re-create their family on their next result.
    fn reregister(&mut self) {
        debug!("config changed, re-registering metric families");
        let fresh = Registry::new();
        match register_base_collectors(&fresh) {
            Ok((results_total, failed_total)) => {
                self.results_total = results_total;
                self.failed_total = failed_total;
            }
            Err(e) => {
                warn!(err = %e, "cannot re-register base collectors");
                return;
            }
        }
        self.families.clear();
        *write_lock(&self.registry) = fresh;
    }

    fn register_family(&mut self, test: &str) -> bool {
        let name = format!("synagent_syntest_{}_status", sanitize_metric_name(test));
        let gauge = match GaugeVec::new(
            Opts::new(
                name,
                format!("Last run status of syntest '{test}' (1 = passed)"),
            ),
            &["plugin_id", "agent"],
        ) {
            Ok(g) => g,
            Err(e) => {
                warn!(test, err = %e, "cannot build metric family");
                return false;
            }
        };
        if let Err(e) = read_lock(&self.registry).register(Box::new(gauge.clone())) {
            warn!(test, err = %e, "cannot register metric family");
            return false;
        }
        self.families.insert(test.to_string(), gauge);
        true
    }
}

fn register_base_collectors(registry: &Registry) -> Result<(IntCounter, IntCounter), AgentError> {
    let results_total = IntCounter::new(
        "synagent_results_total",
        "Test-run results processed by the exporter",
    )
    .map_err(exporter_init)?;
    let failed_total = IntCounter::new(
        "synagent_results_failed_total",
        "Failed test-run results processed by the exporter",
    )
    .map_err(exporter_init)?;
    registry
        .register(Box::new(results_total.clone()))
        .map_err(exporter_init)?;
    registry
        .register(Box::new(failed_total.clone()))
        .map_err(exporter_init)?;
    Ok((results_total, failed_total))
}

fn exporter_init(e: prometheus::Error) -> AgentError {
    AgentError::ExporterInit {
        reason: e.to_string(),
    }
}

/// Keeps only `[a-zA-Z0-9_]`, so any test name yields a legal metric name.
fn sanitize_metric_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

async fn serve_metrics(State(registry): State<SharedRegistry>) -> impl IntoResponse {
    let metric_families = read_lock(&registry).gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            buffer,
        )
            .into_response(),
        Err(e) => {
            warn!(err = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "encode failure").into_response()
        }
    }
}

fn read_lock(r: &RwLock<Registry>) -> std::sync::RwLockReadGuard<'_, Registry> {
    r.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock(r: &RwLock<Registry>) -> std::sync::RwLockWriteGuard<'_, Registry> {
    r.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntest::PluginId;

    fn gathered_names(exporter: &PrometheusExporter) -> Vec<String> {
        read_lock(&exporter.registry)
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect()
    }

    #[tokio::test]
    async fn records_one_family_per_test() {
        let mut exporter = PrometheusExporter::new("pod-1/infra", "127.0.0.1:0", false)
            .await
            .expect("bind ephemeral port");

        let dns = PluginId::compute("pod-1/infra", "dns");
        exporter.record(&TestRunResult::now(dns.clone(), true, "ok"));
        exporter.record(&TestRunResult::now(dns.clone(), false, "timeout"));
        exporter.record(&TestRunResult::now(
            PluginId::compute("pod-1/infra", "http-probe"),
            true,
            "ok",
        ));

        let names = gathered_names(&exporter);
        assert!(names.contains(&"synagent_syntest_dns_status".to_string()));
        assert!(names.contains(&"synagent_syntest_http_probe_status".to_string()));
        assert_eq!(exporter.results_total.get(), 3);
        assert_eq!(exporter.failed_total.get(), 1);
    }

    #[tokio::test]
    async fn config_change_drops_families_for_deleted_tests() {
        let mut exporter = PrometheusExporter::new("pod-1/infra", "127.0.0.1:0", false)
            .await
            .expect("bind ephemeral port");

        let dns = PluginId::compute("pod-1/infra", "dns");
        exporter.record(&TestRunResult::now(dns.clone(), true, "ok"));
        assert!(gathered_names(&exporter).contains(&"synagent_syntest_dns_status".to_string()));

        exporter.reregister();
        let names = gathered_names(&exporter);
        assert!(!names.iter().any(|n| n.contains("syntest_dns")));

        // A surviving test reappears with its next result.
        exporter.record(&TestRunResult::now(dns, false, "late"));
        assert!(gathered_names(&exporter).contains(&"synagent_syntest_dns_status".to_string()));
        assert_eq!(exporter.results_total.get(), 1);
    }

    #[test]
    fn sanitizes_metric_names() {
        assert_eq!(sanitize_metric_name("http-probe"), "http_probe");
        assert_eq!(sanitize_metric_name("dns.v2/check"), "dns_v2_check");
    }
}
