//! Prometheus export of test-run results.

mod exporter;

pub use exporter::PrometheusExporter;
