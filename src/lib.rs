//! # synagent
//!
//! **Synagent** is a per-node synthetic-test agent: a long-running
//! supervisor that discovers declarative test definitions from a shared
//! store, decides which of them apply to this agent, and runs each one as a
//! supervised plugin whose results are fanned out to storage and metrics.
//!
//! ## Features
//!
//! | Area             | Description                                                        | Key types / traits                       |
//! |------------------|--------------------------------------------------------------------|------------------------------------------|
//! | **Reconciler**   | Converge running supervisors to the store's desired set.           | [`PluginManager`]                        |
//! | **Supervision**  | Run one plugin per test with restart policies and backoff.         | [`PluginSupervisor`], [`RestartPolicy`]  |
//! | **Fan-out**      | Non-blocking result pub/sub with per-subscriber drop accounting.   | [`Broadcaster`], [`TestRunResult`]       |
//! | **Store**        | Key-value / pub-sub store contract plus an in-memory reference.    | [`SynTestStore`], [`MemoryStore`]        |
//! | **Metrics**      | One Prometheus family per tracked test over HTTP.                  | [`PrometheusExporter`]                   |
//! | **Plugins**      | The async contract a synthetic test implements.                    | [`SynTestPlugin`], [`PluginFn`]          |
//! | **Bootstrap**    | YAML config, env identity, pod labels, logging.                    | [`AgentConfig`]                          |
//! | **Errors**       | Typed errors per layer with stable labels.                         | [`AgentError`], [`PluginError`]          |
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use synagent::{AgentConfig, MemoryStore, PluginFn, PluginManager, PluginRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     synagent::config::init_tracing();
//!     let config = AgentConfig::load(Path::new("/etc/synagent/config.yaml"))?;
//!
//!     // Register the plugins this build ships with.
//!     let registry = PluginRegistry::new();
//!     registry.register("ping", |_cfg| {
//!         PluginFn::arc(|ctx, emitter| async move {
//!             while !ctx.is_cancelled() {
//!                 emitter.emit(true, "pong");
//!                 tokio::select! {
//!                     _ = ctx.cancelled() => {}
//!                     _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {}
//!                 }
//!             }
//!             Ok(())
//!         })
//!     });
//!
//!     // A real deployment plugs a networked store in here.
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let token = CancellationToken::new();
//!     synagent::os_signals::cancel_on_shutdown_signal(&token);
//!
//!     let mut manager = PluginManager::new(config, store, registry);
//!     manager.start(token).await?;
//!     Ok(())
//! }
//! ```
//!
//! ---

pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod metrics;
pub mod os_signals;
pub mod plugins;
pub mod policies;
pub mod state;
pub mod storage;
pub mod syntest;

// ---- Public re-exports ----

pub use config::{AgentConfig, PrintPluginLogs, RunTimeInfo};
pub use error::{AgentError, PluginError, StoreError};
pub use events::{Broadcaster, SubscriberHandle, Subscription, TestRunResult};
pub use manager::{agent_selector_matches, PluginManager};
pub use metrics::PrometheusExporter;
pub use plugins::{PluginFn, PluginRef, PluginRegistry, PluginSupervisor, ResultEmitter, SynTestPlugin};
pub use policies::RestartPolicy;
pub use state::{PluginState, PluginStatus, StateMap};
pub use storage::{ExtStorageHandler, MemoryStore, StoreRef, SynTestStore};
pub use syntest::{PluginId, SynTestConfig};
