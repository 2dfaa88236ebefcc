//! # The synthetic-test plugin contract.
//!
//! A plugin implements one synthetic test: it runs (usually forever, on its
//! own cadence), emits a [`TestRunResult`] per iteration through its
//! [`ResultEmitter`], and returns when it is done or broken. The supervisor
//! decides what happens next from the returned `Result` and the restart
//! policy.
//!
//! ## Concurrency semantics
//! - `run` must honour its [`CancellationToken`]; the supervisor only exits
//!   after the current run returns.
//! - Each run invocation gets a fresh child token, so a single run can be
//!   interrupted without tearing down the supervisor's restart loop.
//!
//! ## Example
//! ```rust
//! use synagent::plugins::{PluginFn, PluginRef};
//!
//! let ping: PluginRef = PluginFn::arc(|ctx, emitter| async move {
//!     while !ctx.is_cancelled() {
//!         emitter.emit(true, "pong");
//!         tokio::select! {
//!             _ = ctx.cancelled() => break,
//!             _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {}
//!         }
//!     }
//!     Ok(())
//! });
//! # let _ = ping;
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PluginError;
use crate::events::{Broadcaster, TestRunResult};
use crate::syntest::{PluginId, SynTestConfig};

/// One synthetic test's executable implementation.
#[async_trait]
pub trait SynTestPlugin: Send + Sync {
    /// Runs the test until cancellation, completion, or failure.
    ///
    /// Expected to publish one result per iteration via `emitter` and to
    /// return promptly once `ctx` is cancelled.
    async fn run(&self, ctx: CancellationToken, emitter: ResultEmitter)
        -> Result<(), PluginError>;
}

/// Shared handle to a plugin implementation.
pub type PluginRef = Arc<dyn SynTestPlugin>;

/// Publishes results for one plugin-id.
///
/// Cheap to clone; every run invocation receives its own copy.
#[derive(Clone)]
pub struct ResultEmitter {
    plugin_id: PluginId,
    broadcaster: Broadcaster,
}

impl ResultEmitter {
    /// Binds a plugin-id to the broadcaster.
    pub fn new(plugin_id: PluginId, broadcaster: Broadcaster) -> Self {
        Self {
            plugin_id,
            broadcaster,
        }
    }

    /// Publishes one iteration's outcome, stamped with the current time.
    ///
    /// Returns `false` if the broadcaster refused the result (stopped or
    /// congested); the iteration is then lost, per the drop semantics.
    pub fn emit(&self, passed: bool, details: impl Into<String>) -> bool {
        self.broadcaster
            .publish(TestRunResult::now(self.plugin_id.clone(), passed, details))
    }

    /// The id results are published under.
    pub fn plugin_id(&self) -> &PluginId {
        &self.plugin_id
    }
}

/// Function-backed plugin implementation.
///
/// Wraps a closure that creates a fresh future per run, mirroring how a
/// process-backed plugin spawns a fresh child per run.
pub struct PluginFn<F> {
    f: F,
}

impl<F> PluginFn<F> {
    /// Creates a new function-backed plugin.
    pub fn new(f: F) -> Self {
        Self { f }
    }

    /// Creates the plugin and returns it as a shared [`PluginRef`].
    pub fn arc<Fut>(f: F) -> PluginRef
    where
        F: Fn(CancellationToken, ResultEmitter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PluginError>> + Send + 'static,
    {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl<F, Fut> SynTestPlugin for PluginFn<F>
where
    F: Fn(CancellationToken, ResultEmitter) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), PluginError>> + Send,
{
    async fn run(
        &self,
        ctx: CancellationToken,
        emitter: ResultEmitter,
    ) -> Result<(), PluginError> {
        (self.f)(ctx, emitter).await
    }
}

/// Factory producing a plugin instance for a concrete test config.
pub type PluginFactory = Arc<dyn Fn(&SynTestConfig) -> PluginRef + Send + Sync>;

/// Maps plugin names (as referenced by test configs) to factories.
///
/// The reconciler resolves `config.plugin_name` here before starting a
/// supervisor; an unknown name leaves the test in an Error state.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    inner: Arc<DashMap<String, PluginFactory>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under a plugin name, replacing any previous one.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&SynTestConfig) -> PluginRef + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(plugin = %name, "registering plugin factory");
        self.inner.insert(name, Arc::new(factory));
    }

    /// Instantiates the named plugin for the given config.
    pub fn resolve(&self, plugin_name: &str, config: &SynTestConfig) -> Option<PluginRef> {
        self.inner.get(plugin_name).map(|f| (f.value())(config))
    }

    /// True if a factory is registered under `plugin_name`.
    pub fn contains(&self, plugin_name: &str) -> bool {
        self.inner.contains_key(plugin_name)
    }
}
