//! # PluginManager: the reconciliation loop.
//!
//! Owns the set of running supervisors and makes it converge to the store's
//! desired set.
//!
//! ## Architecture
//! ```text
//! store ──config events──► ┌───────────────┐
//! store ◄──fetch/persist── │ PluginManager │──► supervisor per matched test
//!        tick (sync freq)─►└───────┬───────┘          │ publishes
//!                                  │                  ▼
//!                         config-changed        ┌─────────────┐
//!                                  │            │ Broadcaster │
//!                                  ▼            └──────┬──────┘
//!                          PrometheusExporter ◄────────┼──► ExtStorageHandler
//! ```
//!
//! ## Rules
//! - The running-records map is owned by this loop alone; stop-then-start
//!   for one test name is strictly serialised, so at most one supervisor per
//!   plugin-id ever exists.
//! - Each sync trigger first sleeps a small random jitter so a fleet of
//!   agents doesn't hammer the store in lockstep.
//! - The config-signal channel is small and lossy; a dropped signal is
//!   harmless because every signal means "diff now" and the periodic tick
//!   guarantees forward progress anyway.
//! - Fatal conditions funnel through one path that records the first cause
//!   and cancels the root token, so the normal shutdown sequence always
//!   runs; [`PluginManager::start`] then returns the cause.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::events::Broadcaster;
use crate::manager::agent_selector_matches;
use crate::metrics::PrometheusExporter;
use crate::plugins::{PluginRegistry, PluginSupervisor, ResultEmitter};
use crate::policies::RestartPolicy;
use crate::state::{PluginState, PluginStatus, StateMap};
use crate::storage::{ExtStorageHandler, StoreRef};
use crate::syntest::{PluginId, SynTestConfig};

/// Capacity of the advisory config-signal channel; overflow coalesces.
const CONFIG_SIGNAL_BUFFER: usize = 2;

/// Capacity of the exporter's config-changed channel.
const PROM_SIGNAL_BUFFER: usize = 2;

/// Upper bound of the random per-sync jitter.
const MAX_SYNC_JITTER: Duration = Duration::from_millis(3000);

/// Budget for each cleanup write during stop/unregister paths.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// One running synthetic test: its config, the store version it was started
/// from, and the handles to stop it.
struct SynTestRecord {
    config: SynTestConfig,
    version: String,
    cancel: CancellationToken,
    done: JoinHandle<()>,
}

/// Records the first fatal cause and cancels the root token so the ordered
/// shutdown sequence runs.
#[derive(Clone)]
struct FatalSignal {
    token: CancellationToken,
    cause: Arc<Mutex<Option<AgentError>>>,
}

impl FatalSignal {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            cause: Arc::new(Mutex::new(None)),
        }
    }

    fn trip(&self, err: AgentError) {
        error!(err = %err, label = err.as_label(), "FATAL error");
        let mut cause = lock(&self.cause);
        if cause.is_none() {
            *cause = Some(err);
        }
        drop(cause);
        self.token.cancel();
    }

    fn take(&self) -> Option<AgentError> {
        lock(&self.cause).take()
    }
}

/// The agent's top-level component: reconciles store config against the set
/// of running plugin supervisors and owns the fan-out fabric around them.
pub struct PluginManager {
    agent_id: String,
    config: AgentConfig,
    state: StateMap,
    broadcaster: Broadcaster,
    esh: ExtStorageHandler,
    registry: PluginRegistry,
    tests: HashMap<String, SynTestRecord>,
}

impl PluginManager {
    /// Creates a manager from a loaded config, a store handle, and the
    /// plugin registry.
    pub fn new(config: AgentConfig, store: StoreRef, registry: PluginRegistry) -> Self {
        let agent_id = config.agent_id.clone();
        let esh = ExtStorageHandler::new(agent_id.clone(), store, config.sync_frequency);
        info!(agent_id = %agent_id, "plugin manager created");
        Self {
            agent_id,
            config,
            state: StateMap::new(),
            broadcaster: Broadcaster::new(),
            esh,
            registry,
            tests: HashMap::new(),
        }
    }

    /// The shared state map (snapshots for status, tests, debugging).
    pub fn state(&self) -> StateMap {
        self.state.clone()
    }

    /// The result broadcaster (extra subscribers are welcome).
    pub fn broadcaster(&self) -> Broadcaster {
        self.broadcaster.clone()
    }

    /// Runs the agent until `token` is cancelled or a fatal condition trips.
    ///
    /// This is the agent's main loop: it starts the broadcaster, the storage
    /// handler, the config-event subscription and the Prometheus exporter,
    /// announces the agent, then reconciles on every config signal and on a
    /// periodic tick. On exit it runs the ordered shutdown sequence and
    /// returns the fatal cause, if any.
    pub async fn start(&mut self, token: CancellationToken) -> Result<(), AgentError> {
        let fatal = FatalSignal::new(token.clone());

        self.broadcaster.start();

        info!("starting ext-storage handler");
        let esh_token = token.child_token();
        let esh_task = {
            let esh = self.esh.clone();
            let broadcaster = self.broadcaster.clone();
            let state = self.state.clone();
            let token = esh_token.clone();
            let fatal = fatal.clone();
            tokio::spawn(async move {
                if let Err(e) = esh.run(token.clone(), &broadcaster, &state).await {
                    if !token.is_cancelled() {
                        fatal.trip(e);
                    }
                }
            })
        };

        info!("subscribing to config changes from ext-storage");
        let (config_tx, mut config_rx) = mpsc::channel::<String>(CONFIG_SIGNAL_BUFFER);
        let watch_token = token.child_token();
        let watch_task = {
            let store = self.esh.store().clone();
            let tx = config_tx.clone();
            let token = watch_token.clone();
            let fatal = fatal.clone();
            tokio::spawn(async move {
                if let Err(e) = store.subscribe_to_config_events(token.clone(), tx).await {
                    if !token.is_cancelled() {
                        fatal.trip(AgentError::Store(e));
                    }
                }
            })
        };

        let prom_token = token.child_token();
        let (prom_tx, prom_rx) = mpsc::channel::<()>(PROM_SIGNAL_BUFFER);
        let prom_task = self.start_prometheus(&prom_token, prom_rx, &fatal).await;

        // Tell the fleet (and the controller) that a new agent is joining.
        let _ = self
            .esh
            .store()
            .new_agent_event(&format!("new agent: {}", self.agent_id))
            .await;

        // Force a first sync without waiting for a store event.
        let _ = config_tx.try_send("init".to_string());

        let mut ticker = interval_at(
            Instant::now() + self.config.sync_frequency,
            self.config.sync_frequency,
        );

        info!("listening for syntest config changes");
        loop {
            select! {
                _ = token.cancelled() => break,
                signal = config_rx.recv() => match signal {
                    Some(signal) => {
                        debug!(signal = %signal, "sync triggered by config signal");
                        self.jitter_sleep(&token).await;
                        self.sync_and_signal(&token, &prom_tx, &fatal).await;
                    }
                    None => {
                        // The forwarder is gone without tripping fatal itself.
                        fatal.trip(AgentError::Store(
                            crate::error::StoreError::SubscriptionClosed,
                        ));
                    }
                },
                _ = ticker.tick() => {
                    debug!("sync triggered by timer, checking store connection");
                    if let Err(e) = self.esh.store().ping().await {
                        fatal.trip(AgentError::Store(e));
                        continue;
                    }
                    self.sync_and_signal(&token, &prom_tx, &fatal).await;
                }
            }
        }

        self.shutdown(esh_token, esh_task, watch_task, prom_token, prom_task)
            .await;
        fatal.take().map_or(Ok(()), Err)
    }

    /// Starts the exporter when an address is configured; trips fatal when
    /// it cannot be created.
    async fn start_prometheus(
        &self,
        prom_token: &CancellationToken,
        prom_rx: mpsc::Receiver<()>,
        fatal: &FatalSignal,
    ) -> Option<JoinHandle<()>> {
        let address = self.config.prometheus.server_address.clone();
        if address.is_empty() {
            debug!("no prometheus address configured, exporter disabled");
            return None;
        }
        match PrometheusExporter::new(&self.agent_id, &address, self.config.debug_mode).await {
            Ok(exporter) => {
                let broadcaster = self.broadcaster.clone();
                let token = prom_token.clone();
                Some(tokio::spawn(async move {
                    exporter.run(token, &broadcaster, prom_rx).await;
                }))
            }
            Err(e) => {
                fatal.trip(e);
                None
            }
        }
    }

    /// Random short sleep before a sync, to desynchronise agent fleets.
    async fn jitter_sleep(&self, token: &CancellationToken) {
        let jitter =
            Duration::from_millis(rand::rng().random_range(0..MAX_SYNC_JITTER.as_millis() as u64));
        select! {
            _ = token.cancelled() => {}
            _ = sleep(jitter) => {}
        }
    }

    /// Runs a sync; fatal on store listing errors, signals the exporter on
    /// any start/stop.
    async fn sync_and_signal(
        &mut self,
        token: &CancellationToken,
        prom_tx: &mpsc::Sender<()>,
        fatal: &FatalSignal,
    ) {
        if token.is_cancelled() {
            return;
        }
        match self.sync_config(token).await {
            Ok(true) => {
                let _ = prom_tx.try_send(());
            }
            Ok(false) => {}
            Err(e) => {
                error!("cannot sync configs, no point continuing");
                fatal.trip(e);
            }
        }
    }

    /// One reconcile pass: diff the store's version map against the running
    /// set and apply stop/start decisions. Returns whether anything changed.
    async fn sync_config(&mut self, token: &CancellationToken) -> Result<bool, AgentError> {
        debug!("syncing syntest configs");
        let mut changed = false;
        let latest = self.esh.store().fetch_all_test_configs().await?;

        // Running tests that disappeared from the store.
        let running: Vec<String> = self.tests.keys().cloned().collect();
        for name in running {
            if !latest.contains_key(&name) {
                info!(test = %name, "syntest deleted");
                self.stop_and_delete(&name).await;
                changed = true;
            }
        }

        // New tests, and version changes of running ones.
        for (name, version) in &latest {
            if let Some(record) = self.tests.get(name) {
                if &record.version == version {
                    continue;
                }
            }
            let config = match self.esh.store().fetch_test_config(name).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(test = %name, err = %e, "error getting latest config");
                    continue;
                }
            };
            if let Some(record) = self.tests.get(name) {
                info!(
                    test = %name,
                    old = %record.version,
                    new = %version,
                    "syntest config changed"
                );
                self.stop_and_delete(name).await;
                changed = true;
            }

            debug!(test = %name, "checking if test matches agent selector");
            match agent_selector_matches(
                &config,
                &self.config.runtime,
                self.config.watch_own_namespace_only,
            ) {
                Ok(true) => {
                    info!(test = %name, "(re)starting syntest");
                    self.start_test(token, name, version, config);
                    changed = true;
                }
                Ok(false) => {
                    debug!(
                        test = %name,
                        selector = %config.node_selector,
                        "not running test as it didn't match agent selector"
                    );
                }
                Err(e) => {
                    warn!(test = %name, err = %e, "selector evaluation failed, skipping test");
                }
            }
        }
        debug!("finished syncing syntest configs");
        Ok(changed)
    }

    /// Starts a supervisor for one test at the given version.
    ///
    /// An unknown plugin name records an Error state instead; the record is
    /// kept either way so the same version is not retried every cycle.
    fn start_test(
        &mut self,
        token: &CancellationToken,
        name: &str,
        version: &str,
        mut config: SynTestConfig,
    ) {
        config.inject_runtime(&self.config.runtime, &self.agent_id);
        let plugin_id = PluginId::compute(&self.agent_id, name);
        let mut state = PluginState::new(config.clone());

        let cancel = token.child_token();
        let done = match self.registry.resolve(&config.plugin_name, &config) {
            Some(plugin) => {
                debug!(test = %name, plugin = %config.plugin_name, "starting test routine");
                self.state.set(plugin_id.clone(), state);
                let supervisor = PluginSupervisor::new(
                    plugin_id,
                    plugin,
                    RestartPolicy::parse(&config.plugin_restart_policy),
                    self.state.clone(),
                    ResultEmitter::new(
                        PluginId::compute(&self.agent_id, name),
                        self.broadcaster.clone(),
                    ),
                    self.config.print_plugin_logs,
                );
                tokio::spawn(supervisor.run(cancel.clone()))
            }
            None => {
                state.status = PluginStatus::Error;
                state.status_msg =
                    format!("couldn't find plugin '{}' in the registry", config.plugin_name);
                self.state.set(plugin_id, state);
                error!(
                    plugin = %config.plugin_name,
                    test = %name,
                    "couldn't find syntest plugin in the registry"
                );
                tokio::spawn(async {})
            }
        };

        self.tests.insert(
            name.to_string(),
            SynTestRecord {
                config,
                version: version.to_string(),
                cancel,
                done,
            },
        );
    }

    /// Stops a test's supervisor, waits for it, and deletes its state and
    /// persisted run info (the latter under a short timeout so a slow store
    /// cannot stall shutdown).
    async fn stop_and_delete(&mut self, name: &str) {
        let Some(mut record) = self.tests.remove(name) else {
            return;
        };
        debug!(test = %name, "stopping and deleting syntest");
        record.cancel.cancel();
        if (&mut record.done).await.is_err() {
            warn!(test = %name, "supervisor task panicked");
        }

        let plugin_id = PluginId::compute(&self.agent_id, name);
        self.state.delete(&plugin_id);
        match timeout(
            CLEANUP_TIMEOUT,
            self.esh.store().delete_all_test_run_info(&plugin_id),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(test = %name, err = %e, "error deleting syntest data from store"),
            Err(_) => warn!(test = %name, "timed out deleting syntest data from store"),
        }
    }

    /// The ordered shutdown sequence, every step logged:
    /// supervisors, grace sleep, exporter, unregister, storage handler,
    /// broadcaster.
    async fn shutdown(
        &mut self,
        esh_token: CancellationToken,
        esh_task: JoinHandle<()>,
        watch_task: JoinHandle<()>,
        prom_token: CancellationToken,
        prom_task: Option<JoinHandle<()>>,
    ) {
        for (name, record) in self.tests.iter_mut() {
            info!(test = %name, plugin = %record.config.plugin_name, "waiting for plugin to finish");
            let _ = (&mut record.done).await;
        }
        info!("all syntest routines finished");

        warn!(
            grace_period = ?self.config.grace_period,
            "allowing time for agent to export all test results"
        );
        sleep(self.config.grace_period).await;

        prom_token.cancel();
        if let Some(task) = prom_task {
            info!("waiting for prometheus to finish");
            let _ = task.await;
        }

        info!("cleaning up external storage");
        self.cleanup_and_unregister().await;

        esh_token.cancel();
        info!("waiting for ext-storage handler to finish");
        let _ = esh_task.await;
        let _ = watch_task.await;

        self.broadcaster.stop();
        info!("waiting for broadcaster to finish");
        self.broadcaster.join().await;
    }

    /// Deletes all per-test data, the agent's status entry, and announces
    /// the exit. Every store call is bounded by [`CLEANUP_TIMEOUT`].
    async fn cleanup_and_unregister(&mut self) {
        let names: Vec<String> = self.tests.keys().cloned().collect();
        for name in names {
            self.stop_and_delete(&name).await;
        }

        match timeout(
            CLEANUP_TIMEOUT,
            self.esh.store().delete_agent_status(&self.agent_id),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(err = %e, "error deleting agent status from store"),
            Err(_) => warn!("timed out deleting agent status from store"),
        }

        match timeout(
            CLEANUP_TIMEOUT,
            self.esh
                .store()
                .new_agent_event(&format!("exiting agent: {}", self.agent_id)),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(err = %e, "error publishing agent exit event"),
            Err(_) => warn!("timed out publishing agent exit event"),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
