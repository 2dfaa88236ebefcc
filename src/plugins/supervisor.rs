//! # PluginSupervisor: single-plugin restart loop.
//!
//! Runs one plugin to completion, over and over, under its restart policy,
//! and owns every write to that plugin's
//! [`PluginState`](crate::state::PluginState).
//!
//! ## State machine per run cycle
//! ```text
//!       start
//!         │
//!         ▼
//!    ┌──Running──┐
//!    │           │ run returns
//!    │           ▼
//!    │      failed?
//!    │        ├─ yes → policy=Never   → Error (terminal)
//!    │        │        otherwise      → RestartBackOff
//!    │        └─ no  → policy=Always  → RestartBackOff
//!    │                 otherwise      → NotRunning (terminal)
//!    │
//!    └── (after the backoff elapses) ──┘
//! ```
//!
//! ## Rules
//! - Each entry to Running increments `restarts`/`total_restarts`, stamps
//!   `running_since`, and rotates the status message into `last_msg`.
//! - A Running phase longer than
//!   [`STABLE_RUN_RESET`](crate::policies::backoff::STABLE_RUN_RESET) resets
//!   `restarts` before the next delay is computed.
//! - The backoff sleep races against cancellation; on cancellation the loop
//!   exits after the current run returns.
//! - Every run gets a child token, so one run can be interrupted without
//!   tearing down the restart loop.

use tokio::select;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::PrintPluginLogs;
use crate::error::PluginError;
use crate::events::unix_seconds;
use crate::plugins::{PluginRef, ResultEmitter};
use crate::policies::backoff::{restart_delay, STABLE_RUN_RESET};
use crate::policies::RestartPolicy;
use crate::state::{PluginStatus, StateMap};
use crate::syntest::PluginId;
use tracing::{debug, error, info, warn};

/// Supervises one plugin: runs it, tracks its state, restarts it per policy.
///
/// Exactly one supervisor exists per plugin-id at any time; the reconciler
/// enforces this by serialising stop-then-start per test name.
pub struct PluginSupervisor {
    plugin_id: PluginId,
    plugin: PluginRef,
    policy: RestartPolicy,
    state: StateMap,
    emitter: ResultEmitter,
    print_logs: PrintPluginLogs,
}

impl PluginSupervisor {
    /// Creates a supervisor for one (plugin-id, plugin) pair.
    pub fn new(
        plugin_id: PluginId,
        plugin: PluginRef,
        policy: RestartPolicy,
        state: StateMap,
        emitter: ResultEmitter,
        print_logs: PrintPluginLogs,
    ) -> Self {
        Self {
            plugin_id,
            plugin,
            policy,
            state,
            emitter,
            print_logs,
        }
    }

    /// Runs the restart loop until a terminal status or cancellation.
    pub async fn run(self, token: CancellationToken) {
        while !token.is_cancelled() {
            let Some(mut s) = self.state.get(&self.plugin_id) else {
                // State deleted out from under us; nothing left to supervise.
                error!(plugin_id = %self.plugin_id, "cannot fetch plugin state");
                break;
            };

            s.status = PluginStatus::Running;
            s.restarts += 1;
            s.total_restarts += 1;
            s.last_msg = std::mem::take(&mut s.status_msg);
            s.running_since = Some(unix_seconds());
            self.state.set(self.plugin_id.clone(), s.clone());

            let started = Instant::now();
            let run_token = token.child_token();
            let res = self
                .plugin
                .run(run_token.clone(), self.emitter.clone())
                .await;
            // Stop anything the run spawned and left behind.
            run_token.cancel();

            if token.is_cancelled() {
                debug!(plugin_id = %self.plugin_id, "context cancelled, exiting");
                break;
            }

            match res {
                Err(e) => {
                    self.log_run_failure(&e);
                    s.last_msg = std::mem::replace(&mut s.status_msg, e.to_string());
                    if self.policy == RestartPolicy::Never {
                        s.status = PluginStatus::Error;
                        self.state.set(self.plugin_id.clone(), s);
                        break;
                    }
                    s.status = PluginStatus::RestartBackOff;
                    self.state.set(self.plugin_id.clone(), s.clone());
                }
                Ok(()) => {
                    self.log_run_success();
                    s.last_msg =
                        std::mem::replace(&mut s.status_msg, "plugin exited with no error".into());
                    if self.policy != RestartPolicy::Always {
                        s.status = PluginStatus::NotRunning;
                        self.state.set(self.plugin_id.clone(), s);
                        break;
                    }
                    s.status = PluginStatus::RestartBackOff;
                    self.state.set(self.plugin_id.clone(), s.clone());
                }
            }

            // A long stable run earns a fresh backoff streak.
            if started.elapsed() > STABLE_RUN_RESET {
                s.restarts = 0;
                self.state.set(self.plugin_id.clone(), s.clone());
            }

            let delay = restart_delay(s.restarts);
            info!(plugin_id = %self.plugin_id, delay = ?delay, "waiting before restart");
            select! {
                _ = token.cancelled() => {
                    debug!(plugin_id = %self.plugin_id, "context cancelled, exiting");
                    break;
                }
                _ = sleep(delay) => {}
            }
        }
    }

    fn log_run_failure(&self, err: &PluginError) {
        match self.print_logs {
            PrintPluginLogs::Never => {
                debug!(plugin_id = %self.plugin_id, err = %err, "plugin run returned error")
            }
            _ => warn!(plugin_id = %self.plugin_id, err = %err, "plugin run returned error"),
        }
    }

    fn log_run_success(&self) {
        match self.print_logs {
            PrintPluginLogs::Always => {
                info!(plugin_id = %self.plugin_id, "plugin run finished")
            }
            _ => debug!(plugin_id = %self.plugin_id, "plugin run finished"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::error::PluginError;
    use crate::events::Broadcaster;
    use crate::plugins::PluginFn;
    use crate::state::PluginState;
    use crate::syntest::SynTestConfig;

    fn harness(plugin: PluginRef, policy: RestartPolicy) -> (PluginSupervisor, StateMap, PluginId) {
        let id = PluginId::compute("pod-1/infra", "t");
        let state = StateMap::new();
        state.set(id.clone(), PluginState::new(SynTestConfig::default()));
        let sup = PluginSupervisor::new(
            id.clone(),
            plugin,
            policy,
            state.clone(),
            ResultEmitter::new(id.clone(), Broadcaster::new()),
            PrintPluginLogs::Never,
        );
        (sup, state, id)
    }

    #[tokio::test]
    async fn clean_exit_with_policy_never_is_not_running() {
        let plugin = PluginFn::arc(|_ctx, _emitter| async { Ok(()) });
        let (sup, state, id) = harness(plugin, RestartPolicy::Never);
        sup.run(CancellationToken::new()).await;

        let s = state.get(&id).expect("state kept");
        assert_eq!(s.status, PluginStatus::NotRunning);
        assert_eq!(s.status_msg, "plugin exited with no error");
        assert_eq!(s.restarts, 0);
        assert_eq!(s.total_restarts, 0);
    }

    #[tokio::test]
    async fn clean_exit_with_policy_on_error_is_not_running() {
        let plugin = PluginFn::arc(|_ctx, _emitter| async { Ok(()) });
        let (sup, state, id) = harness(plugin, RestartPolicy::OnError);
        sup.run(CancellationToken::new()).await;
        assert_eq!(state.get(&id).expect("state").status, PluginStatus::NotRunning);
    }

    #[tokio::test]
    async fn failure_with_policy_never_is_terminal_error() {
        let plugin = PluginFn::arc(|_ctx, _emitter| async { Err(PluginError::fail("boom")) });
        let (sup, state, id) = harness(plugin, RestartPolicy::Never);
        sup.run(CancellationToken::new()).await;

        let s = state.get(&id).expect("state");
        assert_eq!(s.status, PluginStatus::Error);
        assert!(s.status_msg.contains("boom"));
        assert_eq!(s.total_restarts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn crash_loop_backs_off_ten_then_twenty_seconds() {
        let entries: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = entries.clone();
        let plugin = PluginFn::arc(move |_ctx, _emitter| {
            let seen = seen.clone();
            async move {
                seen.lock().expect("lock").push(Instant::now());
                Err(PluginError::fail("crash"))
            }
        });

        let (sup, state, id) = harness(plugin, RestartPolicy::Always);
        let token = CancellationToken::new();
        let stopper = token.clone();
        let watched = state.clone();
        let watched_id = id.clone();
        let done = tokio::spawn(sup.run(token));

        // Let three runs happen, then cancel during the third backoff.
        loop {
            let s = watched.get(&watched_id).expect("state");
            if s.total_restarts >= 2 && s.status == PluginStatus::RestartBackOff {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        stopper.cancel();
        done.await.expect("supervisor joins");

        let entries = entries.lock().expect("lock");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1] - entries[0], Duration::from_secs(10));
        assert_eq!(entries[2] - entries[1], Duration::from_secs(20));

        let s = state.get(&id).expect("state");
        assert_eq!(s.restarts, 2);
        assert_eq!(s.total_restarts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn long_stable_run_resets_the_backoff_streak() {
        let runs = Arc::new(AtomicU64::new(0));
        let counter = runs.clone();
        let plugin = PluginFn::arc(move |_ctx, _emitter| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                // A run well past the stable-run threshold, then a crash.
                sleep(Duration::from_secs(15 * 60)).await;
                Err(PluginError::fail("crash after stable run"))
            }
        });

        let (sup, state, id) = harness(plugin, RestartPolicy::Always);
        let token = CancellationToken::new();
        let stopper = token.clone();
        let watched = state.clone();
        let watched_id = id.clone();
        let done = tokio::spawn(sup.run(token));

        loop {
            if runs.load(Ordering::SeqCst) >= 3 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        stopper.cancel();
        done.await.expect("supervisor joins");

        // The streak was reset after each stable run, so the delay stayed at
        // the 10 s base rather than doubling.
        let s = watched.get(&watched_id).expect("state");
        assert_eq!(s.restarts, 1, "reset to 0 after the stable run, then one re-entry");
        assert!(s.total_restarts >= 2);
    }

    #[tokio::test]
    async fn cancellation_exits_after_the_current_run() {
        let plugin = PluginFn::arc(|ctx: CancellationToken, _emitter| async move {
            ctx.cancelled().await;
            Ok(())
        });
        let (sup, state, id) = harness(plugin, RestartPolicy::Always);
        let token = CancellationToken::new();
        let stopper = token.clone();
        let done = tokio::spawn(sup.run(token));

        // Give the run a moment to start, then cancel.
        tokio::time::sleep(Duration::from_millis(20)).await;
        stopper.cancel();
        done.await.expect("supervisor joins");

        // No terminal transition was written; the last state is the Running
        // entry from the interrupted cycle.
        assert_eq!(state.get(&id).expect("state").status, PluginStatus::Running);
    }
}
