//! # ExtStorageHandler: result persistence and agent-status writeback.
//!
//! A broadcaster subscriber with two duties:
//!
//! 1. Persist every received [`TestRunResult`] to the store, with a small
//!    bounded retry per result.
//! 2. On a periodic tick at the agent's sync frequency, write the agent's
//!    whole [`StateMap`](crate::state::StateMap) snapshot as its status.
//!
//! Individual write failures are logged and dropped (per the agent's drop
//! semantics); a run of consecutive failures means the store is effectively
//! gone, so the loop returns an error and the reconciler escalates fatally.
//!
//! On cancellation the handler drains whatever is already buffered in its
//! subscription before exiting, so results produced just before shutdown
//! still reach the store inside the grace period.

use std::time::Duration;

use tokio::select;
use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AgentError, StoreError};
use crate::events::{Broadcaster, TestRunResult, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::state::StateMap;
use crate::storage::StoreRef;

/// Attempts per result before it is dropped.
const WRITE_ATTEMPTS: u32 = 3;

/// Pause between attempts for the same result.
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Consecutive dropped writes after which the store is declared gone.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Persists broadcaster output and the agent's status to the external store.
#[derive(Clone)]
pub struct ExtStorageHandler {
    agent_id: String,
    store: StoreRef,
    sync_frequency: Duration,
}

impl ExtStorageHandler {
    /// Creates a handler for the given agent identity and store.
    pub fn new(agent_id: impl Into<String>, store: StoreRef, sync_frequency: Duration) -> Self {
        Self {
            agent_id: agent_id.into(),
            store,
            sync_frequency,
        }
    }

    /// The underlying store handle.
    pub fn store(&self) -> &StoreRef {
        &self.store
    }

    /// Runs until cancellation or until the store is declared gone.
    ///
    /// Returns `Err` only for the latter; the reconciler treats that as a
    /// fatal condition.
    pub async fn run(
        &self,
        token: CancellationToken,
        broadcaster: &Broadcaster,
        state: &StateMap,
    ) -> Result<(), AgentError> {
        let mut sub = broadcaster.subscribe(DEFAULT_SUBSCRIBER_CAPACITY);
        let mut ticker = interval_at(
            Instant::now() + self.sync_frequency,
            self.sync_frequency,
        );
        let mut consecutive_failures: u32 = 0;

        info!(agent_id = %self.agent_id, "ext-storage handler started");
        loop {
            select! {
                _ = token.cancelled() => break,
                received = sub.recv() => match received {
                    Some(result) => {
                        self.account(&mut consecutive_failures, self.persist_result(&token, &result).await)?;
                    }
                    // Broadcaster stopped; nothing more will arrive.
                    None => break,
                },
                _ = ticker.tick() => {
                    debug!(agent_id = %self.agent_id, "writing agent status snapshot");
                    let write = self.store.write_agent_status(&self.agent_id, &state.snapshot()).await;
                    if let Err(e) = &write {
                        warn!(err = %e, "error writing agent status");
                    }
                    self.account(&mut consecutive_failures, write.map_err(Some))?;
                }
            }
        }

        // Shutdown: flush what is already buffered so in-flight results make
        // it out during the grace period.
        while let Some(result) = sub.try_recv() {
            if let Err(Some(e)) = self.persist_result(&token, &result).await {
                warn!(err = %e, "dropping buffered result at shutdown");
            }
        }
        broadcaster.unsubscribe(sub.handle());
        info!(agent_id = %self.agent_id, "ext-storage handler finished");
        Ok(())
    }

    /// Writes one result, retrying a few times.
    ///
    /// `Ok` on success, `Err(None)` when interrupted by cancellation,
    /// `Err(Some(_))` when all attempts failed.
    async fn persist_result(
        &self,
        token: &CancellationToken,
        result: &TestRunResult,
    ) -> Result<(), Option<StoreError>> {
        let mut last_err = None;
        for attempt in 1..=WRITE_ATTEMPTS {
            match self
                .store
                .write_test_run_info(&result.plugin_id, result)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        plugin_id = %result.plugin_id,
                        attempt,
                        err = %e,
                        "error persisting test run"
                    );
                    last_err = Some(e);
                }
            }
            if attempt < WRITE_ATTEMPTS {
                select! {
                    _ = token.cancelled() => return Err(None),
                    _ = sleep(WRITE_RETRY_DELAY) => {}
                }
            }
        }
        Err(last_err)
    }

    /// Tracks consecutive dropped writes; trips once the store looks gone.
    fn account(
        &self,
        consecutive_failures: &mut u32,
        outcome: Result<(), Option<StoreError>>,
    ) -> Result<(), AgentError> {
        match outcome {
            Ok(()) | Err(None) => {
                *consecutive_failures = 0;
                Ok(())
            }
            Err(Some(e)) => {
                *consecutive_failures += 1;
                if *consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    return Err(AgentError::Store(e));
                }
                Ok(())
            }
        }
    }
}
