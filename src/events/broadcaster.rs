//! # Non-blocking fan-out of test-run results.
//!
//! [`Broadcaster`] is the in-agent pub/sub fabric: plugin supervisors publish
//! [`TestRunResult`]s, and every subscriber (storage writeback, Prometheus
//! exporter, anything else) receives its own copy through a dedicated bounded
//! queue.
//!
//! ## Architecture
//! ```text
//! publish(result) ──► [intake queue] ──► fan-out loop
//!                                          │
//!                                          ├──► [queue A] ──► subscriber A
//!                                          ├──► [queue B] ──► subscriber B
//!                                          └──► [queue N] ──► subscriber N
//! ```
//!
//! ## Rules
//! - `publish` never blocks: a full intake queue drops the result and counts it.
//! - A full subscriber queue drops the result **for that subscriber only**;
//!   drops are counted per subscriber and observable via
//!   [`Broadcaster::drop_count`].
//! - Delivery per subscriber is FIFO; cross-subscriber ordering is not
//!   guaranteed.
//! - `stop` is idempotent: it closes the intake, after which the fan-out loop
//!   drains whatever is already buffered and exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::TestRunResult;

/// Capacity of the intake queue between publishers and the fan-out loop.
const INTAKE_CAPACITY: usize = 256;

/// Default per-subscriber delivery buffer.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// Opaque handle identifying one subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberHandle(u64);

/// Receiving side of one subscription.
pub struct Subscription {
    handle: SubscriberHandle,
    rx: mpsc::Receiver<TestRunResult>,
}

impl Subscription {
    /// This subscription's handle (for [`Broadcaster::unsubscribe`] /
    /// [`Broadcaster::drop_count`]).
    pub fn handle(&self) -> SubscriberHandle {
        self.handle
    }

    /// Receives the next result; `None` once unsubscribed (or the
    /// broadcaster is gone) and the queue is drained.
    pub async fn recv(&mut self) -> Option<TestRunResult> {
        self.rx.recv().await
    }

    /// Non-blocking receive of an already-buffered result.
    pub fn try_recv(&mut self) -> Option<TestRunResult> {
        self.rx.try_recv().ok()
    }
}

struct SubscriberChannel {
    sender: mpsc::Sender<TestRunResult>,
    drops: Arc<AtomicU64>,
}

/// In-agent pub/sub for test-run results.
///
/// Cheap to clone; clones share the subscriber set and the intake queue.
#[derive(Clone)]
pub struct Broadcaster {
    intake: Arc<Mutex<Option<mpsc::Sender<TestRunResult>>>>,
    intake_rx: Arc<Mutex<Option<mpsc::Receiver<TestRunResult>>>>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    subs: Arc<DashMap<u64, SubscriberChannel>>,
    next_id: Arc<AtomicU64>,
    publish_drops: Arc<AtomicU64>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    /// Creates a broadcaster; call [`Broadcaster::start`] before publishing.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(INTAKE_CAPACITY);
        Self {
            intake: Arc::new(Mutex::new(Some(tx))),
            intake_rx: Arc::new(Mutex::new(Some(rx))),
            worker: Arc::new(Mutex::new(None)),
            subs: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
            publish_drops: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawns the fan-out loop. Idempotent; later calls are no-ops.
    pub fn start(&self) {
        let Some(mut rx) = lock(&self.intake_rx).take() else {
            return;
        };
        let subs = Arc::clone(&self.subs);
        let handle = tokio::spawn(async move {
            // Ends (after draining) once every intake sender is dropped.
            while let Some(result) = rx.recv().await {
                fan_out(&subs, result);
            }
            debug!("broadcaster drained, fan-out loop exiting");
        });
        *lock(&self.worker) = Some(handle);
    }

    /// Publishes a result without blocking.
    ///
    /// Returns `false` if the broadcaster is stopped or the intake queue is
    /// full (the result is dropped and counted).
    pub fn publish(&self, result: TestRunResult) -> bool {
        let Some(tx) = lock(&self.intake).as_ref().cloned() else {
            return false;
        };
        match tx.try_send(result) {
            Ok(()) => true,
            Err(_) => {
                self.publish_drops.fetch_add(1, Ordering::Relaxed);
                warn!("broadcaster intake full, dropping result");
                false
            }
        }
    }

    /// Registers a subscriber with the given delivery-buffer capacity.
    ///
    /// The subscriber receives every result published after this call, except
    /// those dropped because its buffer was full.
    pub fn subscribe(&self, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.insert(
            id,
            SubscriberChannel {
                sender: tx,
                drops: Arc::new(AtomicU64::new(0)),
            },
        );
        Subscription {
            handle: SubscriberHandle(id),
            rx,
        }
    }

    /// Removes a subscriber; its queue closes after draining.
    pub fn unsubscribe(&self, handle: SubscriberHandle) {
        self.subs.remove(&handle.0);
    }

    /// Results dropped so far for the given subscriber.
    ///
    /// Monotone non-decreasing while the subscription lives; `0` for unknown
    /// handles.
    pub fn drop_count(&self, handle: SubscriberHandle) -> u64 {
        self.subs
            .get(&handle.0)
            .map(|s| s.drops.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Results dropped at the intake because no one was draining it fast enough.
    pub fn publish_drop_count(&self) -> u64 {
        self.publish_drops.load(Ordering::Relaxed)
    }

    /// Closes the intake. Idempotent.
    ///
    /// Publishers start getting `false`; the fan-out loop delivers whatever is
    /// already buffered and then exits. Await [`Broadcaster::join`] to observe
    /// the drain completing.
    pub fn stop(&self) {
        lock(&self.intake).take();
    }

    /// Waits for the fan-out loop to finish (after [`Broadcaster::stop`]).
    pub async fn join(&self) {
        let handle = lock(&self.worker).take();
        if let Some(h) = handle {
            let _ = h.await;
        }
    }
}

fn fan_out(subs: &DashMap<u64, SubscriberChannel>, result: TestRunResult) {
    let mut closed: Vec<u64> = Vec::new();
    for entry in subs.iter() {
        match entry.sender.try_send(result.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = entry.drops.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    subscriber = *entry.key(),
                    dropped, "subscriber buffer full, dropping result"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                closed.push(*entry.key());
            }
        }
    }
    for id in closed {
        subs.remove(&id);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntest::PluginId;

    fn result(n: u64) -> TestRunResult {
        TestRunResult::now(PluginId::compute("a", "t"), true, n.to_string())
    }

    #[tokio::test]
    async fn delivers_in_fifo_order_to_each_subscriber() {
        let b = Broadcaster::new();
        b.start();
        let mut s1 = b.subscribe(8);
        let mut s2 = b.subscribe(8);

        for n in 0..3 {
            assert!(b.publish(result(n)));
        }

        for n in 0..3u64 {
            assert_eq!(s1.recv().await.expect("s1").details, n.to_string());
            assert_eq!(s2.recv().await.expect("s2").details, n.to_string());
        }
    }

    #[tokio::test]
    async fn full_subscriber_drops_and_counts_without_blocking_others() {
        let b = Broadcaster::new();
        b.start();
        let mut slow = b.subscribe(1);
        let mut fast = b.subscribe(16);

        for n in 0..5 {
            assert!(b.publish(result(n)));
        }

        // Stop + join so every delivery attempt has happened before asserting.
        b.stop();
        b.join().await;

        // The slow one buffered a single result; the rest were dropped.
        assert_eq!(b.drop_count(slow.handle()), 4);
        assert_eq!(slow.recv().await.expect("slow").details, "0");

        // The fast subscriber saw everything.
        for n in 0..5u64 {
            assert_eq!(fast.recv().await.expect("fast").details, n.to_string());
        }
    }

    #[tokio::test]
    async fn stop_drains_buffered_results_before_exiting() {
        let b = Broadcaster::new();
        b.start();
        let mut sub = b.subscribe(8);

        for n in 0..4 {
            assert!(b.publish(result(n)));
        }
        b.stop();
        b.join().await;

        // Published-before-stop results were all delivered.
        for n in 0..4u64 {
            assert_eq!(sub.recv().await.expect("buffered").details, n.to_string());
        }
        b.unsubscribe(sub.handle());
        assert!(sub.recv().await.is_none());

        // Publishing after stop is refused; stop stays idempotent.
        assert!(!b.publish(result(9)));
        b.stop();
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_queue() {
        let b = Broadcaster::new();
        b.start();
        let mut sub = b.subscribe(8);
        let handle = sub.handle();

        assert!(b.publish(result(0)));
        assert_eq!(sub.recv().await.expect("first").details, "0");

        b.unsubscribe(handle);
        assert!(sub.recv().await.is_none());
        assert_eq!(b.drop_count(handle), 0);
    }
}
