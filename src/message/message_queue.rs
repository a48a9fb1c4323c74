//! Message ingestion queue.
//!
//! Realtime messages are broadcast as soon as they are accepted and persisted
//! later, in batches, by a background flush worker. The queue is the only
//! owner of a message between `enqueue` and a successful flush.
//!
//! ```text
//!  gateway ──enqueue──► [ pending ] ──take (swap with empty)──► batch ──► store.insert_messages
//!                            ▲                                    │
//!                            └──────── requeue at head on error ──┘
//! ```
//!
//! A batch the store refuses because of its contents is retried one record
//! at a time, so only the offending records are requeued or dropped.
//!
//! The drain swaps the pending list for an empty one under the lock, so a
//! concurrent `enqueue` lands either in the batch being flushed or in the
//! next one, never in both and never in neither. Flushes are serialized by
//! `flush_lock`, so batch N is always written before batch N+1.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    conversation::ConversationStore,
    error::{AppError, Result},
    state::{FlushConfig, FlushFailurePolicy},
};
use super::message_models::PendingMessage;

#[derive(Debug)]
struct QueuedMessage {
    record: PendingMessage,
    attempts: u32,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<QueuedMessage>,
    last_stamp: Option<DateTime<Utc>>,
}

impl QueueState {
    /// Timestamps handed out by the queue strictly increase at microsecond
    /// resolution, so `created_at` order matches enqueue order.
    fn next_timestamp(&mut self, candidate: DateTime<Utc>) -> DateTime<Utc> {
        let candidate = candidate.trunc_subsecs(6);
        let stamp = match self.last_stamp {
            Some(last) if candidate <= last => last + chrono::Duration::microseconds(1),
            _ => candidate,
        };
        self.last_stamp = Some(stamp);
        stamp
    }
}

/// Result of one flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending.
    Idle,
    Flushed { count: u64 },
    /// The store rejected the batch; `requeued` records went back to the head
    /// of the queue and `dropped` ran out of attempts.
    Requeued { requeued: usize, dropped: usize },
    /// The store rejected the batch and the policy discards it.
    Dropped { count: usize },
}

#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    flush_lock: tokio::sync::Mutex<()>,
    store: Arc<dyn ConversationStore>,
    config: FlushConfig,
}

impl MessageQueue {
    pub fn new(store: Arc<dyn ConversationStore>, config: FlushConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                flush_lock: tokio::sync::Mutex::new(()),
                store,
                config,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // The state is a plain Vec; a panic elsewhere cannot leave it half-written.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends `record` to the tail of the queue. Never touches the store.
    pub fn enqueue(&self, record: PendingMessage) -> PendingMessage {
        self.enqueue_with(record, |_| {})
    }

    /// Like [`enqueue`](Self::enqueue), but runs `on_enqueued` while the
    /// record's position in the queue is still exclusive. Callers that fan the
    /// record out from the callback observe records in queue order.
    ///
    /// `on_enqueued` must not block or await.
    pub fn enqueue_with<F>(&self, mut record: PendingMessage, on_enqueued: F) -> PendingMessage
    where
        F: FnOnce(&PendingMessage),
    {
        let mut state = self.state();
        record.created_at = state.next_timestamp(record.created_at);
        state.pending.push(QueuedMessage {
            record: record.clone(),
            attempts: 0,
        });
        on_enqueued(&record);

        debug!(
            conversation_id = %record.conversation_id,
            sender_id = %record.sender_id,
            pending = state.pending.len(),
            "message enqueued"
        );

        record
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    fn take_pending(&self) -> Vec<QueuedMessage> {
        std::mem::take(&mut self.state().pending)
    }

    /// Drains everything pending into the store in one bulk write.
    pub async fn flush(&self) -> FlushOutcome {
        let _cycle = self.inner.flush_lock.lock().await;

        let batch = self.take_pending();
        if batch.is_empty() {
            return FlushOutcome::Idle;
        }

        let records: Vec<PendingMessage> = batch.iter().map(|q| q.record.clone()).collect();

        match self.inner.store.insert_messages(&records).await {
            Ok(count) => {
                info!(count, "flushed message batch");
                FlushOutcome::Flushed { count }
            }
            Err(e) if batch.len() > 1 && !e.is_transient() => self.isolate_rejected(batch, e).await,
            Err(e) => self.handle_failed_batch(batch, e),
        }
    }

    /// The store refused the batch because of its contents. Writes the
    /// records one at a time so a single bad row cannot take the rest of the
    /// batch down with it; only the rows the store still refuses count an
    /// attempt.
    async fn isolate_rejected(&self, batch: Vec<QueuedMessage>, cause: AppError) -> FlushOutcome {
        warn!(error = %cause, count = batch.len(), "message batch rejected, retrying row by row");

        let mut persisted = 0u64;
        let mut rejected = Vec::new();
        let mut last_error = cause;
        let mut records = batch.into_iter();

        while let Some(queued) = records.next() {
            match self
                .inner
                .store
                .insert_messages(std::slice::from_ref(&queued.record))
                .await
            {
                Ok(count) => persisted += count,
                Err(e) if e.is_transient() => {
                    // The store went away mid-way; nothing left is worth trying now.
                    rejected.push(queued);
                    rejected.extend(records.by_ref());
                    last_error = e;
                }
                Err(e) => {
                    error!(
                        conversation_id = %queued.record.conversation_id,
                        sender_id = %queued.record.sender_id,
                        error = %e,
                        "store rejected message"
                    );
                    rejected.push(queued);
                    last_error = e;
                }
            }
        }

        if persisted > 0 {
            info!(count = persisted, "flushed message batch row by row");
        }
        if rejected.is_empty() {
            return FlushOutcome::Flushed { count: persisted };
        }
        self.handle_failed_batch(rejected, last_error)
    }

    fn handle_failed_batch(&self, batch: Vec<QueuedMessage>, cause: AppError) -> FlushOutcome {
        match self.inner.config.failure_policy {
            FlushFailurePolicy::Drop => {
                error!(
                    error = %cause,
                    count = batch.len(),
                    "failed to persist message batch, dropping it"
                );
                FlushOutcome::Dropped { count: batch.len() }
            }
            FlushFailurePolicy::Requeue { max_attempts } => {
                let mut retained = Vec::with_capacity(batch.len());
                let mut dropped = 0;

                for mut queued in batch {
                    queued.attempts += 1;
                    if queued.attempts >= max_attempts {
                        dropped += 1;
                        error!(
                            conversation_id = %queued.record.conversation_id,
                            sender_id = %queued.record.sender_id,
                            attempts = queued.attempts,
                            "giving up on message after repeated flush failures"
                        );
                    } else {
                        retained.push(queued);
                    }
                }

                let requeued = retained.len();
                {
                    let mut state = self.state();
                    // Failed records are older than anything enqueued meanwhile.
                    retained.append(&mut state.pending);
                    state.pending = retained;
                }

                warn!(
                    error = %cause,
                    requeued,
                    dropped,
                    "failed to persist message batch, requeued for retry"
                );
                FlushOutcome::Requeued { requeued, dropped }
            }
        }
    }

    /// Delay before the next cycle after `consecutive_failures` failed ones.
    fn next_delay(&self, consecutive_failures: u32) -> Duration {
        let FlushConfig {
            interval,
            max_backoff,
            ..
        } = self.inner.config;

        if consecutive_failures == 0 {
            return interval;
        }

        interval
            .saturating_mul(1u32 << consecutive_failures.min(16))
            .min(max_backoff)
    }

    /// Starts the periodic flush task. Cycles run one after another, never
    /// concurrently; a failed cycle only delays the next one.
    pub fn start_flush_worker(&self) -> FlushWorker {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let queue = self.clone();

        let handle = tokio::spawn(async move {
            info!(
                interval_secs = queue.inner.config.interval.as_secs(),
                "message flush worker started"
            );

            let mut consecutive_failures = 0u32;
            let mut next_run = Instant::now() + queue.next_delay(0);

            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(next_run) => {}
                    _ = shutdown_rx.changed() => break,
                }

                let started = Instant::now();
                consecutive_failures = match queue.flush().await {
                    FlushOutcome::Requeued { requeued, .. } if requeued > 0 => consecutive_failures + 1,
                    _ => 0,
                };
                next_run = started + queue.next_delay(consecutive_failures);
            }

            let outcome = queue.flush().await;
            info!(?outcome, remaining = queue.pending_len(), "message flush worker stopped");
        });

        FlushWorker { shutdown_tx, handle }
    }
}

/// Handle to the background flush task.
pub struct FlushWorker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl FlushWorker {
    /// Stops the worker after a final flush of whatever is still pending.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.handle.await.map_err(|e| {
            error!("flush worker panicked: {}", e);
            crate::error::AppError::InternalError
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryStore;
    use std::collections::HashSet;
    use uuid::Uuid;

    fn queue_with(store: Arc<InMemoryStore>, failure_policy: FlushFailurePolicy) -> MessageQueue {
        MessageQueue::new(
            store,
            FlushConfig {
                interval: Duration::from_secs(5),
                failure_policy,
                max_backoff: Duration::from_secs(60),
            },
        )
    }

    fn record(conversation_id: Uuid, content: &str) -> PendingMessage {
        PendingMessage::new(conversation_id, Uuid::new_v4(), content.to_string(), Utc::now())
    }

    fn contents(store: &InMemoryStore) -> Vec<String> {
        store.all_messages().into_iter().map(|m| m.content).collect()
    }

    #[tokio::test]
    async fn test_flush_persists_in_enqueue_order() {
        let store = Arc::new(InMemoryStore::new());
        let queue = queue_with(store.clone(), FlushFailurePolicy::Drop);
        let conversation_id = Uuid::new_v4();

        for content in ["one", "two", "three"] {
            queue.enqueue(record(conversation_id, content));
        }

        assert_eq!(queue.flush().await, FlushOutcome::Flushed { count: 3 });
        assert_eq!(contents(&store), vec!["one", "two", "three"]);
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.flush().await, FlushOutcome::Idle);
    }

    #[tokio::test]
    async fn test_enqueue_during_flush_lands_in_next_batch() {
        let store = Arc::new(InMemoryStore::new());
        let queue = queue_with(store.clone(), FlushFailurePolicy::Drop);
        let conversation_id = Uuid::new_v4();

        for content in ["a", "b", "c"] {
            queue.enqueue(record(conversation_id, content));
        }

        let gate = store.hold_inserts();
        let flushing = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.flush().await })
        };

        // The batch has been taken and the insert is in flight.
        gate.entered.notified().await;
        queue.enqueue(record(conversation_id, "d"));
        assert_eq!(queue.pending_len(), 1);
        gate.release.notify_one();

        assert_eq!(flushing.await.unwrap(), FlushOutcome::Flushed { count: 3 });
        assert_eq!(contents(&store), vec!["a", "b", "c"]);

        store.release_inserts();
        assert_eq!(queue.flush().await, FlushOutcome::Flushed { count: 1 });
        assert_eq!(contents(&store), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_failed_batch_is_requeued_ahead_of_newer_messages() {
        let store = Arc::new(InMemoryStore::new());
        let queue = queue_with(store.clone(), FlushFailurePolicy::Requeue { max_attempts: 5 });
        let conversation_id = Uuid::new_v4();

        queue.enqueue(record(conversation_id, "first"));
        queue.enqueue(record(conversation_id, "second"));
        store.fail_next_inserts(1);

        assert_eq!(
            queue.flush().await,
            FlushOutcome::Requeued { requeued: 2, dropped: 0 }
        );
        assert_eq!(store.message_count(), 0);
        // A lost connection is not retried row by row.
        assert_eq!(store.bulk_insert_calls(), 1);

        queue.enqueue(record(conversation_id, "third"));
        assert_eq!(queue.flush().await, FlushOutcome::Flushed { count: 3 });
        assert_eq!(contents(&store), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_drop_policy_discards_failed_batch() {
        let store = Arc::new(InMemoryStore::new());
        let queue = queue_with(store.clone(), FlushFailurePolicy::Drop);

        queue.enqueue(record(Uuid::new_v4(), "lost"));
        store.fail_next_inserts(1);

        assert_eq!(queue.flush().await, FlushOutcome::Dropped { count: 1 });
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.flush().await, FlushOutcome::Idle);
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_records_are_dropped_after_max_attempts() {
        let store = Arc::new(InMemoryStore::new());
        let queue = queue_with(store.clone(), FlushFailurePolicy::Requeue { max_attempts: 2 });

        queue.enqueue(record(Uuid::new_v4(), "poison"));
        store.fail_next_inserts(2);

        assert_eq!(
            queue.flush().await,
            FlushOutcome::Requeued { requeued: 1, dropped: 0 }
        );
        assert_eq!(
            queue.flush().await,
            FlushOutcome::Requeued { requeued: 0, dropped: 1 }
        );
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_rejected_row_does_not_sink_its_batch() {
        let store = Arc::new(InMemoryStore::new());
        let queue = queue_with(store.clone(), FlushFailurePolicy::Requeue { max_attempts: 2 });
        let (innocent, bad) = (Uuid::new_v4(), Uuid::new_v4());

        queue.enqueue(record(innocent, "before"));
        queue.enqueue(record(bad, "x\0y"));
        queue.enqueue(record(innocent, "after"));

        assert_eq!(
            queue.flush().await,
            FlushOutcome::Requeued { requeued: 1, dropped: 0 }
        );
        assert_eq!(contents(&store), vec!["before", "after"]);
        assert_eq!(queue.pending_len(), 1);

        queue.enqueue(record(innocent, "later"));
        assert_eq!(
            queue.flush().await,
            FlushOutcome::Requeued { requeued: 0, dropped: 1 }
        );
        assert_eq!(contents(&store), vec!["before", "after", "later"]);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_rejected_row_under_drop_policy_keeps_the_rest() {
        let store = Arc::new(InMemoryStore::new());
        let queue = queue_with(store.clone(), FlushFailurePolicy::Drop);
        let conversation_id = Uuid::new_v4();

        queue.enqueue(record(conversation_id, "kept"));
        queue.enqueue(record(conversation_id, "\0"));

        assert_eq!(queue.flush().await, FlushOutcome::Dropped { count: 1 });
        assert_eq!(contents(&store), vec!["kept"]);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let queue = queue_with(Arc::new(InMemoryStore::new()), FlushFailurePolicy::Drop);
        let now = Utc::now();
        let conversation_id = Uuid::new_v4();

        let stamps: Vec<_> = (0..5)
            .map(|i| {
                let mut r = record(conversation_id, &i.to_string());
                r.created_at = now;
                queue.enqueue(r).created_at
            })
            .collect();

        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let queue = queue_with(Arc::new(InMemoryStore::new()), FlushFailurePolicy::Drop);

        assert_eq!(queue.next_delay(0), Duration::from_secs(5));
        assert_eq!(queue.next_delay(1), Duration::from_secs(10));
        assert_eq!(queue.next_delay(2), Duration::from_secs(20));
        assert_eq!(queue.next_delay(10), Duration::from_secs(60));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_lose_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let queue = queue_with(store.clone(), FlushFailurePolicy::Drop);
        let conversation_id = Uuid::new_v4();

        let producers: Vec<_> = (0..8)
            .map(|p| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    for i in 0..100 {
                        queue.enqueue(record(conversation_id, &format!("{}-{}", p, i)));
                        if i % 10 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();

        let flusher = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    queue.flush().await;
                    tokio::task::yield_now().await;
                }
            })
        };

        for producer in producers {
            producer.await.unwrap();
        }
        flusher.await.unwrap();
        queue.flush().await;

        let persisted = contents(&store);
        let unique: HashSet<_> = persisted.iter().collect();
        assert_eq!(persisted.len(), 800);
        assert_eq!(unique.len(), 800);

        let stamps: Vec<_> = store.all_messages().iter().map(|m| m.created_at).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_flushes_on_interval_and_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let queue = queue_with(store.clone(), FlushFailurePolicy::Drop);
        let worker = queue.start_flush_worker();
        let conversation_id = Uuid::new_v4();

        queue.enqueue(record(conversation_id, "early"));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(store.message_count(), 1);

        queue.enqueue(record(conversation_id, "late"));
        worker.shutdown().await.unwrap();
        assert_eq!(contents(&store), vec!["early", "late"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_keeps_running_after_failed_cycle() {
        let store = Arc::new(InMemoryStore::new());
        let queue = queue_with(store.clone(), FlushFailurePolicy::Requeue { max_attempts: 5 });
        let worker = queue.start_flush_worker();

        queue.enqueue(record(Uuid::new_v4(), "retry me"));
        store.fail_next_inserts(1);

        // First cycle at 5s fails, the retry backs off to 10s later.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(store.message_count(), 0);
        assert_eq!(queue.pending_len(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.message_count(), 1);
        assert_eq!(store.bulk_insert_calls(), 2);

        worker.shutdown().await.unwrap();
    }
}
