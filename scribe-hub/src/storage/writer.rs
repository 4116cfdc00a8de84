//! Per-room background snapshot writer.
//!
//! The sequencer hands every new snapshot to [`SnapshotWriter::enqueue`],
//! which never waits. A dedicated task per room drains the queue, keeps
//! only the newest snapshot (they are full states, so older ones are
//! superseded), and runs the blocking store write on the blocking pool with
//! bounded retries. One room's slow or failing store never delays another
//! room's writes or anyone's relay.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{SnapshotStore, StoreError};
use crate::broadcast::{Broadcaster, Outbox};
use crate::protocol::ServerMessage;

/// Hub-wide persistence counters.
#[derive(Debug, Default)]
pub struct PersistStats {
    pub snapshots_persisted: AtomicU64,
    pub writes_coalesced: AtomicU64,
    pub write_retries: AtomicU64,
    pub persist_failures: AtomicU64,
}

struct PersistJob {
    snapshot: Vec<u8>,
    /// Connection to warn if the write is finally abandoned (explicit saves).
    notify: Option<Outbox>,
}

/// Retry policy for store writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

/// Handle to one room's writer task.
pub struct SnapshotWriter {
    tx: mpsc::UnboundedSender<PersistJob>,
    pending: Arc<AtomicUsize>,
}

impl SnapshotWriter {
    /// Spawn the writer task for `room_id`. Must be called inside a runtime.
    pub fn spawn(
        room_id: String,
        store: Arc<dyn SnapshotStore>,
        broadcaster: Arc<Broadcaster>,
        retry: RetryPolicy,
        stats: Arc<PersistStats>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let task = WriterTask {
            room_id,
            store,
            broadcaster,
            retry,
            stats,
            pending: pending.clone(),
        };
        tokio::spawn(task.run(rx));

        Self { tx, pending }
    }

    /// Queue `snapshot` for persistence. Never blocks.
    pub fn enqueue(&self, snapshot: Vec<u8>, notify: Option<Outbox>) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(PersistJob { snapshot, notify }).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            log::error!("Snapshot writer task is gone, snapshot not persisted");
        }
    }

    /// Snapshots queued or being written.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}

struct WriterTask {
    room_id: String,
    store: Arc<dyn SnapshotStore>,
    broadcaster: Arc<Broadcaster>,
    retry: RetryPolicy,
    stats: Arc<PersistStats>,
    pending: Arc<AtomicUsize>,
}

impl WriterTask {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<PersistJob>) {
        let mut carried: Vec<Outbox> = Vec::new();

        while let Some(first) = rx.recv().await {
            // Coalesce: only the newest queued snapshot matters
            let mut latest = first;
            let mut taken = 1;
            while let Ok(next) = rx.try_recv() {
                carried.extend(latest.notify.take());
                latest = next;
                taken += 1;
            }
            if taken > 1 {
                self.stats
                    .writes_coalesced
                    .fetch_add((taken - 1) as u64, Ordering::Relaxed);
            }
            carried.extend(latest.notify.take());

            match self.write_with_retry(latest.snapshot, &rx).await {
                WriteResult::Written => {
                    self.stats.snapshots_persisted.fetch_add(1, Ordering::Relaxed);
                    carried.clear();
                }
                WriteResult::Superseded => {
                    // A newer snapshot is queued; its write covers this one
                    // and inherits the connections to warn.
                }
                WriteResult::Failed(e) => {
                    self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                    log::error!(
                        "Giving up persisting snapshot for room {} after {} retries: {e}",
                        self.room_id,
                        self.retry.retries
                    );
                    let warning = ServerMessage::document_error(format!(
                        "Document could not be saved: {e}"
                    ));
                    for outbox in carried.drain(..) {
                        let _ = self.broadcaster.unicast(&outbox, &warning);
                    }
                }
            }

            self.pending.fetch_sub(taken, Ordering::SeqCst);
        }

        log::debug!("Snapshot writer for room {} stopped", self.room_id);
    }

    async fn write_with_retry(
        &self,
        snapshot: Vec<u8>,
        rx: &mpsc::UnboundedReceiver<PersistJob>,
    ) -> WriteResult {
        let snapshot = Arc::new(snapshot);
        let mut attempt = 0u32;

        loop {
            match self.put(snapshot.clone()).await {
                Ok(()) => return WriteResult::Written,
                Err(e) if attempt >= self.retry.retries => return WriteResult::Failed(e),
                Err(e) => {
                    self.stats.write_retries.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "Persisting snapshot for room {} failed (attempt {}): {e}",
                        self.room_id,
                        attempt + 1
                    );
                }
            }

            let delay = self.retry.backoff.saturating_mul(1 << attempt.min(6));
            tokio::time::sleep(delay).await;
            attempt += 1;

            if !rx.is_empty() {
                return WriteResult::Superseded;
            }
        }
    }

    async fn put(&self, snapshot: Arc<Vec<u8>>) -> Result<(), StoreError> {
        let store = self.store.clone();
        let room_id = self.room_id.clone();
        tokio::task::spawn_blocking(move || store.put(&room_id, &snapshot)).await?
    }
}

enum WriteResult {
    Written,
    Superseded,
    Failed(StoreError),
}
