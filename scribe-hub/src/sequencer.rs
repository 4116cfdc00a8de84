//! Per-room broadcast sequencer.
//!
//! ```text
//!  join / leave / edit / save / cursor
//!                │
//!                ▼  tokio Mutex (FIFO): one event at a time per room
//!        ┌───────────────┐
//!        │ RoomState     │── compose(snapshot, op) ── DeltaAlgebra
//!        │  roster       │
//!        │  snapshot     │── enqueue(snapshot) ────── SnapshotWriter (async)
//!        └───────┬───────┘
//!                │ recipients computed under the lock, try_send only
//!                ▼
//!         member outboxes (membership order, origin excluded)
//! ```
//!
//! The room lock is held until the relay decision for an event is made, so
//! every member sees edits in the same receipt order. Relay itself never
//! waits: outboxes are bounded and written with `try_send`.

use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::algebra::{DeltaAlgebra, MalformedOperation};
use crate::broadcast::{Broadcaster, Outbox};
use crate::protocol::{CursorRange, ServerMessage};
use crate::registry::{JoinOutcome, RejoinPolicy, Roster};
use crate::storage::{PersistStats, RetryPolicy, SnapshotStore, SnapshotWriter, StoreError};

/// Collaborators shared by every room.
pub struct RoomServices {
    pub algebra: Arc<dyn DeltaAlgebra>,
    pub store: Arc<dyn SnapshotStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub persist_stats: Arc<PersistStats>,
    pub rejoin_policy: RejoinPolicy,
    pub retry: RetryPolicy,
}

/// Which cursor event is being relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    Selection,
    Move,
}

/// Outcome of an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    /// Accepted and relayed. `evicted` lists members dropped from the room
    /// because the edit did not fit in their outbox.
    Relayed { recipients: usize, evicted: Vec<Uuid> },
    /// Sender is not an active member of the room.
    Dropped,
    /// The algebra refused the operation; origin was notified.
    Rejected(MalformedOperation),
}

struct RoomState {
    roster: Roster,
    /// `None` until loaded from the store.
    snapshot: Option<Vec<u8>>,
    /// Edits relayed while the store was unreadable, in receipt order.
    unapplied: Vec<Vec<u8>>,
}

/// Sequencer for one room.
pub struct Room {
    room_id: String,
    state: Mutex<RoomState>,
    writer: SnapshotWriter,
    services: Arc<RoomServices>,
}

impl Room {
    /// Create a room and spawn its snapshot writer. Must run inside a runtime.
    pub fn new(room_id: impl Into<String>, services: Arc<RoomServices>) -> Self {
        let room_id = room_id.into();
        let writer = SnapshotWriter::spawn(
            room_id.clone(),
            services.store.clone(),
            services.broadcaster.clone(),
            services.retry,
            services.persist_stats.clone(),
        );
        Self {
            room_id,
            state: Mutex::new(RoomState {
                roster: Roster::new(),
                snapshot: None,
                unapplied: Vec::new(),
            }),
            writer,
            services,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Load the snapshot from the store on first use. Cold rooms get the
    /// algebra's empty document. Edits held while the store was unreadable
    /// are composed onto it in receipt order.
    async fn ensure_loaded<'a>(&self, state: &'a mut RoomState) -> Result<&'a [u8], StoreError> {
        if state.snapshot.is_none() {
            let store = self.services.store.clone();
            let room_id = self.room_id.clone();
            let stored = tokio::task::spawn_blocking(move || store.get(&room_id)).await??;
            let mut snapshot = match stored {
                Some(bytes) => {
                    log::info!("Loaded persisted snapshot for room {}", self.room_id);
                    bytes
                }
                None => self.services.algebra.empty(),
            };
            if !state.unapplied.is_empty() {
                let held = std::mem::take(&mut state.unapplied);
                log::info!("Composing {} held edits into room {}", held.len(), self.room_id);
                for op in held {
                    match self.services.algebra.compose(&snapshot, &op) {
                        Ok(next) => snapshot = next,
                        Err(e) => {
                            log::warn!("Held edit no longer applies to room {}: {e}", self.room_id)
                        }
                    }
                }
                self.writer.enqueue(snapshot.clone(), None);
            }
            state.snapshot = Some(snapshot);
        }
        Ok(state.snapshot.as_deref().unwrap_or_default())
    }

    /// Register `display_name` on `outbox`'s connection and run presence relay.
    pub async fn join(&self, outbox: Outbox, display_name: &str) -> JoinOutcome {
        let broadcaster = &self.services.broadcaster;
        let mut state = self.state.lock().await;
        let connection_id = outbox.connection_id();

        let loaded = self.ensure_loaded(&mut state).await.map(|s| s.to_vec());

        let outcome = state
            .roster
            .join(display_name, outbox.clone(), self.services.rejoin_policy);

        if outcome.is_new_participant {
            let _ = broadcaster.fan_out(
                state.roster.outboxes_except(connection_id),
                &ServerMessage::UserJoined {
                    display_name: display_name.to_string(),
                },
            );
            log::info!("{display_name} ({connection_id}) joined room {}", self.room_id);
        } else if let Some(previous) = outcome.displaced {
            log::info!(
                "{display_name} rebound in room {} from {previous} to {connection_id}",
                self.room_id
            );
        } else if !outcome.bound {
            log::info!(
                "{display_name} already present in room {}, {connection_id} not admitted",
                self.room_id
            );
        }

        if outcome.bound {
            match loaded {
                Ok(snapshot) => {
                    let _ = broadcaster
                        .unicast(&outbox, &ServerMessage::InitializeDocument { snapshot });
                }
                Err(e) => {
                    log::error!("Error retrieving document state for room {}: {e}", self.room_id);
                    let _ = broadcaster.unicast(
                        &outbox,
                        &ServerMessage::document_error("Error retrieving document state"),
                    );
                }
            }
        }

        // Roster refresh goes to the whole room, actor included
        let roster_msg = ServerMessage::ConnectedUsers {
            members: outcome.members.clone(),
        };
        if outcome.bound {
            let _ = broadcaster.fan_out(state.roster.outboxes(), &roster_msg);
        } else {
            let _ = broadcaster.fan_out(
                state.roster.outboxes().chain(std::iter::once(&outbox)),
                &roster_msg,
            );
        }

        outcome
    }

    /// Remove `display_name` if it is bound to `connection_id`.
    ///
    /// A stale connection (rebound away, or never admitted) cannot evict the
    /// current holder of the name. Returns the members afterwards, or `None`
    /// if nobody was removed.
    pub async fn leave(&self, connection_id: Uuid, display_name: &str) -> Option<Vec<String>> {
        let mut state = self.state.lock().await;
        let owns_name = state
            .roster
            .participant(display_name)
            .is_some_and(|p| p.connection_id() == connection_id);
        if !owns_name {
            log::debug!(
                "Ignoring leave of {display_name} from {connection_id} in room {}",
                self.room_id
            );
            return None;
        }

        let members = state.roster.leave(display_name);
        self.announce_departure(&state, display_name, &members);
        Some(members)
    }

    /// Implicit leave for a lost channel.
    pub async fn disconnect(&self, connection_id: Uuid) -> Option<String> {
        let mut state = self.state.lock().await;
        let gone = state.roster.leave_connection(connection_id)?;
        let members = state.roster.members();
        self.announce_departure(&state, &gone.display_name, &members);
        Some(gone.display_name)
    }

    fn announce_departure(&self, state: &RoomState, display_name: &str, members: &[String]) {
        let broadcaster = &self.services.broadcaster;
        let _ = broadcaster.fan_out(
            state.roster.outboxes(),
            &ServerMessage::UserLeft {
                display_name: display_name.to_string(),
            },
        );
        let _ = broadcaster.fan_out(
            state.roster.outboxes(),
            &ServerMessage::ConnectedUsers {
                members: members.to_vec(),
            },
        );
        log::info!("{display_name} left room {}", self.room_id);
    }

    /// Sequence one edit: compose, persist in the background, relay.
    ///
    /// A member whose outbox cannot take the relayed edit is dropped from
    /// the room; its replica has missed an operation and must rejoin.
    pub async fn edit(&self, connection_id: Uuid, operation: Vec<u8>) -> EditOutcome {
        let broadcaster = &self.services.broadcaster;
        let algebra = &self.services.algebra;
        let mut state = self.state.lock().await;

        let (origin, origin_outbox) = match state.roster.bound_to(connection_id) {
            Some(p) => (p.display_name.clone(), p.outbox.clone()),
            None => {
                log::debug!(
                    "Dropping edit from inactive connection {connection_id} in room {}",
                    self.room_id
                );
                return EditOutcome::Dropped;
            }
        };

        if !algebra.applicable(&operation) {
            let e = MalformedOperation("operation is not applicable".into());
            return self.reject(&origin, &origin_outbox, e);
        }

        let composed = self
            .ensure_loaded(&mut state)
            .await
            .map(|current| algebra.compose(current, &operation));
        match composed {
            Ok(Ok(next)) => {
                state.snapshot = Some(next.clone());
                self.writer.enqueue(next, None);
            }
            Ok(Err(e)) => return self.reject(&origin, &origin_outbox, e),
            Err(e) => {
                log::error!(
                    "Error retrieving document state for room {}, holding edit from {origin}: {e}",
                    self.room_id
                );
                let _ = broadcaster.unicast(
                    &origin_outbox,
                    &ServerMessage::document_error("Error retrieving document state"),
                );
                state.unapplied.push(operation.clone());
            }
        }

        let report = broadcaster
            .fan_out_report(
                state.roster.outboxes_except(connection_id),
                &ServerMessage::Edit {
                    operation,
                    origin,
                },
            )
            .unwrap_or_default();

        let mut evicted = Vec::new();
        for id in report.overflowed {
            if let Some(gone) = state.roster.leave_connection(id) {
                log::warn!(
                    "{} fell behind in room {}, dropping it from the room",
                    gone.display_name,
                    self.room_id
                );
                let members = state.roster.members();
                self.announce_departure(&state, &gone.display_name, &members);
                evicted.push(id);
            }
        }

        EditOutcome::Relayed {
            recipients: report.delivered,
            evicted,
        }
    }

    fn reject(&self, origin: &str, outbox: &Outbox, e: MalformedOperation) -> EditOutcome {
        log::warn!("Rejected edit from {origin} in room {}: {e}", self.room_id);
        let _ = self
            .services
            .broadcaster
            .unicast(outbox, &ServerMessage::document_error(e.to_string()));
        EditOutcome::Rejected(e)
    }

    /// Overwrite the snapshot with a full state. Persistence only, no relay.
    ///
    /// Returns `false` if the sender is not an active member.
    pub async fn save(&self, connection_id: Uuid, content: Vec<u8>) -> bool {
        let mut state = self.state.lock().await;
        let saver = match state.roster.bound_to(connection_id) {
            Some(p) => p.outbox.clone(),
            None => {
                log::debug!(
                    "Dropping save from inactive connection {connection_id} in room {}",
                    self.room_id
                );
                return false;
            }
        };

        state.snapshot = Some(content.clone());
        state.unapplied.clear();
        self.writer.enqueue(content, Some(saver));
        log::debug!("Snapshot of room {} overwritten by explicit save", self.room_id);
        true
    }

    /// Relay a cursor event to the rest of the room. Nothing is retained.
    pub async fn cursor(
        &self,
        connection_id: Uuid,
        kind: CursorKind,
        cursor: Option<CursorRange>,
    ) -> bool {
        let state = self.state.lock().await;
        let display_name = match state.roster.bound_to(connection_id) {
            Some(p) => p.display_name.clone(),
            None => return false,
        };
        log::trace!("Cursor {kind:?} from {display_name} in room {}", self.room_id);

        let msg = match kind {
            CursorKind::Selection => ServerMessage::RemoteCursorSelection {
                display_name,
                cursor,
            },
            CursorKind::Move => ServerMessage::RemoteCursorMove {
                display_name,
                cursor,
            },
        };
        let _ = self
            .services
            .broadcaster
            .fan_out(state.roster.outboxes_except(connection_id), &msg);
        true
    }

    /// Current members, in first-join order.
    pub async fn members(&self) -> Vec<String> {
        self.state.lock().await.roster.members()
    }

    /// In-memory snapshot, if loaded.
    pub async fn snapshot(&self) -> Option<Vec<u8>> {
        self.state.lock().await.snapshot.clone()
    }

    /// Whether `connection_id` is bound in this room.
    pub async fn is_active(&self, connection_id: Uuid) -> bool {
        self.state.lock().await.roster.bound_to(connection_id).is_some()
    }

    /// Snapshots waiting to be written.
    pub fn pending_writes(&self) -> usize {
        self.writer.pending()
    }

    /// No members and nothing left to persist.
    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.roster.is_empty() && self.writer.is_idle()
    }

    /// Non-waiting variant of [`Room::is_idle`]; a busy room counts as active.
    pub fn try_is_idle(&self) -> bool {
        match self.state.try_lock() {
            Ok(state) => state.roster.is_empty() && self.writer.is_idle(),
            Err(_) => false,
        }
    }
}
