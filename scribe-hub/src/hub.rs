//! Hub façade: connections, sessions and room routing.
//!
//! The gateway registers each transport connection with [`Hub::connect`],
//! forwards decoded [`ClientMessage`]s to [`Hub::handle`] and drains the
//! returned receiver into the socket. A lost channel is reported with
//! [`Hub::disconnect`], which runs an implicit leave in every room the
//! connection still holds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::algebra::{DeltaAlgebra, YrsAlgebra};
use crate::broadcast::{BroadcastStats, Broadcaster, Frame, Outbox};
use crate::protocol::{ClientMessage, CursorRange, ServerMessage};
use crate::registry::{JoinOutcome, RejoinPolicy, RoomRegistry};
use crate::sequencer::{CursorKind, EditOutcome, Room, RoomServices};
use crate::session::Session;
use crate::storage::{MemoryStore, PersistStats, RetryPolicy, SnapshotStore};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Frames buffered per connection. A connection that cannot take an
    /// edit is disconnected; presence and cursor frames are just dropped
    pub outbox_capacity: usize,
    /// What a same-name join from another connection does
    pub rejoin_policy: RejoinPolicy,
    /// Store write retries after the first attempt
    pub persist_retries: u32,
    /// Base backoff between store write attempts, doubled per retry
    pub persist_backoff_ms: u64,
    /// Drop empty rooms once their snapshot is persisted
    pub reap_empty_rooms: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 256,
            rejoin_policy: RejoinPolicy::Rebind,
            persist_retries: 3,
            persist_backoff_ms: 50,
            reap_empty_rooms: false,
        }
    }
}

impl HubConfig {
    /// Small buffers and near-zero backoff.
    pub fn for_testing() -> Self {
        Self {
            outbox_capacity: 64,
            persist_retries: 2,
            persist_backoff_ms: 1,
            ..Self::default()
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.persist_retries,
            backoff: Duration::from_millis(self.persist_backoff_ms),
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub active_rooms: usize,
    pub messages_received: u64,
    pub edits_relayed: u64,
    pub edits_rejected: u64,
    /// Edit, save and cursor events from connections not active in the room
    pub events_dropped: u64,
    /// Connections disconnected because an edit overflowed their outbox
    pub slow_consumers_dropped: u64,
    pub broadcast: BroadcastStats,
    pub snapshots_persisted: u64,
    pub writes_coalesced: u64,
    pub write_retries: u64,
    pub persist_failures: u64,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    messages_received: AtomicU64,
    edits_relayed: AtomicU64,
    edits_rejected: AtomicU64,
    events_dropped: AtomicU64,
    slow_consumers_dropped: AtomicU64,
}

struct Connection {
    outbox: Outbox,
    session: Session,
}

/// The room synchronization hub.
pub struct Hub {
    config: HubConfig,
    services: Arc<RoomServices>,
    registry: RoomRegistry,
    connections: RwLock<HashMap<Uuid, Connection>>,
    counters: Counters,
}

impl Hub {
    pub fn new(
        config: HubConfig,
        algebra: Arc<dyn DeltaAlgebra>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let services = Arc::new(RoomServices {
            algebra,
            store,
            broadcaster: Arc::new(Broadcaster::new()),
            persist_stats: Arc::new(PersistStats::default()),
            rejoin_policy: config.rejoin_policy,
            retry: config.retry_policy(),
        });
        Self {
            config,
            services,
            registry: RoomRegistry::new(),
            connections: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Yrs documents on the given store.
    pub fn with_store(config: HubConfig, store: Arc<dyn SnapshotStore>) -> Self {
        Self::new(config, Arc::new(YrsAlgebra), store)
    }

    /// Yrs documents, nothing survives a restart.
    pub fn in_memory(config: HubConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.services.store
    }

    /// Register a new connection. Frames for it arrive on the receiver.
    pub async fn connect(&self) -> (Uuid, mpsc::Receiver<Frame>) {
        let connection_id = Uuid::new_v4();
        let (outbox, rx) = Outbox::channel(connection_id, self.config.outbox_capacity);
        self.connections.write().await.insert(
            connection_id,
            Connection {
                outbox,
                session: Session::new(),
            },
        );
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        log::debug!("Connection {connection_id} registered");
        (connection_id, rx)
    }

    /// Dispatch one inbound message.
    pub async fn handle(&self, connection_id: Uuid, msg: ClientMessage) {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
        match msg.room_id() {
            Some(room_id) => log::debug!("{} for room {room_id} from {connection_id}", msg.kind()),
            None => log::debug!("{} from {connection_id}", msg.kind()),
        }

        match msg {
            ClientMessage::JoinRoom {
                room_id,
                display_name,
            } => {
                self.join(connection_id, &room_id, &display_name).await;
            }
            ClientMessage::Edit {
                room_id, operation, ..
            } => {
                self.edit(connection_id, &room_id, operation).await;
            }
            ClientMessage::Save { room_id, content } => {
                self.save(connection_id, &room_id, content).await;
            }
            ClientMessage::CursorSelection { room_id, cursor, .. } => {
                self.cursor(connection_id, &room_id, CursorKind::Selection, cursor)
                    .await;
            }
            ClientMessage::CursorMove { room_id, cursor, .. } => {
                self.cursor(connection_id, &room_id, CursorKind::Move, cursor)
                    .await;
            }
            ClientMessage::LeaveRoom {
                room_id,
                display_name,
            } => {
                self.leave(connection_id, &room_id, &display_name).await;
            }
            ClientMessage::Ping => {
                if let Some(outbox) = self.outbox(connection_id).await {
                    let _ = self.services.broadcaster.unicast(&outbox, &ServerMessage::Pong);
                }
            }
        }
    }

    async fn outbox(&self, connection_id: Uuid) -> Option<Outbox> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|c| c.outbox.clone())
    }

    async fn room(&self, room_id: &str) -> Arc<Room> {
        self.registry
            .get_or_create(room_id, || {
                log::info!("Room {room_id} created");
                Room::new(room_id, self.services.clone())
            })
            .await
    }

    /// Room the connection is active in, if any.
    async fn active_room(&self, connection_id: Uuid, room_id: &str) -> Option<Arc<Room>> {
        let active = self
            .connections
            .read()
            .await
            .get(&connection_id)
            .is_some_and(|c| c.session.is_active(room_id));
        if !active {
            self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("Dropping event from {connection_id}: not active in room {room_id}");
            return None;
        }
        self.registry.get(room_id).await
    }

    /// Join `room_id` as `display_name`. `None` for an unknown connection.
    pub async fn join(
        &self,
        connection_id: Uuid,
        room_id: &str,
        display_name: &str,
    ) -> Option<JoinOutcome> {
        let (outbox, previous_name) = {
            let mut connections = self.connections.write().await;
            let conn = connections.get_mut(&connection_id)?;
            let previous = conn.session.begin_join(room_id, display_name);
            (conn.outbox.clone(), previous)
        };

        let room = self.room(room_id).await;
        if let Some(previous) = previous_name {
            room.leave(connection_id, &previous).await;
        }
        let outcome = room.join(outbox, display_name).await;

        let mut connections = self.connections.write().await;
        if !connections.contains_key(&connection_id) {
            // Channel lost mid-join
            drop(connections);
            room.disconnect(connection_id).await;
            return Some(outcome);
        }
        if let Some(conn) = connections.get_mut(&connection_id) {
            conn.session.complete_join(room_id, outcome.bound);
        }
        if let Some(displaced) = outcome.displaced {
            if let Some(conn) = connections.get_mut(&displaced) {
                conn.session.detach(room_id);
            }
        }

        Some(outcome)
    }

    /// Explicit leave. Returns whether a participant was removed.
    pub async fn leave(&self, connection_id: Uuid, room_id: &str, display_name: &str) -> bool {
        let name = {
            let mut connections = self.connections.write().await;
            let Some(conn) = connections.get_mut(&connection_id) else {
                return false;
            };
            if conn.session.display_name(room_id) != Some(display_name) {
                log::debug!(
                    "Ignoring leave of {display_name} from {connection_id} in room {room_id}"
                );
                return false;
            }
            match conn.session.begin_leave(room_id) {
                Some(name) => name,
                None => return false,
            }
        };

        let removed = match self.registry.get(room_id).await {
            Some(room) => room.leave(connection_id, &name).await.is_some(),
            None => false,
        };

        if let Some(conn) = self.connections.write().await.get_mut(&connection_id) {
            conn.session.complete_leave(room_id);
        }
        self.maybe_reap().await;
        removed
    }

    /// Relay an edit from an active connection.
    ///
    /// Members the room dropped for falling behind are disconnected, so
    /// their client reconnects and rejoins from a fresh snapshot.
    pub async fn edit(
        &self,
        connection_id: Uuid,
        room_id: &str,
        operation: Vec<u8>,
    ) -> EditOutcome {
        let Some(room) = self.active_room(connection_id, room_id).await else {
            return EditOutcome::Dropped;
        };
        let outcome = room.edit(connection_id, operation).await;
        match &outcome {
            EditOutcome::Relayed { evicted, .. } => {
                self.counters.edits_relayed.fetch_add(1, Ordering::Relaxed);
                for &slow in evicted {
                    self.counters.slow_consumers_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Disconnecting {slow}: outbox overflowed in room {room_id}");
                    self.disconnect(slow).await;
                }
            }
            EditOutcome::Rejected(_) => {
                self.counters.edits_rejected.fetch_add(1, Ordering::Relaxed);
            }
            EditOutcome::Dropped => {
                self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    /// Overwrite a room's snapshot with `content`.
    pub async fn save(&self, connection_id: Uuid, room_id: &str, content: Vec<u8>) -> bool {
        match self.active_room(connection_id, room_id).await {
            Some(room) => room.save(connection_id, content).await,
            None => false,
        }
    }

    /// Relay a cursor or selection change.
    pub async fn cursor(
        &self,
        connection_id: Uuid,
        room_id: &str,
        kind: CursorKind,
        cursor: Option<CursorRange>,
    ) -> bool {
        match self.active_room(connection_id, room_id).await {
            Some(room) => room.cursor(connection_id, kind, cursor).await,
            None => false,
        }
    }

    /// Channel lost: implicit leave everywhere, then forget the connection.
    pub async fn disconnect(&self, connection_id: Uuid) {
        let rooms = match self.connections.write().await.remove(&connection_id) {
            Some(mut conn) => conn.session.close(),
            None => return,
        };

        for room_id in rooms {
            if let Some(room) = self.registry.get(&room_id).await {
                if let Some(name) = room.disconnect(connection_id).await {
                    log::info!("{name} dropped from room {room_id} (connection lost)");
                }
            }
        }
        log::debug!("Connection {connection_id} unregistered");
        self.maybe_reap().await;
    }

    async fn maybe_reap(&self) {
        if self.config.reap_empty_rooms {
            self.registry.remove_idle().await;
        }
    }

    /// Members of `room_id` in first-join order.
    pub async fn members_of(&self, room_id: &str) -> Vec<String> {
        self.registry.members_of(room_id).await
    }

    /// In-memory snapshot of `room_id`, if the room is loaded.
    pub async fn snapshot_of(&self, room_id: &str) -> Option<Vec<u8>> {
        self.registry.get(room_id).await?.snapshot().await
    }

    pub async fn room_count(&self) -> usize {
        self.registry.room_count().await
    }

    /// Remove empty rooms with nothing left to persist.
    pub async fn reap_idle_rooms(&self) -> usize {
        self.registry.remove_idle().await
    }

    /// Wait until every queued snapshot is written. `false` on timeout.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pending: usize = self
                .registry
                .rooms()
                .await
                .iter()
                .map(|room| room.pending_writes())
                .sum();
            if pending == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                log::warn!("{pending} snapshot writes still pending after flush timeout");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn stats(&self) -> HubStats {
        let persist = &self.services.persist_stats;
        HubStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.connections.read().await.len(),
            active_rooms: self.registry.room_count().await,
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            edits_relayed: self.counters.edits_relayed.load(Ordering::Relaxed),
            edits_rejected: self.counters.edits_rejected.load(Ordering::Relaxed),
            events_dropped: self.counters.events_dropped.load(Ordering::Relaxed),
            slow_consumers_dropped: self.counters.slow_consumers_dropped.load(Ordering::Relaxed),
            broadcast: self.services.broadcaster.stats(),
            snapshots_persisted: persist.snapshots_persisted.load(Ordering::Relaxed),
            writes_coalesced: persist.writes_coalesced.load(Ordering::Relaxed),
            write_retries: persist.write_retries.load(Ordering::Relaxed),
            persist_failures: persist.persist_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreError;
    use yrs::updates::decoder::Decode;
    use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update, WriteTxn};

    /// Takes `delay` to write every snapshot.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    impl SnapshotStore for SlowStore {
        fn get(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(room_id)
        }

        fn put(&self, room_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
            std::thread::sleep(self.delay);
            self.inner.put(room_id, snapshot)
        }

        fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_rooms()
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(ServerMessage::decode(&frame).unwrap());
        }
        out
    }

    fn text_of(state: &[u8]) -> String {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
        }
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.get_string(&txn)
    }

    /// Load `base` into `doc`, append `s`, return only the change.
    fn append(doc: &Doc, base: &[u8], s: &str) -> Vec<u8> {
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(base).unwrap()).unwrap();
        }
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            let len = text.get_string(&txn).len() as u32;
            text.insert(&mut txn, len, s);
        }
        doc.transact().encode_state_as_update_v1(&before)
    }

    fn initialized_snapshot(msgs: &[ServerMessage]) -> Vec<u8> {
        msgs.iter()
            .find_map(|m| match m {
                ServerMessage::InitializeDocument { snapshot } => Some(snapshot.clone()),
                _ => None,
            })
            .expect("no initialize-document")
    }

    #[tokio::test]
    async fn test_distinct_joins_in_first_join_order() {
        let hub = Hub::in_memory(HubConfig::for_testing());
        for name in ["carol", "alice", "bob"] {
            let (conn, _rx) = hub.connect().await;
            hub.join(conn, "R1", name).await.unwrap();
        }
        assert_eq!(hub.members_of("R1").await, vec!["carol", "alice", "bob"]);
        assert!(hub.members_of("nowhere").await.is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_keeps_membership_and_is_silent() {
        let hub = Hub::in_memory(HubConfig::for_testing());
        let (a, _rx_a) = hub.connect().await;
        let (b, mut rx_b) = hub.connect().await;
        hub.join(a, "R1", "alice").await;
        hub.join(b, "R1", "bob").await;
        drain(&mut rx_b);

        let (a2, mut rx_a2) = hub.connect().await;
        let outcome = hub.join(a2, "R1", "alice").await.unwrap();
        assert!(!outcome.is_new_participant);
        assert_eq!(hub.members_of("R1").await, vec!["alice", "bob"]);

        let seen_by_bob = drain(&mut rx_b);
        assert!(seen_by_bob
            .iter()
            .all(|m| !matches!(m, ServerMessage::UserJoined { .. })));
        assert!(!drain(&mut rx_a2).is_empty());

        // Old connection lost its session; its edits are dropped
        assert_eq!(hub.edit(a, "R1", vec![]).await, EditOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_keep_existing_policy() {
        let config = HubConfig {
            rejoin_policy: RejoinPolicy::KeepExisting,
            ..HubConfig::for_testing()
        };
        let hub = Hub::in_memory(config);
        let (a, _rx_a) = hub.connect().await;
        let (a2, mut rx_a2) = hub.connect().await;
        hub.join(a, "R1", "alice").await;

        let outcome = hub.join(a2, "R1", "alice").await.unwrap();
        assert!(!outcome.bound);
        let got = drain(&mut rx_a2);
        assert_eq!(
            got,
            vec![ServerMessage::ConnectedUsers {
                members: vec!["alice".into()]
            }]
        );
        assert_eq!(hub.edit(a2, "R1", vec![]).await, EditOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_scenario_concurrent_edits_converge() {
        let hub = Hub::in_memory(HubConfig::for_testing());
        let (a, mut rx_a) = hub.connect().await;
        let (b, mut rx_b) = hub.connect().await;
        hub.join(a, "R1", "alice").await;
        hub.join(b, "R1", "bob").await;
        let initial = initialized_snapshot(&drain(&mut rx_a));
        drain(&mut rx_b);

        let op1 = append(&Doc::with_client_id(1), &initial, "one ");
        let op2 = append(&Doc::with_client_id(2), &initial, "two");
        assert!(matches!(
            hub.edit(a, "R1", op1.clone()).await,
            EditOutcome::Relayed { recipients: 1, .. }
        ));
        assert!(matches!(
            hub.edit(b, "R1", op2.clone()).await,
            EditOutcome::Relayed { recipients: 1, .. }
        ));

        // Each side applies its own op plus the relayed one
        let relayed_to_b = drain(&mut rx_b);
        let relayed_to_a = drain(&mut rx_a);
        assert_eq!(
            relayed_to_b,
            vec![ServerMessage::Edit {
                operation: op1.clone(),
                origin: "alice".into()
            }]
        );
        assert_eq!(
            relayed_to_a,
            vec![ServerMessage::Edit {
                operation: op2.clone(),
                origin: "bob".into()
            }]
        );

        let algebra = YrsAlgebra;
        let expected = algebra
            .compose(&algebra.compose(&initial, &op1).unwrap(), &op2)
            .unwrap();
        let snapshot = hub.snapshot_of("R1").await.unwrap();
        assert_eq!(text_of(&snapshot), text_of(&expected));

        assert!(hub.flush(Duration::from_secs(2)).await);
        let persisted = hub.store().get("R1").unwrap().unwrap();
        assert_eq!(text_of(&persisted), text_of(&expected));
    }

    #[tokio::test]
    async fn test_scenario_save_then_join_sees_saved_content() {
        let hub = Hub::in_memory(HubConfig::for_testing());
        let (a, mut rx_a) = hub.connect().await;
        hub.join(a, "R1", "alice").await;
        let initial = initialized_snapshot(&drain(&mut rx_a));
        assert_eq!(text_of(&initial), "");

        let saved = YrsAlgebra
            .compose(&initial, &append(&Doc::with_client_id(7), &initial, "X"))
            .unwrap();
        assert!(hub.save(a, "R1", saved.clone()).await);

        let (b, mut rx_b) = hub.connect().await;
        hub.join(b, "R1", "bob").await;
        let bootstrap = initialized_snapshot(&drain(&mut rx_b));
        assert_eq!(bootstrap, saved);
        assert_eq!(text_of(&bootstrap), "X");
    }

    #[tokio::test]
    async fn test_scenario_ungraceful_disconnect_does_not_block() {
        let hub = Hub::in_memory(HubConfig::for_testing());
        let (a, mut rx_a) = hub.connect().await;
        let (b, rx_b) = hub.connect().await;
        hub.join(a, "R1", "alice").await;
        hub.join(b, "R1", "bob").await;
        let initial = initialized_snapshot(&drain(&mut rx_a));

        drop(rx_b);
        let op = append(&Doc::with_client_id(1), &initial, "alone");
        let outcome = tokio::time::timeout(Duration::from_secs(1), hub.edit(a, "R1", op))
            .await
            .expect("edit blocked on a dead peer");
        assert!(matches!(outcome, EditOutcome::Relayed { .. }));
        assert!(drain(&mut rx_a).is_empty());

        hub.disconnect(b).await;
        assert_eq!(hub.members_of("R1").await, vec!["alice"]);
        assert_eq!(
            drain(&mut rx_a),
            vec![
                ServerMessage::UserLeft {
                    display_name: "bob".into()
                },
                ServerMessage::ConnectedUsers {
                    members: vec!["alice".into()]
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_persisted_snapshot_seeds_new_room() {
        let store = Arc::new(MemoryStore::new());
        let algebra = YrsAlgebra;
        let seeded = algebra
            .compose(&algebra.empty(), &append(&Doc::new(), &algebra.empty(), "kept"))
            .unwrap();
        store.put("R1", &seeded).unwrap();

        let hub = Hub::with_store(HubConfig::for_testing(), store.clone());
        let (a, mut rx_a) = hub.connect().await;
        hub.join(a, "R1", "alice").await;
        let initial = initialized_snapshot(&drain(&mut rx_a));
        assert_eq!(text_of(&initial), "kept");

        hub.edit(a, "R1", append(&Doc::with_client_id(3), &initial, "!"))
            .await;
        assert!(hub.flush(Duration::from_secs(2)).await);
        assert_eq!(text_of(&store.get("R1").unwrap().unwrap()), "kept!");
    }

    #[tokio::test]
    async fn test_malformed_edit_rejected_for_origin_only() {
        let hub = Hub::in_memory(HubConfig::for_testing());
        let (a, mut rx_a) = hub.connect().await;
        let (b, mut rx_b) = hub.connect().await;
        hub.join(a, "R1", "alice").await;
        hub.join(b, "R1", "bob").await;
        let before = hub.snapshot_of("R1").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let outcome = hub.edit(a, "R1", vec![0xFF, 0xFE, 0xFD]).await;
        assert!(matches!(outcome, EditOutcome::Rejected(_)));
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerMessage::DocumentError { .. }]
        ));
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(hub.snapshot_of("R1").await, before);
        assert_eq!(hub.stats().await.edits_rejected, 1);
    }

    #[tokio::test]
    async fn test_events_before_join_are_dropped() {
        let hub = Hub::in_memory(HubConfig::for_testing());
        let (a, mut rx_a) = hub.connect().await;
        assert_eq!(hub.edit(a, "R1", vec![1]).await, EditOutcome::Dropped);
        assert!(!hub.save(a, "R1", vec![1]).await);
        assert!(!hub.cursor(a, "R1", CursorKind::Move, None).await);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(hub.stats().await.events_dropped, 3);
        assert_eq!(hub.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_leave_semantics() {
        let hub = Hub::in_memory(HubConfig::for_testing());
        let (a, mut rx_a) = hub.connect().await;
        let (b, mut rx_b) = hub.connect().await;
        hub.join(a, "R1", "alice").await;
        hub.join(b, "R1", "bob").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        // Unknown room, unknown name and someone else's name are no-ops
        assert!(!hub.leave(a, "R9", "alice").await);
        assert!(!hub.leave(a, "R1", "nobody").await);
        assert!(!hub.leave(a, "R1", "bob").await);
        assert!(drain(&mut rx_b).is_empty());

        assert!(hub.leave(a, "R1", "alice").await);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(
            drain(&mut rx_b),
            vec![
                ServerMessage::UserLeft {
                    display_name: "alice".into()
                },
                ServerMessage::ConnectedUsers {
                    members: vec!["bob".into()]
                },
            ]
        );
        assert_eq!(hub.edit(a, "R1", vec![]).await, EditOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_cursor_relay_via_handle() {
        let hub = Hub::in_memory(HubConfig::for_testing());
        let (a, mut rx_a) = hub.connect().await;
        let (b, mut rx_b) = hub.connect().await;
        hub.join(a, "R1", "alice").await;
        hub.join(b, "R1", "bob").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.handle(
            a,
            ClientMessage::CursorSelection {
                room_id: "R1".into(),
                display_name: "alice".into(),
                cursor: Some(CursorRange::selection(0, 4)),
            },
        )
        .await;
        hub.handle(a, ClientMessage::Ping).await;

        assert_eq!(drain(&mut rx_a), vec![ServerMessage::Pong]);
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerMessage::RemoteCursorSelection {
                display_name: "alice".into(),
                cursor: Some(CursorRange::selection(0, 4)),
            }]
        );
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let hub = Hub::in_memory(HubConfig::for_testing());
        let (a, mut rx_a) = hub.connect().await;
        let (b, mut rx_b) = hub.connect().await;
        hub.join(a, "R1", "alice").await;
        hub.join(b, "R2", "bob").await;
        let initial = initialized_snapshot(&drain(&mut rx_a));
        drain(&mut rx_b);

        hub.edit(a, "R1", append(&Doc::new(), &initial, "only R1"))
            .await;
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(text_of(&hub.snapshot_of("R2").await.unwrap()), "");
        assert_eq!(hub.room_count().await, 2);
    }

    #[tokio::test]
    async fn test_empty_rooms_reaped_when_enabled() {
        let config = HubConfig {
            reap_empty_rooms: true,
            ..HubConfig::for_testing()
        };
        let hub = Hub::in_memory(config);
        let (a, _rx_a) = hub.connect().await;
        hub.join(a, "R1", "alice").await;
        assert_eq!(hub.room_count().await, 1);

        hub.disconnect(a).await;
        assert!(hub.flush(Duration::from_secs(2)).await);
        hub.reap_idle_rooms().await;
        assert_eq!(hub.room_count().await, 0);
        assert_eq!(hub.stats().await.active_connections, 0);
    }

    #[tokio::test]
    async fn test_slow_consumer_disconnected_on_edit_overflow() {
        let config = HubConfig {
            outbox_capacity: 3,
            ..HubConfig::for_testing()
        };
        let hub = Hub::in_memory(config);
        let (a, mut rx_a) = hub.connect().await;
        hub.join(a, "R1", "alice").await;
        let initial = initialized_snapshot(&drain(&mut rx_a));
        let (b, mut rx_b) = hub.connect().await;
        hub.join(b, "R1", "bob").await;
        drain(&mut rx_a);

        // Bob never reads: bootstrap took two slots, the first edit the third
        let author = Doc::with_client_id(1);
        hub.edit(a, "R1", append(&author, &initial, "1")).await;
        let outcome = hub.edit(a, "R1", append(&author, &initial, "2")).await;
        assert_eq!(
            outcome,
            EditOutcome::Relayed {
                recipients: 0,
                evicted: vec![b]
            }
        );

        assert_eq!(hub.members_of("R1").await, vec!["alice"]);
        assert_eq!(
            drain(&mut rx_a),
            vec![
                ServerMessage::UserLeft {
                    display_name: "bob".into()
                },
                ServerMessage::ConnectedUsers {
                    members: vec!["alice".into()]
                },
            ]
        );
        let stats = hub.stats().await;
        assert_eq!(stats.slow_consumers_dropped, 1);
        assert_eq!(stats.active_connections, 1);

        // Bob's queue ends after what it already holds, closing its socket
        assert_eq!(drain(&mut rx_b).len(), 3);
        assert!(matches!(
            rx_b.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(hub.edit(b, "R1", vec![]).await, EditOutcome::Dropped);
        assert_eq!(text_of(&hub.snapshot_of("R1").await.unwrap()), "12");
    }

    #[tokio::test]
    async fn test_slow_store_does_not_delay_relay() {
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(300),
        });
        let hub = Hub::with_store(HubConfig::for_testing(), store.clone());
        let (a, mut rx_a) = hub.connect().await;
        let (b, mut rx_b) = hub.connect().await;
        let (c, mut rx_c) = hub.connect().await;
        hub.join(a, "R1", "alice").await;
        hub.join(b, "R1", "bob").await;
        hub.join(c, "R2", "carol").await;
        let initial = initialized_snapshot(&drain(&mut rx_a));
        drain(&mut rx_b);
        let other_initial = initialized_snapshot(&drain(&mut rx_c));

        let author = Doc::with_client_id(1);
        for word in ["a", "b", "c", "d", "e"] {
            let op = append(&author, &initial, word);
            let outcome = tokio::time::timeout(Duration::from_millis(100), hub.edit(a, "R1", op))
                .await
                .expect("edit waited on a snapshot write");
            assert!(matches!(outcome, EditOutcome::Relayed { recipients: 1, .. }));
        }
        assert_eq!(drain(&mut rx_b).len(), 5);

        // Another room is just as responsive while R1 is still writing
        let op = append(&Doc::with_client_id(2), &other_initial, "z");
        tokio::time::timeout(Duration::from_millis(100), hub.edit(c, "R2", op))
            .await
            .expect("edit in another room waited on a snapshot write");

        assert!(hub.flush(Duration::from_secs(5)).await);
        assert_eq!(text_of(&store.get("R1").unwrap().unwrap()), "abcde");
        assert_eq!(text_of(&store.get("R2").unwrap().unwrap()), "z");
    }
}
