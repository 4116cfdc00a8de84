//! Room membership bookkeeping.
//!
//! A [`Roster`] is the ordered participant list of one room. The
//! [`RoomRegistry`] maps room ids to their sequencer ([`Room`]), creating
//! rooms lazily on first join. Not-found cases are no-ops, never errors, so
//! duplicate joins and leaves from flaky channels stay harmless.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::broadcast::Outbox;
use crate::sequencer::Room;

/// What to do when a display name already present in a room joins again
/// from a different connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejoinPolicy {
    /// The new connection takes over the existing entry. Membership and
    /// order are unchanged; the stale connection stops receiving relays.
    #[default]
    Rebind,
    /// The original connection stays bound; the newcomer is not admitted.
    KeepExisting,
}

impl std::str::FromStr for RejoinPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rebind" => Ok(Self::Rebind),
            "keep" | "keep-existing" | "keep_existing" => Ok(Self::KeepExisting),
            other => Err(format!("unknown rejoin policy '{other}'")),
        }
    }
}

/// One connection bound to a display name inside a room.
#[derive(Debug, Clone)]
pub struct Participant {
    pub display_name: String,
    pub outbox: Outbox,
}

impl Participant {
    pub fn connection_id(&self) -> Uuid {
        self.outbox.connection_id()
    }
}

/// Result of [`Roster::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// A new entry was appended.
    pub is_new_participant: bool,
    /// The joining connection is now the one bound to the name.
    pub bound: bool,
    /// Connection that was displaced by a rebind.
    pub displaced: Option<Uuid>,
    /// Members after the join, in first-join order.
    pub members: Vec<String>,
}

/// Ordered membership of a single room.
#[derive(Debug, Default)]
pub struct Roster {
    participants: Vec<Participant>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `display_name` bound to `outbox`, or handle a rejoin per `policy`.
    pub fn join(
        &mut self,
        display_name: &str,
        outbox: Outbox,
        policy: RejoinPolicy,
    ) -> JoinOutcome {
        let connection_id = outbox.connection_id();
        let existing = self
            .participants
            .iter()
            .position(|p| p.display_name == display_name);

        let (is_new_participant, bound, displaced) = match existing {
            None => {
                self.participants.push(Participant {
                    display_name: display_name.to_string(),
                    outbox,
                });
                (true, true, None)
            }
            Some(idx) => {
                let p = &mut self.participants[idx];
                if p.connection_id() == connection_id {
                    (false, true, None)
                } else {
                    match policy {
                        RejoinPolicy::Rebind => {
                            let previous = p.connection_id();
                            p.outbox = outbox;
                            (false, true, Some(previous))
                        }
                        RejoinPolicy::KeepExisting => (false, false, None),
                    }
                }
            }
        };

        JoinOutcome {
            is_new_participant,
            bound,
            displaced,
            members: self.members(),
        }
    }

    /// Remove `display_name`. Unknown names are a no-op.
    pub fn leave(&mut self, display_name: &str) -> Vec<String> {
        self.participants.retain(|p| p.display_name != display_name);
        self.members()
    }

    /// Remove whichever participant is bound to `connection_id`.
    pub fn leave_connection(&mut self, connection_id: Uuid) -> Option<Participant> {
        let idx = self
            .participants
            .iter()
            .position(|p| p.connection_id() == connection_id)?;
        Some(self.participants.remove(idx))
    }

    /// Display names in first-join order.
    pub fn members(&self) -> Vec<String> {
        self.participants
            .iter()
            .map(|p| p.display_name.clone())
            .collect()
    }

    /// Participant bound to `connection_id`, if any.
    pub fn bound_to(&self, connection_id: Uuid) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.connection_id() == connection_id)
    }

    pub fn participant(&self, display_name: &str) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.display_name == display_name)
    }

    /// Outboxes of every member, in membership order.
    pub fn outboxes(&self) -> impl Iterator<Item = &Outbox> {
        self.participants.iter().map(|p| &p.outbox)
    }

    /// Outboxes of every member except `connection_id`, in membership order.
    pub fn outboxes_except(&self, connection_id: Uuid) -> impl Iterator<Item = &Outbox> {
        self.participants
            .iter()
            .filter(move |p| p.connection_id() != connection_id)
            .map(|p| &p.outbox)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

/// Room id → sequencer map.
///
/// Rooms are never removed implicitly; see [`RoomRegistry::remove_idle`].
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the room for `room_id`.
    pub async fn get_or_create<F>(&self, room_id: &str, make: F) -> Arc<Room>
    where
        F: FnOnce() -> Room,
    {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        let room = Arc::new(make());
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    /// Existing room, without creating one.
    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Members of `room_id`; empty for an unknown room.
    pub async fn members_of(&self, room_id: &str) -> Vec<String> {
        match self.get(room_id).await {
            Some(room) => room.members().await,
            None => Vec::new(),
        }
    }

    /// Drop rooms that have no members and nothing left to persist.
    pub async fn remove_idle(&self) -> usize {
        let candidates: Vec<(String, Arc<Room>)> = {
            let rooms = self.rooms.read().await;
            rooms.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut idle = Vec::new();
        for (room_id, room) in candidates {
            if room.is_idle().await {
                idle.push(room_id);
            }
        }

        let mut rooms = self.rooms.write().await;
        let mut removed = 0;
        for room_id in idle {
            // Re-check: someone may have joined since the scan, or be holding
            // the room between lookup and join
            let still_idle = match rooms.get(&room_id) {
                Some(room) => Arc::strong_count(room) == 1 && room.try_is_idle(),
                None => false,
            };
            if still_idle {
                rooms.remove(&room_id);
                removed += 1;
                log::info!("Room {room_id} reaped (idle)");
            }
        }
        removed
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// All rooms, for draining persistence.
    pub(crate) async fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox() -> Outbox {
        Outbox::channel(Uuid::new_v4(), 8).0
    }

    #[test]
    fn test_join_preserves_first_join_order() {
        let mut roster = Roster::new();
        for name in ["alice", "bob", "carol"] {
            let outcome = roster.join(name, outbox(), RejoinPolicy::Rebind);
            assert!(outcome.is_new_participant);
            assert!(outcome.bound);
        }
        assert_eq!(roster.members(), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_same_connection_rejoin_is_noop() {
        let mut roster = Roster::new();
        let ob = outbox();
        roster.join("alice", ob.clone(), RejoinPolicy::Rebind);
        roster.join("bob", outbox(), RejoinPolicy::Rebind);

        let outcome = roster.join("alice", ob, RejoinPolicy::Rebind);
        assert!(!outcome.is_new_participant);
        assert!(outcome.bound);
        assert_eq!(outcome.displaced, None);
        assert_eq!(outcome.members, vec!["alice", "bob"]);
    }

    #[test]
    fn test_rebind_moves_name_to_new_connection() {
        let mut roster = Roster::new();
        let old = outbox();
        let new = outbox();
        roster.join("alice", old.clone(), RejoinPolicy::Rebind);
        roster.join("bob", outbox(), RejoinPolicy::Rebind);

        let outcome = roster.join("alice", new.clone(), RejoinPolicy::Rebind);
        assert!(!outcome.is_new_participant);
        assert!(outcome.bound);
        assert_eq!(outcome.displaced, Some(old.connection_id()));
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.members(), vec!["alice", "bob"]);
        assert!(roster.bound_to(old.connection_id()).is_none());
        assert_eq!(
            roster.bound_to(new.connection_id()).map(|p| p.display_name.as_str()),
            Some("alice")
        );
    }

    #[test]
    fn test_keep_existing_refuses_newcomer() {
        let mut roster = Roster::new();
        let old = outbox();
        let new = outbox();
        roster.join("alice", old.clone(), RejoinPolicy::KeepExisting);

        let outcome = roster.join("alice", new.clone(), RejoinPolicy::KeepExisting);
        assert!(!outcome.is_new_participant);
        assert!(!outcome.bound);
        assert_eq!(roster.len(), 1);
        assert!(roster.bound_to(old.connection_id()).is_some());
        assert!(roster.bound_to(new.connection_id()).is_none());
    }

    #[test]
    fn test_leave_unknown_is_noop() {
        let mut roster = Roster::new();
        roster.join("alice", outbox(), RejoinPolicy::Rebind);
        assert_eq!(roster.leave("nobody"), vec!["alice"]);
        assert_eq!(roster.leave("alice"), Vec::<String>::new());
        assert!(roster.is_empty());
    }

    #[test]
    fn test_leave_connection() {
        let mut roster = Roster::new();
        let a = outbox();
        roster.join("alice", a.clone(), RejoinPolicy::Rebind);
        roster.join("bob", outbox(), RejoinPolicy::Rebind);

        let removed = roster.leave_connection(a.connection_id()).unwrap();
        assert_eq!(removed.display_name, "alice");
        assert!(roster.leave_connection(a.connection_id()).is_none());
        assert_eq!(roster.members(), vec!["bob"]);
    }

    #[test]
    fn test_outboxes_except_keeps_order() {
        let mut roster = Roster::new();
        let a = outbox();
        let b = outbox();
        let c = outbox();
        roster.join("a", a.clone(), RejoinPolicy::Rebind);
        roster.join("b", b.clone(), RejoinPolicy::Rebind);
        roster.join("c", c.clone(), RejoinPolicy::Rebind);

        let ids: Vec<Uuid> = roster
            .outboxes_except(b.connection_id())
            .map(|o| o.connection_id())
            .collect();
        assert_eq!(ids, vec![a.connection_id(), c.connection_id()]);
        assert_eq!(roster.outboxes().count(), 3);
    }

    #[test]
    fn test_rejoin_policy_parse() {
        assert_eq!("rebind".parse::<RejoinPolicy>().unwrap(), RejoinPolicy::Rebind);
        assert_eq!("Keep".parse::<RejoinPolicy>().unwrap(), RejoinPolicy::KeepExisting);
        assert!("sometimes".parse::<RejoinPolicy>().is_err());
    }
}
