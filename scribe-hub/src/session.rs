//! Per-connection session state.
//!
//! ```text
//! Disconnected ──join──► Joining ──admitted──► Active ──leave──► Leaving
//!      ▲                    │                    │                  │
//!      └──── not admitted ──┘◄── displaced / lost┘◄──────── done ───┘
//! ```
//!
//! A connection keeps one state per room it has touched. Edit, save and
//! cursor events are only accepted in `Active`; in any other state they are
//! dropped, never queued.

use std::collections::HashMap;

/// Lifecycle of a connection within one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Joining,
    Active,
    Leaving,
}

#[derive(Debug, Clone)]
struct RoomSession {
    display_name: String,
    state: SessionState,
}

/// Room sessions of one connection.
#[derive(Debug, Default)]
pub struct Session {
    rooms: HashMap<String, RoomSession>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, room_id: &str) -> SessionState {
        self.rooms
            .get(room_id)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    pub fn is_active(&self, room_id: &str) -> bool {
        self.state(room_id) == SessionState::Active
    }

    /// Display name this connection is active under in `room_id`.
    pub fn display_name(&self, room_id: &str) -> Option<&str> {
        self.rooms
            .get(room_id)
            .filter(|s| s.state == SessionState::Active)
            .map(|s| s.display_name.as_str())
    }

    /// Enter `Joining`. Returns the name previously active in this room if
    /// the connection is switching to a different one.
    pub fn begin_join(&mut self, room_id: &str, display_name: &str) -> Option<String> {
        let previous = self
            .display_name(room_id)
            .filter(|name| *name != display_name)
            .map(str::to_string);
        self.rooms.insert(
            room_id.to_string(),
            RoomSession {
                display_name: display_name.to_string(),
                state: SessionState::Joining,
            },
        );
        previous
    }

    /// Leave `Joining`: `Active` if the room bound the name to us.
    pub fn complete_join(&mut self, room_id: &str, admitted: bool) {
        if admitted {
            if let Some(s) = self.rooms.get_mut(room_id) {
                s.state = SessionState::Active;
            }
        } else {
            self.rooms.remove(room_id);
        }
    }

    /// Enter `Leaving` if active. Returns the name to remove.
    pub fn begin_leave(&mut self, room_id: &str) -> Option<String> {
        let s = self.rooms.get_mut(room_id)?;
        if s.state != SessionState::Active {
            return None;
        }
        s.state = SessionState::Leaving;
        Some(s.display_name.clone())
    }

    pub fn complete_leave(&mut self, room_id: &str) {
        self.rooms.remove(room_id);
    }

    /// The name was taken over by another connection.
    pub fn detach(&mut self, room_id: &str) {
        if self.rooms.remove(room_id).is_some() {
            log::debug!("Session detached from room {room_id}");
        }
    }

    /// Channel lost: every room still held, for implicit leave.
    pub fn close(&mut self) -> Vec<String> {
        self.rooms.drain().map(|(room_id, _)| room_id).collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
