//! Binary protocol between editing clients and the hub.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded message:
//! ```text
//! client ──► hub : ClientMessage  (join-room, edit, save, cursor-*, leave-room, ping)
//! hub ──► client : ServerMessage  (initialize-document, user-joined, connected-users,
//!                                  edit, user-left, remote-cursor-*, document-error, pong)
//! ```
//!
//! Edit operations and snapshots are opaque byte blobs owned by the delta
//! algebra; the protocol never looks inside them.

use serde::{Deserialize, Serialize};

/// A caret or selection inside the document, in character offsets.
///
/// `length == 0` is a collapsed caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub index: u32,
    pub length: u32,
}

impl CursorRange {
    pub fn caret(index: u32) -> Self {
        Self { index, length: 0 }
    }

    pub fn selection(index: u32, length: u32) -> Self {
        Self { index, length }
    }

    pub fn is_collapsed(&self) -> bool {
        self.length == 0
    }
}

/// Messages sent by a client to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Enter a room under a display name.
    JoinRoom {
        room_id: String,
        display_name: String,
    },
    /// Incremental edit operation to sequence and relay.
    Edit {
        room_id: String,
        display_name: String,
        operation: Vec<u8>,
    },
    /// Full-state checkpoint. Overwrites the room snapshot, never relayed.
    Save {
        room_id: String,
        content: Vec<u8>,
    },
    /// Selection changed (`None` = editor lost focus).
    CursorSelection {
        room_id: String,
        display_name: String,
        cursor: Option<CursorRange>,
    },
    /// Caret moved while typing.
    CursorMove {
        room_id: String,
        display_name: String,
        cursor: Option<CursorRange>,
    },
    /// Leave the room gracefully.
    LeaveRoom {
        room_id: String,
        display_name: String,
    },
    /// Heartbeat ping
    Ping,
}

impl ClientMessage {
    /// Event name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::Edit { .. } => "edit",
            Self::Save { .. } => "save",
            Self::CursorSelection { .. } => "cursor-selection",
            Self::CursorMove { .. } => "cursor-move",
            Self::LeaveRoom { .. } => "leave-room",
            Self::Ping => "ping",
        }
    }

    /// Room the message targets, if any.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::JoinRoom { room_id, .. }
            | Self::Edit { room_id, .. }
            | Self::Save { room_id, .. }
            | Self::CursorSelection { room_id, .. }
            | Self::CursorMove { room_id, .. }
            | Self::LeaveRoom { room_id, .. } => Some(room_id),
            Self::Ping => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Messages sent by the hub to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Current room snapshot, sent to a joining connection only.
    InitializeDocument { snapshot: Vec<u8> },
    /// A new participant entered the room.
    UserJoined { display_name: String },
    /// Authoritative roster, in first-join order.
    ConnectedUsers { members: Vec<String> },
    /// Relayed edit operation.
    Edit { operation: Vec<u8>, origin: String },
    /// A participant left the room.
    UserLeft { display_name: String },
    RemoteCursorSelection {
        display_name: String,
        cursor: Option<CursorRange>,
    },
    RemoteCursorMove {
        display_name: String,
        cursor: Option<CursorRange>,
    },
    /// Non-fatal error addressed to the acting connection only.
    DocumentError { message: String },
    /// Heartbeat pong
    Pong,
}

impl ServerMessage {
    /// Event name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitializeDocument { .. } => "initialize-document",
            Self::UserJoined { .. } => "user-joined",
            Self::ConnectedUsers { .. } => "connected-users",
            Self::Edit { .. } => "edit",
            Self::UserLeft { .. } => "user-left",
            Self::RemoteCursorSelection { .. } => "remote-cursor-selection",
            Self::RemoteCursorMove { .. } => "remote-cursor-move",
            Self::DocumentError { .. } => "document-error",
            Self::Pong => "pong",
        }
    }

    pub fn document_error(message: impl Into<String>) -> Self {
        Self::DocumentError {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(msg)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
