//! WebSocket client for the hub.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - Typed senders for every client message
//! - Decoded server messages delivered on an event channel
//!
//! Used by the integration tests and by tools that drive a hub directly.

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, CursorRange, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A message from the hub
    Message(ServerMessage),
    /// Connection lost or closed
    Disconnected,
}

/// Client errors.
#[derive(Debug, Clone)]
pub enum ClientError {
    /// WebSocket handshake or TCP connect failed
    ConnectFailed(String),
    Protocol(ProtocolError),
    /// Connection is no longer open
    Closed,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::ConnectFailed(e) => write!(f, "Connect failed: {e}"),
            ClientError::Protocol(e) => write!(f, "Protocol error: {e}"),
            ClientError::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

/// Hub client.
pub struct HubClient {
    url: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::Sender<Outgoing>,
}

impl HubClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:9090`).
    ///
    /// Spawns reader and writer tasks; server messages arrive on the
    /// returned receiver.
    pub async fn connect(
        url: impl Into<String>,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), ClientError> {
        let url = url.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let (event_tx, event_rx) = mpsc::channel(256);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Outgoing>(256);

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(out) = outgoing_rx.recv().await {
                let result = match out {
                    Outgoing::Frame(data) => ws_writer.send(Message::Binary(data.into())).await,
                    Outgoing::Close => {
                        let _ = ws_writer.close().await;
                        break;
                    }
                };
                if result.is_err() {
                    break;
                }
            }
        });

        // Reader task: decode server messages into events
        let reader_state = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(server_msg) => {
                            if event_tx.send(ClientEvent::Message(server_msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from hub: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }

            *reader_state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        log::debug!("Connected to hub at {url}");
        Ok((
            Self {
                url,
                state,
                outgoing_tx,
            },
            event_rx,
        ))
    }

    /// Send any client message.
    pub async fn send(&self, msg: &ClientMessage) -> Result<(), ClientError> {
        if *self.state.read().await == ConnectionState::Disconnected {
            return Err(ClientError::Closed);
        }
        let encoded = msg.encode()?;
        self.outgoing_tx
            .send(Outgoing::Frame(encoded))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Send raw bytes as one binary frame, bypassing the codec.
    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        self.outgoing_tx
            .send(Outgoing::Frame(bytes))
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub async fn join_room(&self, room_id: &str, display_name: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
            display_name: display_name.to_string(),
        })
        .await
    }

    pub async fn edit(
        &self,
        room_id: &str,
        display_name: &str,
        operation: Vec<u8>,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::Edit {
            room_id: room_id.to_string(),
            display_name: display_name.to_string(),
            operation,
        })
        .await
    }

    pub async fn save(&self, room_id: &str, content: Vec<u8>) -> Result<(), ClientError> {
        self.send(&ClientMessage::Save {
            room_id: room_id.to_string(),
            content,
        })
        .await
    }

    pub async fn cursor_selection(
        &self,
        room_id: &str,
        display_name: &str,
        cursor: Option<CursorRange>,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::CursorSelection {
            room_id: room_id.to_string(),
            display_name: display_name.to_string(),
            cursor,
        })
        .await
    }

    pub async fn cursor_move(
        &self,
        room_id: &str,
        display_name: &str,
        cursor: Option<CursorRange>,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::CursorMove {
            room_id: room_id.to_string(),
            display_name: display_name.to_string(),
            cursor,
        })
        .await
    }

    pub async fn leave_room(&self, room_id: &str, display_name: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::LeaveRoom {
            room_id: room_id.to_string(),
            display_name: display_name.to_string(),
        })
        .await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Ping).await
    }

    /// Close the WebSocket gracefully.
    pub async fn close(&self) {
        let _ = self.outgoing_tx.send(Outgoing::Close).await;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}
