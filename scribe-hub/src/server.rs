//! WebSocket gateway in front of the hub.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── Room R1 ── roster + snapshot
//!            ├── handle_connection ─┤       │
//! Client B ──┘   (one task each)    │       └── SnapshotWriter ── SnapshotStore
//!                                   └── Room R2 ...                (Memory / RocksDB)
//! ```
//!
//! Each connection task multiplexes two sources with `tokio::select!`:
//! inbound WebSocket frames (decoded into [`ClientMessage`] and handed to the
//! hub) and the connection's outbox (frames the hub relays to it). When the
//! socket closes or errors, the hub runs an implicit leave.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::hub::{Hub, HubConfig, HubStats};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::storage::{MemoryStore, RocksStore, SnapshotStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `SCRIBE_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("SCRIBE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("SCRIBE_STORAGE_PATH").filter(|p| !p.is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(raw) = lookup("SCRIBE_OUTBOX_CAPACITY") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => config.hub.outbox_capacity = n,
                _ => log::warn!("Ignoring invalid SCRIBE_OUTBOX_CAPACITY={raw}"),
            }
        }
        if let Some(raw) = lookup("SCRIBE_REJOIN_POLICY") {
            match raw.parse() {
                Ok(policy) => config.hub.rejoin_policy = policy,
                Err(e) => log::warn!("Ignoring SCRIBE_REJOIN_POLICY: {e}"),
            }
        }
        if let Some(raw) = lookup("SCRIBE_REAP_EMPTY_ROOMS") {
            config.hub.reap_empty_rooms = matches!(raw.as_str(), "1" | "true" | "yes");
        }

        config
    }
}

/// The hub server.
pub struct HubServer {
    config: ServerConfig,
    hub: Arc<Hub>,
}

impl HubServer {
    /// Open the configured store and build the hub.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(RocksStore::open(store_config)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Build on an already-open store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let hub = Arc::new(Hub::with_store(config.hub.clone(), store));
        Self { config, hub }
    }

    /// Count the rooms that already have a persisted snapshot. Rooms load
    /// lazily on first join.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let rooms = self.hub.store().list_rooms()?;
        log::info!("{} rooms with persisted snapshots", rooms.len());
        Ok(rooms.len())
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.recover()?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Hub server listening on {}", self.config.bind_addr);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept loop on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Wait for pending snapshot writes, e.g. before exiting.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        log::info!("Flushing pending snapshots");
        self.hub.flush(timeout).await
    }

    pub async fn stats(&self) -> HubStats {
        self.hub.stats().await
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<Hub>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (connection_id, mut outbox) = hub.connect().await;
    log::info!("WebSocket connection {connection_id} established from {addr}");

    let result = loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        match ClientMessage::decode(&data) {
                            Ok(client_msg) => hub.handle(connection_id, client_msg).await,
                            Err(e) => {
                                log::warn!("Undecodable frame from {addr}: {e}");
                                let reply = ServerMessage::document_error("Unrecognized message");
                                if let Ok(encoded) = reply.encode() {
                                    let frame = Message::Binary(encoded.into());
                                    if let Err(e) = ws_sender.send(frame).await {
                                        break Err(e.into());
                                    }
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = ws_sender.send(Message::Pong(payload)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {connection_id} from {addr} closed");
                        break Ok(());
                    }
                    Some(Ok(Message::Text(_))) => {
                        log::warn!("Ignoring text frame from {addr}");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        break Err(e.into());
                    }
                }
            }

            frame = outbox.recv() => {
                match frame {
                    Some(frame) => {
                        let bytes: Vec<u8> = frame.as_ref().clone();
                        if let Err(e) = ws_sender.send(Message::Binary(bytes.into())).await {
                            break Err(e.into());
                        }
                    }
                    None => break Ok(()),
                }
            }
        }
    };

    // Implicit leave for every room this connection still holds
    hub.disconnect(connection_id).await;
    result
}
