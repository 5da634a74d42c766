//! WebSocket transport for the sync service.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌── BroadcastGroup (docName) ── peer queues ──► Client A, B
//!             ├── join frame ──┤
//! Client B ──┘                 └── SyncService ── DocumentActor ── HistoryStore
//!                                                                  ├── MemoryHistoryStore
//!                                                                  └── RocksHistoryStore
//! ```
//!
//! Each connection runs one task: the first text frame must be `join`,
//! after which the task selects between inbound frames (dispatched to the
//! service) and its peer queue (written to the socket). Unknown event types
//! are answered with an `error` frame and the connection is dropped.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 5 & 8

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Frame, RoomManager};
use crate::protocol::{Broadcaster, ClientEvent, ConnectionState, JoinRequest, ProtocolError, ServerEvent};
use crate::service::{ConnectionContext, SyncError, SyncService};
use crate::storage::{HistoryStore, MemoryHistoryStore, RocksHistoryStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per connection before it is evicted
    pub peer_queue_capacity: usize,
    /// Maximum connections per document
    pub max_peers_per_room: usize,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            peer_queue_capacity: 256,
            max_peers_per_room: 100,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `TANDEM_BIND_ADDR`, `TANDEM_STORAGE_PATH`,
    /// `TANDEM_PEER_QUEUE` and `TANDEM_MAX_PEERS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("TANDEM_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("TANDEM_STORAGE_PATH").filter(|p| !p.is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(n) = parse_count(&lookup, "TANDEM_PEER_QUEUE") {
            config.peer_queue_capacity = n;
        }
        if let Some(n) = parse_count(&lookup, "TANDEM_MAX_PEERS") {
            config.max_peers_per_room = n;
        }
        config
    }
}

fn parse_count(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            warn!("Ignoring {key}={raw}: expected a positive integer");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub protocol_errors: u64,
    pub active_rooms: usize,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    protocol_errors: AtomicU64,
}

/// Everything a connection task needs.
#[derive(Clone)]
struct Shared {
    service: Arc<SyncService>,
    rooms: Arc<RoomManager>,
    stats: Arc<AtomicServerStats>,
}

/// The sync server.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    shared: Shared,
}

impl SyncServer {
    /// Open the configured store and build the service over it.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn HistoryStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksHistoryStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryHistoryStore::new()),
        };
        Ok(Self::with_service(config, Arc::new(SyncService::new(store))))
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        Self::with_service(
            ServerConfig::default(),
            Arc::new(SyncService::new(Arc::new(MemoryHistoryStore::new()))),
        )
    }

    pub fn with_service(config: ServerConfig, service: Arc<SyncService>) -> Self {
        let rooms = Arc::new(RoomManager::new(config.peer_queue_capacity, config.max_peers_per_room));
        Self {
            config,
            shared: Shared {
                service,
                rooms,
                stats: Arc::new(AtomicServerStats::default()),
            },
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub fn stats(&self) -> ServerStats {
        let s = &self.shared.stats;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            total_messages: s.total_messages.load(Ordering::Relaxed),
            total_bytes: s.total_bytes.load(Ordering::Relaxed),
            protocol_errors: s.protocol_errors.load(Ordering::Relaxed),
            active_rooms: self.shared.rooms.room_count(),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<SyncService> {
        &self.shared.service
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.shared.rooms
    }
}

// ─── Connection handling ──────────────────────────────────────────────

async fn send_event(sink: &mut WsSink, event: &ServerEvent) -> Result<(), BoxError> {
    sink.send(Message::text(event.encode()?)).await?;
    Ok(())
}

async fn send_error(sink: &mut WsSink, message: impl Into<String>) -> Result<(), BoxError> {
    send_event(sink, &ServerEvent::Error(message.into())).await
}

/// Wait for the `join` handshake. `None` when the client hung up first.
async fn read_join(
    source: &mut WsSource,
    sink: &mut WsSink,
    state: ConnectionState,
    addr: SocketAddr,
) -> Result<Option<JoinRequest>, BoxError> {
    while let Some(msg) = source.next().await {
        match msg? {
            Message::Text(text) => {
                let event = match ClientEvent::decode(text.as_str()) {
                    Ok(event) => event,
                    Err(e) => {
                        send_error(sink, e.to_string()).await?;
                        return Err(e.into());
                    }
                };
                let accepted = state.accepts(&event);
                return match event {
                    ClientEvent::Join(join) if accepted => Ok(Some(join)),
                    other => {
                        let e = ProtocolError::UnexpectedEvent {
                            state,
                            event: other.kind(),
                        };
                        send_error(sink, e.to_string()).await?;
                        Err(e.into())
                    }
                };
            }
            Message::Ping(data) => sink.send(Message::Pong(data)).await?,
            Message::Close(_) => break,
            _ => debug!("Ignoring non-text frame from {addr} before join"),
        }
    }
    Ok(None)
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Shared) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    debug!("WebSocket connection established from {addr}");

    let mut state = ConnectionState::Connecting;
    let Some(join) = read_join(&mut ws_receiver, &mut ws_sender, state, addr).await? else {
        return Ok(());
    };

    let peer_id = Uuid::new_v4();
    let Some((room, mut peer_rx)) = shared.rooms.join(&join.doc_name, peer_id) else {
        warn!("Room '{}' is full; refusing {addr}", join.doc_name);
        send_error(&mut ws_sender, format!("Document '{}' has too many connections", join.doc_name)).await?;
        return Ok(());
    };

    shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let result = match open_session(&shared, &room, peer_id, &join, &mut state).await {
        Ok(ctx) => {
            info!("Author {} joined '{}' from {addr}", ctx.author_id(), join.doc_name);
            let result = pump(&shared, &ctx, state, &mut ws_sender, &mut ws_receiver, &mut peer_rx, addr).await;
            if let Err(e) = shared.service.on_disconnect(&ctx).await {
                warn!("Disconnect of author {} failed: {e}", ctx.author_id());
            }
            info!("Author {} left '{}'", ctx.author_id(), join.doc_name);
            result
        }
        Err(e) => {
            error!("Could not open '{}' for {addr} ({state:?}): {e}", join.doc_name);
            send_error(&mut ws_sender, e.to_string()).await
        }
    };

    let closed = shared.rooms.leave(&room, &peer_id, || {
        shared.service.evict(&join.doc_name);
    });
    if closed {
        debug!("Room '{}' closed", join.doc_name);
    }
    shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    result
}

/// Authenticate (falling back to a fresh author on bad credentials) and
/// run the welcome sequence, advancing `state` after each step.
async fn open_session(
    shared: &Shared,
    room: &Arc<BroadcastGroup>,
    peer_id: Uuid,
    join: &JoinRequest,
    state: &mut ConnectionState,
) -> Result<ConnectionContext, SyncError> {
    let authenticated = state.advance(ConnectionState::Authenticated)?;
    let broadcaster: Arc<dyn Broadcaster> = Arc::new(room.broadcaster(peer_id));
    let service = &shared.service;

    let ctx = match service
        .authenticate(&join.doc_name, join.author_id, join.token.clone(), Arc::clone(&broadcaster))
        .await
    {
        Ok(ctx) => ctx,
        Err(SyncError::Authentication { author_id, .. }) => {
            warn!("Author {author_id} failed to resume on '{}'; registering as new author", join.doc_name);
            service.authenticate(&join.doc_name, None, None, broadcaster).await?
        }
        Err(e) => return Err(e),
    };
    *state = authenticated;

    service
        .welcome_client(&ctx, join.start_height, |id| format!("Author {id}"))
        .await?;
    *state = state.advance(ConnectionState::Synced)?;
    Ok(ctx)
}

/// Main loop of a synced connection.
async fn pump(
    shared: &Shared,
    ctx: &ConnectionContext,
    mut state: ConnectionState,
    ws_sender: &mut WsSink,
    ws_receiver: &mut WsSource,
    peer_rx: &mut mpsc::Receiver<Frame>,
    addr: SocketAddr,
) -> Result<(), BoxError> {
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        shared.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        shared.stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);

                        let event = match ClientEvent::decode(text.as_str()) {
                            Ok(event) => event,
                            Err(e @ ProtocolError::UnknownMessageType(_)) => {
                                shared.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                                warn!("Dropping {addr}: {e}");
                                send_error(ws_sender, e.to_string()).await?;
                                break;
                            }
                            Err(e) => {
                                shared.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                                warn!("Malformed frame from {addr}: {e}");
                                send_error(ws_sender, e.to_string()).await?;
                                continue;
                            }
                        };

                        if !state.accepts(&event) {
                            shared.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                            let e = ProtocolError::UnexpectedEvent { state, event: event.kind() };
                            send_error(ws_sender, e.to_string()).await?;
                            continue;
                        }

                        match event {
                            ClientEvent::SubmitChange(change) => {
                                if let Err(e) = shared.service.on_submit_change(ctx, change).await {
                                    warn!("Submit from author {} failed: {e}", ctx.author_id());
                                    send_error(ws_sender, e.to_string()).await?;
                                }
                            }
                            ClientEvent::ChangeAuthor(data) => {
                                if let Err(e) = shared.service.on_change_author(ctx, data).await {
                                    send_error(ws_sender, e.to_string()).await?;
                                }
                            }
                            ClientEvent::LogEvent(value) => shared.service.on_log_event(ctx, &value),
                            ClientEvent::Disconnect => {
                                state = state.advance(ConnectionState::Disconnected)?;
                                debug!("Author {} disconnected ({state:?})", ctx.author_id());
                                break;
                            }
                            // Filtered by `accepts` above.
                            ClientEvent::Join(_) => {}
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {
                        debug!("Ignoring non-text frame from {addr}");
                    }
                }
            }

            frame = peer_rx.recv() => {
                match frame {
                    Some(frame) => ws_sender.send(Message::text(frame.to_string())).await?,
                    None => {
                        // Evicted by the room for falling behind.
                        warn!("Author {} evicted from '{}'", ctx.author_id(), ctx.doc_name());
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.peer_queue_capacity, 256);
        assert_eq!(config.max_peers_per_room, 100);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("TANDEM_BIND_ADDR", "0.0.0.0:8080"),
            ("TANDEM_STORAGE_PATH", "/var/lib/tandem"),
            ("TANDEM_PEER_QUEUE", "64"),
            ("TANDEM_MAX_PEERS", "zero"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/tandem")));
        assert_eq!(config.peer_queue_capacity, 64);
        assert_eq!(config.max_peers_per_room, 100);
    }

    #[test]
    fn test_config_empty_lookup_is_default() {
        assert_eq!(ServerConfig::from_lookup(|_| None), ServerConfig::default());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_open_session_advances_state() {
        let server = SyncServer::with_defaults();
        let shared = server.shared.clone();
        let peer_id = Uuid::new_v4();
        let (room, mut rx) = shared.rooms.join("doc", peer_id).unwrap();
        let join = JoinRequest::new("doc");

        let mut state = ConnectionState::Connecting;
        let ctx = open_session(&shared, &room, peer_id, &join, &mut state).await.unwrap();
        assert_eq!(state, ConnectionState::Synced);
        let kinds: Vec<String> = (0..3)
            .map(|_| ServerEvent::decode(&rx.try_recv().unwrap()).unwrap().kind().to_string())
            .collect();
        assert_eq!(kinds, vec!["registered", "authorChange", "initDoc"]);

        // A synced connection cannot run the handshake again, and nothing
        // is registered for the attempt.
        let again = open_session(&shared, &room, peer_id, &join, &mut state).await;
        assert!(matches!(
            again,
            Err(SyncError::Protocol(ProtocolError::InvalidTransition {
                from: ConnectionState::Synced,
                to: ConnectionState::Authenticated,
            }))
        ));
        assert_eq!(state, ConnectionState::Synced);
        assert!(rx.try_recv().is_err());
        let next_id = ctx.author_id() + 1;
        assert_eq!(shared.service.author("doc", next_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.service().store().list_documents().unwrap(), Vec::<String>::new());
    }
}
