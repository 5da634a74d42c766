//! WebSocket client for the sync server.
//!
//! Provides:
//! - Connection lifecycle (`join` handshake, `disconnect`)
//! - A local [`Replica`] kept current from `initDoc` and `newChange`
//! - Author registration state for resuming with a token
//!
//! Used by headless tools and the integration tests.

use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{AuthorId, Change, ChangeError, Item, Version};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientEvent, JoinRequest, ProtocolError, ServerEvent};
use crate::session::AuthorData;

/// Client-side copy of a document and its authors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Replica {
    author_id: Option<AuthorId>,
    token: Option<String>,
    history: Change,
    document: Vec<Item>,
    authors: BTreeMap<AuthorId, AuthorData>,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one server event into the replica.
    pub fn apply(&mut self, event: &ServerEvent) -> Result<(), ChangeError> {
        match event {
            ServerEvent::Registered { author_id, token } => {
                self.author_id = Some(*author_id);
                self.token = Some(token.clone());
            }
            ServerEvent::AuthorChange { author_id, author_data } => {
                self.authors.insert(*author_id, author_data.clone());
            }
            ServerEvent::AuthorDisconnect(author_id) => {
                self.authors.remove(author_id);
            }
            ServerEvent::InitDoc { history, authors } => {
                if history.start == 0 {
                    self.document = history.apply_to(&[])?;
                    self.history = history.clone();
                } else {
                    // Resumed from a known height: only the tail was sent.
                    self.append(history.clone())?;
                }
                self.authors = authors.clone();
            }
            ServerEvent::NewChange(change) => self.append(change.clone())?,
            ServerEvent::Error(message) => warn!("Server error: {message}"),
        }
        Ok(())
    }

    fn append(&mut self, change: Change) -> Result<(), ChangeError> {
        let document = change.apply_to(&self.document)?;
        self.history.concat(change)?;
        self.document = document;
        Ok(())
    }

    pub fn author_id(&self) -> Option<AuthorId> {
        self.author_id
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn version(&self) -> Version {
        self.history.end()
    }

    pub fn history(&self) -> &Change {
        &self.history
    }

    pub fn document(&self) -> &[Item] {
        &self.document
    }

    pub fn authors(&self) -> &BTreeMap<AuthorId, AuthorData> {
        &self.authors
    }

    /// Handshake that resumes this author from the current version.
    pub fn resume_request(&self, doc_name: impl Into<String>) -> JoinRequest {
        JoinRequest {
            doc_name: doc_name.into(),
            author_id: self.author_id,
            token: self.token.clone(),
            start_height: Some(self.version()),
        }
    }
}

/// The sync client.
pub struct SyncClient {
    outgoing: mpsc::Sender<String>,
    events: mpsc::Receiver<ServerEvent>,
    connected: Arc<AtomicBool>,
    replica: Replica,
}

impl SyncClient {
    /// Connect to `url` and send the `join` handshake.
    ///
    /// Spawns one writer and one reader task; both end with the connection.
    pub async fn connect(url: &str, join: JoinRequest) -> Result<Self, ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            warn!("Could not connect to {url}: {e}");
            ProtocolError::ConnectionClosed
        })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let connected = Arc::new(AtomicBool::new(true));
        let (event_tx, event_rx) = mpsc::channel(256);
        let reader_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            reader_connected.store(false, Ordering::Relaxed);
            debug!("Connection to server closed");
        });

        let client = Self {
            outgoing: out_tx,
            events: event_rx,
            connected,
            replica: Replica::new(),
        };
        client.send(&ClientEvent::Join(join)).await?;
        Ok(client)
    }

    pub async fn send(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        self.send_raw(event.encode()?).await
    }

    /// Send an arbitrary text frame.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.outgoing
            .send(text.into())
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn submit_change(&self, change: Change) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::SubmitChange(change)).await
    }

    pub async fn change_author(&self, name: impl Into<String>, color: impl Into<String>) -> Result<(), ProtocolError> {
        let data = AuthorData {
            name: name.into(),
            color: color.into(),
        };
        self.send(&ClientEvent::ChangeAuthor(data)).await
    }

    pub async fn log_event(&self, event: serde_json::Value) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::LogEvent(event)).await
    }

    /// Announce departure and close the connection.
    pub async fn disconnect(self) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Disconnect).await
    }

    /// Next server event, already folded into the replica. `None` once the
    /// connection is gone.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        let event = self.events.recv().await?;
        if let Err(e) = self.replica.apply(&event) {
            warn!("Replica out of sync after '{}': {e}", event.kind());
        }
        Some(event)
    }

    /// Like [`next_event`](Self::next_event) but gives up after `timeout`.
    pub async fn next_event_timeout(&mut self, timeout: Duration) -> Option<ServerEvent> {
        tokio::time::timeout(timeout, self.next_event()).await.ok().flatten()
    }

    /// Consume events until one of `kind` arrives.
    pub async fn wait_for(&mut self, kind: &str, timeout: Duration) -> Option<ServerEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let event = self.next_event_timeout(remaining).await?;
            if event.kind() == kind {
                return Some(event);
            }
        }
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}
