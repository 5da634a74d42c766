//! Protocol orchestration over per-document actors.
//!
//! Architecture:
//! ```text
//!  connection A ─┐                      ┌────────────────────────────────┐
//!  connection B ─┼─ DocumentHandle ───► │ mpsc queue ─► DocumentActor    │
//!  connection C ─┘   (per doc)          │               CollaborationSession
//!                                       │               dyn HistoryStore │
//!                                       └───────────────┬────────────────┘
//!                                                       │ after commit
//!                                                       ▼
//!                                              Broadcaster (transport)
//! ```
//!
//! Each document is owned by one actor task that handles commands one at a
//! time, so submissions to a document are serialized and broadcasts leave in
//! commit order. Documents run in parallel. The first request for a document
//! loads it from the store; concurrent requests wait on the same load.

use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tandem_core::{AuthorId, Change, ChangeError, Version};
use tokio::sync::{mpsc, oneshot, OnceCell};

use crate::protocol::{Broadcaster, ProtocolError, ServerEvent};
use crate::session::{Author, AuthorData, CollaborationSession, SessionSnapshot};
use crate::storage::{HistoryStore, StoreError};

/// Commands buffered per document before senders wait.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Errors surfaced by the sync service.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Unknown author or wrong token on resumption
    Authentication { doc_name: String, author_id: AuthorId },
    Store(StoreError),
    Protocol(ProtocolError),
    /// Stored history could not be replayed
    Change(ChangeError),
    /// Request does not fit the session state (e.g. unknown author)
    InvalidState(String),
    /// The document actor has stopped
    SessionClosed,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authentication { doc_name, author_id } => {
                write!(f, "Authentication failed for author {author_id} on '{doc_name}'")
            }
            Self::Store(e) => write!(f, "Store error: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Change(e) => write!(f, "History error: {e}"),
            Self::InvalidState(e) => write!(f, "Invalid state: {e}"),
            Self::SessionClosed => write!(f, "Document session closed"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Protocol(e) => Some(e),
            Self::Change(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e)
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e)
    }
}

impl From<ChangeError> for SyncError {
    fn from(e: ChangeError) -> Self {
        SyncError::Change(e)
    }
}

/// Result of one `submitChange`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// Transactions appended to the history, as broadcast
    pub committed: Option<Change>,
    /// Transactions dropped by rebase or validation
    pub rejected: usize,
    /// Document version after the submission
    pub version: Version,
}

/// Author display name generator used by `welcome_client`.
pub type PlaceholderName = Box<dyn FnOnce(AuthorId) -> String + Send>;

enum Command {
    Authenticate {
        author_id: Option<AuthorId>,
        token: Option<String>,
        reply: oneshot::Sender<Result<AuthorId, SyncError>>,
    },
    Welcome {
        author_id: AuthorId,
        start_height: Option<Version>,
        placeholder_name: PlaceholderName,
        broadcaster: Arc<dyn Broadcaster>,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Submit {
        author_id: AuthorId,
        change: Change,
        broadcaster: Arc<dyn Broadcaster>,
        reply: oneshot::Sender<Result<SubmitOutcome, SyncError>>,
    },
    ChangeAuthor {
        author_id: AuthorId,
        data: AuthorData,
        broadcaster: Arc<dyn Broadcaster>,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Disconnect {
        author_id: AuthorId,
        broadcaster: Arc<dyn Broadcaster>,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    ClearHistory {
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Author {
        author_id: AuthorId,
        reply: oneshot::Sender<Option<Author>>,
    },
}

// ─── Document Actor ───────────────────────────────────────────────────

struct DocumentActor {
    session: CollaborationSession,
    store: Arc<dyn HistoryStore>,
}

impl DocumentActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        info!("Document '{}' unloaded", self.session.doc_name());
    }

    async fn handle(&mut self, command: Command) {
        // A dropped reply receiver means the caller went away; the work is done regardless.
        match command {
            Command::Authenticate { author_id, token, reply } => {
                let _ = reply.send(self.authenticate(author_id, token));
            }
            Command::Welcome {
                author_id,
                start_height,
                placeholder_name,
                broadcaster,
                reply,
            } => {
                let _ = reply.send(self.welcome(author_id, start_height, placeholder_name, &*broadcaster));
            }
            Command::Submit {
                author_id,
                change,
                broadcaster,
                reply,
            } => {
                let _ = reply.send(self.submit(author_id, change, &*broadcaster).await);
            }
            Command::ChangeAuthor {
                author_id,
                data,
                broadcaster,
                reply,
            } => {
                let _ = reply.send(self.change_author(author_id, data, &*broadcaster));
            }
            Command::Disconnect {
                author_id,
                broadcaster,
                reply,
            } => {
                let _ = reply.send(self.disconnect(author_id, &*broadcaster));
            }
            Command::ClearHistory { reply } => {
                let _ = reply.send(self.clear_history().await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.session.snapshot());
            }
            Command::Author { author_id, reply } => {
                let _ = reply.send(self.session.author(author_id).cloned());
            }
        }
    }

    fn doc_name(&self) -> &str {
        self.session.doc_name()
    }

    /// Run `f` against the store for this document on the blocking pool.
    async fn with_store<T: Send + 'static>(
        &self,
        f: impl FnOnce(&dyn HistoryStore, &str) -> Result<T, StoreError> + Send + 'static,
    ) -> Result<T, StoreError> {
        run_blocking(&self.store, self.doc_name(), f).await
    }

    fn auth_error(&self, author_id: AuthorId) -> SyncError {
        SyncError::Authentication {
            doc_name: self.doc_name().to_string(),
            author_id,
        }
    }

    fn authenticate(&mut self, author_id: Option<AuthorId>, token: Option<String>) -> Result<AuthorId, SyncError> {
        let Some(id) = author_id else {
            let id = self.session.add_author();
            debug!("New author {id} on '{}'", self.doc_name());
            return Ok(id);
        };

        let valid = token.is_some_and(|t| self.session.verify_token(id, &t));
        if !valid {
            warn!("Rejected credentials for author {id} on '{}'", self.doc_name());
            return Err(self.auth_error(id));
        }
        if let Some(author) = self.session.author_mut(id) {
            author.active = true;
        }
        debug!("Author {id} resumed on '{}'", self.doc_name());
        Ok(id)
    }

    fn welcome(
        &mut self,
        author_id: AuthorId,
        start_height: Option<Version>,
        placeholder_name: PlaceholderName,
        broadcaster: &dyn Broadcaster,
    ) -> Result<(), SyncError> {
        let version = self.session.version();
        let Some(author) = self.session.author_mut(author_id) else {
            return Err(SyncError::InvalidState(format!("Unknown author {author_id}")));
        };
        if author.name.is_empty() {
            author.name = placeholder_name(author_id);
        }
        let token = author.token.clone();
        let author_data = author.data();

        broadcaster.send_to_author(&ServerEvent::Registered { author_id, token });
        broadcaster.broadcast(&ServerEvent::AuthorChange { author_id, author_data });

        // A client claiming a version we never reached gets the full history.
        let start = start_height.filter(|h| *h <= version).unwrap_or(0);
        let history = self.session.history_since(start)?;
        broadcaster.send_to_author(&ServerEvent::InitDoc {
            history,
            authors: self.session.get_active_authors(),
        });
        Ok(())
    }

    async fn submit(
        &mut self,
        author_id: AuthorId,
        mut change: Change,
        broadcaster: &dyn Broadcaster,
    ) -> Result<SubmitOutcome, SyncError> {
        match self.session.author(author_id) {
            Some(author) if author.active => {}
            _ => return Err(SyncError::InvalidState(format!("Author {author_id} is not connected"))),
        }
        for tx in change.transactions.iter_mut() {
            tx.author = Some(author_id);
        }

        let version = self.session.version();
        if change.start > version {
            warn!(
                "Author {author_id} submitted change at {} beyond version {version} of '{}'",
                change.start,
                self.doc_name()
            );
            return Ok(self.reject_all(author_id, change));
        }

        // Lengths that overflow describe no document; such a transaction
        // is rejected with everything after it, before rebase sees it.
        let well_formed = change
            .transactions
            .iter()
            .position(|tx| tx.validate().is_err())
            .unwrap_or(change.len());
        if well_formed < change.len() {
            warn!(
                "Author {author_id} submitted a malformed transaction at {} on '{}'",
                change.start + well_formed as Version,
                self.doc_name()
            );
        }
        let candidate = Change::new(change.start, change.transactions[..well_formed].to_vec());

        let base = self.session.history_since(change.start)?;
        let (rebased, _) = candidate.rebase_onto(&base)?.into_parts();
        let rebased = rebased.unwrap_or_else(|| Change::empty(version));

        // Rebased transactions must still apply; the first that doesn't is
        // rejected with everything after it.
        let (applied, document) = self.session.apply_prefix(&rebased);
        let accepted = applied.len();
        let rejected = (accepted < change.len()).then(|| {
            Change::new(
                change.start + accepted as Version,
                change.transactions[accepted..].to_vec(),
            )
        });

        if !applied.is_empty() {
            let appended = applied.clone();
            match self
                .with_store(move |store, doc_name| store.on_new_change(doc_name, &appended))
                .await
            {
                Ok(_) => self.session.record(applied.clone(), document)?,
                Err(StoreError::StartMismatch { expected, got, .. }) => {
                    error!(
                        "Store for '{}' is at version {expected} but session committed at {got}; reloading",
                        self.doc_name()
                    );
                    return self.recover_from_mismatch(author_id, change, broadcaster).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let rejected_count = rejected.as_ref().map_or(0, Change::len);
        if let Some(author) = self.session.author_mut(author_id) {
            author.rejections += rejected_count as u64;
            author.continue_base = rejected;
        }
        if rejected_count > 0 {
            warn!(
                "Rejected {rejected_count} transactions from author {author_id} on '{}'",
                self.doc_name()
            );
        }

        let committed = (!applied.is_empty()).then_some(applied);
        if let Some(change) = &committed {
            debug!(
                "Committed {} transactions to '{}' (version {})",
                change.len(),
                self.doc_name(),
                change.end()
            );
            broadcaster.broadcast(&ServerEvent::NewChange(change.clone()));
        }

        Ok(SubmitOutcome {
            committed,
            rejected: rejected_count,
            version: self.session.version(),
        })
    }

    fn reject_all(&mut self, author_id: AuthorId, change: Change) -> SubmitOutcome {
        let rejected = change.len();
        if let Some(author) = self.session.author_mut(author_id) {
            author.rejections += rejected as u64;
            author.continue_base = Some(change);
        }
        SubmitOutcome {
            committed: None,
            rejected,
            version: self.session.version(),
        }
    }

    /// The store disagrees with the session: adopt the store's history and
    /// resync the author whose change could not be committed.
    async fn recover_from_mismatch(
        &mut self,
        author_id: AuthorId,
        change: Change,
        broadcaster: &dyn Broadcaster,
    ) -> Result<SubmitOutcome, SyncError> {
        let history = self.with_store(|store, doc_name| store.load(doc_name)).await?;
        self.session.replace_history(history)?;
        info!(
            "Reloaded '{}' from store at version {}",
            self.doc_name(),
            self.session.version()
        );

        let outcome = self.reject_all(author_id, change);
        broadcaster.send_to_author(&ServerEvent::InitDoc {
            history: self.session.history().clone(),
            authors: self.session.get_active_authors(),
        });
        Ok(outcome)
    }

    fn change_author(&mut self, author_id: AuthorId, data: AuthorData, broadcaster: &dyn Broadcaster) -> Result<(), SyncError> {
        let Some(author) = self.session.author_mut(author_id) else {
            return Err(SyncError::InvalidState(format!("Unknown author {author_id}")));
        };
        author.name = data.name;
        author.color = data.color;
        let author_data = author.data();
        broadcaster.broadcast(&ServerEvent::AuthorChange { author_id, author_data });
        Ok(())
    }

    fn disconnect(&mut self, author_id: AuthorId, broadcaster: &dyn Broadcaster) -> Result<(), SyncError> {
        let Some(author) = self.session.author_mut(author_id) else {
            return Err(SyncError::InvalidState(format!("Unknown author {author_id}")));
        };
        author.active = false;
        broadcaster.broadcast(&ServerEvent::AuthorDisconnect(author_id));
        debug!("Author {author_id} left '{}'", self.doc_name());
        Ok(())
    }

    async fn clear_history(&mut self) -> Result<(), SyncError> {
        self.with_store(|store, doc_name| store.delete_document(doc_name)).await?;
        self.session.clear_history();
        warn!("History of '{}' cleared", self.doc_name());
        Ok(())
    }
}

/// Run a store call on the blocking pool, off the actor's worker thread.
async fn run_blocking<T: Send + 'static>(
    store: &Arc<dyn HistoryStore>,
    doc_name: &str,
    f: impl FnOnce(&dyn HistoryStore, &str) -> Result<T, StoreError> + Send + 'static,
) -> Result<T, StoreError> {
    let store = Arc::clone(store);
    let doc_name = doc_name.to_string();
    tokio::task::spawn_blocking(move || f(&*store, &doc_name))
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Store task failed: {e}")))?
}

// ─── Handles ──────────────────────────────────────────────────────────

/// Cheap, cloneable address of a document actor.
#[derive(Clone)]
pub struct DocumentHandle {
    doc_name: Arc<str>,
    commands: mpsc::Sender<Command>,
}

impl DocumentHandle {
    pub fn doc_name(&self) -> &str {
        &self.doc_name
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SyncError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        response.await.map_err(|_| SyncError::SessionClosed)
    }
}

/// One authenticated connection: document, author and outbound channel.
#[derive(Clone)]
pub struct ConnectionContext {
    author_id: AuthorId,
    handle: DocumentHandle,
    broadcaster: Arc<dyn Broadcaster>,
}

impl ConnectionContext {
    pub fn author_id(&self) -> AuthorId {
        self.author_id
    }

    pub fn doc_name(&self) -> &str {
        self.handle.doc_name()
    }
}

// ─── Service ──────────────────────────────────────────────────────────

/// Registry of loaded documents and entry point for every protocol event.
pub struct SyncService {
    store: Arc<dyn HistoryStore>,
    documents: DashMap<String, Arc<OnceCell<DocumentHandle>>>,
    queue_capacity: usize,
    /// Store loads issued, for monitoring the load barrier
    loads: AtomicU64,
}

impl SyncService {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self::with_queue_capacity(store, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(store: Arc<dyn HistoryStore>, queue_capacity: usize) -> Self {
        Self {
            store,
            documents: DashMap::new(),
            queue_capacity: queue_capacity.max(1),
            loads: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    /// Number of store loads issued so far.
    pub fn store_loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn loaded_documents(&self) -> Vec<String> {
        self.documents
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Load the document if needed and return its actor handle.
    ///
    /// Concurrent callers for the same unloaded document share one load.
    pub async fn ensure_loaded(&self, doc_name: &str) -> Result<DocumentHandle, SyncError> {
        let cell = self
            .documents
            .entry(doc_name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let handle = cell.get_or_try_init(|| self.load(doc_name)).await?;
        Ok(handle.clone())
    }

    async fn load(&self, doc_name: &str) -> Result<DocumentHandle, SyncError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let history = run_blocking(&self.store, doc_name, |store, name| store.load(name)).await?;

        let version = history.end();
        let session = CollaborationSession::from_history(doc_name, history)?;
        let (commands, queue) = mpsc::channel(self.queue_capacity);
        let actor = DocumentActor {
            session,
            store: Arc::clone(&self.store),
        };
        tokio::spawn(actor.run(queue));

        info!("Loaded document '{doc_name}' at version {version}");
        Ok(DocumentHandle {
            doc_name: Arc::from(doc_name),
            commands,
        })
    }

    /// Forget a loaded document. Its actor stops once every open
    /// connection to it has gone.
    pub fn evict(&self, doc_name: &str) -> bool {
        self.documents.remove(doc_name).is_some()
    }

    // ─── Protocol entry points ────────────────────────────────────────

    /// Validate resumption credentials or register a new author.
    pub async fn authenticate(
        &self,
        doc_name: &str,
        author_id: Option<AuthorId>,
        token: Option<String>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Result<ConnectionContext, SyncError> {
        let handle = self.ensure_loaded(doc_name).await?;
        let author_id = handle
            .request(|reply| Command::Authenticate { author_id, token, reply })
            .await??;
        Ok(ConnectionContext {
            author_id,
            handle,
            broadcaster,
        })
    }

    /// Send `registered`, broadcast `authorChange`, then send `initDoc`.
    pub async fn welcome_client(
        &self,
        ctx: &ConnectionContext,
        start_height: Option<Version>,
        placeholder_name: impl FnOnce(AuthorId) -> String + Send + 'static,
    ) -> Result<(), SyncError> {
        ctx.handle
            .request(|reply| Command::Welcome {
                author_id: ctx.author_id,
                start_height,
                placeholder_name: Box::new(placeholder_name),
                broadcaster: Arc::clone(&ctx.broadcaster),
                reply,
            })
            .await?
    }

    /// Rebase, validate, commit and broadcast a submitted change.
    pub async fn on_submit_change(&self, ctx: &ConnectionContext, change: Change) -> Result<SubmitOutcome, SyncError> {
        ctx.handle
            .request(|reply| Command::Submit {
                author_id: ctx.author_id,
                change,
                broadcaster: Arc::clone(&ctx.broadcaster),
                reply,
            })
            .await?
    }

    pub async fn on_change_author(&self, ctx: &ConnectionContext, data: AuthorData) -> Result<(), SyncError> {
        ctx.handle
            .request(|reply| Command::ChangeAuthor {
                author_id: ctx.author_id,
                data,
                broadcaster: Arc::clone(&ctx.broadcaster),
                reply,
            })
            .await?
    }

    /// Mark the author inactive. Queues behind any in-flight submission.
    pub async fn on_disconnect(&self, ctx: &ConnectionContext) -> Result<(), SyncError> {
        ctx.handle
            .request(|reply| Command::Disconnect {
                author_id: ctx.author_id,
                broadcaster: Arc::clone(&ctx.broadcaster),
                reply,
            })
            .await?
    }

    /// Client telemetry; logged only.
    pub fn on_log_event(&self, ctx: &ConnectionContext, event: &serde_json::Value) {
        info!(
            target: "tandem::client",
            "[{}] author {}: {event}",
            ctx.doc_name(),
            ctx.author_id
        );
    }

    // ─── Administration ───────────────────────────────────────────────

    /// Drop a document's history, in the store and in memory.
    pub async fn clear_history(&self, doc_name: &str) -> Result<(), SyncError> {
        let handle = self.ensure_loaded(doc_name).await?;
        handle.request(|reply| Command::ClearHistory { reply }).await?
    }

    pub async fn snapshot(&self, doc_name: &str) -> Result<SessionSnapshot, SyncError> {
        let handle = self.ensure_loaded(doc_name).await?;
        handle.request(|reply| Command::Snapshot { reply }).await
    }

    /// Server-side state of one author, secrets included.
    pub async fn author(&self, doc_name: &str, author_id: AuthorId) -> Result<Option<Author>, SyncError> {
        let handle = self.ensure_loaded(doc_name).await?;
        handle.request(|reply| Command::Author { author_id, reply }).await
    }

    /// Flush the store before shutdown.
    pub fn close(&self) -> Result<(), SyncError> {
        self.store.on_close()?;
        info!("Sync service closed");
        Ok(())
    }
}
