//! # tandem-collab — Document sync server for Tandem
//!
//! Authors edit a shared document concurrently; the server rebases each
//! submitted change onto the committed history, persists it, and fans it
//! out to everyone on the document.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON over WS    ┌─────────────┐
//! │ SyncClient  │ ◄───────────────► │ SyncServer  │
//! │ (Replica)   │  {type, data}     │ (transport) │
//! └─────────────┘                   └──────┬──────┘
//!                                          │ ConnectionContext
//!                                          ▼
//!                                   ┌─────────────┐      ┌───────────────┐
//!                                   │ SyncService │ ───► │ BroadcastGroup│
//!                                   │ doc actors  │      │ (fan-out)     │
//!                                   └──────┬──────┘      └───────────────┘
//!                                          │
//!                                   ┌──────┴──────┐
//!                                   │HistoryStore │ Memory · RocksDB
//!                                   └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`storage`] — Append-only history persistence with optimistic concurrency
//! - [`session`] — Per-document history, materialized document and authors
//! - [`protocol`] — JSON wire events and connection states
//! - [`service`] — Per-document actors implementing the protocol
//! - [`broadcast`] — Room fan-out with bounded per-peer queues
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket client with a local replica
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Submit + commit (memory store) | <50µs |
//! | Broadcast 1K msgs × 100 peers | <10ms |
//! | RocksDB append (1 transaction) | <100µs |

pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod server;
pub mod service;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, PeerBroadcaster, RoomManager};
pub use client::{Replica, SyncClient};
pub use protocol::{Broadcaster, ClientEvent, ConnectionState, JoinRequest, ProtocolError, ServerEvent};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use service::{ConnectionContext, DocumentHandle, SubmitOutcome, SyncError, SyncService};
pub use session::{Author, AuthorData, CollaborationSession, SessionSnapshot};
pub use storage::{
    DocumentMetadata, HistoryStore, MemoryHistoryStore, RocksHistoryStore, StoreConfig, StoreError,
};
