//! # roster-collab: local-first collections with remote replication
//!
//! Keeps an in-memory mirror of each named document collection in sync with
//! a local store, and replicates that store to a remote peer over websockets.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  get(name)  ┌──────────────────┐   events   ┌──────────┐
//! │   Registry   │ ──────────► │ CollectionMirror │ ─────────► │ UI / CLI │
//! └──────────────┘             └────────┬─────────┘            └──────────┘
//!                                       │ store calls
//!                                       ▼
//!                              ┌──────────────────┐  changes  ┌───────────┐
//!                              │  DocumentStore   │ ────────► │  refresh  │
//!                              │ (memory / rocks) │           └───────────┘
//!                              └────────┬─────────┘
//!                                       │ push / pull
//!                                       ▼
//!                              ┌──────────────────┐  WebSocket ┌──────────────┐
//!                              │    Replicator    │ ◄────────► │ ReplicaServer│
//!                              └──────────────────┘   bincode  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`mirror`]: per-collection actor owning the mirrored item list
//! - [`registry`]: one mirror per collection name
//! - [`storage`]: store contract, in-memory and RocksDB stores, change feed
//! - [`protocol`]: binary wire protocol (bincode-encoded SyncMessage)
//! - [`client`]: push / pull replication sessions
//! - [`server`]: websocket replica server

pub mod client;
pub mod mirror;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use client::{
    ReplicationError, ReplicationHandle, ReplicationOptions, ReplicationState,
    ReplicationSummary, Replicator,
};
pub use mirror::{
    CollectionMirror, ConcurrencyPolicy, MirrorConfig, MirrorError, MirrorEvent, MirrorOp,
    RefreshReport, SyncStatus,
};
pub use protocol::{Direction, JoinRequest, MessageType, ProtocolError, SyncMessage};
pub use registry::Registry;
pub use server::{ReplicaServer, ServerConfig, ServerStats};
pub use storage::{
    Change, DocRef, DocumentStore, MemoryProvider, MemoryStore, RocksProvider, RocksStore,
    StoreConfig, StoreError, StoreInfo, StoreProvider, StoredDoc,
};
