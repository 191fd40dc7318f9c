//! In-memory mirror of one named collection.
//!
//! Architecture:
//! ```text
//!  caller ──► CollectionMirror ──cmd──► actor task ──spawn──► store I/O task
//!                 │    ▲                   │   ▲                    │
//!                 │    └── items (read) ───┘   └──── completion ────┘
//!                 │                            │
//!                 └◄── MirrorEvent ◄───────────┘ (broadcast)
//! ```
//!
//! The actor is the only writer of `items`. Store calls run in spawned
//! tasks and report back as commands, so operations interleave at store
//! boundaries while patches are applied one at a time against the current
//! list. Readers (`get`, `items`) take a short read lock and never wait on
//! the store.

mod actor;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use roster_core::{Document, Revision};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::client::ReplicationError;
use crate::storage::{StoreError, StoreProvider};

use actor::{Command, Mutation};

/// Mirror errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MirrorError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Store error: {0}")]
    Store(StoreError),
    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),
    #[error("No remote configured for '{0}'")]
    NoRemote(String),
    #[error("Mirror closed")]
    Closed,
}

impl From<StoreError> for MirrorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(reason) => MirrorError::StoreUnavailable(reason),
            StoreError::NotFound(id) => MirrorError::NotFound(id),
            conflict @ StoreError::Conflict { .. } => MirrorError::Conflict(conflict.to_string()),
            other => MirrorError::Store(other),
        }
    }
}

/// How operations on the same document id are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyPolicy {
    /// Operations interleave at store boundaries; concurrent writes to one
    /// id race and the store's accepted write wins.
    #[default]
    Interleaved,
    /// Operations on one id run one after another in issue order.
    SerializedPerId,
}

/// Mirror configuration.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Replication base URL; the collection name is appended
    pub remote: Option<String>,
    /// Buffered events per subscriber
    pub event_capacity: usize,
    /// Pending commands before callers wait
    pub command_capacity: usize,
    pub policy: ConcurrencyPolicy,
    /// Documents per replication batch
    pub batch_size: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            remote: None,
            event_capacity: 256,
            command_capacity: 64,
            policy: ConcurrencyPolicy::Interleaved,
            batch_size: 100,
        }
    }
}

impl MirrorConfig {
    /// Small buffers for tests.
    pub fn for_testing() -> Self {
        Self {
            remote: None,
            event_capacity: 1024,
            command_capacity: 16,
            policy: ConcurrencyPolicy::Interleaved,
            batch_size: 10,
        }
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    pub fn with_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Operations that can fail, as reported in [`MirrorEvent::OperationFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOp {
    Refresh,
    Add,
    Remove,
    Update,
    StartSync,
    SyncOnce,
}

impl std::fmt::Display for MirrorOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MirrorOp::Refresh => "refresh",
            MirrorOp::Add => "add",
            MirrorOp::Remove => "remove",
            MirrorOp::Update => "update",
            MirrorOp::StartSync => "start_sync",
            MirrorOp::SyncOnce => "sync_once",
        };
        f.write_str(name)
    }
}

/// Notifications sent to observers after each change of mirror state.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorEvent {
    /// `items` was emptied at the start of a refresh
    Cleared,
    Loaded { id: String },
    Added { id: String },
    Removed { id: String },
    Updated { id: String },
    SyncStarted,
    SyncStopped,
    SyncFailed { reason: String },
    OperationFailed { op: MirrorOp, error: MirrorError },
}

/// Outcome of a refresh.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RefreshReport {
    /// Documents fetched
    pub loaded: usize,
    /// Ids whose fetch failed
    pub failed: Vec<(String, StoreError)>,
    /// A later refresh started before this one finished; its loads were dropped
    pub superseded: bool,
}

/// Replication state returned by `start_sync`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    /// Change subscription plus replication sessions
    pub handles: usize,
    /// Replication endpoint, when a remote is configured
    pub remote: Option<String>,
    /// Sync was already running; nothing was created
    pub already_active: bool,
}

/// State shared between the handle and its actor.
#[derive(Clone)]
struct Shared {
    items: Arc<RwLock<Vec<Document>>>,
    events: broadcast::Sender<MirrorEvent>,
    sync_handles: Arc<AtomicUsize>,
}

/// Handle to a collection mirror.
pub struct CollectionMirror {
    name: String,
    commands: mpsc::Sender<Command>,
    shared: Shared,
}

impl CollectionMirror {
    /// Spawn the mirror actor for `name`.
    ///
    /// The actor opens the store through `provider` and runs the initial
    /// refresh before taking commands. If the store cannot be opened every
    /// operation fails with [`MirrorError::StoreUnavailable`].
    pub fn spawn(name: impl Into<String>, provider: Arc<dyn StoreProvider>, config: MirrorConfig) -> Self {
        let name = name.into();
        let (commands, rx) = mpsc::channel(config.command_capacity.max(1));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Shared {
            items: Arc::new(RwLock::new(Vec::new())),
            events,
            sync_handles: Arc::new(AtomicUsize::new(0)),
        };

        tokio::spawn(actor::run(
            name.clone(),
            config,
            shared.clone(),
            provider,
            commands.downgrade(),
            rx,
        ));

        Self {
            name,
            commands,
            shared,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, MirrorError>>) -> Command,
    ) -> Result<T, MirrorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| MirrorError::Closed)?;
        rx.await.map_err(|_| MirrorError::Closed)?
    }

    // ─── Operations ───────────────────────────────────────────────────

    /// Reload every document from the store.
    pub async fn refresh(&self) -> Result<RefreshReport, MirrorError> {
        self.request(|reply| Command::Refresh { reply: Some(reply) }).await
    }

    /// Insert `doc`; returns it with the store-assigned id and revision.
    pub async fn add(&self, doc: Document) -> Result<Document, MirrorError> {
        self.request(|reply| Command::Mutate(Mutation::Add { doc, reply }))
            .await
    }

    /// Delete the document `id`; returns the tombstone revision.
    pub async fn remove(&self, id: &str) -> Result<Revision, MirrorError> {
        let id = id.to_string();
        self.request(|reply| Command::Mutate(Mutation::Remove { id, reply }))
            .await
    }

    /// Replace the fields of document `id`.
    pub async fn update(&self, id: &str, fields: Map<String, Value>) -> Result<Document, MirrorError> {
        let id = id.to_string();
        self.request(|reply| Command::Mutate(Mutation::Update { id, fields, reply }))
            .await
    }

    /// Start change-driven refresh and continuous replication. Idempotent.
    pub async fn start_sync(&self) -> Result<SyncStatus, MirrorError> {
        self.request(|reply| Command::StartSync { reply }).await
    }

    /// Cancel all sync handles. Returns whether sync was running.
    pub async fn stop_sync(&self) -> Result<bool, MirrorError> {
        self.request(|reply| Command::StopSync { reply }).await
    }

    /// One-shot push and pull with the remote, then a refresh.
    pub async fn sync_once(&self) -> Result<RefreshReport, MirrorError> {
        self.request(|reply| Command::SyncOnce { reply }).await
    }

    // ─── Readers ──────────────────────────────────────────────────────

    /// Mirror entry for `id`, without touching the store.
    pub fn get(&self, id: &str) -> Option<Document> {
        let items = self.shared.items.read().unwrap_or_else(|e| e.into_inner());
        items.iter().find(|d| d.id() == Some(id)).cloned()
    }

    /// Snapshot of the mirrored list.
    pub fn items(&self) -> Vec<Document> {
        self.shared
            .items
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.shared.items.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MirrorEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.sync_handle_count() > 0
    }

    /// Active change subscriptions and replication sessions.
    pub fn sync_handle_count(&self) -> usize {
        self.shared.sync_handles.load(Ordering::SeqCst)
    }
}
