//! Local document stores for roster collections.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐   open(name)   ┌──────────────────────────────┐
//! │  StoreProvider   │ ─────────────► │ Arc<dyn DocumentStore>       │
//! │ (memory / rocks) │                │                              │
//! └──────────────────┘                │  documents: id → StoredDoc   │
//!                                     │  changes:   seq → Change     │
//!                                     │  feed:      ChangeFeed       │
//!                                     └──────────────┬───────────────┘
//!                                                    │ publish
//!                                                    ▼
//!                                   mirror refresh / push replication
//! ```
//!
//! Every successful mutation stores a new [`Revision`] and appends one
//! [`Change`] to the collection's change log. Deletes leave a tombstone so
//! they can be replicated like any other write.

pub mod feed;
pub mod memory;
pub mod rocks;

pub use feed::{ChangeFeed, FeedStats};
pub use memory::{MemoryProvider, MemoryStore};
pub use rocks::{RocksProvider, RocksStore, StoreConfig};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use roster_core::{Document, Revision};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Storage errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error(
        "Revision conflict on {id}: expected {}, found {}",
        show_revision(.expected),
        show_revision(.actual)
    )]
    Conflict {
        id: String,
        expected: Option<Revision>,
        actual: Option<Revision>,
    },
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

fn show_revision(revision: &Option<Revision>) -> String {
    revision
        .as_ref()
        .map_or_else(|| "none".to_string(), ToString::to_string)
}

/// Identifier and current revision of a live document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRef {
    pub id: String,
    pub revision: Revision,
}

/// One entry of a collection's change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Monotonically increasing, starting at 1
    pub seq: u64,
    pub id: String,
    pub revision: Revision,
    pub deleted: bool,
}

/// Collection summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInfo {
    pub name: String,
    /// Highest change sequence assigned so far (0 for an empty log)
    pub update_seq: u64,
    /// Number of live (non-deleted) documents
    pub doc_count: u64,
}

/// Stored form of a document revision, including tombstones.
///
/// The body is kept as a JSON object string so the record can travel
/// through bincode (storage and wire) unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDoc {
    pub id: String,
    pub revision: Revision,
    pub deleted: bool,
    pub body: String,
}

impl StoredDoc {
    pub fn live(
        id: impl Into<String>,
        revision: Revision,
        fields: &Map<String, Value>,
    ) -> Result<Self, StoreError> {
        let body =
            serde_json::to_string(fields).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self {
            id: id.into(),
            revision,
            deleted: false,
            body,
        })
    }

    pub fn tombstone(id: impl Into<String>, revision: Revision) -> Self {
        Self {
            id: id.into(),
            revision,
            deleted: true,
            body: "{}".to_string(),
        }
    }

    /// Decode into a [`Document`] carrying id and revision.
    pub fn to_document(&self) -> Result<Document, StoreError> {
        let fields: Map<String, Value> = serde_json::from_str(&self.body)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(Document {
            id: Some(self.id.clone()),
            revision: Some(self.revision.clone()),
            fields,
        })
    }

    pub fn doc_ref(&self) -> DocRef {
        DocRef {
            id: self.id.clone(),
            revision: self.revision.clone(),
        }
    }

    pub fn change(&self, seq: u64) -> Change {
        Change {
            seq,
            id: self.id.clone(),
            revision: self.revision.clone(),
            deleted: self.deleted,
        }
    }
}

/// Contract a collection mirror needs from a local document store.
///
/// Writes use optimistic concurrency: `write` and `delete` must carry the
/// document's current revision or fail with [`StoreError::Conflict`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Collection name this store holds.
    fn name(&self) -> &str;

    async fn info(&self) -> Result<StoreInfo, StoreError>;

    /// All live documents, ordered by id.
    async fn list_all(&self) -> Result<Vec<DocRef>, StoreError>;

    /// Fetch a live document. Tombstones are reported as `NotFound`.
    async fn fetch(&self, id: &str) -> Result<Document, StoreError>;

    /// Create a document, assigning an id when it has none.
    async fn insert(&self, doc: Document) -> Result<DocRef, StoreError>;

    /// Overwrite a document; `doc.revision` must match the stored one.
    async fn write(&self, doc: Document) -> Result<Revision, StoreError>;

    /// Delete a document; `doc.revision` must match the stored one.
    async fn delete(&self, doc: &Document) -> Result<Revision, StoreError>;

    /// Change log entries with `seq > since`, in sequence order.
    async fn changes_since(&self, since: u64) -> Result<Vec<Change>, StoreError>;

    /// Latest stored revision of `id`, tombstones included.
    async fn fetch_any(&self, id: &str) -> Result<Option<StoredDoc>, StoreError>;

    /// Store a revision received from a replica if it wins against the
    /// local one. Returns whether anything changed.
    async fn apply_replicated(&self, doc: StoredDoc) -> Result<bool, StoreError>;

    /// Live notifications for every change committed after this call.
    fn subscribe(&self) -> broadcast::Receiver<Change>;
}

/// Opens (or creates) the store behind a named collection.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    async fn open(&self, name: &str) -> Result<Arc<dyn DocumentStore>, StoreError>;
}

// ─── Shared write rules ──────────────────────────────────────────────

/// Collection names double as directory names for persistent stores.
pub(crate) fn validate_collection_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::Unavailable(format!(
            "invalid collection name '{name}'"
        )))
    }
}

/// Id for a document about to be inserted.
pub(crate) fn assign_id(doc: &Document) -> Result<String, StoreError> {
    match doc.id() {
        Some("") => Err(StoreError::InvalidDocument("empty document id".into())),
        Some(id) => Ok(id.to_string()),
        None => Ok(Uuid::new_v4().simple().to_string()),
    }
}

pub(crate) fn require_id(doc: &Document) -> Result<&str, StoreError> {
    match doc.id() {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(StoreError::InvalidDocument("document has no id".into())),
    }
}

/// Revision to assign to a write of `id` that expects `expected` to be the
/// stored revision.
///
/// A live document must be matched exactly. An absent document (or one
/// whose latest revision is a tombstone) can only be created, never
/// overwritten.
pub(crate) fn next_revision(
    id: &str,
    current: Option<&StoredDoc>,
    expected: Option<&Revision>,
) -> Result<Revision, StoreError> {
    match (current, expected) {
        (Some(cur), Some(exp)) if !cur.deleted => {
            if &cur.revision == exp {
                successor(&cur.revision)
            } else {
                Err(StoreError::Conflict {
                    id: id.to_string(),
                    expected: Some(exp.clone()),
                    actual: Some(cur.revision.clone()),
                })
            }
        }
        (Some(cur), None) if !cur.deleted => Err(StoreError::Conflict {
            id: id.to_string(),
            expected: None,
            actual: Some(cur.revision.clone()),
        }),
        (_, Some(_)) => Err(StoreError::NotFound(id.to_string())),
        (Some(tombstone), None) => successor(&tombstone.revision),
        (None, None) => Ok(Revision::first()),
    }
}

fn successor(revision: &Revision) -> Result<Revision, StoreError> {
    revision
        .next()
        .map_err(|e| StoreError::InvalidDocument(e.to_string()))
}

/// Reject replicated documents that could never be written locally again.
pub(crate) fn check_replicated(doc: &StoredDoc) -> Result<(), StoreError> {
    if doc.id.is_empty() {
        return Err(StoreError::InvalidDocument("replicated document has no id".into()));
    }
    if doc.revision.generation() == u64::MAX {
        return Err(StoreError::InvalidDocument(format!(
            "replicated revision {} of {} is out of range",
            doc.revision, doc.id
        )));
    }
    Ok(())
}

/// Revision that a delete of `id` with `expected` leaves as tombstone.
pub(crate) fn tombstone_revision(
    id: &str,
    current: Option<&StoredDoc>,
    expected: Option<&Revision>,
) -> Result<Revision, StoreError> {
    let expected = expected
        .ok_or_else(|| StoreError::InvalidDocument(format!("delete of {id} without revision")))?;
    match current {
        Some(cur) if !cur.deleted => next_revision(id, Some(cur), Some(expected)),
        _ => Err(StoreError::NotFound(id.to_string())),
    }
}

/// Whether a replicated revision should replace the local one.
pub(crate) fn replicated_wins(incoming: &StoredDoc, current: Option<&StoredDoc>) -> bool {
    match current {
        None => true,
        Some(cur) => incoming.revision > cur.revision,
    }
}

/// Collapse a change log to the most recent entry per id, keeping
/// sequence order.
pub fn latest_per_id(changes: &[Change]) -> Vec<Change> {
    let mut latest: HashMap<&str, &Change> = HashMap::with_capacity(changes.len());
    for change in changes {
        match latest.get(change.id.as_str()) {
            Some(existing) if existing.seq >= change.seq => {}
            _ => {
                latest.insert(change.id.as_str(), change);
            }
        }
    }
    let mut collapsed: Vec<Change> = latest.into_values().cloned().collect();
    collapsed.sort_by_key(|c| c.seq);
    collapsed
}
