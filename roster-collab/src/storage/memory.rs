//! In-process document store.
//!
//! Holds documents and the change log in memory behind a single mutex.
//! Used for tests, ephemeral sessions and in-memory replica servers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use roster_core::{Document, Revision};
use tokio::sync::broadcast;

use super::{
    assign_id, check_replicated, next_revision, replicated_wins, require_id, tombstone_revision,
    validate_collection_name, Change, ChangeFeed, DocRef, DocumentStore, FeedStats, StoreError,
    StoreInfo, StoreProvider, StoredDoc,
};

const DEFAULT_FEED_CAPACITY: usize = 1024;

#[derive(Default)]
struct MemoryState {
    docs: BTreeMap<String, StoredDoc>,
    changes: Vec<Change>,
    seq: u64,
}

impl MemoryState {
    /// Store a revision and append its change entry.
    fn commit(&mut self, stored: StoredDoc) -> Change {
        self.seq += 1;
        let change = stored.change(self.seq);
        self.docs.insert(stored.id.clone(), stored);
        self.changes.push(change.clone());
        change
    }
}

/// Memory-backed [`DocumentStore`].
pub struct MemoryStore {
    name: String,
    state: Mutex<MemoryState>,
    feed: ChangeFeed,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_feed_capacity(name, DEFAULT_FEED_CAPACITY)
    }

    pub fn with_feed_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState::default()),
            feed: ChangeFeed::new(capacity),
        }
    }

    pub fn feed_stats(&self) -> FeedStats {
        self.feed.stats()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|e| StoreError::Database(format!("memory store lock poisoned: {e}")))
    }

    /// Commit under the lock and publish while still holding it so the
    /// feed sees changes in sequence order.
    fn commit(&self, state: &mut MemoryState, stored: StoredDoc) {
        let change = state.commit(stored);
        self.feed.publish(change);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn info(&self) -> Result<StoreInfo, StoreError> {
        let state = self.lock()?;
        Ok(StoreInfo {
            name: self.name.clone(),
            update_seq: state.seq,
            doc_count: state.docs.values().filter(|d| !d.deleted).count() as u64,
        })
    }

    async fn list_all(&self) -> Result<Vec<DocRef>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .docs
            .values()
            .filter(|d| !d.deleted)
            .map(StoredDoc::doc_ref)
            .collect())
    }

    async fn fetch(&self, id: &str) -> Result<Document, StoreError> {
        let state = self.lock()?;
        match state.docs.get(id) {
            Some(stored) if !stored.deleted => stored.to_document(),
            _ => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn insert(&self, doc: Document) -> Result<DocRef, StoreError> {
        let id = assign_id(&doc)?;
        let mut state = self.lock()?;
        let revision = next_revision(&id, state.docs.get(&id), None)?;
        let stored = StoredDoc::live(id, revision, &doc.fields)?;
        let doc_ref = stored.doc_ref();
        self.commit(&mut state, stored);
        Ok(doc_ref)
    }

    async fn write(&self, doc: Document) -> Result<Revision, StoreError> {
        let id = require_id(&doc)?;
        let mut state = self.lock()?;
        let revision = next_revision(id, state.docs.get(id), doc.revision())?;
        let stored = StoredDoc::live(id, revision.clone(), &doc.fields)?;
        self.commit(&mut state, stored);
        Ok(revision)
    }

    async fn delete(&self, doc: &Document) -> Result<Revision, StoreError> {
        let id = require_id(doc)?;
        let mut state = self.lock()?;
        let revision = tombstone_revision(id, state.docs.get(id), doc.revision())?;
        self.commit(&mut state, StoredDoc::tombstone(id, revision.clone()));
        Ok(revision)
    }

    async fn changes_since(&self, since: u64) -> Result<Vec<Change>, StoreError> {
        let state = self.lock()?;
        // Sequence numbers are dense from 1, so seq n sits at index n - 1.
        let start = usize::try_from(since).unwrap_or(usize::MAX).min(state.changes.len());
        Ok(state.changes[start..].to_vec())
    }

    async fn fetch_any(&self, id: &str) -> Result<Option<StoredDoc>, StoreError> {
        Ok(self.lock()?.docs.get(id).cloned())
    }

    async fn apply_replicated(&self, doc: StoredDoc) -> Result<bool, StoreError> {
        check_replicated(&doc)?;
        let mut state = self.lock()?;
        if !replicated_wins(&doc, state.docs.get(&doc.id)) {
            return Ok(false);
        }
        self.commit(&mut state, doc);
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.feed.subscribe()
    }
}

/// Keeps one [`MemoryStore`] per collection name for the provider's lifetime.
pub struct MemoryProvider {
    stores: tokio::sync::Mutex<HashMap<String, Arc<MemoryStore>>>,
    feed_capacity: usize,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_feed_capacity(feed_capacity: usize) -> Self {
        Self {
            stores: tokio::sync::Mutex::new(HashMap::new()),
            feed_capacity,
        }
    }

    /// Names of the collections opened so far.
    pub async fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreProvider for MemoryProvider {
    async fn open(&self, name: &str) -> Result<Arc<dyn DocumentStore>, StoreError> {
        validate_collection_name(name)?;
        let mut stores = self.stores.lock().await;
        let store = stores
            .entry(name.to_string())
            .or_insert_with(|| {
                log::debug!("Creating in-memory collection '{name}'");
                Arc::new(MemoryStore::with_feed_capacity(name, self.feed_capacity))
            })
            .clone();
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(name: &str) -> Document {
        Document::new().with_field("name", name)
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_revision() {
        let store = MemoryStore::new("students");
        let doc_ref = store.insert(student("Ana")).await.unwrap();
        assert_eq!(doc_ref.id.len(), 32);
        assert_eq!(doc_ref.revision.generation(), 1);

        let fetched = store.fetch(&doc_ref.id).await.unwrap();
        assert_eq!(fetched.get_str("name"), Some("Ana"));
        assert_eq!(fetched.revision(), Some(&doc_ref.revision));
    }

    #[tokio::test]
    async fn test_insert_existing_id_conflicts() {
        let store = MemoryStore::new("students");
        store.insert(student("Ana").with_id("s1")).await.unwrap();
        let err = store.insert(student("Ben").with_id("s1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_write_requires_current_revision() {
        let store = MemoryStore::new("students");
        let doc_ref = store.insert(student("Ana").with_id("s1")).await.unwrap();

        let update = student("Ana B").with_id("s1").with_revision(doc_ref.revision.clone());
        let rev2 = store.write(update.clone()).await.unwrap();
        assert_eq!(rev2.generation(), 2);

        // Same (now stale) revision again
        let err = store.write(update).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(store.fetch("s1").await.unwrap().get_str("name"), Some("Ana B"));
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone() {
        let store = MemoryStore::new("students");
        let doc_ref = store.insert(student("Ana").with_id("s1")).await.unwrap();
        let doc = store.fetch("s1").await.unwrap();
        let tomb_rev = store.delete(&doc).await.unwrap();
        assert!(tomb_rev > doc_ref.revision);

        assert_eq!(store.fetch("s1").await.unwrap_err(), StoreError::NotFound("s1".into()));
        assert!(store.list_all().await.unwrap().is_empty());

        let tomb = store.fetch_any("s1").await.unwrap().unwrap();
        assert!(tomb.deleted);

        // Deleting again fails: the document is gone
        assert_eq!(store.delete(&doc).await.unwrap_err(), StoreError::NotFound("s1".into()));
    }

    #[tokio::test]
    async fn test_change_log_and_info() {
        let store = MemoryStore::new("students");
        let a = store.insert(student("Ana")).await.unwrap();
        store.insert(student("Ben")).await.unwrap();
        let doc = store.fetch(&a.id).await.unwrap();
        store.delete(&doc).await.unwrap();

        let info = store.info().await.unwrap();
        assert_eq!(info.update_seq, 3);
        assert_eq!(info.doc_count, 1);

        let changes = store.changes_since(1).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].seq, 2);
        assert!(changes[1].deleted);
        assert!(store.changes_since(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_receives_commits() {
        let store = MemoryStore::new("students");
        let mut rx = store.subscribe();
        let doc_ref = store.insert(student("Ana")).await.unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.id, doc_ref.id);
        assert_eq!(change.seq, 1);
        assert_eq!(store.feed_stats().published, 1);
    }

    #[tokio::test]
    async fn test_apply_replicated_is_idempotent() {
        let store = MemoryStore::new("students");
        let remote = StoredDoc::live("s1", Revision::first(), &student("Ana").fields).unwrap();

        assert!(store.apply_replicated(remote.clone()).await.unwrap());
        assert!(!store.apply_replicated(remote.clone()).await.unwrap());
        assert_eq!(store.info().await.unwrap().update_seq, 1);

        // Older revision loses
        let newer = StoredDoc::tombstone("s1", remote.revision.next().unwrap());
        assert!(store.apply_replicated(newer).await.unwrap());
        assert!(!store.apply_replicated(remote).await.unwrap());
        assert!(store.fetch("s1").await.is_err());
    }

    #[tokio::test]
    async fn test_apply_replicated_rejects_exhausted_revision() {
        let store = MemoryStore::new("students");
        let last: Revision = format!("{}-ffff", u64::MAX).parse().unwrap();
        let remote = StoredDoc::live("s1", last, &student("Ana").fields).unwrap();

        let err = store.apply_replicated(remote).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument(_)));
        assert_eq!(store.info().await.unwrap().update_seq, 0);
    }

    #[tokio::test]
    async fn test_list_all_sorted_by_id() {
        let store = MemoryStore::new("students");
        for id in ["c", "a", "b"] {
            store.insert(student(id).with_id(id)).await.unwrap();
        }
        let ids: Vec<String> = store.list_all().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_provider_returns_same_store() {
        let provider = MemoryProvider::new();
        let first = provider.open("students").await.unwrap();
        first.insert(student("Ana")).await.unwrap();

        let second = provider.open("students").await.unwrap();
        assert_eq!(second.list_all().await.unwrap().len(), 1);
        assert_eq!(provider.collections().await, vec!["students".to_string()]);
    }

    #[tokio::test]
    async fn test_provider_rejects_invalid_name() {
        let provider = MemoryProvider::new();
        let err = provider.open("no/slashes").await.err().unwrap();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
