//! RocksDB-backed persistent document store.
//!
//! One database per collection, at `<root>/<collection>`. Column families:
//! - `documents`: latest revision per id (bincode, LZ4 compressed), tombstones included
//! - `changes`: change log, keyed by sequence number (8 bytes big-endian)
//! - `metadata`: store metadata (created_at, updated_at, live doc count)
//!
//! Every mutation is one atomic write batch touching all three families.
//! Read-check-write sequences are serialized by an in-process write lock so
//! revision checks cannot interleave.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use async_trait::async_trait;
use roster_core::{Document, Revision};
use tokio::sync::broadcast;

use super::{
    assign_id, check_replicated, next_revision, replicated_wins, require_id, tombstone_revision,
    validate_collection_name, Change, ChangeFeed, DocRef, DocumentStore, FeedStats, StoreError,
    StoreInfo, StoreProvider, StoredDoc,
};

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_CHANGES: &str = "changes";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_CHANGES, CF_METADATA];

const METADATA_KEY: &[u8] = b"store";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory; each collection gets a subdirectory
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write batch (default: false)
    pub sync_writes: bool,
    /// Max open files per database (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Change feed buffer per subscriber
    pub feed_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("roster_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
            feed_capacity: 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
            feed_capacity: 256,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreMetadata {
    name: String,
    doc_count: u64,
    /// Seconds since epoch
    created_at: u64,
    updated_at: u64,
}

impl StoreMetadata {
    fn new(name: &str) -> Self {
        let now = now_secs();
        Self {
            name: name.to_string(),
            doc_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// RocksDB-backed [`DocumentStore`] for one collection.
pub struct RocksStore {
    name: String,
    /// Single-threaded mode: column families are fixed at open
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    path: PathBuf,
    /// Last assigned change sequence
    sequence: AtomicU64,
    write_lock: Mutex<()>,
    feed: ChangeFeed,
}

impl RocksStore {
    /// Open (or create) the collection `name` under `config.path`.
    pub fn open(name: &str, config: StoreConfig) -> Result<Self, StoreError> {
        validate_collection_name(name)?;
        let path = config.path.join(name);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|cf| ColumnFamilyDescriptor::new(*cf, Self::cf_options(cf, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db);
        let feed = ChangeFeed::new(config.feed_capacity);
        let store = Self {
            name: name.to_string(),
            db,
            config,
            path,
            sequence: AtomicU64::new(sequence),
            write_lock: Mutex::new(()),
            feed,
        };

        if store.load_metadata()?.is_none() {
            store.put_metadata(&StoreMetadata::new(name))?;
        }
        log::info!(
            "Opened collection '{name}' at {} (update_seq {sequence})",
            store.path.display()
        );
        Ok(store)
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Values are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                // Takes megabytes
                opts.optimize_for_point_lookup((config.block_cache_size / (1024 * 1024)).max(1) as u64);
            }
            CF_CHANGES => {
                // Append-only, read sequentially by replication
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::None);
            }
        }
        opts
    }

    /// Last sequence number in the change log, 0 when empty.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let Some(cf) = db.cf_handle(CF_CHANGES) else {
            return 0;
        };
        let mut iter = db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) => decode_seq(&key).unwrap_or(0),
            _ => 0,
        }
    }

    // ─── Records ──────────────────────────────────────────────────────

    fn encode_doc(doc: &StoredDoc) -> Result<Vec<u8>, StoreError> {
        let bytes = bincode::serde::encode_to_vec(doc, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&bytes))
    }

    fn decode_doc(bytes: &[u8]) -> Result<StoredDoc, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (doc, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(doc)
    }

    fn load(&self, id: &str) -> Result<Option<StoredDoc>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_doc(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_metadata(&self) -> Result<Option<StoreMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, METADATA_KEY)? {
            Some(bytes) => {
                let (meta, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    fn put_metadata(&self, meta: &StoreMetadata) -> Result<(), StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let bytes = bincode::serde::encode_to_vec(meta, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.db.put_cf(&cf, METADATA_KEY, bytes)?;
        Ok(())
    }

    /// Atomically store `stored`, append its change and update metadata.
    ///
    /// Caller must hold the write lock and pass the previous revision.
    fn commit(&self, previous: Option<&StoredDoc>, stored: StoredDoc) -> Result<Change, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_changes = self.cf(CF_CHANGES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let seq = self.sequence.load(Ordering::SeqCst) + 1;
        let change = stored.change(seq);

        let mut meta = self
            .load_metadata()?
            .unwrap_or_else(|| StoreMetadata::new(&self.name));
        meta.doc_count = meta.doc_count.saturating_add_signed(live_delta(previous, &stored));
        meta.updated_at = now_secs();

        let change_bytes = bincode::serde::encode_to_vec(&change, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let meta_bytes = bincode::serde::encode_to_vec(&meta, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, stored.id.as_bytes(), Self::encode_doc(&stored)?);
        batch.put_cf(&cf_changes, seq.to_be_bytes(), change_bytes);
        batch.put_cf(&cf_meta, METADATA_KEY, meta_bytes);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        self.sequence.store(seq, Ordering::SeqCst);
        self.feed.publish(change.clone());
        Ok(change)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|e| StoreError::Database(format!("write lock poisoned: {e}")))
    }

    // ─── Accessors ────────────────────────────────────────────────────

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn update_seq(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn feed_stats(&self) -> FeedStats {
        self.feed.stats()
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn info(&self) -> Result<StoreInfo, StoreError> {
        let meta = self
            .load_metadata()?
            .unwrap_or_else(|| StoreMetadata::new(&self.name));
        Ok(StoreInfo {
            name: self.name.clone(),
            update_seq: self.update_seq(),
            doc_count: meta.doc_count,
        })
    }

    async fn list_all(&self) -> Result<Vec<DocRef>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut refs = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            let stored = Self::decode_doc(&value)?;
            if !stored.deleted {
                refs.push(stored.doc_ref());
            }
        }
        Ok(refs)
    }

    async fn fetch(&self, id: &str) -> Result<Document, StoreError> {
        match self.load(id)? {
            Some(stored) if !stored.deleted => stored.to_document(),
            _ => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn insert(&self, doc: Document) -> Result<DocRef, StoreError> {
        let id = assign_id(&doc)?;
        let _guard = self.lock()?;
        let previous = self.load(&id)?;
        let revision = next_revision(&id, previous.as_ref(), None)?;
        let stored = StoredDoc::live(id, revision, &doc.fields)?;
        let doc_ref = stored.doc_ref();
        self.commit(previous.as_ref(), stored)?;
        Ok(doc_ref)
    }

    async fn write(&self, doc: Document) -> Result<Revision, StoreError> {
        let id = require_id(&doc)?;
        let _guard = self.lock()?;
        let previous = self.load(id)?;
        let revision = next_revision(id, previous.as_ref(), doc.revision())?;
        let stored = StoredDoc::live(id, revision.clone(), &doc.fields)?;
        self.commit(previous.as_ref(), stored)?;
        Ok(revision)
    }

    async fn delete(&self, doc: &Document) -> Result<Revision, StoreError> {
        let id = require_id(doc)?;
        let _guard = self.lock()?;
        let previous = self.load(id)?;
        let revision = tombstone_revision(id, previous.as_ref(), doc.revision())?;
        self.commit(previous.as_ref(), StoredDoc::tombstone(id, revision.clone()))?;
        Ok(revision)
    }

    async fn changes_since(&self, since: u64) -> Result<Vec<Change>, StoreError> {
        let cf = self.cf(CF_CHANGES)?;
        let start = since.saturating_add(1).to_be_bytes();
        let mut changes = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (_, value) = item?;
            let (change, _): (Change, _) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            changes.push(change);
        }
        Ok(changes)
    }

    async fn fetch_any(&self, id: &str) -> Result<Option<StoredDoc>, StoreError> {
        self.load(id)
    }

    async fn apply_replicated(&self, doc: StoredDoc) -> Result<bool, StoreError> {
        check_replicated(&doc)?;
        let _guard = self.lock()?;
        let previous = self.load(&doc.id)?;
        if !replicated_wins(&doc, previous.as_ref()) {
            return Ok(false);
        }
        self.commit(previous.as_ref(), doc)?;
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.feed.subscribe()
    }
}

/// Opens one [`RocksStore`] per collection under a shared root directory.
///
/// RocksDB holds an exclusive lock per database, so opened stores are
/// cached and shared for the provider's lifetime.
pub struct RocksProvider {
    config: StoreConfig,
    stores: tokio::sync::Mutex<HashMap<String, Arc<RocksStore>>>,
}

impl RocksProvider {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            stores: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.path
    }
}

#[async_trait]
impl StoreProvider for RocksProvider {
    async fn open(&self, name: &str) -> Result<Arc<dyn DocumentStore>, StoreError> {
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(name) {
            return Ok(store.clone());
        }

        std::fs::create_dir_all(&self.config.path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", self.config.path.display())))?;

        let config = self.config.clone();
        let owned_name = name.to_string();
        let store = tokio::task::spawn_blocking(move || RocksStore::open(&owned_name, config))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .map_err(|e| match e {
                StoreError::Unavailable(_) => e,
                other => StoreError::Unavailable(other.to_string()),
            })?;

        let store = Arc::new(store);
        stores.insert(name.to_string(), store.clone());
        Ok(store)
    }
}

/// Change in live document count when `next` replaces `previous`.
fn live_delta(previous: Option<&StoredDoc>, next: &StoredDoc) -> i64 {
    let was_live = previous.is_some_and(|p| !p.deleted);
    match (was_live, next.deleted) {
        (false, false) => 1,
        (true, true) => -1,
        _ => 0,
    }
}

fn decode_seq(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
