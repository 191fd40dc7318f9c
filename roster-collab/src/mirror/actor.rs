//! Mirror actor: single writer of a collection's item list.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use roster_core::{Document, Revision};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{
    ConcurrencyPolicy, MirrorConfig, MirrorError, MirrorEvent, MirrorOp, RefreshReport, Shared,
    SyncStatus,
};
use crate::client::{ReplicationError, ReplicationHandle, ReplicationOptions, Replicator};
use crate::protocol::Direction;
use crate::storage::{Change, DocumentStore, StoreError, StoreProvider};

type Reply<T> = oneshot::Sender<Result<T, MirrorError>>;

/// Store mutations; these are the operations subject to the concurrency policy.
pub(super) enum Mutation {
    Add { doc: Document, reply: Reply<Document> },
    Remove { id: String, reply: Reply<Revision> },
    Update { id: String, fields: Map<String, Value>, reply: Reply<Document> },
}

impl Mutation {
    /// Document id this mutation targets, if known before it runs.
    fn key(&self) -> Option<&str> {
        match self {
            Mutation::Add { doc, .. } => doc.id(),
            Mutation::Remove { id, .. } | Mutation::Update { id, .. } => Some(id.as_str()),
        }
    }
}

/// Completed store I/O for a mutation.
pub(super) enum Settled {
    Added {
        key: Option<String>,
        result: Result<Document, StoreError>,
        reply: Reply<Document>,
    },
    Removed {
        id: String,
        result: Result<Revision, StoreError>,
        reply: Reply<Revision>,
    },
    Updated {
        id: String,
        result: Result<Document, StoreError>,
        reply: Reply<Document>,
    },
}

pub(super) enum Command {
    Refresh { reply: Option<Reply<RefreshReport>> },
    Mutate(Mutation),
    StartSync { reply: Reply<SyncStatus> },
    StopSync { reply: Reply<bool> },
    SyncOnce { reply: Reply<RefreshReport> },

    // Completions from spawned tasks
    Loaded { generation: u64, doc: Document },
    RefreshDone {
        generation: u64,
        outcome: Result<(usize, Vec<(String, StoreError)>), StoreError>,
        reply: Option<Reply<RefreshReport>>,
    },
    Settled(Settled),
    SyncOnceDone {
        result: Result<(), ReplicationError>,
        reply: Reply<RefreshReport>,
    },
    ReplicationFailed { session: u64, direction: Direction, error: ReplicationError },
}

/// Handles of one `start_sync` call.
struct SyncSession {
    id: u64,
    listener: CancellationToken,
    replications: Vec<ReplicationHandle>,
}

impl SyncSession {
    fn handle_count(&self) -> usize {
        1 + self.replications.len()
    }

    fn cancel(&self) {
        self.listener.cancel();
        for handle in &self.replications {
            handle.cancel();
        }
    }
}

struct MirrorActor {
    name: String,
    config: MirrorConfig,
    store: Result<Arc<dyn DocumentStore>, StoreError>,
    shared: Shared,
    commands: mpsc::WeakSender<Command>,
    /// Bumped by every refresh; loads tagged with an older value are dropped
    generation: u64,
    /// Tombstone revisions of ids removed since the current refresh began.
    /// A load read before the delete must not bring the entry back.
    removed: HashMap<String, Revision>,
    sync: Option<SyncSession>,
    next_session: u64,
    /// Ids with a mutation in flight (SerializedPerId only)
    busy: HashSet<String>,
    queued: HashMap<String, VecDeque<Mutation>>,
}

pub(super) async fn run(
    name: String,
    config: MirrorConfig,
    shared: Shared,
    provider: Arc<dyn StoreProvider>,
    commands: mpsc::WeakSender<Command>,
    mut rx: mpsc::Receiver<Command>,
) {
    let store = provider.open(&name).await;
    if let Err(e) = &store {
        log::error!("Collection '{name}' unavailable: {e}");
    }

    let mut actor = MirrorActor {
        name,
        config,
        store,
        shared,
        commands,
        generation: 0,
        removed: HashMap::new(),
        sync: None,
        next_session: 0,
        busy: HashSet::new(),
        queued: HashMap::new(),
    };

    if actor.store.is_ok() {
        actor.refresh(None);
    }
    while let Some(command) = rx.recv().await {
        actor.handle(command);
    }

    if let Some(session) = actor.sync.take() {
        session.cancel();
    }
    log::debug!("Mirror '{}' stopped", actor.name);
}

impl MirrorActor {
    fn handle(&mut self, command: Command) {
        match command {
            Command::Refresh { reply } => self.refresh(reply),
            Command::Mutate(mutation) => self.submit(mutation),
            Command::StartSync { reply } => self.start_sync(reply),
            Command::StopSync { reply } => {
                let _ = reply.send(Ok(self.stop_sync()));
            }
            Command::SyncOnce { reply } => self.sync_once(reply),
            Command::Loaded { generation, doc } => self.loaded(generation, doc),
            Command::RefreshDone {
                generation,
                outcome,
                reply,
            } => self.refresh_done(generation, outcome, reply),
            Command::Settled(settled) => self.settled(settled),
            Command::SyncOnceDone { result, reply } => match result {
                Ok(()) => self.refresh(Some(reply)),
                Err(e) => self.fail(MirrorOp::SyncOnce, e.into(), reply),
            },
            Command::ReplicationFailed {
                session,
                direction,
                error,
            } => self.replication_failed(session, direction, error),
        }
    }

    // ─── Plumbing ─────────────────────────────────────────────────────

    fn store(&self) -> Result<Arc<dyn DocumentStore>, MirrorError> {
        match &self.store {
            Ok(store) => Ok(store.clone()),
            Err(e) => Err(MirrorError::StoreUnavailable(e.to_string())),
        }
    }

    fn emit(&self, event: MirrorEvent) {
        // No subscribers is fine.
        let _ = self.shared.events.send(event);
    }

    /// Run store I/O off the actor and feed its completion back in.
    fn spawn_io<F>(&self, io: F)
    where
        F: Future<Output = Command> + Send + 'static,
    {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let completion = io.await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(completion).await;
            }
        });
    }

    fn fail<T>(&self, op: MirrorOp, error: MirrorError, reply: Reply<T>) {
        log::warn!("{op} on '{}' failed: {error}", self.name);
        self.emit(MirrorEvent::OperationFailed {
            op,
            error: error.clone(),
        });
        let _ = reply.send(Err(error));
    }

    fn with_items<R>(&self, f: impl FnOnce(&mut Vec<Document>) -> R) -> R {
        let mut items = self.shared.items.write().unwrap_or_else(|e| e.into_inner());
        f(&mut items)
    }

    /// Insert or replace the entry for `doc`'s id.
    ///
    /// An entry already holding a newer revision is kept.
    fn upsert(&self, doc: Document) -> bool {
        self.with_items(|items| {
            let Some(id) = doc.id() else {
                return false;
            };
            match items.iter_mut().find(|d| d.id() == Some(id)) {
                Some(existing) if existing.revision() > doc.revision() => false,
                Some(existing) => {
                    *existing = doc;
                    true
                }
                None => {
                    items.push(doc);
                    true
                }
            }
        })
    }

    // ─── Refresh ──────────────────────────────────────────────────────

    fn refresh(&mut self, reply: Option<Reply<RefreshReport>>) {
        let store = match self.store() {
            Ok(store) => store,
            Err(e) => {
                match reply {
                    Some(reply) => self.fail(MirrorOp::Refresh, e, reply),
                    None => log::warn!("refresh on '{}' skipped: {e}", self.name),
                }
                return;
            }
        };

        self.generation += 1;
        let generation = self.generation;
        self.removed.clear();
        self.with_items(Vec::clear);
        self.emit(MirrorEvent::Cleared);
        log::debug!("Refreshing '{}' (generation {generation})", self.name);

        let commands = self.commands.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let outcome = load_all(store, generation, &name, &commands).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx
                    .send(Command::RefreshDone {
                        generation,
                        outcome,
                        reply,
                    })
                    .await;
            }
        });
    }

    fn loaded(&mut self, generation: u64, doc: Document) {
        if generation != self.generation {
            log::trace!("Dropping load from superseded refresh {generation}");
            return;
        }
        let id = doc.id().unwrap_or_default().to_string();
        if let Some(tombstone) = self.removed.get(&id) {
            if doc.revision().map_or(true, |rev| rev < tombstone) {
                log::trace!("Dropping load of '{id}' read before its removal");
                return;
            }
        }
        if self.upsert(doc) {
            self.emit(MirrorEvent::Loaded { id });
        }
    }

    fn refresh_done(
        &mut self,
        generation: u64,
        outcome: Result<(usize, Vec<(String, StoreError)>), StoreError>,
        reply: Option<Reply<RefreshReport>>,
    ) {
        match outcome {
            Ok((loaded, failed)) => {
                let report = RefreshReport {
                    loaded,
                    failed,
                    superseded: generation != self.generation,
                };
                log::debug!(
                    "Refresh {generation} of '{}' done: {} loaded, {} failed",
                    self.name,
                    report.loaded,
                    report.failed.len()
                );
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(report));
                }
            }
            Err(e) => match reply {
                Some(reply) => self.fail(MirrorOp::Refresh, e.into(), reply),
                None => {
                    log::warn!("refresh on '{}' failed: {e}", self.name);
                    self.emit(MirrorEvent::OperationFailed {
                        op: MirrorOp::Refresh,
                        error: e.into(),
                    });
                }
            },
        }
    }

    // ─── Mutations ────────────────────────────────────────────────────

    fn submit(&mut self, mutation: Mutation) {
        if self.config.policy == ConcurrencyPolicy::SerializedPerId {
            if let Some(key) = mutation.key() {
                if self.busy.contains(key) {
                    let key = key.to_string();
                    log::trace!("Queueing mutation of '{key}'");
                    self.queued.entry(key).or_default().push_back(mutation);
                    return;
                }
                self.busy.insert(key.to_string());
            }
        }
        self.dispatch(mutation);
    }

    /// Release `key` and start the next queued mutation for it.
    fn release(&mut self, key: &str) {
        if self.config.policy != ConcurrencyPolicy::SerializedPerId {
            return;
        }
        let next = self.queued.get_mut(key).and_then(VecDeque::pop_front);
        match next {
            Some(mutation) => self.dispatch(mutation),
            None => {
                self.queued.remove(key);
                self.busy.remove(key);
            }
        }
    }

    fn dispatch(&mut self, mutation: Mutation) {
        let store = match self.store() {
            Ok(store) => store,
            Err(e) => {
                let key = mutation.key().map(str::to_string);
                match mutation {
                    Mutation::Add { reply, .. } => self.fail(MirrorOp::Add, e, reply),
                    Mutation::Remove { reply, .. } => self.fail(MirrorOp::Remove, e, reply),
                    Mutation::Update { reply, .. } => self.fail(MirrorOp::Update, e, reply),
                }
                if let Some(key) = key {
                    self.release(&key);
                }
                return;
            }
        };

        match mutation {
            Mutation::Add { doc, reply } => {
                let key = doc.id().map(str::to_string);
                self.spawn_io(async move {
                    let result = insert(store.as_ref(), doc).await;
                    Command::Settled(Settled::Added { key, result, reply })
                });
            }
            Mutation::Remove { id, reply } => {
                self.spawn_io(async move {
                    let result = remove(store.as_ref(), &id).await;
                    Command::Settled(Settled::Removed { id, result, reply })
                });
            }
            Mutation::Update { id, fields, reply } => {
                self.spawn_io(async move {
                    let result = update(store.as_ref(), &id, fields).await;
                    Command::Settled(Settled::Updated { id, result, reply })
                });
            }
        }
    }

    fn settled(&mut self, settled: Settled) {
        match settled {
            Settled::Added { key, result, reply } => {
                match result {
                    Ok(doc) => {
                        let id = doc.id().unwrap_or_default().to_string();
                        self.upsert(doc.clone());
                        self.emit(MirrorEvent::Added { id });
                        let _ = reply.send(Ok(doc));
                    }
                    Err(e) => self.fail(MirrorOp::Add, e.into(), reply),
                }
                if let Some(key) = key {
                    self.release(&key);
                }
            }
            Settled::Removed { id, result, reply } => {
                match result {
                    Ok(revision) => {
                        self.removed.insert(id.clone(), revision.clone());
                        self.with_items(|items| items.retain(|d| d.id() != Some(id.as_str())));
                        self.emit(MirrorEvent::Removed { id: id.clone() });
                        let _ = reply.send(Ok(revision));
                    }
                    Err(e) => self.fail(MirrorOp::Remove, e.into(), reply),
                }
                self.release(&id);
            }
            Settled::Updated { id, result, reply } => {
                match result {
                    Ok(doc) => {
                        self.upsert(doc.clone());
                        self.emit(MirrorEvent::Updated { id: id.clone() });
                        let _ = reply.send(Ok(doc));
                    }
                    Err(e) => self.fail(MirrorOp::Update, e.into(), reply),
                }
                self.release(&id);
            }
        }
    }

    // ─── Sync ─────────────────────────────────────────────────────────

    fn remote_url(&self) -> Option<String> {
        self.config
            .remote
            .as_ref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), self.name))
    }

    fn start_sync(&mut self, reply: Reply<SyncStatus>) {
        if let Some(session) = &self.sync {
            log::debug!("Sync of '{}' already running", self.name);
            let _ = reply.send(Ok(SyncStatus {
                handles: session.handle_count(),
                remote: self.remote_url(),
                already_active: true,
            }));
            return;
        }
        let store = match self.store() {
            Ok(store) => store,
            Err(e) => return self.fail(MirrorOp::StartSync, e, reply),
        };

        self.next_session += 1;
        let session_id = self.next_session;

        let listener = CancellationToken::new();
        tokio::spawn(listen_for_changes(
            store.subscribe(),
            self.name.clone(),
            listener.clone(),
            self.commands.clone(),
        ));

        let remote = self.remote_url();
        let mut replications = Vec::new();
        if let Some(url) = &remote {
            let options = ReplicationOptions {
                continuous: true,
                batch_size: self.config.batch_size,
                since: 0,
            };
            for direction in [Direction::Push, Direction::Pull] {
                let handle = Replicator::start(store.clone(), direction, url.as_str(), options.clone());
                self.watch_replication(session_id, handle.clone());
                replications.push(handle);
            }
        }

        let session = SyncSession {
            id: session_id,
            listener,
            replications,
        };
        let handles = session.handle_count();
        self.sync = Some(session);
        self.shared.sync_handles.store(handles, Ordering::SeqCst);

        log::info!(
            "Sync of '{}' started ({handles} handles, remote: {})",
            self.name,
            remote.as_deref().unwrap_or("none")
        );
        self.emit(MirrorEvent::SyncStarted);
        let _ = reply.send(Ok(SyncStatus {
            handles,
            remote,
            already_active: false,
        }));
    }

    fn watch_replication(&self, session: u64, handle: ReplicationHandle) {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            if let Err(error) = handle.finished().await {
                if let Some(tx) = commands.upgrade() {
                    let _ = tx
                        .send(Command::ReplicationFailed {
                            session,
                            direction: handle.direction(),
                            error,
                        })
                        .await;
                }
            }
        });
    }

    fn stop_sync(&mut self) -> bool {
        let Some(session) = self.sync.take() else {
            return false;
        };
        session.cancel();
        self.shared.sync_handles.store(0, Ordering::SeqCst);
        log::info!("Sync of '{}' stopped", self.name);
        self.emit(MirrorEvent::SyncStopped);
        true
    }

    fn replication_failed(&mut self, session: u64, direction: Direction, error: ReplicationError) {
        let current = self.sync.as_ref().map(|s| s.id);
        if current != Some(session) {
            log::debug!("Ignoring failure of stale sync session {session}");
            return;
        }
        if let Some(session) = self.sync.take() {
            session.cancel();
        }
        self.shared.sync_handles.store(0, Ordering::SeqCst);

        let reason = format!("{direction} replication failed: {error}");
        log::error!("Sync of '{}' stopped: {reason}", self.name);
        self.emit(MirrorEvent::SyncFailed { reason });
    }

    fn sync_once(&mut self, reply: Reply<RefreshReport>) {
        let Some(url) = self.remote_url() else {
            return self.fail(MirrorOp::SyncOnce, MirrorError::NoRemote(self.name.clone()), reply);
        };
        let store = match self.store() {
            Ok(store) => store,
            Err(e) => return self.fail(MirrorOp::SyncOnce, e, reply),
        };

        let options = ReplicationOptions {
            continuous: false,
            batch_size: self.config.batch_size,
            since: 0,
        };
        log::info!("One-shot sync of '{}' with {url}", self.name);
        self.spawn_io(async move {
            let result = replicate_once(store, &url, options).await;
            Command::SyncOnceDone { result, reply }
        });
    }
}

// ─── Store I/O (runs in spawned tasks) ────────────────────────────────

/// List and fetch every document, sending each one back as it arrives.
async fn load_all(
    store: Arc<dyn DocumentStore>,
    generation: u64,
    name: &str,
    commands: &mpsc::WeakSender<Command>,
) -> Result<(usize, Vec<(String, StoreError)>), StoreError> {
    let refs = store.list_all().await?;

    let mut fetches: FuturesUnordered<_> = refs
        .into_iter()
        .map(|doc_ref| {
            let store = store.clone();
            async move {
                let result = store.fetch(&doc_ref.id).await;
                (doc_ref.id, result)
            }
        })
        .collect();

    let mut loaded = 0;
    let mut failed = Vec::new();
    while let Some((id, result)) = fetches.next().await {
        match result {
            Ok(doc) => {
                let Some(tx) = commands.upgrade() else {
                    break;
                };
                if tx.send(Command::Loaded { generation, doc }).await.is_err() {
                    break;
                }
                loaded += 1;
            }
            Err(e) => {
                log::warn!("Fetch of '{id}' in '{name}' failed: {e}");
                failed.push((id, e));
            }
        }
    }
    Ok((loaded, failed))
}

async fn insert(store: &dyn DocumentStore, mut doc: Document) -> Result<Document, StoreError> {
    let doc_ref = store.insert(doc.clone()).await?;
    doc.id = Some(doc_ref.id);
    doc.revision = Some(doc_ref.revision);
    Ok(doc)
}

async fn remove(store: &dyn DocumentStore, id: &str) -> Result<Revision, StoreError> {
    let current = store.fetch(id).await?;
    store.delete(&current).await
}

async fn update(
    store: &dyn DocumentStore,
    id: &str,
    fields: Map<String, Value>,
) -> Result<Document, StoreError> {
    let current = store.fetch(id).await?;
    let mut doc = Document::from_fields(fields).with_id(id);
    doc.revision = current.revision;
    let revision = store.write(doc.clone()).await?;
    doc.revision = Some(revision);
    Ok(doc)
}

/// Turn local change notifications into refresh commands until cancelled.
///
/// The receiver is subscribed before this task starts, so it only sees
/// changes made after sync began.
async fn listen_for_changes(
    mut changes: broadcast::Receiver<Change>,
    name: String,
    token: CancellationToken,
    commands: mpsc::WeakSender<Command>,
) {
    log::debug!("Following changes of '{name}'");

    loop {
        let change = tokio::select! {
            _ = token.cancelled() => break,
            change = changes.recv() => change,
        };
        match change {
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::debug!("Change listener of '{name}' lagged by {n}");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
        // One refresh covers everything already queued.
        while changes.try_recv().is_ok() {}

        let Some(tx) = commands.upgrade() else {
            break;
        };
        if tx.send(Command::Refresh { reply: None }).await.is_err() {
            break;
        }
    }
}

/// Push then pull once.
async fn replicate_once(
    store: Arc<dyn DocumentStore>,
    url: &str,
    options: ReplicationOptions,
) -> Result<(), ReplicationError> {
    let push = Replicator::start(store.clone(), Direction::Push, url, options.clone());
    let pushed = push.finished().await?;
    let pull = Replicator::start(store, Direction::Pull, url, options);
    let pulled = pull.finished().await?;
    log::info!(
        "One-shot sync with {url}: pushed {}, pulled {}",
        pushed.docs_transferred,
        pulled.docs_transferred
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_mutation_key() {
        let (tx, _rx) = oneshot::channel();
        let add = Mutation::Add {
            doc: Document::new(),
            reply: tx,
        };
        assert_eq!(add.key(), None);

        let (tx, _rx) = oneshot::channel();
        let remove = Mutation::Remove {
            id: "s1".into(),
            reply: tx,
        };
        assert_eq!(remove.key(), Some("s1"));
    }

    #[tokio::test]
    async fn test_update_replaces_body() {
        let store = MemoryStore::new("students");
        let doc_ref = store
            .insert(Document::new().with_id("s1").with_field("name", "Ana").with_field("grade", "3"))
            .await
            .unwrap();

        let mut fields = Map::new();
        fields.insert("name".into(), "Ana B".into());
        let updated = update(&store, "s1", fields).await.unwrap();

        assert_eq!(updated.get_str("name"), Some("Ana B"));
        assert!(updated.get("grade").is_none());
        assert!(updated.revision().unwrap() > &doc_ref.revision);
        assert_eq!(store.fetch("s1").await.unwrap(), updated);
    }

    #[tokio::test]
    async fn test_remove_missing_is_not_found() {
        let store = MemoryStore::new("students");
        assert_eq!(
            remove(&store, "nope").await.unwrap_err(),
            StoreError::NotFound("nope".into())
        );
    }

    #[tokio::test]
    async fn test_insert_fills_id_and_revision() {
        let store = MemoryStore::new("students");
        let doc = insert(&store, Document::new().with_field("name", "Ana")).await.unwrap();
        assert!(doc.id().is_some());
        assert_eq!(doc.revision().unwrap().generation(), 1);
    }
}
