//! Replication integration tests.
//!
//! Start a live `ReplicaServer` on a free port and replicate local stores
//! and mirrors against it over websockets.

use roster_collab::storage::{DocumentStore, MemoryProvider, MemoryStore, StoreProvider};
use roster_collab::{
    CollectionMirror, Direction, MirrorConfig, MirrorError, MirrorEvent, Registry, ReplicaServer,
    ReplicationError, ReplicationOptions, ReplicationState, Replicator, ServerConfig,
};
use roster_core::{Document, Student};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct TestServer {
    server: Arc<ReplicaServer>,
    provider: Arc<MemoryProvider>,
    base_url: String,
}

impl TestServer {
    /// Start a memory-backed server on a free port.
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let provider = Arc::new(MemoryProvider::new());
        let config = ServerConfig {
            bind_addr: addr.to_string(),
            batch_size: 2,
            ..ServerConfig::default()
        };
        let server = Arc::new(ReplicaServer::with_provider(config, provider.clone()));

        let running = server.clone();
        tokio::spawn(async move {
            let _ = running.run_on(listener).await;
        });

        Self {
            server,
            provider,
            base_url: format!("ws://{addr}"),
        }
    }

    fn url(&self, collection: &str) -> String {
        format!("{}/{collection}", self.base_url)
    }

    async fn store(&self, collection: &str) -> Arc<dyn DocumentStore> {
        self.provider.open(collection).await.unwrap()
    }
}

fn student(name: &str) -> Document {
    Document::from_record(&Student::named(name)).unwrap()
}

fn one_shot() -> ReplicationOptions {
    ReplicationOptions {
        batch_size: 2,
        ..ReplicationOptions::one_shot()
    }
}

async fn replicate(store: Arc<dyn DocumentStore>, direction: Direction, url: &str) -> u64 {
    let handle = Replicator::start(store, direction, url, one_shot());
    timeout(Duration::from_secs(5), handle.finished())
        .await
        .expect("replication timed out")
        .expect("replication failed")
        .docs_transferred
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(Duration::from_secs(5), async {
        while !check().await {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ─── One-shot sessions ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_one_shot_push() {
    let server = TestServer::start().await;
    let local: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new("students"));
    for name in ["Ana", "Ben", "Cy"] {
        local.insert(student(name).with_id(name.to_lowercase())).await.unwrap();
    }

    let sent = replicate(local.clone(), Direction::Push, &server.url("students")).await;
    assert_eq!(sent, 3);

    let remote = server.store("students").await;
    for id in ["ana", "ben", "cy"] {
        assert_eq!(remote.fetch(id).await.unwrap(), local.fetch(id).await.unwrap());
    }
    assert_eq!(server.server.stats().await.docs_received, 3);
}

#[tokio::test]
async fn test_one_shot_pull() {
    let server = TestServer::start().await;
    let remote = server.store("tutors").await;
    for name in ["Dee", "Eve", "Fay", "Gus", "Hal"] {
        remote.insert(student(name)).await.unwrap();
    }

    let local: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new("tutors"));
    let pulled = replicate(local.clone(), Direction::Pull, &server.url("tutors")).await;
    assert_eq!(pulled, 5);
    assert_eq!(local.list_all().await.unwrap(), remote.list_all().await.unwrap());
}

#[tokio::test]
async fn test_empty_push_completes() {
    let server = TestServer::start().await;
    let local: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new("students"));
    assert_eq!(replicate(local, Direction::Push, &server.url("students")).await, 0);
}

#[tokio::test]
async fn test_deletions_replicate() {
    let server = TestServer::start().await;
    let url = server.url("students");
    let local: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new("students"));
    local.insert(student("Ana").with_id("s1")).await.unwrap();
    replicate(local.clone(), Direction::Push, &url).await;

    let doc = local.fetch("s1").await.unwrap();
    local.delete(&doc).await.unwrap();
    replicate(local.clone(), Direction::Push, &url).await;

    let remote = server.store("students").await;
    assert!(remote.fetch("s1").await.is_err());
    assert!(remote.fetch_any("s1").await.unwrap().unwrap().deleted);

    // And back down to a fresh device
    let other: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new("students"));
    replicate(other.clone(), Direction::Pull, &url).await;
    assert!(other.list_all().await.unwrap().is_empty());
    assert!(other.fetch_any("s1").await.unwrap().unwrap().deleted);
}

#[tokio::test]
async fn test_conflicting_writes_converge() {
    let server = TestServer::start().await;
    let url = server.url("students");
    let a: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new("students"));
    let b: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new("students"));

    a.insert(student("Ana").with_id("s1")).await.unwrap();
    replicate(a.clone(), Direction::Push, &url).await;
    replicate(b.clone(), Direction::Pull, &url).await;

    // Both edit the same revision offline
    let base = a.fetch("s1").await.unwrap();
    a.write(student("Ana A").with_id("s1").with_revision(base.revision().unwrap().clone()))
        .await
        .unwrap();
    b.write(student("Ana B").with_id("s1").with_revision(base.revision().unwrap().clone()))
        .await
        .unwrap();

    for store in [&a, &b] {
        replicate(store.clone(), Direction::Push, &url).await;
    }
    for store in [&a, &b] {
        replicate(store.clone(), Direction::Pull, &url).await;
    }

    let remote = server.store("students").await.fetch("s1").await.unwrap();
    assert_eq!(a.fetch("s1").await.unwrap(), remote);
    assert_eq!(b.fetch("s1").await.unwrap(), remote);
}

// ─── Continuous sessions ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_continuous_push_follows_local_changes() {
    let server = TestServer::start().await;
    let local: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new("students"));
    let handle = Replicator::start(
        local.clone(),
        Direction::Push,
        server.url("students"),
        ReplicationOptions::continuous(),
    );
    eventually(|| {
        let active = handle.state() == ReplicationState::Active;
        async move { active }
    })
    .await;

    local.insert(student("Ana").with_id("s1")).await.unwrap();
    let remote = server.store("students").await;
    eventually(|| {
        let remote = remote.clone();
        async move { remote.fetch("s1").await.is_ok() }
    })
    .await;

    handle.cancel();
    let summary = handle.finished().await.unwrap();
    assert_eq!(summary.direction, Direction::Push);
    assert!(summary.docs_transferred >= 1);
}

#[tokio::test]
async fn test_continuous_pull_follows_remote_changes() {
    let server = TestServer::start().await;
    let local: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new("students"));
    let handle = Replicator::start(
        local.clone(),
        Direction::Pull,
        server.url("students"),
        ReplicationOptions::continuous(),
    );

    let remote = server.store("students").await;
    for name in ["Ana", "Ben", "Cy"] {
        remote.insert(student(name)).await.unwrap();
    }
    eventually(|| {
        let local = local.clone();
        async move { local.list_all().await.unwrap().len() == 3 }
    })
    .await;

    assert!(!handle.is_finished());
    handle.cancel();
    assert!(handle.finished().await.is_ok());
}

// ─── Failures ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_invalid_collection_is_refused() {
    let server = TestServer::start().await;
    let local: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new("students"));
    let handle = Replicator::start(
        local,
        Direction::Pull,
        server.url("bad%20name"),
        one_shot(),
    );
    let err = timeout(Duration::from_secs(5), handle.finished())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ReplicationError::Remote(_)));
}

#[tokio::test]
async fn test_unreachable_remote_fails_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let local: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new("students"));
    let handle = Replicator::start(local, Direction::Push, format!("ws://{addr}/students"), one_shot());
    let err = timeout(Duration::from_secs(5), handle.finished())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ReplicationError::Connect(_)));
}

// ─── Mirrors over replication ────────────────────────────────────────────────

fn device(server: &TestServer) -> Registry {
    Registry::new(
        Arc::new(MemoryProvider::new()),
        MirrorConfig::for_testing().with_remote(server.base_url.clone()),
    )
}

#[tokio::test]
async fn test_sync_once_exchanges_documents() {
    let server = TestServer::start().await;
    server.store("students").await.insert(student("Remote")).await.unwrap();

    let registry = device(&server);
    let students = registry.get("students").await;
    students.add(student("Local")).await.unwrap();

    let report = timeout(Duration::from_secs(5), students.sync_once())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.loaded, 2);
    assert_eq!(students.len(), 2);
    assert_eq!(server.store("students").await.list_all().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_start_sync_with_remote_is_idempotent() {
    let server = TestServer::start().await;
    let registry = device(&server);
    let students = registry.get("students").await;

    let first = students.start_sync().await.unwrap();
    assert_eq!(first.handles, 3);
    assert_eq!(first.remote, Some(server.url("students")));

    let second = students.start_sync().await.unwrap();
    assert!(second.already_active);
    assert_eq!(students.sync_handle_count(), 3);

    assert!(students.stop_sync().await.unwrap());
    assert_eq!(students.sync_handle_count(), 0);
}

#[tokio::test]
async fn test_two_devices_converge() {
    let server = TestServer::start().await;
    let phone = device(&server).get("students").await;
    let laptop = device(&server).get("students").await;
    phone.start_sync().await.unwrap();
    laptop.start_sync().await.unwrap();

    let added = phone.add(student("Ana")).await.unwrap();
    let id = added.id().unwrap().to_string();
    eventually(|| {
        let seen = laptop.get(&id).is_some();
        async move { seen }
    })
    .await;

    laptop.remove(&id).await.unwrap();
    eventually(|| {
        let gone = phone.get(&id).is_none();
        async move { gone }
    })
    .await;
}

#[tokio::test]
async fn test_replication_failure_stops_sync() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mirror = CollectionMirror::spawn(
        "students",
        Arc::new(MemoryProvider::new()),
        MirrorConfig::for_testing().with_remote(format!("ws://{addr}")),
    );
    let mut events = mirror.subscribe();
    mirror.start_sync().await.unwrap();

    let failed = timeout(Duration::from_secs(5), async {
        loop {
            if let MirrorEvent::SyncFailed { reason } = events.recv().await.unwrap() {
                return reason;
            }
        }
    })
    .await
    .unwrap();
    assert!(failed.contains("replication failed"));
    assert_eq!(mirror.sync_handle_count(), 0);

    // Sync can be started again after a failure
    let status = mirror.start_sync().await.unwrap();
    assert!(!status.already_active);
}

#[tokio::test]
async fn test_sync_once_reports_unreachable_remote() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mirror = CollectionMirror::spawn(
        "students",
        Arc::new(MemoryProvider::new()),
        MirrorConfig::for_testing().with_remote(format!("ws://{addr}")),
    );
    let err = mirror.sync_once().await.unwrap_err();
    assert!(matches!(
        err,
        MirrorError::Replication(ReplicationError::Connect(_))
    ));
}
