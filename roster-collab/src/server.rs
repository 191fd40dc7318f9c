//! Websocket replica server: the remote peer of a roster mirror.
//!
//! Architecture:
//! ```text
//! Client A (push) ──┐                    ┌── Pull session ──► Client B
//!                   ├── Join(collection) ┤
//! Client C (pull) ──┘         │          └── Pull session ──► Client C
//!                             ▼
//!                   StoreProvider::open(collection)
//!                             │
//!                   ┌─────────┴──────────┐
//!                   │ DocumentStore      │──── ChangeFeed ───► live pulls
//!                   │ (memory / RocksDB) │
//!                   └────────────────────┘
//! ```
//!
//! Each connection serves one session. A push session applies incoming
//! revisions with `apply_replicated` and acks every batch. A pull session
//! sends the change log from the client's checkpoint, then `Complete`, then
//! (when continuous) every new change as it is committed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{Direction, MessageType, SyncMessage};
use crate::storage::{
    latest_per_id, Change, DocumentStore, MemoryProvider, RocksProvider, StoreConfig,
    StoreProvider, StoredDoc,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Change feed capacity per collection
    pub broadcast_capacity: usize,
    /// Documents per `Changes` batch
    pub batch_size: usize,
    /// RocksDB root directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            batch_size: 100,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub push_sessions: u64,
    pub pull_sessions: u64,
    /// Revisions applied from push sessions
    pub docs_received: u64,
    /// Revisions sent to pull sessions
    pub docs_sent: u64,
}

/// Session state of one connection after `Join`.
struct Joined {
    collection: String,
    store: Arc<dyn DocumentStore>,
    direction: Direction,
}

/// The replica server.
pub struct ReplicaServer {
    config: ServerConfig,
    provider: Arc<dyn StoreProvider>,
    stats: Arc<RwLock<ServerStats>>,
    /// Identity used on outgoing messages
    peer_id: Uuid,
}

impl ReplicaServer {
    /// Create a server; storage follows `config.storage_path`.
    pub fn new(config: ServerConfig) -> Self {
        let provider: Arc<dyn StoreProvider> = match &config.storage_path {
            Some(path) => Arc::new(RocksProvider::new(StoreConfig {
                path: path.clone(),
                feed_capacity: config.broadcast_capacity,
                ..StoreConfig::default()
            })),
            None => Arc::new(MemoryProvider::with_feed_capacity(config.broadcast_capacity)),
        };
        Self::with_provider(config, provider)
    }

    /// Create a server over an existing store provider.
    pub fn with_provider(config: ServerConfig, provider: Arc<dyn StoreProvider>) -> Self {
        Self {
            config,
            provider,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            peer_id: Uuid::new_v4(),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Replica server listening on {}", self.config.bind_addr);
        self.run_on(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let provider = self.provider.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let peer_id = self.peer_id;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, provider, stats.clone(), config, peer_id)
                        .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
                let mut s = stats.write().await;
                s.active_connections = s.active_connections.saturating_sub(1);
            });
        }
    }

    /// Handle a single websocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        provider: Arc<dyn StoreProvider>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
        peer_id: Uuid,
    ) -> Result<(), BoxError> {
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("Websocket connection established from {addr}");

        let mut joined: Option<Joined> = None;
        let mut feed: Option<broadcast::Receiver<Change>> = None;
        // Highest local sequence already sent to a pull client
        let mut checkpoint = 0u64;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let sync_msg = match SyncMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match sync_msg.msg_type {
                                MessageType::Join => {
                                    if joined.is_some() {
                                        let reply = SyncMessage::error(peer_id, sync_msg.collection.as_str(), "session already joined");
                                        send(&mut ws_sender, &reply).await?;
                                        continue;
                                    }
                                    let request = match sync_msg.join_request() {
                                        Ok(r) => r,
                                        Err(e) => {
                                            let reply = SyncMessage::error(peer_id, sync_msg.collection.as_str(), &e.to_string());
                                            send(&mut ws_sender, &reply).await?;
                                            break;
                                        }
                                    };
                                    let store = match provider.open(&sync_msg.collection).await {
                                        Ok(s) => s,
                                        Err(e) => {
                                            log::warn!("Join of '{}' from {addr} refused: {e}", sync_msg.collection);
                                            let reply = SyncMessage::error(peer_id, sync_msg.collection.as_str(), &e.to_string());
                                            send(&mut ws_sender, &reply).await?;
                                            break;
                                        }
                                    };

                                    log::info!(
                                        "{} session {} joined '{}' (continuous: {}, since: {})",
                                        request.direction, sync_msg.peer_id, sync_msg.collection,
                                        request.continuous, request.since
                                    );

                                    if request.direction == Direction::Pull {
                                        // Subscribe before reading the log so nothing falls in between.
                                        let rx = store.subscribe();
                                        let (sent, covered) = Self::send_changes(
                                            &mut ws_sender, store.as_ref(), &sync_msg.collection,
                                            request.since, config.batch_size, peer_id,
                                        ).await?;
                                        checkpoint = covered;
                                        let done = SyncMessage::complete(peer_id, sync_msg.collection.as_str(), checkpoint);
                                        send(&mut ws_sender, &done).await?;
                                        if request.continuous {
                                            feed = Some(rx);
                                        }
                                        let mut s = stats.write().await;
                                        s.pull_sessions += 1;
                                        s.docs_sent += sent;
                                    } else {
                                        stats.write().await.push_sessions += 1;
                                    }

                                    joined = Some(Joined {
                                        collection: sync_msg.collection,
                                        store,
                                        direction: request.direction,
                                    });
                                }

                                MessageType::Push => {
                                    let Some(session) = joined.as_ref().filter(|j| j.direction == Direction::Push) else {
                                        let reply = SyncMessage::error(peer_id, sync_msg.collection.as_str(), "push before join");
                                        send(&mut ws_sender, &reply).await?;
                                        break;
                                    };
                                    let docs = match sync_msg.documents() {
                                        Ok(d) => d,
                                        Err(e) => {
                                            let reply = SyncMessage::error(peer_id, session.collection.as_str(), &e.to_string());
                                            send(&mut ws_sender, &reply).await?;
                                            break;
                                        }
                                    };

                                    let mut applied = 0u64;
                                    let mut failure = None;
                                    for doc in docs {
                                        match session.store.apply_replicated(doc).await {
                                            Ok(true) => applied += 1,
                                            Ok(false) => {}
                                            Err(e) => {
                                                failure = Some(e);
                                                break;
                                            }
                                        }
                                    }
                                    if let Some(e) = failure {
                                        log::error!("Push into '{}' failed: {e}", session.collection);
                                        let reply = SyncMessage::error(peer_id, session.collection.as_str(), &e.to_string());
                                        send(&mut ws_sender, &reply).await?;
                                        break;
                                    }

                                    let ack = SyncMessage::ack(peer_id, session.collection.as_str(), sync_msg.checkpoint);
                                    send(&mut ws_sender, &ack).await?;
                                    if applied > 0 {
                                        log::debug!("Applied {applied} pushed docs to '{}'", session.collection);
                                        stats.write().await.docs_received += applied;
                                    }
                                }

                                MessageType::Ping => {
                                    send(&mut ws_sender, &SyncMessage::pong(peer_id)).await?;
                                }

                                _ => {
                                    log::debug!("Unhandled message type: {:?}", sync_msg.msg_type);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("Websocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Live changes for a continuous pull session
                change = async {
                    if let Some(ref mut rx) = feed {
                        rx.recv().await
                    } else {
                        std::future::pending().await
                    }
                } => {
                    let Some(session) = joined.as_ref() else {
                        continue;
                    };
                    match change {
                        Ok(change) if change.seq <= checkpoint => {}
                        Ok(_) => {
                            let (sent, covered) = Self::send_changes(
                                &mut ws_sender, session.store.as_ref(), &session.collection,
                                checkpoint, config.batch_size, peer_id,
                            ).await?;
                            checkpoint = covered;
                            stats.write().await.docs_sent += sent;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Pull session on '{}' lagged by {n} changes", session.collection);
                            let (sent, covered) = Self::send_changes(
                                &mut ws_sender, session.store.as_ref(), &session.collection,
                                checkpoint, config.batch_size, peer_id,
                            ).await?;
                            checkpoint = covered;
                            stats.write().await.docs_sent += sent;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        let _ = ws_sender.close().await;
        Ok(())
    }

    /// Send the latest revision of every id changed after `since`.
    ///
    /// Returns the number of documents sent and the sequence covered.
    async fn send_changes<S>(
        sink: &mut S,
        store: &dyn DocumentStore,
        collection: &str,
        since: u64,
        batch_size: usize,
        peer_id: Uuid,
    ) -> Result<(u64, u64), BoxError>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        let changes = store.changes_since(since).await?;
        let Some(covered) = changes.last().map(|c| c.seq) else {
            return Ok((0, since));
        };

        let collapsed = latest_per_id(&changes);
        let batches: Vec<&[Change]> = collapsed.chunks(batch_size.max(1)).collect();
        let last = batches.len().saturating_sub(1);
        let mut sent = 0u64;

        for (i, batch) in batches.into_iter().enumerate() {
            let mut docs: Vec<StoredDoc> = Vec::with_capacity(batch.len());
            for change in batch {
                if let Some(doc) = store.fetch_any(&change.id).await? {
                    docs.push(doc);
                }
            }
            let checkpoint = if i == last {
                covered
            } else {
                batch.last().map_or(since, |c| c.seq)
            };
            let msg = SyncMessage::changes(peer_id, collection, checkpoint, &docs)?;
            send(sink, &msg).await?;
            sent += docs.len() as u64;
        }
        log::trace!("Sent {sent} docs of '{collection}' (since {since}, covered {covered})");
        Ok((sent, covered))
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Store provider serving the collections.
    pub fn provider(&self) -> &Arc<dyn StoreProvider> {
        &self.provider
    }
}

async fn send<S>(sink: &mut S, msg: &SyncMessage) -> Result<(), BoxError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_core::Document;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.batch_size, 100);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = ReplicaServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = ReplicaServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.docs_received, 0);
        assert_eq!(stats.docs_sent, 0);
    }

    #[tokio::test]
    async fn test_server_with_storage_opens_rocks_collections() {
        let dir = tempfile::tempdir().unwrap();
        let server = ReplicaServer::with_storage("127.0.0.1:0", dir.path().join("db"));
        let store = server.provider().open("students").await.unwrap();
        store.insert(Document::new().with_field("name", "Ana")).await.unwrap();
        assert!(dir.path().join("db").join("students").exists());
    }

    #[tokio::test]
    async fn test_server_with_provider_shares_stores() {
        let provider = Arc::new(MemoryProvider::new());
        let server = ReplicaServer::with_provider(ServerConfig::default(), provider.clone());
        server.provider().open("students").await.unwrap();
        assert_eq!(provider.collections().await, vec!["students".to_string()]);
    }
}
