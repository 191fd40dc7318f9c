//! Websocket replication client.
//!
//! A [`Replicator`] session copies revisions between a local
//! [`DocumentStore`] and a [`ReplicaServer`](crate::server::ReplicaServer)
//! in one direction:
//! - Push: local change log → `Push` batches → server, each batch acked
//! - Pull: server `Changes` batches → `apply_replicated` on the local store
//!
//! One-shot sessions end after the initial catch-up. Continuous sessions
//! keep following new changes until cancelled or until the connection fails.
//! Sessions never reconnect on their own.

use std::fmt::Display;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{Direction, JoinRequest, MessageType, ProtocolError, SyncMessage};
use crate::storage::{latest_per_id, Change, DocumentStore, StoreError, StoredDoc};

/// Replication errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplicationError {
    #[error("Connection to {0} failed")]
    Connect(String),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Local store error: {0}")]
    Store(#[from] StoreError),
    #[error("Remote error: {0}")]
    Remote(String),
    #[error("Connection closed")]
    Closed,
}

/// Session options.
#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    /// Keep following changes after the initial catch-up
    pub continuous: bool,
    /// Documents per `Push` batch
    pub batch_size: usize,
    /// Checkpoint to start from (0 = full history)
    pub since: u64,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            continuous: true,
            batch_size: 100,
            since: 0,
        }
    }
}

impl ReplicationOptions {
    pub fn continuous() -> Self {
        Self::default()
    }

    pub fn one_shot() -> Self {
        Self {
            continuous: false,
            ..Self::default()
        }
    }
}

/// Outcome of a session that ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSummary {
    pub direction: Direction,
    /// Revisions sent (push) or applied locally (pull)
    pub docs_transferred: u64,
    /// Last checkpoint reached
    pub checkpoint: u64,
}

/// Session lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationState {
    Connecting,
    Active,
    Completed(ReplicationSummary),
    Cancelled(ReplicationSummary),
    Failed(ReplicationError),
}

impl ReplicationState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ReplicationState::Completed(_)
                | ReplicationState::Cancelled(_)
                | ReplicationState::Failed(_)
        )
    }
}

/// Handle to a running replication session.
///
/// Dropping the handle does not stop the session; call [`cancel`](Self::cancel).
#[derive(Clone)]
pub struct ReplicationHandle {
    direction: Direction,
    url: String,
    token: CancellationToken,
    state: watch::Receiver<ReplicationState>,
}

impl ReplicationHandle {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current state snapshot.
    pub fn state(&self) -> ReplicationState {
        self.state.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state.borrow().is_finished()
    }

    /// Stop the session. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the session to end.
    ///
    /// Cancellation counts as a clean end and yields the progress so far.
    pub async fn finished(&self) -> Result<ReplicationSummary, ReplicationError> {
        let mut state = self.state.clone();
        let ended = state
            .wait_for(ReplicationState::is_finished)
            .await
            .map_err(|_| ReplicationError::Closed)?;
        match ReplicationState::clone(&ended) {
            ReplicationState::Completed(summary) | ReplicationState::Cancelled(summary) => {
                Ok(summary)
            }
            ReplicationState::Failed(e) => Err(e),
            ReplicationState::Connecting | ReplicationState::Active => Err(ReplicationError::Closed),
        }
    }
}

/// Starts replication sessions.
pub struct Replicator;

impl Replicator {
    /// Start a session between `store` and the collection at `url`
    /// (`ws://host:port/<collection>`).
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        store: Arc<dyn DocumentStore>,
        direction: Direction,
        url: impl Into<String>,
        options: ReplicationOptions,
    ) -> ReplicationHandle {
        let url = url.into();
        let token = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ReplicationState::Connecting);
        let collection = remote_collection(&url, store.name());

        let mut session = Session {
            peer_id: Uuid::new_v4(),
            store,
            direction,
            url: url.clone(),
            collection,
            checkpoint: options.since,
            options,
            transferred: 0,
            state: state_tx,
        };

        let cancel = token.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = session.run() => Some(result),
            };
            let summary = session.summary();
            let state = match result {
                None => {
                    log::info!("{} replication with {} cancelled", session.direction, session.url);
                    ReplicationState::Cancelled(summary)
                }
                Some(Ok(())) => {
                    log::info!(
                        "{} replication with {} complete ({} docs, checkpoint {})",
                        session.direction,
                        session.url,
                        summary.docs_transferred,
                        summary.checkpoint
                    );
                    ReplicationState::Completed(summary)
                }
                Some(Err(e)) => {
                    log::warn!("{} replication with {} failed: {e}", session.direction, session.url);
                    ReplicationState::Failed(e)
                }
            };
            session.state.send_replace(state);
        });

        ReplicationHandle {
            direction,
            url,
            token,
            state: state_rx,
        }
    }
}

/// Collection name at the end of a replication URL.
fn remote_collection(url: &str, fallback: &str) -> String {
    let path = url.split_once("://").map_or(url, |(_, rest)| rest);
    match path.split_once('/') {
        Some((_, tail)) => {
            let name = tail.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
            if name.is_empty() {
                fallback.to_string()
            } else {
                name.to_string()
            }
        }
        None => fallback.to_string(),
    }
}

struct Session {
    peer_id: Uuid,
    store: Arc<dyn DocumentStore>,
    direction: Direction,
    url: String,
    collection: String,
    options: ReplicationOptions,
    checkpoint: u64,
    transferred: u64,
    state: watch::Sender<ReplicationState>,
}

impl Session {
    fn summary(&self) -> ReplicationSummary {
        ReplicationSummary {
            direction: self.direction,
            docs_transferred: self.transferred,
            checkpoint: self.checkpoint,
        }
    }

    async fn run(&mut self) -> Result<(), ReplicationError> {
        // Subscribe before the first catch-up so no commit falls in between.
        let feed = match self.direction {
            Direction::Push => Some(self.store.subscribe()),
            Direction::Pull => None,
        };

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| {
                log::debug!("Connect to {} failed: {e}", self.url);
                ReplicationError::Connect(self.url.clone())
            })?;
        let (mut sink, mut stream) = ws_stream.split();

        let join = SyncMessage::join(
            self.peer_id,
            self.collection.as_str(),
            &JoinRequest {
                direction: self.direction,
                continuous: self.options.continuous,
                since: self.checkpoint,
            },
        )?;
        send(&mut sink, &join).await?;
        self.state.send_replace(ReplicationState::Active);
        log::debug!(
            "{} session {} joined '{}' at {}",
            self.direction,
            self.peer_id,
            self.collection,
            self.url
        );

        let result = match feed {
            Some(feed) => self.push(&mut sink, &mut stream, feed).await,
            None => self.pull(&mut sink, &mut stream).await,
        };
        let _ = sink.close().await;
        result
    }

    // ─── Push ─────────────────────────────────────────────────────────

    async fn push<S, R>(
        &mut self,
        sink: &mut S,
        stream: &mut R,
        mut feed: broadcast::Receiver<Change>,
    ) -> Result<(), ReplicationError>
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
        R: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        // The first round always sends a batch so the server confirms the join.
        self.push_pending(sink, stream, true).await?;
        if !self.options.continuous {
            return Ok(());
        }

        loop {
            tokio::select! {
                change = feed.recv() => {
                    match change {
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::debug!("Push feed lagged by {n}; catching up from the log");
                        }
                        Err(broadcast::error::RecvError::Closed) => return Err(ReplicationError::Closed),
                    }
                    // Coalesce whatever else is already queued.
                    while feed.try_recv().is_ok() {}
                    self.push_pending(sink, stream, false).await?;
                }
                msg = stream.next() => {
                    match self.next_message(sink, msg).await? {
                        Some(msg) => {
                            log::debug!("Unexpected {:?} during push session", msg.msg_type);
                        }
                        None => continue,
                    }
                }
            }
        }
    }

    /// Send every id changed since the checkpoint, in batches.
    async fn push_pending<S, R>(
        &mut self,
        sink: &mut S,
        stream: &mut R,
        force: bool,
    ) -> Result<(), ReplicationError>
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
        R: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let changes = self.store.changes_since(self.checkpoint).await?;
        let Some(covered) = changes.last().map(|c| c.seq) else {
            if force {
                let msg = SyncMessage::push(self.peer_id, self.collection.as_str(), self.checkpoint, &[])?;
                send(sink, &msg).await?;
                self.await_ack(sink, stream, self.checkpoint).await?;
            }
            return Ok(());
        };

        let collapsed = latest_per_id(&changes);
        let batch_size = self.options.batch_size.max(1);
        let batches: Vec<&[Change]> = collapsed.chunks(batch_size).collect();
        let last = batches.len().saturating_sub(1);

        for (i, batch) in batches.into_iter().enumerate() {
            let mut docs: Vec<StoredDoc> = Vec::with_capacity(batch.len());
            for change in batch {
                if let Some(doc) = self.store.fetch_any(&change.id).await? {
                    docs.push(doc);
                }
            }
            let checkpoint = if i == last {
                covered
            } else {
                batch.last().map_or(self.checkpoint, |c| c.seq)
            };

            let msg = SyncMessage::push(self.peer_id, self.collection.as_str(), checkpoint, &docs)?;
            send(sink, &msg).await?;
            self.await_ack(sink, stream, checkpoint).await?;

            self.checkpoint = checkpoint;
            self.transferred += docs.len() as u64;
            log::trace!("Pushed {} docs to '{}' (checkpoint {checkpoint})", docs.len(), self.collection);
        }
        Ok(())
    }

    async fn await_ack<S, R>(
        &mut self,
        sink: &mut S,
        stream: &mut R,
        checkpoint: u64,
    ) -> Result<(), ReplicationError>
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
        R: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = stream.next().await;
            let Some(msg) = self.next_message(sink, frame).await? else {
                continue;
            };
            match msg.msg_type {
                MessageType::Ack if msg.checkpoint == checkpoint => return Ok(()),
                MessageType::Ack => {
                    log::debug!("Stale ack {} (waiting for {checkpoint})", msg.checkpoint);
                }
                other => return Err(ProtocolError::InvalidMessageType(other).into()),
            }
        }
    }

    // ─── Pull ─────────────────────────────────────────────────────────

    async fn pull<S, R>(&mut self, sink: &mut S, stream: &mut R) -> Result<(), ReplicationError>
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
        R: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = stream.next().await;
            let Some(msg) = self.next_message(sink, frame).await? else {
                continue;
            };
            match msg.msg_type {
                MessageType::Changes => {
                    let docs = msg.documents()?;
                    let received = docs.len();
                    for doc in docs {
                        if self.store.apply_replicated(doc).await? {
                            self.transferred += 1;
                        }
                    }
                    self.checkpoint = self.checkpoint.max(msg.checkpoint);
                    log::trace!(
                        "Pulled {received} docs into '{}' (checkpoint {})",
                        self.store.name(),
                        self.checkpoint
                    );
                }
                MessageType::Complete => {
                    self.checkpoint = self.checkpoint.max(msg.checkpoint);
                    if !self.options.continuous {
                        return Ok(());
                    }
                    log::debug!("Pull of '{}' caught up at {}", self.collection, self.checkpoint);
                }
                other => return Err(ProtocolError::InvalidMessageType(other).into()),
            }
        }
    }

    // ─── Framing ──────────────────────────────────────────────────────

    /// Decode one websocket frame.
    ///
    /// Returns `None` for frames handled here (pings, pongs, control frames).
    async fn next_message<S>(
        &self,
        sink: &mut S,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> Result<Option<SyncMessage>, ReplicationError>
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
    {
        match frame {
            Some(Ok(Message::Binary(data))) => {
                let bytes: Vec<u8> = data.into();
                let msg = SyncMessage::decode(&bytes)?;
                match msg.msg_type {
                    MessageType::Error => Err(ReplicationError::Remote(msg.error_message()?)),
                    MessageType::Ping => {
                        send(sink, &SyncMessage::pong(self.peer_id)).await?;
                        Ok(None)
                    }
                    MessageType::Pong => Ok(None),
                    _ => Ok(Some(msg)),
                }
            }
            Some(Ok(Message::Ping(data))) => {
                sink.send(Message::Pong(data))
                    .await
                    .map_err(|_| ReplicationError::Closed)?;
                Ok(None)
            }
            Some(Ok(Message::Close(_))) | None => Err(ReplicationError::Closed),
            Some(Ok(_)) => Ok(None),
            Some(Err(e)) => {
                log::debug!("Websocket error from {}: {e}", self.url);
                Err(ReplicationError::Closed)
            }
        }
    }
}

async fn send<S>(sink: &mut S, msg: &SyncMessage) -> Result<(), ReplicationError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into())).await.map_err(|e| {
        log::debug!("Websocket send failed: {e}");
        ReplicationError::Closed
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use tokio::time::{timeout, Duration};

    #[test]
    fn test_remote_collection_from_url() {
        assert_eq!(remote_collection("ws://127.0.0.1:9090/students", "x"), "students");
        assert_eq!(remote_collection("ws://host/db/students/", "x"), "students");
        assert_eq!(remote_collection("ws://host", "local"), "local");
        assert_eq!(remote_collection("ws://host/", "local"), "local");
    }

    #[test]
    fn test_options_default() {
        let options = ReplicationOptions::default();
        assert!(options.continuous);
        assert_eq!(options.batch_size, 100);
        assert_eq!(options.since, 0);
        assert!(!ReplicationOptions::one_shot().continuous);
    }

    #[test]
    fn test_state_is_finished() {
        let summary = ReplicationSummary {
            direction: Direction::Pull,
            docs_transferred: 0,
            checkpoint: 0,
        };
        assert!(!ReplicationState::Connecting.is_finished());
        assert!(!ReplicationState::Active.is_finished());
        assert!(ReplicationState::Completed(summary.clone()).is_finished());
        assert!(ReplicationState::Cancelled(summary).is_finished());
        assert!(ReplicationState::Failed(ReplicationError::Closed).is_finished());
    }

    #[tokio::test]
    async fn test_connect_failure_reported() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let store = Arc::new(MemoryStore::new("students"));
        let url = format!("ws://127.0.0.1:{port}/students");
        let handle = Replicator::start(store, Direction::Push, &url, ReplicationOptions::one_shot());

        let result = timeout(Duration::from_secs(5), handle.finished()).await.unwrap();
        assert_eq!(result.unwrap_err(), ReplicationError::Connect(url));
        assert!(handle.is_finished());
        assert_eq!(handle.direction(), Direction::Push);
    }

    #[tokio::test]
    async fn test_cancel_before_connect_completes() {
        let store = Arc::new(MemoryStore::new("students"));
        // Non-routable address keeps the connect pending.
        let handle = Replicator::start(
            store,
            Direction::Pull,
            "ws://10.255.255.1:9/students",
            ReplicationOptions::continuous(),
        );
        handle.cancel();
        assert!(handle.is_cancelled());

        let summary = timeout(Duration::from_secs(5), handle.finished())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.docs_transferred, 0);
        assert!(matches!(handle.state(), ReplicationState::Cancelled(_)));
    }
}
