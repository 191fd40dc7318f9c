//! Change fan-out for a single collection.
//!
//! Uses a tokio broadcast channel so every subscriber (mirror refresh
//! listener, push replicators, server pull sessions) gets its own receiver.
//! Receivers that fall more than `capacity` changes behind observe
//! `RecvError::Lagged` and are expected to re-read the change log.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use super::Change;

/// Snapshot of feed activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub published: u64,
    pub undelivered: u64,
    pub subscribers: usize,
}

/// Broadcast channel of committed changes.
pub struct ChangeFeed {
    sender: broadcast::Sender<Change>,
    capacity: usize,
    published: AtomicU64,
    undelivered: AtomicU64,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            published: AtomicU64::new(0),
            undelivered: AtomicU64::new(0),
        }
    }

    /// Publish a committed change. Returns the number of receivers reached.
    pub fn publish(&self, change: Change) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(change) {
            Ok(count) => count,
            Err(_) => {
                // No subscribers right now; the change log still has it.
                self.undelivered.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.sender.subscribe()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            published: self.published.load(Ordering::Relaxed),
            undelivered: self.undelivered.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}
