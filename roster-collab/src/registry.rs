//! Registry: one shared [`CollectionMirror`] per collection name.
//!
//! Built once by the composition root and passed to whoever needs a mirror.
//! Mirrors live as long as the registry; there is no eviction.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::mirror::{CollectionMirror, MirrorConfig, MirrorError};
use crate::storage::StoreProvider;

pub struct Registry {
    provider: Arc<dyn StoreProvider>,
    config: MirrorConfig,
    mirrors: RwLock<HashMap<String, Arc<CollectionMirror>>>,
}

impl Registry {
    pub fn new(provider: Arc<dyn StoreProvider>, config: MirrorConfig) -> Self {
        Self {
            provider,
            config,
            mirrors: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the mirror for `name`.
    ///
    /// Creating a mirror opens its store and starts the initial refresh in
    /// the background; concurrent first calls share one instance.
    pub async fn get(&self, name: &str) -> Arc<CollectionMirror> {
        // Fast path: read lock
        {
            let mirrors = self.mirrors.read().await;
            if let Some(mirror) = mirrors.get(name) {
                return mirror.clone();
            }
        }

        // Slow path: write lock to create
        let mut mirrors = self.mirrors.write().await;
        // Double-check after acquiring write lock
        if let Some(mirror) = mirrors.get(name) {
            return mirror.clone();
        }

        log::info!("Creating mirror for collection '{name}'");
        let mirror = Arc::new(CollectionMirror::spawn(
            name,
            self.provider.clone(),
            self.config.clone(),
        ));
        mirrors.insert(name.to_string(), mirror.clone());
        mirror
    }

    /// Names of all mirrored collections, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mirrors.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.mirrors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.mirrors.read().await.is_empty()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.mirrors.read().await.contains_key(name)
    }

    /// Stop sync on every mirror. Returns how many were syncing.
    pub async fn stop_all_sync(&self) -> Result<usize, MirrorError> {
        let mirrors: Vec<Arc<CollectionMirror>> =
            self.mirrors.read().await.values().cloned().collect();
        let mut stopped = 0;
        for mirror in mirrors {
            if mirror.stop_sync().await? {
                stopped += 1;
            }
        }
        Ok(stopped)
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }
}
