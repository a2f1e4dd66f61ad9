//! One provider per open document, shared by every view of it.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cache::LocalCache;
use crate::error::SyncError;
use crate::protocol::DocumentId;
use crate::provider::{Provider, ProviderConfig, ProviderState};

/// Registry of live providers keyed by document.
///
/// Opening an already-open document hands back the same provider, so a
/// process never holds two replicas of one document.
pub struct ReplicaArena {
    config: ProviderConfig,
    cache: Arc<dyn LocalCache>,
    providers: Mutex<HashMap<DocumentId, Arc<Provider>>>,
}

impl ReplicaArena {
    pub fn new(config: ProviderConfig, cache: Arc<dyn LocalCache>) -> Self {
        Self {
            config,
            cache,
            providers: Mutex::new(HashMap::new()),
        }
    }

    /// Provider for `doc_id`, opening one if needed.
    pub async fn open(&self, doc_id: DocumentId) -> Result<Arc<Provider>, SyncError> {
        let mut providers = self.providers.lock().await;
        if let Some(existing) = providers.get(&doc_id) {
            if existing.state() != ProviderState::Closed {
                return Ok(existing.clone());
            }
        }

        let provider = Arc::new(Provider::open(doc_id, self.config.clone(), self.cache.clone()).await?);
        providers.insert(doc_id, provider.clone());
        log::debug!("Arena now holds {} documents", providers.len());
        Ok(provider)
    }

    pub async fn get(&self, doc_id: DocumentId) -> Option<Arc<Provider>> {
        self.providers.lock().await.get(&doc_id).cloned()
    }

    /// Close and forget one document's provider.
    pub async fn close(&self, doc_id: DocumentId) -> bool {
        let removed = self.providers.lock().await.remove(&doc_id);
        match removed {
            Some(provider) => {
                provider.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let providers: Vec<_> = self.providers.lock().await.drain().map(|(_, p)| p).collect();
        for provider in providers {
            provider.close().await;
        }
    }

    pub async fn documents(&self) -> Vec<DocumentId> {
        self.providers.lock().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.providers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.providers.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use uuid::Uuid;

    fn arena() -> ReplicaArena {
        // Nothing listens on the discard port; providers stay offline.
        let config = ProviderConfig::for_testing("http://127.0.0.1:9", "tok");
        ReplicaArena::new(config, Arc::new(MemoryCache::new()))
    }

    #[tokio::test]
    async fn test_open_is_shared_per_document() {
        let arena = arena();
        let doc = Uuid::new_v4();
        let first = arena.open(doc).await.unwrap();
        let second = arena.open(doc).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = arena.open(Uuid::new_v4()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(arena.len().await, 2);
        arena.close_all().await;
        assert!(arena.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_snapshots_into_cache() {
        let cache = Arc::new(MemoryCache::new());
        let arena = ReplicaArena::new(
            ProviderConfig::for_testing("http://127.0.0.1:9", "tok"),
            cache.clone(),
        );
        let doc = Uuid::new_v4();
        let provider = arena.open(doc).await.unwrap();
        provider.push_text("draft").await.unwrap();

        assert!(arena.close(doc).await);
        assert!(!arena.close(doc).await);
        assert_eq!(provider.state(), ProviderState::Closed);

        // Reopening restores the edit from the cache.
        let reopened = arena.open(doc).await.unwrap();
        assert!(!Arc::ptr_eq(&provider, &reopened));
        assert_eq!(reopened.text().await, "draft");
        arena.close_all().await;
    }
}
