//! Document indexing and semantic search over workspace uploads.
//!
//! The primary record store and the object store are collaborators reached
//! through trait seams; this module owns only the derived state: snippet
//! splitting, embedding caches, single-flight indexing, and cosine ranking.

pub mod indexer;
pub mod similarity;
pub mod snippet;

pub use indexer::{DocumentIndexer, IndexReport, IndexerConfig, SearchError, SearchHit};
pub use similarity::cosine_similarity;
pub use snippet::split_snippets;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// One document as listed by the primary record store.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub key: String,
    pub name: String,
    pub filename: String,
    pub storage_key: String,
    #[serde(default)]
    pub folder_path: String,
}

/// Primary record store collaborator: lists a workspace's documents.
#[async_trait]
pub trait DocumentCatalog: Send + Sync {
    async fn list_documents(&self, workspace_id: &str) -> anyhow::Result<Vec<DocumentRecord>>;
}

/// Object store failure; exposes the attempted key so callers can fall back
/// to a reconstructed key.
#[derive(Debug, Clone, Error)]
#[error("object store get failed for {key}: {message}")]
pub struct ObjectStoreError {
    pub key: String,
    pub message: String,
}

/// Object storage collaborator: raw document bytes by key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;
}

/// Cached content and derived snippets for one document.
#[derive(Debug, Clone)]
pub struct CachedDocument {
    pub content: Arc<String>,
    pub snippets: Arc<Vec<String>>,
    pub fetched_at: DateTime<Utc>,
}

/// Process-lifetime document cache keyed by (workspace, document key).
/// Avoids repeat object-store reads and re-splitting; cleared only by the
/// explicit per-workspace clear.
#[derive(Default)]
pub struct DocumentCache {
    inner: RwLock<HashMap<(String, String), CachedDocument>>,
}

impl DocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, workspace_id: &str, document_key: &str) -> Option<CachedDocument> {
        self.inner
            .read()
            .expect("document cache poisoned")
            .get(&(workspace_id.to_string(), document_key.to_string()))
            .cloned()
    }

    pub fn insert(&self, workspace_id: &str, document_key: &str, content: String, snippets: Vec<String>) {
        self.inner.write().expect("document cache poisoned").insert(
            (workspace_id.to_string(), document_key.to_string()),
            CachedDocument {
                content: Arc::new(content),
                snippets: Arc::new(snippets),
                fetched_at: Utc::now(),
            },
        );
    }

    /// Drop every cached document of one workspace.
    pub fn clear_workspace(&self, workspace_id: &str) -> usize {
        let mut guard = self.inner.write().expect("document cache poisoned");
        let before = guard.len();
        guard.retain(|(ws, _), _| ws != workspace_id);
        before - guard.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("document cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_cache_scoped_clear() {
        let cache = DocumentCache::new();
        cache.insert("ws-1", "d1", "one".to_string(), vec!["one".to_string()]);
        cache.insert("ws-1", "d2", "two".to_string(), vec!["two".to_string()]);
        cache.insert("ws-2", "d1", "other".to_string(), vec!["other".to_string()]);

        assert_eq!(cache.clear_workspace("ws-1"), 2);
        assert!(cache.get("ws-1", "d1").is_none());
        assert!(cache.get("ws-2", "d1").is_some());
    }
}
