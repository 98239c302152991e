//! Per-workspace document indexing and cosine-ranked semantic search.
//!
//! Concurrent searches against one workspace share a single in-flight
//! indexing pass instead of each paying for its own embeddings; the pass
//! runs under one global timeout whose cancellation signal is shared by
//! every per-snippet embedding task, so a timeout degrades to partial
//! results instead of an all-or-nothing failure.

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::memory::credits::CreditGuard;
use crate::memory::embed::{
    estimate_tokens, snippet_cache_key, workspace_cache_scope, ApiKeys, EmbeddingGenerator,
};
use crate::memory::error::{CreditError, EmbedError, EmbedErrorKind};

use super::snippet::{split_snippets, DEFAULT_SNIPPET_TARGET};
use super::similarity::cosine_similarity;
use super::{DocumentCache, DocumentCatalog, DocumentRecord, ObjectStore};

/// Default global timeout for one indexing pass.
const DEFAULT_PASS_TIMEOUT: Duration = Duration::from_secs(120);

/// Indexer tuning knobs.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Global timeout for one indexing pass; on expiry every in-flight
    /// snippet embedding is cancelled and the pass reports partial results.
    pub pass_timeout: Duration,
    /// Target snippet size in characters.
    pub snippet_target: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            pass_timeout: DEFAULT_PASS_TIMEOUT,
            snippet_target: DEFAULT_SNIPPET_TARGET,
        }
    }
}

impl IndexerConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            pass_timeout: Duration::from_secs(config.index_timeout_secs),
            snippet_target: config.snippet_target_chars,
        }
    }
}

/// Outcome of one indexing pass. Partial success is a valid, observable
/// result: `embedded` vs `unprocessed` records how far the pass got before
/// the timeout.
#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    /// Documents listed for the workspace.
    pub documents: usize,
    /// Documents skipped after both fetch attempts failed.
    pub skipped_documents: usize,
    /// Snippets known for the workspace after this pass.
    pub snippets: usize,
    /// Snippets whose embeddings were already cached.
    pub cached: usize,
    /// Snippets newly embedded by this pass.
    pub embedded: usize,
    /// Snippets that failed embedding (isolated, siblings unaffected).
    pub failed: usize,
    /// Snippets cancelled by the pass timeout.
    pub unprocessed: usize,
    /// Whether the global timeout fired.
    pub timed_out: bool,
    /// Pass-fatal error (document listing failed); snippet-level failures
    /// are counted, not stored here.
    pub error: Option<String>,
}

/// One ranked search result.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub document_key: String,
    pub document_name: String,
    pub folder_path: String,
    pub snippet: String,
    pub score: f32,
}

/// Search failure: the only error a search call raises is its own query
/// embedding (or the credit reservation around it).
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("{0}")]
    Embed(#[from] EmbedError),

    #[error("{0}")]
    Credits(#[from] CreditError),
}

#[derive(Clone)]
struct IndexedSnippet {
    document_key: String,
    document_name: String,
    folder_path: String,
    text: String,
    cache_key: String,
}

enum SnippetOutcome {
    Embedded,
    AlreadyCached,
    Cancelled,
    Failed(String),
}

type SharedIndexFuture = Shared<BoxFuture<'static, IndexReport>>;

struct Inner {
    catalog: Arc<dyn DocumentCatalog>,
    objects: Arc<dyn ObjectStore>,
    embedder: Arc<EmbeddingGenerator>,
    credits: Arc<CreditGuard>,
    keys: ApiKeys,
    documents: Arc<DocumentCache>,
    registry: RwLock<HashMap<String, Arc<Vec<IndexedSnippet>>>>,
    inflight: Mutex<HashMap<String, SharedIndexFuture>>,
    config: IndexerConfig,
}

/// Document indexer and semantic search for workspace uploads.
#[derive(Clone)]
pub struct DocumentIndexer {
    inner: Arc<Inner>,
}

impl DocumentIndexer {
    pub fn new(
        catalog: Arc<dyn DocumentCatalog>,
        objects: Arc<dyn ObjectStore>,
        embedder: Arc<EmbeddingGenerator>,
        credits: Arc<CreditGuard>,
        keys: ApiKeys,
        documents: Arc<DocumentCache>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                objects,
                embedder,
                credits,
                keys,
                documents,
                registry: RwLock::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Semantic search over a workspace's documents.
    ///
    /// Ensures the index is current (running or awaiting the in-flight
    /// pass), then ranks every cached snippet embedding by cosine similarity
    /// against the query. Raises only when the query's own embedding cannot
    /// be produced; index-pass failures degrade to fewer results.
    pub async fn search(
        &self,
        workspace_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let inner = &self.inner;
        let resolved = inner.keys.resolve(Some(workspace_id));

        let reservation = inner
            .credits
            .reserve(u64::from(estimate_tokens(query)), !resolved.byok)?;
        let query_embedding = match inner
            .embedder
            .generate(query, resolved.key, None, None)
            .await
        {
            Ok(embedding) => {
                inner
                    .credits
                    .adjust(reservation, u64::from(embedding.tokens))?;
                embedding
            }
            Err(err) => {
                if let Err(refund_err) = inner.credits.refund(reservation) {
                    tracing::error!(error = %refund_err, "refund failed after query embedding error");
                }
                return Err(err.into());
            }
        };

        let report = self.ensure_indexed(workspace_id).await;
        if let Some(error) = &report.error {
            tracing::warn!(workspace_id, error = %error, "searching over stale index");
        }

        let snippets = inner
            .registry
            .read()
            .expect("snippet registry poisoned")
            .get(workspace_id)
            .cloned();
        let Some(snippets) = snippets else {
            return Ok(Vec::new());
        };

        let cache = inner.embedder.cache();
        let mut hits: Vec<SearchHit> = snippets
            .iter()
            .filter_map(|snippet| {
                let vector = cache.get(&snippet.cache_key)?;
                Some(SearchHit {
                    document_key: snippet.document_key.clone(),
                    document_name: snippet.document_name.clone(),
                    folder_path: snippet.folder_path.clone(),
                    snippet: snippet.text.clone(),
                    score: cosine_similarity(&query_embedding.vector, &vector),
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    /// Run the workspace's indexing pass, or await the one already in
    /// flight. Concurrent callers share a single pass and observe the same
    /// resulting cache state.
    pub async fn ensure_indexed(&self, workspace_id: &str) -> IndexReport {
        let fut = {
            let mut inflight = self.inner.inflight.lock().await;
            if let Some(existing) = inflight.get(workspace_id) {
                existing.clone()
            } else {
                let inner = Arc::clone(&self.inner);
                let ws = workspace_id.to_string();
                // The pass removes its own map entry on every exit path, so
                // a failed or cancelled pass never wedges the workspace.
                let fut: SharedIndexFuture = async move {
                    let report = run_index_pass(&inner, &ws).await;
                    inner.inflight.lock().await.remove(&ws);
                    report
                }
                .boxed()
                .shared();
                inflight.insert(workspace_id.to_string(), fut.clone());
                fut
            }
        };
        fut.await
    }

    /// Drop every cached embedding, document, and snippet of one workspace.
    /// There is no automatic expiry; this is the only invalidation.
    pub fn clear_workspace(&self, workspace_id: &str) {
        let embeddings = self
            .inner
            .embedder
            .cache()
            .remove_scope(&workspace_cache_scope(workspace_id));
        let documents = self.inner.documents.clear_workspace(workspace_id);
        self.inner
            .registry
            .write()
            .expect("snippet registry poisoned")
            .remove(workspace_id);
        tracing::info!(workspace_id, embeddings, documents, "workspace caches cleared");
    }
}

async fn run_index_pass(inner: &Arc<Inner>, workspace_id: &str) -> IndexReport {
    let mut report = IndexReport::default();

    let documents = match inner.catalog.list_documents(workspace_id).await {
        Ok(documents) => documents,
        Err(e) => {
            tracing::error!(workspace_id, error = %e, "document listing failed, aborting pass");
            report.error = Some(format!("document listing failed: {}", e));
            return report;
        }
    };
    report.documents = documents.len();

    // Fetch and split anything not already content-cached. One bad document
    // must not abort the pass.
    for document in &documents {
        if inner.documents.get(workspace_id, &document.key).is_some() {
            continue;
        }
        match fetch_content(inner, workspace_id, document).await {
            Ok(content) => {
                let snippets = split_snippets(&content, inner.config.snippet_target);
                inner
                    .documents
                    .insert(workspace_id, &document.key, content, snippets);
            }
            Err(reason) => {
                report.skipped_documents += 1;
                tracing::warn!(
                    workspace_id,
                    document = %document.key,
                    reason = %reason,
                    "skipping document after failed fetches"
                );
            }
        }
    }

    // Rebuild the workspace's snippet registry from the content cache.
    let mut entries = Vec::new();
    for document in &documents {
        let Some(cached) = inner.documents.get(workspace_id, &document.key) else {
            continue;
        };
        for text in cached.snippets.iter() {
            entries.push(IndexedSnippet {
                document_key: document.key.clone(),
                document_name: document.name.clone(),
                folder_path: document.folder_path.clone(),
                text: text.clone(),
                cache_key: snippet_cache_key(workspace_id, &document.key, text),
            });
        }
    }
    report.snippets = entries.len();

    let cache = inner.embedder.cache();
    let pending: Vec<IndexedSnippet> = entries
        .iter()
        .filter(|s| cache.get(&s.cache_key).is_none())
        .cloned()
        .collect();
    report.cached = report.snippets - pending.len();

    inner
        .registry
        .write()
        .expect("snippet registry poisoned")
        .insert(workspace_id.to_string(), Arc::new(entries));

    if pending.is_empty() {
        return report;
    }

    // Embed every pending snippet in parallel under one shared cancellation
    // signal; the global timeout fires it and the pass settles with counts.
    let resolved = inner.keys.resolve(Some(workspace_id));
    let cancel = CancellationToken::new();
    let mut join = Box::pin(join_all(pending.iter().map(|snippet| {
        embed_snippet(inner, snippet, resolved.key, resolved.byok, &cancel)
    })));

    let outcomes = tokio::select! {
        outcomes = &mut join => outcomes,
        _ = tokio::time::sleep(inner.config.pass_timeout) => {
            report.timed_out = true;
            cancel.cancel();
            (&mut join).await
        }
    };

    for outcome in outcomes {
        match outcome {
            SnippetOutcome::Embedded => report.embedded += 1,
            SnippetOutcome::AlreadyCached => report.cached += 1,
            SnippetOutcome::Cancelled => report.unprocessed += 1,
            SnippetOutcome::Failed(reason) => {
                report.failed += 1;
                tracing::warn!(workspace_id, reason = %reason, "snippet embedding failed");
            }
        }
    }

    tracing::info!(
        workspace_id,
        documents = report.documents,
        snippets = report.snippets,
        embedded = report.embedded,
        unprocessed = report.unprocessed,
        failed = report.failed,
        timed_out = report.timed_out,
        "indexing pass finished"
    );
    report
}

/// One snippet's complete reserve -> generate -> adjust-or-refund unit.
async fn embed_snippet(
    inner: &Arc<Inner>,
    snippet: &IndexedSnippet,
    api_key: &str,
    byok: bool,
    cancel: &CancellationToken,
) -> SnippetOutcome {
    let estimate = u64::from(estimate_tokens(&snippet.text));
    let reservation = match inner.credits.reserve(estimate, !byok) {
        Ok(id) => id,
        Err(e) => return SnippetOutcome::Failed(e.to_string()),
    };

    match inner
        .embedder
        .generate(&snippet.text, api_key, Some(&snippet.cache_key), Some(cancel))
        .await
    {
        Ok(embedding) => {
            if let Err(e) = inner.credits.adjust(reservation, u64::from(embedding.tokens)) {
                return SnippetOutcome::Failed(e.to_string());
            }
            if embedding.cached {
                SnippetOutcome::AlreadyCached
            } else {
                SnippetOutcome::Embedded
            }
        }
        Err(err) => {
            if let Err(refund_err) = inner.credits.refund(reservation) {
                tracing::error!(error = %refund_err, "refund failed after snippet embedding error");
            }
            if err.kind == EmbedErrorKind::Cancelled {
                SnippetOutcome::Cancelled
            } else {
                SnippetOutcome::Failed(err.to_string())
            }
        }
    }
}

/// Fetch a document's raw bytes, falling back to a key reconstructed from
/// (workspace, normalized folder path, filename) when the stored key fails.
async fn fetch_content(
    inner: &Arc<Inner>,
    workspace_id: &str,
    document: &DocumentRecord,
) -> Result<String, String> {
    match inner.objects.get(&document.storage_key).await {
        Ok(bytes) => Ok(decode_text(bytes)),
        Err(first) => {
            let fallback = fallback_key(workspace_id, &document.folder_path, &document.filename);
            tracing::warn!(
                attempted = %first.key,
                fallback = %fallback,
                "object fetch failed, retrying with reconstructed key"
            );
            match inner.objects.get(&fallback).await {
                Ok(bytes) => Ok(decode_text(bytes)),
                Err(second) => Err(format!("{}; {}", first, second)),
            }
        }
    }
}

fn decode_text(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Expected object key for a document: `{workspace}/{folder}/{filename}`
/// with the folder path normalized (empty segments dropped).
fn fallback_key(workspace_id: &str, folder_path: &str, filename: &str) -> String {
    let folder: Vec<&str> = folder_path
        .split('/')
        .filter(|segment| !segment.trim().is_empty())
        .collect();
    if folder.is_empty() {
        format!("{}/{}", workspace_id, filename)
    } else {
        format!("{}/{}/{}", workspace_id, folder.join("/"), filename)
    }
}
