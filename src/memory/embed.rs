//! Embedding generation with caching, retry/backoff, and cancellation.
//!
//! The network seam is the [`EmbeddingBackend`] trait; production uses the
//! OpenRouter-style [`HttpEmbeddingBackend`]. The generator wraps a backend
//! with a content cache and a bounded, cancellable retry loop.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::error::{classify_provider_error, EmbedError};

/// Default maximum attempts per generation (1 initial + 4 retries).
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default cap on a single backoff sleep.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// A generated embedding.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub vector: Arc<Vec<f32>>,
    /// Prompt tokens billed by the provider; 0 for cache hits.
    pub tokens: u32,
    /// Whether the vector came from the cache (no network call, no billing).
    pub cached: bool,
}

/// Raw result of one backend call.
#[derive(Debug, Clone)]
pub struct BackendEmbedding {
    pub vector: Vec<f32>,
    pub tokens: u32,
}

/// The raw text -> vector network call. Implementations classify their
/// failures via [`EmbedError`] so the generator can decide what to retry.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str, api_key: &str) -> Result<BackendEmbedding, EmbedError>;
}

/// Estimate tokens for a text (rough: 4 chars per token).
pub fn estimate_tokens(text: &str) -> u32 {
    ((text.len() + 3) / 4) as u32
}

/// Process-lifetime embedding cache.
///
/// Keys are caller-provided; the document indexer scopes them by
/// `workspace/document#contenthash` so a workspace clear can drop exactly its
/// own entries. There is no automatic expiry.
#[derive(Default)]
pub struct EmbeddingCache {
    inner: RwLock<HashMap<String, Arc<Vec<f32>>>>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<f32>>> {
        self.inner.read().expect("embedding cache poisoned").get(key).cloned()
    }

    pub fn insert(&self, key: String, vector: Arc<Vec<f32>>) {
        self.inner
            .write()
            .expect("embedding cache poisoned")
            .insert(key, vector);
    }

    /// Remove every entry whose key starts with `prefix`. Used by the
    /// per-workspace cache clear.
    pub fn remove_scope(&self, prefix: &str) -> usize {
        let mut guard = self.inner.write().expect("embedding cache poisoned");
        let before = guard.len();
        guard.retain(|k, _| !k.starts_with(prefix));
        before - guard.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("embedding cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Embedding credential resolution: workspace-owned key (BYOK) when one is
/// registered, platform key otherwise. BYOK calls are audited but never
/// charged against platform credits.
pub struct ApiKeys {
    platform: String,
    workspace: HashMap<String, String>,
}

/// A resolved credential and whether it is caller-supplied.
pub struct ResolvedKey<'a> {
    pub key: &'a str,
    pub byok: bool,
}

impl ApiKeys {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            workspace: HashMap::new(),
        }
    }

    /// Register a workspace-owned key.
    pub fn with_workspace_key(
        mut self,
        workspace_id: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        self.workspace.insert(workspace_id.into(), key.into());
        self
    }

    pub fn resolve(&self, workspace_id: Option<&str>) -> ResolvedKey<'_> {
        if let Some(ws) = workspace_id {
            if let Some(key) = self.workspace.get(ws) {
                return ResolvedKey { key, byok: true };
            }
        }
        ResolvedKey {
            key: &self.platform,
            byok: false,
        }
    }
}

/// Build a cache key scoped to (workspace, document) from snippet content.
pub fn snippet_cache_key(workspace_id: &str, document_key: &str, content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!("{}/{}#{:x}", workspace_id, document_key, digest)
}

/// Prefix matching every cache key of one workspace.
pub fn workspace_cache_scope(workspace_id: &str) -> String {
    format!("{}/", workspace_id)
}

/// Retry policy for the generator.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub max_attempts: u32,
    pub max_delay: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Text -> vector generator with caching, bounded retries, and cancellation.
pub struct EmbeddingGenerator {
    backend: Arc<dyn EmbeddingBackend>,
    cache: Arc<EmbeddingCache>,
    config: GeneratorConfig,
}

impl EmbeddingGenerator {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, cache: Arc<EmbeddingCache>) -> Self {
        Self {
            backend,
            cache,
            config: GeneratorConfig::default(),
        }
    }

    pub fn with_config(
        backend: Arc<dyn EmbeddingBackend>,
        cache: Arc<EmbeddingCache>,
        config: GeneratorConfig,
    ) -> Self {
        Self {
            backend,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Generate an embedding for `text`.
    ///
    /// A cache hit under `cache_key` short-circuits with no network call and
    /// no billing. Throttling and network failures retry with exponential
    /// backoff plus jitter; configuration failures surface immediately.
    /// Cancellation aborts both the in-flight call and any pending sleep.
    pub async fn generate(
        &self,
        text: &str,
        api_key: &str,
        cache_key: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Embedding, EmbedError> {
        if text.trim().is_empty() {
            return Err(EmbedError::empty_input());
        }

        if let Some(key) = cache_key {
            if let Some(vector) = self.cache.get(key) {
                return Ok(Embedding {
                    vector,
                    tokens: 0,
                    cached: true,
                });
            }
        }

        let mut attempt: u32 = 0;
        loop {
            let result = cancellable(cancel, self.backend.embed(text, api_key)).await;

            match result {
                Ok(Ok(raw)) => {
                    let vector = Arc::new(raw.vector);
                    if let Some(key) = cache_key {
                        self.cache.insert(key.to_string(), Arc::clone(&vector));
                    }
                    return Ok(Embedding {
                        vector,
                        tokens: raw.tokens,
                        cached: false,
                    });
                }
                Ok(Err(err)) if err.is_transient() && attempt + 1 < self.config.max_attempts => {
                    let delay = err.suggested_delay(attempt).min(self.config.max_delay);
                    tracing::warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "embedding call failed, backing off"
                    );
                    cancellable(cancel, tokio::time::sleep(delay)).await?;
                    attempt += 1;
                }
                Ok(Err(err)) => return Err(err),
                Err(cancelled) => return Err(cancelled),
            }
        }
    }
}

/// Run `fut` unless `cancel` fires first.
async fn cancellable<F: std::future::Future>(
    cancel: Option<&CancellationToken>,
    fut: F,
) -> Result<F::Output, EmbedError> {
    match cancel {
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => Err(EmbedError::cancelled()),
                out = fut => Ok(out),
            }
        }
        None => Ok(fut.await),
    }
}

/// Embedding backend speaking the OpenRouter/OpenAI embeddings protocol.
pub struct HttpEmbeddingBackend {
    client: Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

impl HttpEmbeddingBackend {
    pub fn new(endpoint: String, model: String, dimension: usize) -> Self {
        Self {
            client: Client::new(),
            endpoint,
            model,
            dimension,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbeddingBackend {
    async fn embed(&self, text: &str, api_key: &str) -> Result<BackendEmbedding, EmbedError> {
        let request = EmbeddingRequest {
            model: self.model.clone(),
            input: vec![text.to_string()],
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbedError::network(format!("embedding request failed: {}", e)))?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp
            .text()
            .await
            .map_err(|e| EmbedError::network(format!("embedding response read failed: {}", e)))?;

        if !status.is_success() {
            let mut err = classify_provider_error(status.as_u16(), &body);
            if err.retry_after.is_none() {
                err.retry_after = retry_after;
            }
            return Err(err);
        }

        let response: EmbeddingResponse = serde_json::from_str(&body).map_err(|e| {
            EmbedError::parse(format!("failed to parse embedding response: {}", e))
        })?;

        let mut data = response.data;
        data.sort_by_key(|d| d.index);
        let first = data
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::parse("no embedding returned".to_string()))?;

        if first.embedding.len() != self.dimension {
            tracing::warn!(
                got = first.embedding.len(),
                expected = self.dimension,
                "embedding dimension mismatch"
            );
        }

        let tokens = response
            .usage
            .map(|u| u.prompt_tokens)
            .unwrap_or_else(|| estimate_tokens(text));

        Ok(BackendEmbedding {
            vector: first.embedding,
            tokens,
        })
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingUsage {
    prompt_tokens: u32,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Deterministic backend: hashes the text into a small vector and counts
    /// calls. Optionally fails the first N calls with a given error.
    pub struct StubBackend {
        pub calls: AtomicU32,
        pub fail_first: u32,
        pub failure: Option<EmbedError>,
        pub delay: Option<Duration>,
        pub dimension: usize,
    }

    impl StubBackend {
        pub fn new(dimension: usize) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: 0,
                failure: None,
                delay: None,
                dimension,
            }
        }

        pub fn failing_first(mut self, n: u32, err: EmbedError) -> Self {
            self.fail_first = n;
            self.failure = Some(err);
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn vector_for(&self, text: &str) -> Vec<f32> {
            let digest = Sha256::digest(text.as_bytes());
            digest
                .iter()
                .take(self.dimension)
                .map(|b| *b as f32 / 255.0)
                .collect()
        }
    }

    #[async_trait]
    impl EmbeddingBackend for StubBackend {
        async fn embed(&self, text: &str, _api_key: &str) -> Result<BackendEmbedding, EmbedError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if call < self.fail_first {
                return Err(self.failure.clone().expect("failure configured"));
            }
            Ok(BackendEmbedding {
                vector: self.vector_for(text),
                tokens: estimate_tokens(text),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StubBackend;
    use super::*;
    use crate::memory::error::EmbedErrorKind;

    fn generator(backend: Arc<StubBackend>) -> EmbeddingGenerator {
        EmbeddingGenerator::new(backend, Arc::new(EmbeddingCache::new()))
    }

    #[tokio::test]
    async fn test_rejects_empty_text() {
        let backend = Arc::new(StubBackend::new(8));
        let gen = generator(Arc::clone(&backend));
        let err = gen.generate("   ", "key", None, None).await.unwrap_err();
        assert_eq!(err.kind, EmbedErrorKind::EmptyInput);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_makes_exactly_one_network_call() {
        let backend = Arc::new(StubBackend::new(8));
        let gen = generator(Arc::clone(&backend));

        let first = gen
            .generate("hello world", "key", Some("ck-1"), None)
            .await
            .unwrap();
        let second = gen
            .generate("hello world", "key", Some("ck-1"), None)
            .await
            .unwrap();

        assert_eq!(backend.call_count(), 1);
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.tokens, 0);
        assert_eq!(first.vector, second.vector);
    }

    #[tokio::test]
    async fn test_retries_throttling_then_succeeds() {
        let backend = Arc::new(
            StubBackend::new(8)
                .failing_first(2, EmbedError::throttled("429".to_string(), None)),
        );
        let gen = EmbeddingGenerator::with_config(
            Arc::clone(&backend) as Arc<dyn EmbeddingBackend>,
            Arc::new(EmbeddingCache::new()),
            GeneratorConfig {
                max_attempts: 5,
                max_delay: Duration::from_millis(1),
            },
        );

        let out = gen.generate("text", "key", None, None).await.unwrap();
        assert_eq!(backend.call_count(), 3);
        assert!(!out.vector.is_empty());
    }

    #[tokio::test]
    async fn test_configuration_error_is_not_retried() {
        let backend = Arc::new(StubBackend::new(8).failing_first(
            u32::MAX,
            EmbedError::configuration(Some(401), "bad key".to_string()),
        ));
        let gen = generator(Arc::clone(&backend));

        let err = gen.generate("text", "key", None, None).await.unwrap_err();
        assert_eq!(err.kind, EmbedErrorKind::Configuration);
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_bounded_attempts_surface_throttling() {
        let backend = Arc::new(
            StubBackend::new(8)
                .failing_first(u32::MAX, EmbedError::throttled("429".to_string(), None)),
        );
        let gen = EmbeddingGenerator::with_config(
            Arc::clone(&backend) as Arc<dyn EmbeddingBackend>,
            Arc::new(EmbeddingCache::new()),
            GeneratorConfig {
                max_attempts: 3,
                max_delay: Duration::from_millis(1),
            },
        );

        let err = gen.generate("text", "key", None, None).await.unwrap_err();
        assert_eq!(err.kind, EmbedErrorKind::Throttled);
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_in_flight_call() {
        let backend =
            Arc::new(StubBackend::new(8).with_delay(Duration::from_secs(30)));
        let gen = generator(Arc::clone(&backend));

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let err = gen
            .generate("text", "key", None, Some(&token))
            .await
            .unwrap_err();
        assert_eq!(err.kind, EmbedErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_backoff_sleep() {
        let backend = Arc::new(
            StubBackend::new(8)
                .failing_first(u32::MAX, EmbedError::throttled("429".to_string(), None)),
        );
        let gen = generator(Arc::clone(&backend));

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        // First failure schedules a multi-second backoff; cancellation must
        // cut it short rather than waiting it out.
        let start = std::time::Instant::now();
        let err = gen
            .generate("text", "key", None, Some(&token))
            .await
            .unwrap_err();
        assert_eq!(err.kind, EmbedErrorKind::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_workspace_scope_prefixes_cache_keys() {
        let key = snippet_cache_key("ws-1", "doc-1", "content");
        assert!(key.starts_with(&workspace_cache_scope("ws-1")));

        let cache = EmbeddingCache::new();
        cache.insert(key, Arc::new(vec![0.1]));
        cache.insert(
            snippet_cache_key("ws-2", "doc-1", "content"),
            Arc::new(vec![0.2]),
        );

        assert_eq!(cache.remove_scope(&workspace_cache_scope("ws-1")), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
