//! Temporally-partitioned vector memory store.
//!
//! This module provides:
//! - An asynchronous write pipeline turning raw text facts into embedded
//!   vectors persisted into per-agent, per-grain partitions
//! - Cost-aware credit reservation around every embedding call
//! - A connection-cached read path with similarity, metadata, and temporal
//!   queries
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌───────────────────┐
//! │ Queue batch  │────▶│   WriteConsumer   │
//! └──────────────┘     └─────────┬─────────┘
//!                                │
//!                  ┌─────────────┼──────────────┐
//!                  ▼             ▼              ▼
//!           ┌───────────┐ ┌────────────┐ ┌───────────┐
//!           │ Embedding │ │  Credit    │ │ Partition │
//!           │ Generator │ │  Guard     │ │ Store     │
//!           └───────────┘ └────────────┘ │ (LanceDB) │
//!                                        └─────┬─────┘
//!                                              ▲
//!                                      ┌───────┴───────┐
//!                                      │  QueryClient  │
//!                                      └───────────────┘
//! ```

pub mod consumer;
pub mod credits;
pub mod embed;
pub mod error;
pub mod partition;
pub mod query;
pub mod store;
pub mod types;

pub use consumer::WriteConsumer;
pub use credits::{CreditGuard, ReservationId};
pub use embed::{
    estimate_tokens, snippet_cache_key, workspace_cache_scope, ApiKeys, Embedding,
    EmbeddingBackend, EmbeddingCache, EmbeddingGenerator, HttpEmbeddingBackend, ResolvedKey,
};
pub use error::{EmbedError, EmbedErrorKind, StoreError, ValidationError};
pub use partition::{PartitionRef, TemporalGrain};
pub use query::{QueryClient, QueryOptions, TemporalRange, MAX_QUERY_LIMIT};
pub use store::{LancePartitionStore, PartitionStore, StoreQuery};
pub use types::*;

use crate::config::Config;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The assembled memory subsystem.
#[derive(Clone)]
pub struct MemorySystem {
    pub store: Arc<dyn PartitionStore>,
    pub embedder: Arc<EmbeddingGenerator>,
    pub credits: Arc<CreditGuard>,
    pub consumer: Arc<WriteConsumer>,
    pub query: Arc<QueryClient>,
}

/// Initialize the memory subsystem from configuration.
pub fn init_memory(config: &Config) -> MemorySystem {
    let store: Arc<dyn PartitionStore> = Arc::new(LancePartitionStore::new(&config.store_uri));

    let backend = Arc::new(HttpEmbeddingBackend::new(
        config.embed_endpoint.clone(),
        config.embed_model.clone(),
        config.embed_dimension,
    ));
    let cache = Arc::new(EmbeddingCache::new());
    let embedder = Arc::new(EmbeddingGenerator::new(backend, cache));

    let credits = Arc::new(CreditGuard::new(config.credit_balance));

    let consumer = Arc::new(WriteConsumer::new(
        Arc::clone(&store),
        Arc::clone(&embedder),
        Arc::clone(&credits),
        ApiKeys::new(config.platform_api_key.clone()),
    ));

    let query = Arc::new(QueryClient::new(Arc::clone(&store)));

    tracing::info!(
        store = %config.store_uri,
        model = %config.embed_model,
        "memory subsystem initialized"
    );

    MemorySystem {
        store,
        embedder,
        credits,
        consumer,
        query,
    }
}

/// Spawn a task draining delivered batches into the consumer.
///
/// The transport feeding the channel is a collaborator; each received batch
/// is processed and its per-message failures handed to `report` for
/// partial-batch redelivery.
pub fn spawn_consumer_loop(
    consumer: Arc<WriteConsumer>,
    mut batches: mpsc::Receiver<Vec<QueueMessage>>,
    report: mpsc::Sender<BatchOutcome>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = batches.recv().await {
            let size = batch.len();
            let outcome = consumer.process_batch(batch).await;
            if !outcome.is_clean() {
                tracing::warn!(
                    failed = outcome.failures.len(),
                    size,
                    "batch finished with failures"
                );
            }
            if report.send(outcome).await.is_err() {
                tracing::debug!("batch outcome receiver dropped, stopping consumer loop");
                break;
            }
        }
    })
}
