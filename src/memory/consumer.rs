//! Write consumer: drains batched write messages into partitions.
//!
//! Messages are processed independently; one malformed message fails alone
//! and the batch continues, matching queues with partial-batch redelivery.
//! Raw facts are embedded inside a reserve -> generate -> adjust-or-refund
//! unit per fact, and a fact's failure never takes down its siblings.

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::credits::CreditGuard;
use super::embed::{estimate_tokens, ApiKeys, EmbeddingGenerator};
use super::error::{StoreError, ValidationError};
use super::store::PartitionStore;
use super::types::{
    BatchItemFailure, BatchOutcome, FactRecord, QueueMessage, RawFact, WriteMessage,
    WriteOperation,
};

/// A message-level failure. Item-local errors are reported per message id;
/// the queue redelivers only those.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Store(#[from] StoreError),
}

/// Consumer for batched write messages.
pub struct WriteConsumer {
    store: Arc<dyn PartitionStore>,
    embedder: Arc<EmbeddingGenerator>,
    credits: Arc<CreditGuard>,
    keys: ApiKeys,
}

impl WriteConsumer {
    pub fn new(
        store: Arc<dyn PartitionStore>,
        embedder: Arc<EmbeddingGenerator>,
        credits: Arc<CreditGuard>,
        keys: ApiKeys,
    ) -> Self {
        Self {
            store,
            embedder,
            credits,
            keys,
        }
    }

    /// Process one delivered batch. Every message is attempted; the outcome
    /// lists only the failed ids for redelivery.
    pub async fn process_batch(&self, batch: Vec<QueueMessage>) -> BatchOutcome {
        let mut failures = Vec::new();

        for message in batch {
            if let Err(err) = self.process_message(&message.body).await {
                tracing::warn!(
                    message_id = %message.id,
                    error = %err,
                    "write message failed"
                );
                failures.push(BatchItemFailure {
                    message_id: message.id,
                    reason: err.to_string(),
                });
            }
        }

        BatchOutcome { failures }
    }

    async fn process_message(&self, body: &str) -> Result<(), WriteError> {
        let message: WriteMessage = serde_json::from_str(body)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        message.validate()?;

        let partition = message.partition();
        tracing::debug!(
            partition = %partition,
            operation = %message.operation,
            "dispatching write message"
        );

        match message.operation {
            WriteOperation::Insert => {
                let rows = self.assemble_rows(&message).await;
                if rows.is_empty() {
                    tracing::warn!(partition = %partition, "insert produced no rows");
                    return Ok(());
                }
                self.store.add(&partition, rows).await?;
            }
            WriteOperation::Update => {
                let rows = self.assemble_rows(&message).await;
                if rows.is_empty() {
                    tracing::warn!(partition = %partition, "update produced no rows");
                    return Ok(());
                }
                self.store.upsert(&partition, rows).await?;
            }
            WriteOperation::Delete => {
                self.store
                    .delete_by_ids(&partition, &message.data.record_ids)
                    .await?;
            }
            WriteOperation::Purge => {
                self.store.purge(&partition).await?;
            }
        }
        Ok(())
    }

    /// Turn a message's payload into persistable rows: pre-embedded records
    /// pass through, raw facts are embedded concurrently. A fact that fails
    /// embedding is dropped (and its reservation refunded) without touching
    /// its siblings.
    async fn assemble_rows(&self, message: &WriteMessage) -> Vec<FactRecord> {
        let mut rows = message.data.records.clone();
        if message.data.raw_facts.is_empty() {
            return rows;
        }

        let resolved = self.keys.resolve(message.workspace_id.as_deref());
        let results = join_all(
            message
                .data
                .raw_facts
                .iter()
                .map(|fact| self.embed_fact(fact, resolved.key, resolved.byok)),
        )
        .await;

        let mut failed = 0usize;
        for result in results {
            match result {
                Ok(row) => rows.push(row),
                Err(reason) => {
                    failed += 1;
                    tracing::warn!(reason = %reason, "dropping fact that failed embedding");
                }
            }
        }
        if failed > 0 {
            tracing::warn!(failed, kept = rows.len(), "insert batch partially embedded");
        }
        rows
    }

    async fn embed_fact(
        &self,
        fact: &RawFact,
        api_key: &str,
        byok: bool,
    ) -> Result<FactRecord, String> {
        let estimate = u64::from(estimate_tokens(&fact.content));
        let reservation = self
            .credits
            .reserve(estimate, !byok)
            .map_err(|e| e.to_string())?;

        match self
            .embedder
            .generate(&fact.content, api_key, fact.cache_key.as_deref(), None)
            .await
        {
            Ok(embedding) => {
                self.credits
                    .adjust(reservation, u64::from(embedding.tokens))
                    .map_err(|e| e.to_string())?;
                Ok(FactRecord {
                    id: fact
                        .id
                        .clone()
                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                    content: fact.content.clone(),
                    embedding: embedding.vector.as_ref().clone(),
                    timestamp: fact.timestamp.unwrap_or_else(Utc::now),
                    metadata: fact.metadata.clone(),
                })
            }
            Err(err) => {
                if let Err(refund_err) = self.credits.refund(reservation) {
                    tracing::error!(error = %refund_err, "refund failed after embedding error");
                }
                Err(err.to_string())
            }
        }
    }
}
