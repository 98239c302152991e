//! Read path over memory partitions.
//!
//! Similarity and metadata filters are pushed down to the store; temporal
//! range filtering happens in-process after retrieval because the backend
//! has no native date-range predicate on the string timestamp column.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::StoreError;
use super::partition::{PartitionRef, TemporalGrain};
use super::store::{PartitionStore, StoreQuery};
use super::types::FactHit;

/// Upper bound on rows requested from the backend per query.
pub const MAX_QUERY_LIMIT: usize = 1000;

/// Inclusive-start, exclusive-end temporal bounds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporalRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<DateTime<Utc>>,
}

impl TemporalRange {
    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        if let Some(after) = &self.after {
            if ts < after {
                return false;
            }
        }
        if let Some(before) = &self.before {
            if ts >= before {
                return false;
            }
        }
        true
    }
}

/// Options for one partition query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Similarity search vector; `None` scans by filter only.
    pub vector: Option<Vec<f32>>,
    /// Metadata equality filters, pushed down to the backend.
    pub metadata_filter: Vec<(String, String)>,
    /// Requested row count; clamped to `[1, MAX_QUERY_LIMIT]`.
    pub limit: usize,
    /// Temporal bounds, applied in-process after retrieval.
    pub temporal: Option<TemporalRange>,
}

/// Query client over the partition store.
pub struct QueryClient {
    store: Arc<dyn PartitionStore>,
}

impl QueryClient {
    pub fn new(store: Arc<dyn PartitionStore>) -> Self {
        Self { store }
    }

    /// Query one partition. An unwritten partition is valid and returns an
    /// empty result.
    pub async fn query(
        &self,
        agent_id: &str,
        grain: TemporalGrain,
        options: QueryOptions,
    ) -> Result<Vec<FactHit>, StoreError> {
        let partition = PartitionRef::new(agent_id, grain);
        let limit = options.limit.clamp(1, MAX_QUERY_LIMIT);

        let store_query = StoreQuery {
            vector: options.vector,
            filter: options.metadata_filter,
            limit,
        };

        let mut hits = self.store.query(&partition, &store_query).await?;

        if let Some(range) = &options.temporal {
            hits.retain(|hit| range.contains(&hit.timestamp));
        }

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::FactRecord;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Store stub that records the limits it was asked for and returns
    /// canned rows.
    struct RecordingStore {
        requested_limits: Mutex<Vec<usize>>,
        rows: Vec<FactHit>,
    }

    impl RecordingStore {
        fn with_rows(rows: Vec<FactHit>) -> Self {
            Self {
                requested_limits: Mutex::new(Vec::new()),
                rows,
            }
        }
    }

    #[async_trait]
    impl PartitionStore for RecordingStore {
        async fn add(&self, _: &PartitionRef, _: Vec<FactRecord>) -> Result<(), StoreError> {
            Ok(())
        }

        async fn delete_by_ids(&self, _: &PartitionRef, _: &[String]) -> Result<(), StoreError> {
            Ok(())
        }

        async fn purge(&self, _: &PartitionRef) -> Result<(), StoreError> {
            Ok(())
        }

        async fn query(
            &self,
            _: &PartitionRef,
            query: &StoreQuery,
        ) -> Result<Vec<FactHit>, StoreError> {
            self.requested_limits.lock().unwrap().push(query.limit);
            Ok(self.rows.clone())
        }
    }

    fn hit(id: &str, ts: &str) -> FactHit {
        FactHit {
            id: id.to_string(),
            content: id.to_string(),
            timestamp: ts.parse().unwrap(),
            metadata: HashMap::new(),
            distance: None,
        }
    }

    #[tokio::test]
    async fn test_limit_clamped_to_backend_maximum() {
        let store = Arc::new(RecordingStore::with_rows(Vec::new()));
        let client = QueryClient::new(Arc::clone(&store) as Arc<dyn PartitionStore>);

        client
            .query(
                "a",
                TemporalGrain::Daily,
                QueryOptions {
                    limit: 10_000,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        client
            .query(
                "a",
                TemporalGrain::Daily,
                QueryOptions {
                    limit: 0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let limits = store.requested_limits.lock().unwrap().clone();
        assert_eq!(limits, vec![MAX_QUERY_LIMIT, 1]);
    }

    #[tokio::test]
    async fn test_temporal_filter_applied_after_retrieval() {
        let store = Arc::new(RecordingStore::with_rows(vec![
            hit("old", "2023-06-01T00:00:00Z"),
            hit("in", "2024-02-01T00:00:00Z"),
            hit("edge", "2024-03-01T00:00:00Z"),
        ]));
        let client = QueryClient::new(Arc::clone(&store) as Arc<dyn PartitionStore>);

        let hits = client
            .query(
                "a",
                TemporalGrain::Monthly,
                QueryOptions {
                    limit: 10,
                    temporal: Some(TemporalRange {
                        after: Some("2024-01-01T00:00:00Z".parse().unwrap()),
                        before: Some("2024-03-01T00:00:00Z".parse().unwrap()),
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["in"]);
    }
}
