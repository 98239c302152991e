//! Types for the memory subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::error::ValidationError;
use super::partition::{PartitionRef, TemporalGrain};

/// A fully materialized memory fact, ready to persist into a partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactRecord {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// A fact that still needs an embedding. Transient: the write consumer turns
/// it into a [`FactRecord`] or drops it when embedding fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Cache key for embedding reuse; identical content under one key is
    /// billed and embedded at most once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Write operations accepted by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOperation {
    Insert,
    Update,
    Delete,
    Purge,
}

impl std::fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Purge => "purge",
        };
        write!(f, "{}", s)
    }
}

/// Payload of a write message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WritePayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<FactRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw_facts: Vec<RawFact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub record_ids: Vec<String>,
}

/// One write operation against one partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteMessage {
    pub operation: WriteOperation,
    pub agent_id: String,
    pub temporal_grain: TemporalGrain,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub data: WritePayload,
}

impl WriteMessage {
    /// The partition this message targets.
    pub fn partition(&self) -> PartitionRef {
        PartitionRef::new(self.agent_id.clone(), self.temporal_grain)
    }

    /// Queue ordering key. Publishers use this as the message group key so
    /// one partition's operations are delivered in order.
    pub fn ordering_key(&self) -> String {
        self.partition().ordering_key()
    }

    /// Validate the message shape against its operation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.operation {
            WriteOperation::Insert | WriteOperation::Update => {
                if self.data.records.is_empty() && self.data.raw_facts.is_empty() {
                    return Err(ValidationError::MissingRecords);
                }
                if !self.data.raw_facts.is_empty() && self.workspace_id.is_none() {
                    return Err(ValidationError::MissingWorkspace);
                }
                Ok(())
            }
            WriteOperation::Delete => {
                if self.data.record_ids.is_empty() {
                    return Err(ValidationError::MissingRecordIds);
                }
                Ok(())
            }
            WriteOperation::Purge => Ok(()),
        }
    }
}

/// An opaque message as delivered by the queue. Delivery is at-least-once
/// and batched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub id: String,
    pub body: String,
}

/// One failed message in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub message_id: String,
    pub reason: String,
}

/// Result of processing one batch: only the listed ids are redelivered by
/// queues that support partial-batch failure reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub failures: Vec<BatchItemFailure>,
}

impl BatchOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// One row returned by a partition query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactHit {
    pub id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Backend distance for vector queries; absent on metadata-only scans.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_message(op: WriteOperation) -> WriteMessage {
        WriteMessage {
            operation: op,
            agent_id: "agent-1".to_string(),
            temporal_grain: TemporalGrain::Daily,
            workspace_id: None,
            data: WritePayload::default(),
        }
    }

    #[test]
    fn test_insert_requires_records_or_raw_facts() {
        let msg = base_message(WriteOperation::Insert);
        assert_eq!(msg.validate(), Err(ValidationError::MissingRecords));
    }

    #[test]
    fn test_raw_facts_require_workspace() {
        let mut msg = base_message(WriteOperation::Insert);
        msg.data.raw_facts.push(RawFact {
            id: None,
            content: "fact".to_string(),
            timestamp: None,
            cache_key: None,
            metadata: HashMap::new(),
        });
        assert_eq!(msg.validate(), Err(ValidationError::MissingWorkspace));

        msg.workspace_id = Some("ws-1".to_string());
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_delete_requires_record_ids() {
        let mut msg = base_message(WriteOperation::Delete);
        assert_eq!(msg.validate(), Err(ValidationError::MissingRecordIds));

        msg.data.record_ids.push("r1".to_string());
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_purge_needs_no_payload() {
        assert!(base_message(WriteOperation::Purge).validate().is_ok());
    }

    #[test]
    fn test_wire_schema_is_camel_case() {
        let json = r#"{
            "operation": "insert",
            "agentId": "agent-1",
            "temporalGrain": "weekly",
            "workspaceId": "ws-1",
            "data": {
                "rawFacts": [{"content": "hello", "cacheKey": "k1"}]
            }
        }"#;
        let msg: WriteMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.operation, WriteOperation::Insert);
        assert_eq!(msg.temporal_grain, TemporalGrain::Weekly);
        assert_eq!(msg.data.raw_facts[0].cache_key.as_deref(), Some("k1"));
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_ordering_key_tracks_partition() {
        let msg = base_message(WriteOperation::Purge);
        assert_eq!(msg.ordering_key(), "agent-1/daily");
    }
}
