//! Partition store backed by LanceDB.
//!
//! One partition is one vector table named by [`PartitionRef::table_name`].
//! Tables are created lazily from the first insert batch (schema inferred
//! from the rows); a missing table reads as empty and purges as a no-op.
//! Metadata is written as flattened top-level columns; a legacy nested
//! `metadata` JSON column is read-only fallback for rows written before the
//! flattening migration.

use arrow_array::builder::{FixedSizeListBuilder, Float32Builder};
use arrow_array::{Array, Float32Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType, Table};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::error::StoreError;
use super::partition::PartitionRef;
use super::types::{FactHit, FactRecord};

/// Column carrying the backend's vector distance in query results.
const DISTANCE_COL: &str = "_distance";

/// Legacy nested metadata column; read-only.
const LEGACY_METADATA_COL: &str = "metadata";

const FIXED_COLUMNS: [&str; 4] = ["id", "content", "timestamp", "embedding"];

/// A query pushed down to the partition backend.
#[derive(Debug, Clone, Default)]
pub struct StoreQuery {
    /// Similarity search vector; `None` scans by filter only.
    pub vector: Option<Vec<f32>>,
    /// Metadata equality filters, rendered into the backend's expression
    /// language with quote-escaped values.
    pub filter: Vec<(String, String)>,
    /// Maximum rows requested from the backend.
    pub limit: usize,
}

/// Mutation and query surface of one partition backend.
///
/// `upsert` has a default delete-then-insert implementation for backends
/// without a native upsert; LanceDB overrides it with `merge_insert`.
#[async_trait]
pub trait PartitionStore: Send + Sync {
    /// Append rows, creating the partition's table from this batch if it
    /// does not exist yet.
    async fn add(&self, partition: &PartitionRef, rows: Vec<FactRecord>) -> Result<(), StoreError>;

    /// Delete rows by id. Idempotent: missing ids and a missing table are
    /// not errors.
    async fn delete_by_ids(&self, partition: &PartitionRef, ids: &[String])
        -> Result<(), StoreError>;

    /// Remove the partition unconditionally. A missing table is a no-op.
    async fn purge(&self, partition: &PartitionRef) -> Result<(), StoreError>;

    /// Replace rows by id.
    async fn upsert(
        &self,
        partition: &PartitionRef,
        rows: Vec<FactRecord>,
    ) -> Result<(), StoreError> {
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        self.delete_by_ids(partition, &ids).await?;
        self.add(partition, rows).await
    }

    /// Run a query. A missing table returns an empty result.
    async fn query(
        &self,
        partition: &PartitionRef,
        query: &StoreQuery,
    ) -> Result<Vec<FactHit>, StoreError>;
}

/// LanceDB-backed partition store with process-wide connection caching.
///
/// One connection per store URI and one cached table handle per partition;
/// a backend failure evicts the affected handles so the next call
/// reconnects.
pub struct LancePartitionStore {
    uri: String,
    connection: Mutex<Option<Connection>>,
    tables: Mutex<HashMap<String, Table>>,
}

impl LancePartitionStore {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            connection: Mutex::new(None),
            tables: Mutex::new(HashMap::new()),
        }
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = lancedb::connect(&self.uri)
            .execute()
            .await
            .map_err(|e| StoreError::Connection(format!("connect to {}: {}", self.uri, e)))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Open a partition's table, or `None` when it does not exist.
    async fn table(&self, name: &str) -> Result<Option<Table>, StoreError> {
        if let Some(table) = self.tables.lock().await.get(name) {
            return Ok(Some(table.clone()));
        }

        let conn = self.connection().await?;
        match conn.open_table(name).execute().await {
            Ok(table) => {
                self.tables
                    .lock()
                    .await
                    .insert(name.to_string(), table.clone());
                Ok(Some(table))
            }
            Err(lancedb::Error::TableNotFound { .. }) => Ok(None),
            Err(e) => {
                self.evict(name).await;
                Err(StoreError::Backend(format!("open table {}: {}", name, e)))
            }
        }
    }

    /// Drop cached handles after a backend failure so the next call
    /// reconnects.
    async fn evict(&self, name: &str) {
        self.tables.lock().await.remove(name);
        *self.connection.lock().await = None;
    }

    async fn create_from_rows(
        &self,
        name: &str,
        rows: &[FactRecord],
    ) -> Result<(), StoreError> {
        let schema = infer_schema(rows);
        let batch = build_batch(Arc::clone(&schema), rows)?;
        let reader = RecordBatchIterator::new([Ok(batch)].into_iter(), schema);

        let conn = self.connection().await?;
        match conn.create_table(name, Box::new(reader)).execute().await {
            Ok(table) => {
                self.tables.lock().await.insert(name.to_string(), table);
                Ok(())
            }
            // Another consumer won the create race; fall through to a plain
            // add against the now-existing table.
            Err(lancedb::Error::TableAlreadyExists { .. }) => {
                let table = self
                    .table(name)
                    .await?
                    .ok_or_else(|| StoreError::Backend(format!("table {} vanished", name)))?;
                self.append(&table, name, rows).await
            }
            Err(e) => {
                self.evict(name).await;
                Err(StoreError::Backend(format!("create table {}: {}", name, e)))
            }
        }
    }

    async fn append(
        &self,
        table: &Table,
        name: &str,
        rows: &[FactRecord],
    ) -> Result<(), StoreError> {
        let schema = table
            .schema()
            .await
            .map_err(|e| StoreError::Backend(format!("schema of {}: {}", name, e)))?;
        warn_on_unknown_keys(&schema, rows, name);

        let batch = build_batch(Arc::clone(&schema), rows)?;
        let reader = RecordBatchIterator::new([Ok(batch)].into_iter(), schema);
        table
            .add(Box::new(reader))
            .execute()
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Backend(format!("add to {}: {}", name, e)))
    }
}

#[async_trait]
impl PartitionStore for LancePartitionStore {
    async fn add(&self, partition: &PartitionRef, rows: Vec<FactRecord>) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let name = partition.table_name();
        match self.table(&name).await? {
            Some(table) => {
                let result = self.append(&table, &name, &rows).await;
                if result.is_err() {
                    self.evict(&name).await;
                }
                result
            }
            None => self.create_from_rows(&name, &rows).await,
        }
    }

    async fn delete_by_ids(
        &self,
        partition: &PartitionRef,
        ids: &[String],
    ) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let name = partition.table_name();
        let Some(table) = self.table(&name).await? else {
            return Ok(());
        };

        let list = ids
            .iter()
            .map(|id| sql_quote(id))
            .collect::<Vec<_>>()
            .join(", ");
        let predicate = format!("id IN ({})", list);

        match table.delete(&predicate).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.evict(&name).await;
                Err(StoreError::Backend(format!("delete from {}: {}", name, e)))
            }
        }
    }

    async fn purge(&self, partition: &PartitionRef) -> Result<(), StoreError> {
        let name = partition.table_name();
        let conn = self.connection().await?;
        self.tables.lock().await.remove(&name);

        match conn.drop_table(&name).await {
            Ok(_) => Ok(()),
            Err(lancedb::Error::TableNotFound { .. }) => Ok(()),
            Err(e) => {
                self.evict(&name).await;
                Err(StoreError::Backend(format!("purge {}: {}", name, e)))
            }
        }
    }

    async fn upsert(
        &self,
        partition: &PartitionRef,
        rows: Vec<FactRecord>,
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let name = partition.table_name();
        let Some(table) = self.table(&name).await? else {
            // Nothing to merge against; the first write creates the table.
            return self.create_from_rows(&name, &rows).await;
        };

        let schema = table
            .schema()
            .await
            .map_err(|e| StoreError::Backend(format!("schema of {}: {}", name, e)))?;
        warn_on_unknown_keys(&schema, &rows, &name);

        let batch = build_batch(Arc::clone(&schema), &rows)?;
        let reader = RecordBatchIterator::new([Ok(batch)].into_iter(), schema);

        let mut merge = table.merge_insert(&["id"]);
        merge
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        match merge.execute(Box::new(reader)).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.evict(&name).await;
                Err(StoreError::Backend(format!("upsert into {}: {}", name, e)))
            }
        }
    }

    async fn query(
        &self,
        partition: &PartitionRef,
        query: &StoreQuery,
    ) -> Result<Vec<FactHit>, StoreError> {
        let name = partition.table_name();
        let Some(table) = self.table(&name).await? else {
            return Ok(Vec::new());
        };

        let filter = render_filter(&query.filter);
        let result = collect_batches(&table, query, filter).await;

        match result {
            Ok(batches) => {
                let mut hits = Vec::new();
                for batch in &batches {
                    hits.extend(parse_hits(batch));
                }
                Ok(hits)
            }
            Err(e) => {
                self.evict(&name).await;
                Err(StoreError::Backend(format!("query {}: {}", name, e)))
            }
        }
    }
}

async fn collect_batches(
    table: &Table,
    query: &StoreQuery,
    filter: Option<String>,
) -> lancedb::Result<Vec<RecordBatch>> {
    if let Some(vector) = &query.vector {
        let mut q = table
            .query()
            .nearest_to(vector.as_slice())?
            .column("embedding")
            .distance_type(DistanceType::Cosine)
            .limit(query.limit);
        if let Some(f) = filter {
            q = q.only_if(f);
        }
        let mut stream = q.execute().await?;
        let mut out = Vec::new();
        while let Some(batch) = stream.try_next().await? {
            out.push(batch);
        }
        Ok(out)
    } else {
        let mut q = table.query().limit(query.limit);
        if let Some(f) = filter {
            q = q.only_if(f);
        }
        let mut stream = q.execute().await?;
        let mut out = Vec::new();
        while let Some(batch) = stream.try_next().await? {
            out.push(batch);
        }
        Ok(out)
    }
}

/// Quote a value for the backend's SQL-style expression language.
pub fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render metadata equality filters into one pushdown expression.
pub fn render_filter(pairs: &[(String, String)]) -> Option<String> {
    if pairs.is_empty() {
        return None;
    }
    Some(
        pairs
            .iter()
            .map(|(column, value)| format!("{} = {}", column, sql_quote(value)))
            .collect::<Vec<_>>()
            .join(" AND "),
    )
}

/// Infer a partition schema from the first insert batch: fixed columns plus
/// one nullable Utf8 column per metadata key present in the rows.
fn infer_schema(rows: &[FactRecord]) -> SchemaRef {
    let dim = rows.first().map(|r| r.embedding.len()).unwrap_or(0) as i32;
    let keys: BTreeSet<&str> = rows
        .iter()
        .flat_map(|r| r.metadata.keys().map(String::as_str))
        .collect();

    let embedding_item = Field::new("item", DataType::Float32, true);
    let mut fields = vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("content", DataType::Utf8, false),
        Field::new("timestamp", DataType::Utf8, false),
        Field::new(
            "embedding",
            DataType::FixedSizeList(Arc::new(embedding_item), dim),
            false,
        ),
    ];
    for key in keys {
        fields.push(Field::new(key, DataType::Utf8, true));
    }
    Arc::new(Schema::new(fields))
}

fn warn_on_unknown_keys(schema: &SchemaRef, rows: &[FactRecord], table: &str) {
    let known: BTreeSet<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    let unknown: BTreeSet<&str> = rows
        .iter()
        .flat_map(|r| r.metadata.keys().map(String::as_str))
        .filter(|k| !known.contains(k))
        .collect();
    if !unknown.is_empty() {
        tracing::warn!(
            table,
            keys = ?unknown,
            "dropping metadata keys absent from the partition schema"
        );
    }
}

fn build_batch(schema: SchemaRef, rows: &[FactRecord]) -> Result<RecordBatch, StoreError> {
    let mut columns: Vec<Arc<dyn Array>> = Vec::with_capacity(schema.fields().len());

    for field in schema.fields() {
        let array: Arc<dyn Array> = match field.name().as_str() {
            "id" => Arc::new(StringArray::from(
                rows.iter().map(|r| Some(r.id.as_str())).collect::<Vec<_>>(),
            )),
            "content" => Arc::new(StringArray::from(
                rows.iter()
                    .map(|r| Some(r.content.as_str()))
                    .collect::<Vec<_>>(),
            )),
            "timestamp" => Arc::new(StringArray::from(
                rows.iter()
                    .map(|r| Some(r.timestamp.to_rfc3339()))
                    .collect::<Vec<_>>(),
            )),
            "embedding" => {
                let dim = match field.data_type() {
                    DataType::FixedSizeList(_, n) => *n,
                    other => {
                        return Err(StoreError::Decode(format!(
                            "unexpected embedding type in schema: {:?}",
                            other
                        )))
                    }
                };
                let mut builder = FixedSizeListBuilder::new(Float32Builder::new(), dim);
                for row in rows {
                    if row.embedding.len() != dim as usize {
                        return Err(StoreError::Decode(format!(
                            "embedding dimension mismatch: got {}, expected {}",
                            row.embedding.len(),
                            dim
                        )));
                    }
                    builder.values().append_slice(&row.embedding);
                    builder.append(true);
                }
                Arc::new(builder.finish())
            }
            key => Arc::new(StringArray::from(
                rows.iter()
                    .map(|r| r.metadata.get(key).map(String::as_str))
                    .collect::<Vec<_>>(),
            )),
        };
        columns.push(array);
    }

    RecordBatch::try_new(schema, columns)
        .map_err(|e| StoreError::Decode(format!("record batch build failed: {}", e)))
}

/// Map result rows back to [`FactHit`]s.
///
/// Flattened top-level metadata columns are preferred; rows with none fall
/// back to the legacy nested `metadata` JSON column.
fn parse_hits(batch: &RecordBatch) -> Vec<FactHit> {
    let schema = batch.schema();

    let id = string_column(batch, "id");
    let content = string_column(batch, "content");
    let timestamp = string_column(batch, "timestamp");
    let legacy = string_column(batch, LEGACY_METADATA_COL);
    let distance = batch
        .column_by_name(DISTANCE_COL)
        .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

    let (Some(id), Some(content), Some(timestamp)) = (id, content, timestamp) else {
        return Vec::new();
    };

    let meta_columns: Vec<(&str, &StringArray)> = schema
        .fields()
        .iter()
        .filter(|f| {
            !FIXED_COLUMNS.contains(&f.name().as_str())
                && f.name() != DISTANCE_COL
                && f.name() != LEGACY_METADATA_COL
        })
        .filter_map(|f| {
            batch
                .column_by_name(f.name())
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .map(|arr| (f.name().as_str(), arr))
        })
        .collect();

    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        if id.is_null(i) || content.is_null(i) || timestamp.is_null(i) {
            continue;
        }

        let ts = match DateTime::parse_from_rfc3339(timestamp.value(i)) {
            Ok(t) => t.with_timezone(&Utc),
            Err(e) => {
                tracing::warn!(row = i, error = %e, "skipping row with unparseable timestamp");
                continue;
            }
        };

        let mut metadata: HashMap<String, String> = meta_columns
            .iter()
            .filter(|(_, arr)| !arr.is_null(i))
            .map(|(name, arr)| ((*name).to_string(), arr.value(i).to_string()))
            .collect();

        if metadata.is_empty() {
            if let Some(legacy) = legacy {
                if !legacy.is_null(i) {
                    metadata = parse_legacy_metadata(legacy.value(i));
                }
            }
        }

        out.push(FactHit {
            id: id.value(i).to_string(),
            content: content.value(i).to_string(),
            timestamp: ts,
            metadata,
            distance: distance.map(|d| d.value(i)),
        });
    }
    out
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
}

fn parse_legacy_metadata(raw: &str) -> HashMap<String, String> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => map
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect(),
        _ => HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::partition::TemporalGrain;
    use tempfile::TempDir;

    fn record(id: &str, content: &str, meta: &[(&str, &str)]) -> FactRecord {
        FactRecord {
            id: id.to_string(),
            content: content.to_string(),
            embedding: vec![0.1, 0.2, 0.3],
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
            metadata: meta
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_sql_quote_escapes_single_quotes() {
        assert_eq!(sql_quote("plain"), "'plain'");
        assert_eq!(sql_quote("it's"), "'it''s'");
        assert_eq!(sql_quote("a' OR '1'='1"), "'a'' OR ''1''=''1'");
    }

    #[test]
    fn test_render_filter_joins_with_and() {
        assert_eq!(render_filter(&[]), None);
        let rendered = render_filter(&[
            ("kind".to_string(), "note".to_string()),
            ("owner".to_string(), "o'brien".to_string()),
        ])
        .unwrap();
        assert_eq!(rendered, "kind = 'note' AND owner = 'o''brien'");
    }

    #[test]
    fn test_infer_schema_flattens_metadata_keys() {
        let rows = vec![
            record("r1", "a", &[("kind", "note")]),
            record("r2", "b", &[("owner", "x")]),
        ];
        let schema = infer_schema(&rows);
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, ["id", "content", "timestamp", "embedding", "kind", "owner"]);
    }

    #[test]
    fn test_legacy_metadata_fallback() {
        let rows = vec![record("r1", "a", &[])];
        let mut fields: Vec<Field> = infer_schema(&rows)
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();
        fields.push(Field::new(LEGACY_METADATA_COL, DataType::Utf8, true));
        let schema = Arc::new(Schema::new(fields));

        let base = build_batch(Arc::clone(&schema), &rows).unwrap();
        let mut columns = base.columns().to_vec();
        columns.pop();
        columns.push(Arc::new(StringArray::from(vec![Some(
            r#"{"kind":"note","rank":3}"#,
        )])));
        let batch = RecordBatch::try_new(schema, columns).unwrap();

        let hits = parse_hits(&batch);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.get("kind").map(String::as_str), Some("note"));
        assert_eq!(hits[0].metadata.get("rank").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn test_first_insert_creates_table_with_exact_row() {
        let tmp = TempDir::new().unwrap();
        let store = LancePartitionStore::new(tmp.path().to_string_lossy().to_string());
        let partition = PartitionRef::new("agent1", TemporalGrain::Daily);

        store
            .add(&partition, vec![record("r1", "hello", &[])])
            .await
            .unwrap();

        let hits = store
            .query(
                &partition,
                &StoreQuery {
                    vector: None,
                    filter: Vec::new(),
                    limit: 10,
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "r1");
        assert_eq!(hits[0].content, "hello");
        assert_eq!(hits[0].timestamp.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_missing_table_reads_empty_and_mutations_are_noops() {
        let tmp = TempDir::new().unwrap();
        let store = LancePartitionStore::new(tmp.path().to_string_lossy().to_string());
        let partition = PartitionRef::new("ghost", TemporalGrain::Weekly);

        let hits = store
            .query(&partition, &StoreQuery { limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert!(hits.is_empty());

        store
            .delete_by_ids(&partition, &["nope".to_string()])
            .await
            .unwrap();
        store.purge(&partition).await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_replaces_row_content() {
        let tmp = TempDir::new().unwrap();
        let store = LancePartitionStore::new(tmp.path().to_string_lossy().to_string());
        let partition = PartitionRef::new("agent1", TemporalGrain::Daily);

        store
            .add(&partition, vec![record("r1", "old", &[("kind", "note")])])
            .await
            .unwrap();
        store
            .upsert(&partition, vec![record("r1", "new", &[("kind", "note")])])
            .await
            .unwrap();

        let hits = store
            .query(&partition, &StoreQuery { limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "new");
    }

    #[tokio::test]
    async fn test_vector_query_ranks_by_similarity() {
        let tmp = TempDir::new().unwrap();
        let store = LancePartitionStore::new(tmp.path().to_string_lossy().to_string());
        let partition = PartitionRef::new("agent1", TemporalGrain::Docs);

        let mut near = record("near", "close", &[]);
        near.embedding = vec![1.0, 0.0, 0.0];
        let mut far = record("far", "distant", &[]);
        far.embedding = vec![0.0, 1.0, 0.0];
        store.add(&partition, vec![near, far]).await.unwrap();

        let hits = store
            .query(
                &partition,
                &StoreQuery {
                    vector: Some(vec![1.0, 0.0, 0.0]),
                    filter: Vec::new(),
                    limit: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "near");
        assert!(hits[0].distance.unwrap() <= hits[1].distance.unwrap());
    }

    #[tokio::test]
    async fn test_purge_then_insert_recreates_partition() {
        let tmp = TempDir::new().unwrap();
        let store = LancePartitionStore::new(tmp.path().to_string_lossy().to_string());
        let partition = PartitionRef::new("agent1", TemporalGrain::Daily);

        store
            .add(&partition, vec![record("r1", "a", &[])])
            .await
            .unwrap();
        store.purge(&partition).await.unwrap();

        let hits = store
            .query(&partition, &StoreQuery { limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert!(hits.is_empty());

        store
            .add(&partition, vec![record("r2", "b", &[])])
            .await
            .unwrap();
        let hits = store
            .query(&partition, &StoreQuery { limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "r2");
    }
}
