//! Bulk upsert with lineage stamping and an audit trail
//!
//! [`RecordsLoader::upsert`] takes one batch for one table and:
//!
//! 1. rejects tables without a single-column primary key before any I/O
//! 2. normalizes every record to a field map, drops unknown columns and
//!    derives keys for tables keyed by a hashed column, then has the
//!    warehouse rewrite values in their stored form (`2026-01-01T00:00:00Z`
//!    reads back from Postgres as `2026-01-01T00:00:00+00:00`)
//! 3. classifies each record ([`Classification`]): keyless records are
//!    inserts; keyed records are updates when the key exists in storage and
//!    fallback inserts when it does not
//! 4. diffs updates against the stored row and skips those with no change
//! 5. builds audit entries (full record for creates, changed fields for
//!    updates) when a task id is given and the table is audited
//! 6. applies updates, inserts and audit rows in one transaction
//!
//! A single writer per table is assumed; concurrent loaders may race between
//! the key lookup and the write.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use kiln_common::digest::short_code;

use crate::schema::{key_text, KeyStrategy, TableSchema, LINEAGE_COLUMN};
use crate::warehouse::{AuditEntry, ChangeSet, Row, Warehouse, WarehouseError};

mod diff;

pub use diff::{diff, same_value, Classification, FieldDiff};

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Unsupported schema for {table}: {reason}")]
    UnsupportedSchema { table: String, reason: String },

    #[error("Record {index} for {table} is not a JSON object")]
    NotAnObject { table: String, index: usize },

    #[error("Record {index} for {table} has no {column} to derive its key from")]
    MissingKeySource {
        table: String,
        index: usize,
        column: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}

pub type Result<T> = std::result::Result<T, LoaderError>;

/// Outcome of one upsert call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub inserted: usize,
    pub updated: usize,
    /// Records that matched the stored row exactly, or were superseded by a
    /// later record with the same key in the same batch
    pub skipped: usize,
    /// Audit entries written
    pub logged: usize,
}

impl LoadSummary {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Clone)]
pub struct RecordsLoader {
    warehouse: Arc<dyn Warehouse>,
}

impl RecordsLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    /// Upsert any serializable records.
    pub async fn upsert_serialized<T: Serialize>(
        &self,
        table: &TableSchema,
        records: &[T],
        task_id: Option<Uuid>,
    ) -> Result<LoadSummary> {
        let values = records
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.upsert(table, values, task_id).await
    }

    #[instrument(skip(self, records), fields(table = %table.qualified(), records = records.len()))]
    pub async fn upsert(
        &self,
        table: &TableSchema,
        records: Vec<Value>,
        task_id: Option<Uuid>,
    ) -> Result<LoadSummary> {
        let key = table
            .key_column()
            .ok_or_else(|| LoaderError::UnsupportedSchema {
                table: table.qualified(),
                reason: format!(
                    "expected one primary key column, found {:?}",
                    table.primary_key
                ),
            })?;

        if records.is_empty() {
            return Ok(LoadSummary::default());
        }

        let mut summary = LoadSummary::default();
        let rows = normalize(table, key, records, &mut summary)?;
        let rows = self.warehouse.conform(table, rows).await?;

        let claimed: Vec<String> = rows
            .iter()
            .filter_map(|r| r.get(key).and_then(key_text))
            .collect();
        let existing = self.warehouse.existing_keys(table, &claimed).await?;

        let update_keys: Vec<String> = claimed
            .iter()
            .filter(|k| existing.contains(*k))
            .cloned()
            .collect();
        let stored = self.warehouse.fetch_rows(table, &update_keys).await?;

        let plan: Vec<(Classification, Row)> = rows
            .into_iter()
            .map(|row| {
                let classification = match row.get(key).and_then(key_text) {
                    None => Classification::Insert,
                    Some(k) if stored.contains_key(&k) => Classification::Update { key: k },
                    Some(k) => Classification::RequiresFallbackInsert { key: k },
                };
                (classification, row)
            })
            .collect();

        let audit_task = task_id.filter(|_| table.audited);
        let lineage_task = task_id.filter(|_| table.lineage);
        let mut changes = ChangeSet::default();
        let mut fallbacks = 0usize;

        for (classification, mut row) in plan {
            match classification {
                Classification::Insert | Classification::RequiresFallbackInsert { .. } => {
                    let record_key = match classification {
                        Classification::RequiresFallbackInsert { key: k } => {
                            fallbacks += 1;
                            k
                        },
                        _ => {
                            let minted = Uuid::new_v4().to_string();
                            row.insert(key.to_string(), Value::String(minted.clone()));
                            minted
                        },
                    };
                    if let Some(task) = lineage_task {
                        row.insert(
                            LINEAGE_COLUMN.to_string(),
                            json!({ "created_in_task": task, "modified_in_task": task }),
                        );
                    }
                    if let Some(task) = audit_task {
                        changes
                            .audit
                            .push(AuditEntry::create(table, record_key, task, &row));
                    }
                    changes.inserts.push(row);
                },
                Classification::Update { key: record_key } => {
                    let Some(current) = stored.get(&record_key) else {
                        continue;
                    };
                    let field_diff = diff(current, &row);
                    if field_diff.is_empty() {
                        summary.skipped += 1;
                        continue;
                    }

                    let mut update = field_diff.current.clone();
                    if let Some(k) = row.remove(key) {
                        update.insert(key.to_string(), k);
                    }
                    if let Some(task) = lineage_task {
                        let mut lineage = current
                            .get(LINEAGE_COLUMN)
                            .and_then(Value::as_object)
                            .cloned()
                            .unwrap_or_default();
                        lineage.insert("modified_in_task".to_string(), json!(task));
                        update.insert(LINEAGE_COLUMN.to_string(), Value::Object(lineage));
                    }
                    if let Some(task) = audit_task {
                        changes.audit.push(AuditEntry::update(
                            table,
                            record_key,
                            task,
                            field_diff.previous,
                            field_diff.current,
                        ));
                    }
                    changes.updates.push(update);
                },
            }
        }

        if let Err(e) = self.warehouse.apply(table, &changes).await {
            error!(error = %e, "Upsert rolled back");
            debug!(
                inserts = ?changes.inserts,
                updates = ?changes.updates,
                "Rejected change set"
            );
            return Err(e.into());
        }

        summary.inserted = changes.inserts.len();
        summary.updated = changes.updates.len();
        summary.logged = changes.audit.len();

        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped,
            logged = summary.logged,
            fallback_inserts = fallbacks,
            "Upsert complete"
        );

        Ok(summary)
    }
}

/// Turn raw values into field maps keyed the way `table` expects.
///
/// Unknown columns and caller-supplied lineage are dropped. Records with a
/// key already seen in this batch replace the earlier one.
fn normalize(
    table: &TableSchema,
    key: &str,
    records: Vec<Value>,
    summary: &mut LoadSummary,
) -> Result<Vec<Row>> {
    let mut rows: Vec<Row> = Vec::with_capacity(records.len());
    let mut seen: HashMap<String, usize> = HashMap::new();

    for (index, record) in records.into_iter().enumerate() {
        let Value::Object(mut row) = record else {
            return Err(LoaderError::NotAnObject {
                table: table.qualified(),
                index,
            });
        };

        row.remove(LINEAGE_COLUMN);
        row.retain(|column, _| table.accepts(column));

        if row.get(key).and_then(key_text).is_none() {
            if let KeyStrategy::Derived { from, length } = &table.key_strategy {
                let source = row.get(from).and_then(key_text).ok_or_else(|| {
                    LoaderError::MissingKeySource {
                        table: table.qualified(),
                        index,
                        column: from.clone(),
                    }
                })?;
                row.insert(key.to_string(), Value::String(short_code(&source, *length)));
            }
        }

        match row.get(key).and_then(key_text) {
            Some(k) => match seen.get(&k) {
                Some(&slot) => {
                    rows[slot] = row;
                    summary.skipped += 1;
                },
                None => {
                    seen.insert(k, rows.len());
                    rows.push(row);
                },
            },
            None => rows.push(row),
        }
    }

    Ok(rows)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::warehouse::{MemoryWarehouse, Operation};

    fn apps() -> TableSchema {
        TableSchema::new("public", "app", "app_code").with_columns(["app_code", "app_name"])
    }

    fn loader() -> (Arc<MemoryWarehouse>, RecordsLoader) {
        let warehouse = Arc::new(MemoryWarehouse::new());
        (warehouse.clone(), RecordsLoader::new(warehouse))
    }

    #[tokio::test]
    async fn test_composite_key_rejected_before_io() {
        let (warehouse, loader) = loader();
        let table = apps().with_composite_key(&["app_code", "app_name"]);
        let err = loader
            .upsert(&table, vec![json!({"app_code": "a"})], None)
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::UnsupportedSchema { .. }));
        assert!(warehouse.rows(&table).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let (_, loader) = loader();
        let summary = loader.upsert(&apps(), vec![], Some(Uuid::new_v4())).await.unwrap();
        assert_eq!(summary, LoadSummary::default());
    }

    #[tokio::test]
    async fn test_non_object_rejected() {
        let (_, loader) = loader();
        let err = loader.upsert(&apps(), vec![json!([1, 2])], None).await.unwrap_err();
        assert!(matches!(err, LoaderError::NotAnObject { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_keyless_record_gets_uuid_and_create_audit() {
        let (warehouse, loader) = loader();
        let task = Uuid::new_v4();
        let summary = loader
            .upsert(&apps(), vec![json!({"app_name": "Payroll", "junk": 1})], Some(task))
            .await
            .unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.logged, 1);

        let rows = warehouse.rows(&apps()).await;
        assert_eq!(rows.len(), 1);
        let key = rows[0]["app_code"].as_str().unwrap();
        assert!(Uuid::parse_str(key).is_ok());
        assert!(!rows[0].contains_key("junk"));
        assert_eq!(rows[0][LINEAGE_COLUMN]["created_in_task"], json!(task));

        let audit = warehouse.audit_log().await;
        assert_eq!(audit[0].operation, Operation::Create);
        assert!(audit[0].previous_value.is_none());
        assert_eq!(audit[0].record_id, key);
    }

    #[tokio::test]
    async fn test_derived_key_makes_reloads_idempotent() {
        let (warehouse, loader) = loader();
        let table = TableSchema::app();
        let first = loader
            .upsert(&table, vec![json!({"app_name": "Payroll"})], None)
            .await
            .unwrap();
        let second = loader
            .upsert(&table, vec![json!({"app_name": "Payroll"})], None)
            .await
            .unwrap();
        assert_eq!(first.inserted, 1);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(warehouse.rows(&table).await.len(), 1);
    }

    #[tokio::test]
    async fn test_derived_key_needs_source_column() {
        let (_, loader) = loader();
        let err = loader
            .upsert(&TableSchema::app(), vec![json!({"other": "x"})], None)
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::MissingKeySource { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_keys_in_batch_last_wins() {
        let (warehouse, loader) = loader();
        let summary = loader
            .upsert(
                &apps(),
                vec![
                    json!({"app_code": "a", "app_name": "First"}),
                    json!({"app_code": "a", "app_name": "Second"}),
                ],
                None,
            )
            .await
            .unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.skipped, 1);
        let row = warehouse.row(&apps(), "a").await.unwrap();
        assert_eq!(row["app_name"], json!("Second"));
    }

    #[tokio::test]
    async fn test_update_keeps_created_lineage() {
        let (warehouse, loader) = loader();
        let first_task = Uuid::new_v4();
        let second_task = Uuid::new_v4();
        loader
            .upsert(&apps(), vec![json!({"app_code": "a", "app_name": "Old"})], Some(first_task))
            .await
            .unwrap();
        loader
            .upsert(&apps(), vec![json!({"app_code": "a", "app_name": "New"})], Some(second_task))
            .await
            .unwrap();

        let row = warehouse.row(&apps(), "a").await.unwrap();
        assert_eq!(row[LINEAGE_COLUMN]["created_in_task"], json!(first_task));
        assert_eq!(row[LINEAGE_COLUMN]["modified_in_task"], json!(second_task));
    }

    #[tokio::test]
    async fn test_no_audit_without_task() {
        let (warehouse, loader) = loader();
        let summary = loader
            .upsert(&apps(), vec![json!({"app_code": "a", "app_name": "x"})], None)
            .await
            .unwrap();
        assert_eq!(summary.logged, 0);
        assert!(warehouse.audit_log().await.is_empty());
        let row = warehouse.row(&apps(), "a").await.unwrap();
        assert!(!row.contains_key(LINEAGE_COLUMN));
    }

    #[tokio::test]
    async fn test_failed_apply_leaves_storage_untouched() {
        let (warehouse, loader) = loader();
        warehouse
            .seed(&apps(), vec![json!({"app_code": "a", "app_name": "Old"})])
            .await;
        warehouse.fail_next_apply();

        let result = loader
            .upsert(
                &apps(),
                vec![
                    json!({"app_code": "a", "app_name": "New"}),
                    json!({"app_name": "Fresh"}),
                ],
                Some(Uuid::new_v4()),
            )
            .await;

        assert!(matches!(result, Err(LoaderError::Warehouse(_))));
        assert_eq!(warehouse.rows(&apps()).await.len(), 1);
        assert_eq!(warehouse.row(&apps(), "a").await.unwrap()["app_name"], json!("Old"));
        assert!(warehouse.audit_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_non_finite_floats_stored_as_null() {
        #[derive(Serialize)]
        struct Reading {
            id: String,
            value: f64,
        }

        let (warehouse, loader) = loader();
        let table = TableSchema::new("public", "reading", "id");
        let readings = [Reading {
            id: "r1".to_string(),
            value: f64::NAN,
        }];

        let summary = loader.upsert_serialized(&table, &readings, None).await.unwrap();

        assert_eq!(summary.inserted, 1);
        let row = warehouse.row(&table, "r1").await.unwrap();
        assert_eq!(row["value"], Value::Null);
    }

    /// Memory storage that renders UTC timestamps the way Postgres does.
    struct OffsetTimestamps(MemoryWarehouse);

    #[async_trait::async_trait]
    impl Warehouse for OffsetTimestamps {
        async fn existing_keys(
            &self,
            table: &TableSchema,
            keys: &[String],
        ) -> crate::warehouse::Result<std::collections::HashSet<String>> {
            self.0.existing_keys(table, keys).await
        }

        async fn fetch_rows(
            &self,
            table: &TableSchema,
            keys: &[String],
        ) -> crate::warehouse::Result<HashMap<String, Row>> {
            self.0.fetch_rows(table, keys).await
        }

        async fn apply(&self, table: &TableSchema, changes: &ChangeSet) -> crate::warehouse::Result<()> {
            self.0.apply(table, changes).await
        }

        async fn conform(
            &self,
            _table: &TableSchema,
            rows: Vec<Row>,
        ) -> crate::warehouse::Result<Vec<Row>> {
            Ok(rows
                .into_iter()
                .map(|mut row| {
                    for value in row.values_mut() {
                        if let Some(ts) = value.as_str().and_then(|s| s.strip_suffix('Z')) {
                            *value = json!(format!("{ts}+00:00"));
                        }
                    }
                    row
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_diff_uses_stored_form() {
        let storage = Arc::new(OffsetTimestamps(MemoryWarehouse::new()));
        let events = TableSchema::new("public", "event", "id");
        storage
            .0
            .seed(
                &events,
                vec![json!({"id": "e1", "happened_at": "2026-01-01T00:00:00+00:00"})],
            )
            .await;
        let loader = RecordsLoader::new(storage.clone());

        let summary = loader
            .upsert(
                &events,
                vec![json!({"id": "e1", "happened_at": "2026-01-01T00:00:00Z"})],
                Some(Uuid::new_v4()),
            )
            .await
            .unwrap();

        assert_eq!(summary.updated, 0);
        assert_eq!(summary.skipped, 1);
        assert!(storage.0.audit_log().await.is_empty());
    }
}
