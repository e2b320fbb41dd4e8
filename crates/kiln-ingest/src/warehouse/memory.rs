use super::{AuditEntry, ChangeSet, Result, Row, Warehouse, WarehouseError};
use crate::catalog::{SourceCatalog, SourceConfig};
use crate::schema::{key_text, TableSchema};
use crate::task::{Status, TaskType};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

type Table = BTreeMap<String, Row>;

#[derive(Default)]
struct State {
    tables: HashMap<String, Table>,
    audit: Vec<AuditEntry>,
    sources: Vec<SourceConfig>,
}

/// In-process warehouse for tests and dry runs.
///
/// `apply` works on a copy of the target table and swaps it in only when
/// every step succeeded, mirroring a rolled-back transaction on failure.
#[derive(Default)]
pub struct MemoryWarehouse {
    state: Mutex<State>,
    fail_next_apply: AtomicBool,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put rows directly into `table`, bypassing the audit trail.
    pub async fn seed(&self, table: &TableSchema, rows: Vec<Value>) {
        let Some(key) = table.key_column() else {
            return;
        };
        let mut state = self.state.lock().await;
        let target = state.tables.entry(table.qualified()).or_default();
        for row in rows {
            if let Value::Object(map) = row {
                if let Some(k) = map.get(key).and_then(key_text) {
                    target.insert(k, map);
                }
            }
        }
    }

    pub async fn rows(&self, table: &TableSchema) -> Vec<Row> {
        let state = self.state.lock().await;
        state
            .tables
            .get(&table.qualified())
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn row(&self, table: &TableSchema, key: &str) -> Option<Row> {
        let state = self.state.lock().await;
        state.tables.get(&table.qualified())?.get(key).cloned()
    }

    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.state.lock().await.audit.clone()
    }

    pub async fn add_source(&self, source: SourceConfig) {
        self.state.lock().await.sources.push(source);
    }

    /// Make the next `apply` fail after partially applying its changes.
    pub fn fail_next_apply(&self) {
        self.fail_next_apply.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn existing_keys(&self, table: &TableSchema, keys: &[String]) -> Result<HashSet<String>> {
        let state = self.state.lock().await;
        let Some(rows) = state.tables.get(&table.qualified()) else {
            return Ok(HashSet::new());
        };
        Ok(keys.iter().filter(|k| rows.contains_key(*k)).cloned().collect())
    }

    async fn fetch_rows(
        &self,
        table: &TableSchema,
        keys: &[String],
    ) -> Result<HashMap<String, Row>> {
        let state = self.state.lock().await;
        let Some(rows) = state.tables.get(&table.qualified()) else {
            return Ok(HashMap::new());
        };
        Ok(keys
            .iter()
            .filter_map(|k| rows.get(k).map(|r| (k.clone(), r.clone())))
            .collect())
    }

    async fn apply(&self, table: &TableSchema, changes: &ChangeSet) -> Result<()> {
        let key = table.key_column().ok_or_else(|| WarehouseError::NoKey {
            table: table.qualified(),
        })?;

        let mut state = self.state.lock().await;
        let mut staged = state.tables.get(&table.qualified()).cloned().unwrap_or_default();

        for update in &changes.updates {
            let k = update.get(key).and_then(key_text).ok_or_else(|| {
                WarehouseError::Rejected(format!("update without key in {}", table.qualified()))
            })?;
            if let Some(row) = staged.get_mut(&k) {
                for (column, value) in update {
                    row.insert(column.clone(), value.clone());
                }
            }
        }

        for insert in &changes.inserts {
            let k = insert.get(key).and_then(key_text).ok_or_else(|| {
                WarehouseError::Rejected(format!("insert without key in {}", table.qualified()))
            })?;
            if staged.contains_key(&k) {
                return Err(WarehouseError::Duplicate {
                    table: table.qualified(),
                    key: k,
                });
            }
            staged.insert(k, insert.clone());
        }

        if self.fail_next_apply.swap(false, Ordering::SeqCst) {
            return Err(WarehouseError::Rejected("injected failure".to_string()));
        }

        state.tables.insert(table.qualified(), staged);
        state.audit.extend(changes.audit.iter().cloned());
        Ok(())
    }
}

#[async_trait]
impl SourceCatalog for MemoryWarehouse {
    async fn active_sources(&self, pipeline_code: &str) -> Result<Vec<SourceConfig>> {
        let state = self.state.lock().await;
        let mut sources: Vec<SourceConfig> = state
            .sources
            .iter()
            .filter(|s| s.active && s.pipeline_code == pipeline_code)
            .cloned()
            .collect();
        sources.sort_by(|a, b| a.source_code.cmp(&b.source_code));
        Ok(sources)
    }

    async fn latest_artifact(
        &self,
        source_code: &str,
        task_type: TaskType,
        status: Status,
    ) -> Result<Option<String>> {
        let state = self.state.lock().await;
        let Some(tasks) = state.tables.get(&TableSchema::task().qualified()) else {
            return Ok(None);
        };

        let field = |row: &Row, name: &str| row.get(name).and_then(Value::as_str).map(str::to_string);

        Ok(tasks
            .values()
            .filter(|row| {
                field(row, "source_code").as_deref() == Some(source_code)
                    && field(row, "task_type_code").as_deref() == Some(task_type.code())
                    && field(row, "status").as_deref() == Some(status.as_str())
            })
            .filter_map(|row| {
                let ended = field(row, "ended_at")?;
                let ended = chrono::DateTime::parse_from_rfc3339(&ended).ok()?;
                Some((ended, field(row, "task_image")?))
            })
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, image)| image))
    }
}
