//! Relational warehouse access
//!
//! The records loader talks to storage only through [`Warehouse`]: look up
//! which keys exist, fetch current rows, and apply one [`ChangeSet`] atomically.
//! [`PgWarehouse`] runs against Postgres; [`MemoryWarehouse`] keeps tables in
//! memory with the same all-or-nothing semantics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

use crate::schema::TableSchema;

mod memory;
mod postgres;

pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

/// One record as a field map
pub type Row = Map<String, Value>;

#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Row decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Table {table} has no single-column primary key")]
    NoKey { table: String },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Duplicate key {key} in {table}")]
    Duplicate { table: String, key: String },

    #[error("Unknown table {0}")]
    UnknownTable(String),

    #[error("Write rejected: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, WarehouseError>;

/// Audit operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "C")]
    Create,
    #[serde(rename = "U")]
    Update,
    #[serde(rename = "D")]
    Delete,
}

impl Operation {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Create => "C",
            Self::Update => "U",
            Self::Delete => "D",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Row of `operations.audit_logs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub log_id: Uuid,
    pub table_name: String,
    pub record_id: String,
    pub task_id: Uuid,
    pub operation: Operation,
    /// Changed fields before the write; `None` for creates
    pub previous_value: Option<Value>,
    /// Changed fields after the write; the full record for creates
    pub new_value: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn create(table: &TableSchema, record_id: String, task_id: Uuid, record: &Row) -> Self {
        Self {
            log_id: Uuid::new_v4(),
            table_name: table.qualified(),
            record_id,
            task_id,
            operation: Operation::Create,
            previous_value: None,
            new_value: Value::Object(record.clone()),
            created_at: Utc::now(),
        }
    }

    pub fn update(
        table: &TableSchema,
        record_id: String,
        task_id: Uuid,
        previous: Row,
        new: Row,
    ) -> Self {
        Self {
            log_id: Uuid::new_v4(),
            table_name: table.qualified(),
            record_id,
            task_id,
            operation: Operation::Update,
            previous_value: Some(Value::Object(previous)),
            new_value: Value::Object(new),
            created_at: Utc::now(),
        }
    }
}

/// Everything one upsert call writes, applied in a single transaction:
/// updates first, then inserts, then audit rows.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Key plus changed columns for existing rows
    pub updates: Vec<Row>,
    pub inserts: Vec<Row>,
    pub audit: Vec<AuditEntry>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.inserts.is_empty() && self.audit.is_empty()
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Subset of `keys` present in `table`.
    async fn existing_keys(&self, table: &TableSchema, keys: &[String]) -> Result<HashSet<String>>;

    /// Current rows for `keys`, indexed by key text.
    async fn fetch_rows(&self, table: &TableSchema, keys: &[String])
        -> Result<HashMap<String, Row>>;

    /// Apply all changes or none of them.
    async fn apply(&self, table: &TableSchema, changes: &ChangeSet) -> Result<()>;

    /// Rewrite each field of `rows` the way `table` stores it, so incoming
    /// values compare equal to what [`Warehouse::fetch_rows`] returns. Rows
    /// keep their own field set and order. Storage that keeps JSON verbatim
    /// returns the rows unchanged.
    async fn conform(&self, _table: &TableSchema, rows: Vec<Row>) -> Result<Vec<Row>> {
        Ok(rows)
    }
}
