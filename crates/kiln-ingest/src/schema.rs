//! Warehouse table descriptions
//!
//! A [`TableSchema`] tells the records loader how to treat one target table:
//! its single-column primary key, how new keys are minted, which columns exist,
//! and whether writes are audited and stamped with lineage.

use serde_json::Value;

/// Schema holding the engine's own bookkeeping tables.
pub const OPERATIONS_SCHEMA: &str = "operations";

/// Column that records which tasks created and last modified a row.
pub const LINEAGE_COLUMN: &str = "lineage_metadata";

/// How a key is produced for a record that arrives without one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Random UUIDv4 assigned at insert time
    Uuid,
    /// Stable hex code hashed from another column, assigned before classification
    Derived { from: String, length: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub schema: String,
    pub name: String,
    pub primary_key: Vec<String>,
    /// Known columns. Empty means every field is passed through.
    pub columns: Vec<String>,
    pub key_strategy: KeyStrategy,
    pub audited: bool,
    pub lineage: bool,
}

impl TableSchema {
    /// Audited, lineage-tracked table keyed by `primary_key` with UUID keys.
    pub fn new(schema: impl Into<String>, name: impl Into<String>, primary_key: &str) -> Self {
        let schema = schema.into();
        let tracked = schema != OPERATIONS_SCHEMA;
        Self {
            schema,
            name: name.into(),
            primary_key: vec![primary_key.to_string()],
            columns: Vec::new(),
            key_strategy: KeyStrategy::Uuid,
            audited: tracked,
            lineage: tracked,
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_composite_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_derived_key(mut self, from: impl Into<String>, length: usize) -> Self {
        self.key_strategy = KeyStrategy::Derived {
            from: from.into(),
            length,
        };
        self
    }

    pub fn with_audit(mut self, audited: bool) -> Self {
        self.audited = audited;
        self
    }

    pub fn with_lineage(mut self, lineage: bool) -> Self {
        self.lineage = lineage;
        self
    }

    /// `schema.name`, unquoted
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// The single key column, or `None` for composite or missing keys.
    pub fn key_column(&self) -> Option<&str> {
        match self.primary_key.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        }
    }

    pub fn accepts(&self, column: &str) -> bool {
        self.columns.is_empty()
            || self.columns.iter().any(|c| c == column)
            || (self.lineage && column == LINEAGE_COLUMN)
    }

    /// `operations.job`
    pub fn job() -> Self {
        Self::new(OPERATIONS_SCHEMA, "job", "job_id").with_columns([
            "job_id",
            "name",
            "app_code",
            "status",
            "exception",
            "started_at",
            "ended_at",
            "duration",
            "memory_usage_start",
            "cpu_usage_start",
            "memory_usage_end",
            "cpu_usage_end",
            "memory_usage",
            "cpu_usage",
            "host_name",
            "execution_user",
            "process_id",
            "number_of_tasks",
        ])
    }

    /// `operations.task`
    pub fn task() -> Self {
        Self::new(OPERATIONS_SCHEMA, "task", "task_id").with_columns([
            "task_id",
            "job_id",
            "name",
            "pipeline_code",
            "source_code",
            "task_type_code",
            "location",
            "location_status",
            "status",
            "exception",
            "started_at",
            "ended_at",
            "duration",
            "memory_usage_start",
            "cpu_usage_start",
            "memory_usage_end",
            "cpu_usage_end",
            "memory_usage",
            "cpu_usage",
            "records_processed",
            "files_processed",
            "task_image",
            "task_image_status",
        ])
    }

    /// `operations.app`, keyed by a code hashed from `app_name`
    pub fn app() -> Self {
        Self::new(OPERATIONS_SCHEMA, "app", "app_code")
            .with_columns(["app_code", "app_name"])
            .with_derived_key("app_name", 8)
    }
}

/// Canonical text form of a key value, used to match keys across backends.
/// Null and empty strings count as "no key".
pub fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operations_tables_not_tracked() {
        let job = TableSchema::job();
        assert!(!job.audited);
        assert!(!job.lineage);
        assert_eq!(job.key_column(), Some("job_id"));

        let roles = TableSchema::new("public", "role", "role_id");
        assert!(roles.audited && roles.lineage);
        assert_eq!(roles.qualified(), "public.role");
    }

    #[test]
    fn test_composite_key_has_no_key_column() {
        let t = TableSchema::new("public", "x", "a").with_composite_key(&["a", "b"]);
        assert_eq!(t.key_column(), None);
    }

    #[test]
    fn test_accepts_filters_unknown_columns() {
        let t = TableSchema::new("public", "role", "role_id").with_columns(["role_id", "title"]);
        assert!(t.accepts("title"));
        assert!(t.accepts(LINEAGE_COLUMN));
        assert!(!t.accepts("junk"));
        assert!(!TableSchema::job().accepts(LINEAGE_COLUMN));
    }

    #[test]
    fn test_key_text() {
        assert_eq!(key_text(&json!(9999)), Some("9999".to_string()));
        assert_eq!(key_text(&json!("abc")), Some("abc".to_string()));
        assert_eq!(key_text(&json!(null)), None);
        assert_eq!(key_text(&json!("  ")), None);
    }
}
