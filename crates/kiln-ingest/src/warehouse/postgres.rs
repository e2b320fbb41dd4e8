use super::{AuditEntry, ChangeSet, Result, Row, Warehouse, WarehouseError};
use crate::catalog::{SourceCatalog, SourceConfig};
use crate::schema::TableSchema;
use crate::task::{Status, TaskType};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, instrument};

/// Postgres-backed warehouse.
///
/// Rows travel as JSON and are converted to the table's column types with
/// `jsonb_populate_recordset`, so one statement covers a whole batch regardless
/// of the table's shape.
#[derive(Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Double-quote an identifier, rejecting anything that is not a plain name.
fn quote_ident(ident: &str) -> Result<String> {
    let valid = !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !ident.starts_with(|c: char| c.is_ascii_digit());
    if !valid {
        return Err(WarehouseError::InvalidIdentifier(ident.to_string()));
    }
    Ok(format!("\"{ident}\""))
}

fn qualified(table: &TableSchema) -> Result<String> {
    Ok(format!("{}.{}", quote_ident(&table.schema)?, quote_ident(&table.name)?))
}

fn key_column(table: &TableSchema) -> Result<String> {
    let key = table.key_column().ok_or_else(|| WarehouseError::NoKey {
        table: table.qualified(),
    })?;
    quote_ident(key)
}

/// Match `t.key` against `$1` (a text array). The keys are cast to the key
/// column's own type through the table's row type, which keeps the primary
/// key index usable.
fn key_match(table: &TableSchema) -> Result<String> {
    let key = key_column(table)?;
    let raw_key = table.key_column().unwrap_or_default();
    let target = qualified(table)?;
    Ok(format!(
        "t.{key} = ANY(ARRAY(\
         SELECT (jsonb_populate_record(NULL::{target}, jsonb_build_object('{raw_key}', k))).{key} \
         FROM unnest($1::text[]) AS k))"
    ))
}

async fn insert_rows(
    tx: &mut Transaction<'_, Postgres>,
    table: &TableSchema,
    rows: &[Row],
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let columns: Vec<String> = rows
        .iter()
        .flat_map(|r| r.keys().cloned())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .map(|c| quote_ident(&c))
        .collect::<Result<_>>()?;
    let column_list = columns.join(", ");
    let target = qualified(table)?;

    let sql = format!(
        "INSERT INTO {target} ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_recordset(NULL::{target}, $1)"
    );

    sqlx::query(&sql)
        .bind(Value::Array(rows.iter().cloned().map(Value::Object).collect()))
        .execute(&mut **tx)
        .await?;

    Ok(())
}

async fn update_rows(
    tx: &mut Transaction<'_, Postgres>,
    table: &TableSchema,
    rows: &[Row],
) -> Result<()> {
    let key = key_column(table)?;
    let target = qualified(table)?;
    let raw_key = table.key_column().unwrap_or_default();

    // Rows carry only their changed columns; group them by column set so each
    // group is one UPDATE ... FROM statement.
    let mut groups: BTreeMap<Vec<String>, Vec<Value>> = BTreeMap::new();
    for row in rows {
        let columns: Vec<String> = row.keys().filter(|c| *c != raw_key).cloned().collect();
        if columns.is_empty() {
            continue;
        }
        groups
            .entry(columns)
            .or_default()
            .push(Value::Object(row.clone()));
    }

    for (columns, batch) in groups {
        let assignments = columns
            .iter()
            .map(|c| quote_ident(c).map(|q| format!("{q} = v.{q}")))
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        let sql = format!(
            "UPDATE {target} AS t SET {assignments} \
             FROM jsonb_populate_recordset(NULL::{target}, $1) AS v \
             WHERE t.{key} = v.{key}"
        );

        sqlx::query(&sql)
            .bind(Value::Array(batch))
            .execute(&mut **tx)
            .await?;
    }

    Ok(())
}

async fn insert_audit(tx: &mut Transaction<'_, Postgres>, entries: &[AuditEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"
        INSERT INTO operations.audit_logs (
            log_id, table_name, record_id, task_id, operation_type_code,
            previous_value, new_value, created_at
        )
        "#,
    );

    query_builder.push_values(entries, |mut b, entry| {
        b.push_bind(entry.log_id)
            .push_bind(&entry.table_name)
            .push_bind(&entry.record_id)
            .push_bind(entry.task_id)
            .push_bind(entry.operation.code())
            .push_bind(&entry.previous_value)
            .push_bind(&entry.new_value)
            .push_bind(entry.created_at);
    });

    query_builder.build().execute(&mut **tx).await?;
    Ok(())
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn existing_keys(&self, table: &TableSchema, keys: &[String]) -> Result<HashSet<String>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let key = key_column(table)?;
        let sql = format!(
            "SELECT t.{key}::text FROM {} AS t WHERE {}",
            qualified(table)?,
            key_match(table)?
        );

        let found: Vec<String> = sqlx::query_scalar(&sql)
            .bind(keys)
            .fetch_all(&self.pool)
            .await?;

        Ok(found.into_iter().collect())
    }

    async fn fetch_rows(
        &self,
        table: &TableSchema,
        keys: &[String],
    ) -> Result<HashMap<String, Row>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let key = key_column(table)?;
        let sql = format!(
            "SELECT t.{key}::text, to_jsonb(t) FROM {} AS t WHERE {}",
            qualified(table)?,
            key_match(table)?
        );

        let rows: Vec<(String, Value)> = sqlx::query_as(&sql)
            .bind(keys)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(k, v)| match v {
                Value::Object(map) => Some((k, map)),
                _ => None,
            })
            .collect())
    }

    /// Round-trips the batch through `jsonb_populate_record` and `to_jsonb`,
    /// so timestamps, numerics and dates take their stored text form.
    async fn conform(&self, table: &TableSchema, rows: Vec<Row>) -> Result<Vec<Row>> {
        if rows.is_empty() {
            return Ok(rows);
        }
        let target = qualified(table)?;
        let sql = format!(
            "SELECT to_jsonb(r) \
             FROM jsonb_array_elements($1) WITH ORDINALITY AS e(elem, n) \
             CROSS JOIN LATERAL jsonb_populate_record(NULL::{target}, e.elem) AS r \
             ORDER BY e.n"
        );

        let typed: Vec<Value> = sqlx::query_scalar(&sql)
            .bind(Value::Array(rows.iter().cloned().map(Value::Object).collect()))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .zip(typed)
            .map(|(mut row, typed)| {
                if let Value::Object(typed) = typed {
                    for (column, value) in row.iter_mut() {
                        if let Some(stored) = typed.get(column) {
                            *value = stored.clone();
                        }
                    }
                }
                row
            })
            .collect())
    }

    #[instrument(skip(self, changes), fields(table = %table.qualified()))]
    async fn apply(&self, table: &TableSchema, changes: &ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        update_rows(&mut tx, table, &changes.updates).await?;
        insert_rows(&mut tx, table, &changes.inserts).await?;
        insert_audit(&mut tx, &changes.audit).await?;

        tx.commit().await?;

        debug!(
            updated = changes.updates.len(),
            inserted = changes.inserts.len(),
            audit = changes.audit.len(),
            "Change set committed"
        );
        Ok(())
    }
}

#[async_trait]
impl SourceCatalog for PgWarehouse {
    async fn active_sources(&self, pipeline_code: &str) -> Result<Vec<SourceConfig>> {
        let rows: Vec<Value> = sqlx::query_scalar(
            r#"
            SELECT to_jsonb(s)
            FROM operations.source AS s
            WHERE s.pipeline_code = $1 AND s.active
            ORDER BY s.source_code
            "#,
        )
        .bind(pipeline_code)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| serde_json::from_value(row).map_err(WarehouseError::from))
            .collect()
    }

    async fn latest_artifact(
        &self,
        source_code: &str,
        task_type: TaskType,
        status: Status,
    ) -> Result<Option<String>> {
        let image: Option<String> = sqlx::query_scalar(
            r#"
            SELECT task_image
            FROM operations.task
            WHERE source_code = $1
              AND task_type_code = $2
              AND status = $3
              AND task_image IS NOT NULL
              AND ended_at IS NOT NULL
            ORDER BY ended_at DESC
            LIMIT 1
            "#,
        )
        .bind(source_code)
        .bind(task_type.code())
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(image)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("app_code").ok(), Some("\"app_code\"".to_string()));
        assert!(quote_ident("x; DROP TABLE y").is_err());
        assert!(quote_ident("1abc").is_err());
        assert!(quote_ident("").is_err());
    }

    #[test]
    fn test_key_match_casts_keys_not_column() {
        let table = TableSchema::new("public", "event", "event_id");
        let sql = key_match(&table).unwrap();
        assert!(sql.starts_with("t.\"event_id\" = ANY("));
        assert!(sql.contains("jsonb_build_object('event_id', k)"));
        assert!(sql.contains("unnest($1::text[])"));
        assert!(!sql.contains("::text = ANY"));
    }

    #[test]
    fn test_composite_key_rejected() {
        let table = TableSchema::new("public", "x", "a").with_composite_key(&["a", "b"]);
        assert!(matches!(key_column(&table), Err(WarehouseError::NoKey { .. })));
    }
}
