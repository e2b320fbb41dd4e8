use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bucket::{BlobKey, WriteMode};
use crate::catalog::SourceConfig;
use crate::context::RunContext;
use crate::task::{Runnable, Status, TaskError, TaskRun, TaskSpec, TaskType};
use crate::warehouse::Row;

/// Per-record reshaping applied by a [`TransformTask`]
pub trait RecordTransform: Send + Sync {
    /// Return the transformed record, or `None` to drop it.
    fn apply(&self, record: Row) -> Option<Row>;
}

/// Renames fields, then optionally keeps only a whitelist of columns.
#[derive(Debug, Clone, Default)]
pub struct FieldMapping {
    renames: Vec<(String, String)>,
    keep: Option<Vec<String>>,
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.renames.push((from.into(), to.into()));
        self
    }

    pub fn keep<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keep = Some(columns.into_iter().map(Into::into).collect());
        self
    }
}

impl RecordTransform for FieldMapping {
    fn apply(&self, mut record: Row) -> Option<Row> {
        for (from, to) in &self.renames {
            if let Some(value) = record.remove(from) {
                record.insert(to.clone(), value);
            }
        }
        if let Some(keep) = &self.keep {
            record.retain(|column, _| keep.iter().any(|k| k == column));
        }
        Some(record)
    }
}

/// Reads the latest finished extract artifact of a source, reshapes every
/// record and writes `transformed/{job_id}/{pipeline}_{source}.json.gz`.
pub struct TransformTask {
    source: SourceConfig,
    transform: Arc<dyn RecordTransform>,
}

impl TransformTask {
    pub fn new(source: SourceConfig, transform: Arc<dyn RecordTransform>) -> Self {
        Self { source, transform }
    }

    pub fn spec(&self) -> TaskSpec {
        TaskSpec::new(
            format!("{} transform", self.source.source_name),
            &self.source.pipeline_code,
            &self.source.source_code,
            TaskType::Transform,
        )
    }
}

#[async_trait]
impl Runnable for TransformTask {
    async fn run(&mut self, task: &mut TaskRun<'_>, ctx: &RunContext) -> Result<(), TaskError> {
        let source_code = &self.source.source_code;
        let image = ctx
            .catalog
            .latest_artifact(source_code, TaskType::Extract, Status::Finished)
            .await?
            .ok_or_else(|| {
                TaskError::NoData(format!("no finished extract artifact for source {source_code}"))
            })?;
        debug!(source = %source_code, image = %image, "Transform input located");

        let input = BlobKey::parse(image)?;
        let records = ctx.bucket.read(&input).await?;
        if records.is_empty() {
            return Err(TaskError::NoData(format!("{input} is empty")));
        }

        let total = records.len();
        let transformed: Vec<Row> = records
            .into_iter()
            .filter_map(|record| match record {
                Value::Object(row) => self.transform.apply(row),
                _ => None,
            })
            .collect();

        let output = BlobKey::transformed(task.job_id(), &self.source.artifact_name())?;
        task.set_task_image(output.as_str());
        ctx.bucket
            .write(&transformed, &output, WriteMode::Overwrite)
            .await?;
        task.add_records(transformed.len() as u64);
        task.add_files(1);

        info!(
            source = %source_code,
            input = total,
            output = transformed.len(),
            image = %output,
            "Transform complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_mapping_renames_then_keeps() {
        let mapping = FieldMapping::new()
            .rename("label_en", "name")
            .rename("onu_code", "un_code")
            .keep(["name", "un_code"]);
        let Value::Object(row) = json!({"label_en": "Chile", "onu_code": 152, "junk": true}) else {
            unreachable!()
        };
        let out = mapping.apply(row).map(Value::Object);
        assert_eq!(out, Some(json!({"name": "Chile", "un_code": 152})));
    }
}
