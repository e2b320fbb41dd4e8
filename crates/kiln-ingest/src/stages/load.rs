use async_trait::async_trait;
use tracing::info;

use crate::bucket::BlobKey;
use crate::catalog::SourceConfig;
use crate::context::RunContext;
use crate::schema::TableSchema;
use crate::task::{Runnable, Status, TaskError, TaskRun, TaskSpec, TaskType};

/// Which bucket artifact a [`LoadTask`] reads
#[derive(Debug, Clone)]
pub enum ArtifactRef {
    /// `transformed/{job_id}/{name}.json.gz` of the running job
    Transformed { name: String },
    /// Latest finished artifact of a source's tasks of the given type
    Latest {
        source_code: String,
        task_type: TaskType,
    },
    /// A fixed object
    Key(BlobKey),
}

/// Upserts a staged artifact into a warehouse table, with audit rows
/// attributed to this task. The task image is the target `schema.table`.
pub struct LoadTask {
    source: SourceConfig,
    artifact: ArtifactRef,
    table: TableSchema,
}

impl LoadTask {
    pub fn new(source: SourceConfig, artifact: ArtifactRef, table: TableSchema) -> Self {
        Self {
            source,
            artifact,
            table,
        }
    }

    /// Load the current job's transformed artifact of `source`.
    pub fn transformed(source: SourceConfig, table: TableSchema) -> Self {
        let artifact = ArtifactRef::Transformed {
            name: source.artifact_name(),
        };
        Self::new(source, artifact, table)
    }

    pub fn spec(&self) -> TaskSpec {
        TaskSpec::new(
            format!("{} load", self.source.source_name),
            &self.source.pipeline_code,
            &self.source.source_code,
            TaskType::Load,
        )
        .with_location(self.table.qualified())
    }

    async fn resolve(&self, task: &TaskRun<'_>, ctx: &RunContext) -> Result<BlobKey, TaskError> {
        match &self.artifact {
            ArtifactRef::Transformed { name } => Ok(BlobKey::transformed(task.job_id(), name)?),
            ArtifactRef::Key(key) => Ok(key.clone()),
            ArtifactRef::Latest {
                source_code,
                task_type,
            } => {
                let image = ctx
                    .catalog
                    .latest_artifact(source_code, *task_type, Status::Finished)
                    .await?
                    .ok_or_else(|| {
                        TaskError::NoData(format!(
                            "no finished {} artifact for source {source_code}",
                            task_type.code()
                        ))
                    })?;
                Ok(BlobKey::parse(image)?)
            },
        }
    }
}

#[async_trait]
impl Runnable for LoadTask {
    async fn run(&mut self, task: &mut TaskRun<'_>, ctx: &RunContext) -> Result<(), TaskError> {
        task.set_task_image(self.table.qualified());

        let input = self.resolve(task, ctx).await?;
        let records = ctx.bucket.read(&input).await?;
        if records.is_empty() {
            return Err(TaskError::NoData(format!("{input} is empty")));
        }

        let summary = ctx
            .loader
            .upsert(&self.table, records, Some(task.task_id()))
            .await?;
        task.add_records(summary.written() as u64);
        task.add_files(1);

        info!(
            table = %self.table.qualified(),
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped,
            "Load complete"
        );
        Ok(())
    }
}
