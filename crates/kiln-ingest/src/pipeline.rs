//! Pipeline registry: turns a pipeline code into a ready-to-run [`Job`]
//!
//! Builders read the pipeline's active sources from the catalog and append
//! tasks to the job. [`ExtractPipeline`] stages every source into `raw/`;
//! [`EtlPipeline`] adds a transform and a load task per source.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::catalog::{LocationType, SourceCatalog, SourceConfig};
use crate::extract::{ApiClient, ApiExtractTask, FileExtractTask, PaginationConfig};
use crate::job::Job;
use crate::schema::TableSchema;
use crate::stages::{LoadTask, RecordTransform, TransformTask};
use crate::task::Task;
use crate::warehouse::WarehouseError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unknown pipeline: {0}")]
    Unknown(String),

    #[error("Pipeline {0} has no active sources")]
    NoSources(String),

    #[error("Catalog lookup failed: {0}")]
    Catalog(#[from] WarehouseError),
}

#[async_trait]
pub trait PipelineBuilder: Send + Sync {
    /// Append this pipeline's tasks for `sources` to `job`.
    async fn build(&self, job: &mut Job, sources: Vec<SourceConfig>) -> Result<(), PipelineError>;
}

fn extract_task(source: SourceConfig, client: &ApiClient, pagination: Option<&PaginationConfig>) -> Task {
    match source.location_type {
        LocationType::Api => {
            let mut stage = ApiExtractTask::new(source, client.clone());
            if let Some(p) = pagination {
                stage = stage.with_pagination(p.clone());
            }
            Task::new(stage.spec(), stage)
        },
        LocationType::File => {
            let stage = FileExtractTask::new(source, client.clone());
            Task::new(stage.spec(), stage)
        },
    }
}

/// One extract task per active source
pub struct ExtractPipeline {
    client: ApiClient,
}

impl ExtractPipeline {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PipelineBuilder for ExtractPipeline {
    async fn build(&self, job: &mut Job, sources: Vec<SourceConfig>) -> Result<(), PipelineError> {
        for source in sources {
            job.add_task(extract_task(source, &self.client, None));
        }
        Ok(())
    }
}

/// Extract, transform and load per API source into one table.
///
/// FILE sources are staged to `raw/` only: their artifact is opaque bytes,
/// not records, so no transform or load is scheduled for them.
pub struct EtlPipeline {
    client: ApiClient,
    /// Used by API sources without pagination settings of their own;
    /// `None` keeps those sources on a single GET.
    pagination: Option<PaginationConfig>,
    transform: Arc<dyn RecordTransform>,
    table: TableSchema,
}

impl EtlPipeline {
    pub fn new(
        client: ApiClient,
        pagination: Option<PaginationConfig>,
        transform: Arc<dyn RecordTransform>,
        table: TableSchema,
    ) -> Self {
        Self {
            client,
            pagination,
            transform,
            table,
        }
    }
}

#[async_trait]
impl PipelineBuilder for EtlPipeline {
    async fn build(&self, job: &mut Job, sources: Vec<SourceConfig>) -> Result<(), PipelineError> {
        for source in sources {
            if source.location_type == LocationType::File {
                warn!(
                    source = %source.source_code,
                    "FILE source is extracted only; transform and load skipped"
                );
                job.add_task(extract_task(source, &self.client, None));
                continue;
            }

            let pagination = source.pagination.clone().or_else(|| self.pagination.clone());
            job.add_task(extract_task(source.clone(), &self.client, pagination.as_ref()));

            let transform = TransformTask::new(source.clone(), self.transform.clone());
            job.add_task(Task::new(transform.spec(), transform));

            let load = LoadTask::transformed(source, self.table.clone());
            job.add_task(Task::new(load.spec(), load));
        }
        Ok(())
    }
}

/// Pipeline code to builder table, with an optional fallback builder for
/// codes that are only defined in the catalog.
#[derive(Default)]
pub struct PipelineRegistry {
    builders: BTreeMap<String, Arc<dyn PipelineBuilder>>,
    fallback: Option<Arc<dyn PipelineBuilder>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, code: impl Into<String>, builder: Arc<dyn PipelineBuilder>) -> Self {
        self.builders.insert(code.into(), builder);
        self
    }

    pub fn with_fallback(mut self, builder: Arc<dyn PipelineBuilder>) -> Self {
        self.fallback = Some(builder);
        self
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }

    /// Build the job for `code` from its active sources.
    pub async fn build_job(
        &self,
        code: &str,
        app_code: &str,
        catalog: &dyn SourceCatalog,
    ) -> Result<Job, PipelineError> {
        let builder = self
            .builders
            .get(code)
            .or(self.fallback.as_ref())
            .ok_or_else(|| PipelineError::Unknown(code.to_string()))?;

        let sources = catalog.active_sources(code).await?;
        if sources.is_empty() {
            return Err(PipelineError::NoSources(code.to_string()));
        }

        let mut job = Job::new(format!("pipeline {code}"), app_code);
        let source_count = sources.len();
        builder.build(&mut job, sources).await?;

        info!(
            pipeline = code,
            job_id = %job.id(),
            sources = source_count,
            tasks = job.tasks().len(),
            "Job built"
        );
        Ok(job)
    }
}
