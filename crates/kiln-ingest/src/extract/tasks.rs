use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::{
    ApiClient, ExtractError, PageRequest, PageSink, PaginatedApiClient, PaginationConfig,
};
use crate::bucket::{BlobKey, WriteMode};
use crate::catalog::SourceConfig;
use crate::context::RunContext;
use crate::task::{Runnable, TaskError, TaskRun, TaskSpec, TaskType};

/// Extracts a JSON API source into `raw/{job_id}/{pipeline}_{source}.json.gz`.
///
/// Sources with a pagination config go through the page loop and stream each
/// page to the artifact; others are fetched with one GET whose body is either
/// the record array or a single record.
pub struct ApiExtractTask {
    source: SourceConfig,
    client: ApiClient,
    pagination: Option<PaginationConfig>,
}

impl ApiExtractTask {
    pub fn new(source: SourceConfig, client: ApiClient) -> Self {
        let pagination = source.pagination.clone();
        Self {
            source,
            client,
            pagination,
        }
    }

    /// Override the source's own pagination settings.
    pub fn with_pagination(mut self, pagination: PaginationConfig) -> Self {
        self.pagination = Some(pagination);
        self
    }

    pub fn spec(&self) -> TaskSpec {
        let spec = TaskSpec::new(
            format!("API {} extraction", self.source.source_name),
            &self.source.pipeline_code,
            &self.source.source_code,
            TaskType::Extract,
        );
        match self.source.url() {
            Some(url) => spec.with_location(url),
            None => spec,
        }
    }
}

#[async_trait]
impl Runnable for ApiExtractTask {
    async fn run(&mut self, task: &mut TaskRun<'_>, ctx: &RunContext) -> Result<(), TaskError> {
        let url = self
            .source
            .url()
            .ok_or_else(|| ExtractError::NoLocation(self.source.source_code.clone()))?;
        let key = BlobKey::raw(task.job_id(), &self.source.artifact_name())?;
        task.set_task_image(key.as_str());

        match &self.pagination {
            Some(pagination) => {
                let request = PageRequest {
                    url,
                    params: self.source.params(),
                    headers: self.source.headers(),
                    timeout: self.source.timeout(),
                    pagination: pagination.clone(),
                };
                let sink = PageSink {
                    bucket: &ctx.bucket,
                    key: &key,
                };
                let result = PaginatedApiClient::new(self.client.clone())
                    .fetch_all(&request, Some(sink))
                    .await?;

                if let Some(status) = result.last_status() {
                    task.set_location_status(status);
                }
                task.add_records(result.records.len() as u64);
                task.add_files(1);

                if !result.consistency_check() {
                    warn!(
                        source = %self.source.source_code,
                        expected = result.total_records,
                        received = result.records.len(),
                        "Extracted artifact is incomplete"
                    );
                    task.mark_image_failed();
                }
                if result.records.is_empty() && result.total_records > 0 {
                    return Err(TaskError::NoData(format!(
                        "every page of {} failed",
                        self.source.source_code
                    )));
                }
            },
            None => {
                let response = self
                    .client
                    .get_json(
                        &url,
                        &self.source.params(),
                        &self.source.headers(),
                        self.source.timeout(),
                    )
                    .await?;
                task.set_location_status(response.status);

                let records = match response.body {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    other => vec![other],
                };
                ctx.bucket.write(&records, &key, WriteMode::Overwrite).await?;
                task.add_records(records.len() as u64);
                task.add_files(1);
            },
        }

        info!(source = %self.source.source_code, image = %key, "API extraction complete");
        Ok(())
    }
}

/// Downloads a static file into `raw/{job_id}/{pipeline}_{source}.bin.gz`.
pub struct FileExtractTask {
    source: SourceConfig,
    client: ApiClient,
}

impl FileExtractTask {
    pub fn new(source: SourceConfig, client: ApiClient) -> Self {
        Self { source, client }
    }

    pub fn spec(&self) -> TaskSpec {
        let spec = TaskSpec::new(
            format!("File {} extraction", self.source.source_name),
            &self.source.pipeline_code,
            &self.source.source_code,
            TaskType::Extract,
        );
        match self.source.url() {
            Some(url) => spec.with_location(url),
            None => spec,
        }
    }
}

#[async_trait]
impl Runnable for FileExtractTask {
    async fn run(&mut self, task: &mut TaskRun<'_>, ctx: &RunContext) -> Result<(), TaskError> {
        let url = self
            .source
            .url()
            .ok_or_else(|| ExtractError::NoLocation(self.source.source_code.clone()))?;
        let key = BlobKey::raw_file(task.job_id(), &self.source.artifact_name())?;
        task.set_task_image(key.as_str());

        let response = self
            .client
            .get_bytes(&url, &self.source.headers(), self.source.timeout())
            .await?;
        task.set_location_status(response.status);

        if response.body.is_empty() {
            return Err(TaskError::NoData(format!("{url} returned an empty body")));
        }

        ctx.bucket.write_bytes(&response.body, &key).await?;
        task.add_files(1);

        info!(
            source = %self.source.source_code,
            bytes = response.body.len(),
            image = %key,
            "File extraction complete"
        );
        Ok(())
    }
}
