//! Tasks: one unit of pipeline work with a fixed lifecycle
//!
//! A [`Task`] pairs lifecycle bookkeeping with a [`Runnable`] stage that does
//! the actual work. The stage only sees a [`TaskRun`] handle, through which it
//! can report what it produced; status and timing are owned by the lifecycle
//! methods. Every task can produce a [`TaskStats`] snapshot at any point.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::bucket::StorageError;
use crate::context::RunContext;
use crate::extract::ExtractError;
use crate::lifecycle::{Lifecycle, LifecycleError};
use crate::loader::LoaderError;
use crate::metrics::ResourceSampler;
use crate::warehouse::WarehouseError;

pub use crate::lifecycle::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "E")]
    Extract,
    #[serde(rename = "T")]
    Transform,
    #[serde(rename = "L")]
    Load,
}

impl TaskType {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Extract => "E",
            Self::Transform => "T",
            Self::Load => "L",
        }
    }
}

/// Errors a stage can raise from `run`; all of them fail the task
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Load(#[from] LoaderError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("No data received: {0}")]
    NoData(String),

    #[error("{0}")]
    Config(String),
}

/// Work performed between `start` and `finish`
#[async_trait]
pub trait Runnable: Send + Sync {
    async fn run(&mut self, task: &mut TaskRun<'_>, ctx: &RunContext) -> Result<(), TaskError>;
}

/// Static description of a task
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub pipeline_code: String,
    pub source_code: String,
    pub task_type: TaskType,
    pub location: Option<String>,
}

impl TaskSpec {
    pub fn new(
        name: impl Into<String>,
        pipeline_code: impl Into<String>,
        source_code: impl Into<String>,
        task_type: TaskType,
    ) -> Self {
        Self {
            name: name.into(),
            pipeline_code: pipeline_code.into(),
            source_code: source_code.into(),
            task_type,
            location: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Outputs a stage reports while running
#[derive(Debug, Clone, Default)]
struct Outputs {
    location_status: Option<u16>,
    records_processed: u64,
    files_processed: u64,
    task_image: Option<String>,
    image_failed: bool,
}

/// Mutable view of a running task handed to its stage
pub struct TaskRun<'a> {
    task_id: Uuid,
    job_id: Uuid,
    spec: &'a TaskSpec,
    outputs: &'a mut Outputs,
}

impl TaskRun<'_> {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn spec(&self) -> &TaskSpec {
        self.spec
    }

    /// Path of the artifact this task writes or loads.
    pub fn set_task_image(&mut self, image: impl Into<String>) {
        self.outputs.task_image = Some(image.into());
    }

    pub fn set_location_status(&mut self, status: u16) {
        self.outputs.location_status = Some(status);
    }

    pub fn add_records(&mut self, count: u64) {
        self.outputs.records_processed += count;
    }

    pub fn add_files(&mut self, count: u64) {
        self.outputs.files_processed += count;
    }

    /// Flag the artifact as unreliable even if the task finishes.
    pub fn mark_image_failed(&mut self) {
        self.outputs.image_failed = true;
    }
}

/// Row of `operations.task`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub name: String,
    pub pipeline_code: String,
    pub source_code: String,
    pub task_type_code: TaskType,
    pub location: Option<String>,
    pub location_status: Option<u16>,
    pub status: Status,
    pub exception: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds
    pub duration: Option<f64>,
    pub memory_usage_start: Option<f64>,
    pub cpu_usage_start: Option<f64>,
    pub memory_usage_end: Option<f64>,
    pub cpu_usage_end: Option<f64>,
    pub memory_usage: Option<f64>,
    pub cpu_usage: Option<f64>,
    pub records_processed: u64,
    pub files_processed: u64,
    pub task_image: Option<String>,
    pub task_image_status: Option<Status>,
}

pub struct Task {
    task_id: Uuid,
    job_id: Uuid,
    spec: TaskSpec,
    lifecycle: Lifecycle,
    outputs: Outputs,
    stage: Box<dyn Runnable>,
}

impl Task {
    pub fn new(spec: TaskSpec, stage: impl Runnable + 'static) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            job_id: Uuid::nil(),
            spec,
            lifecycle: Lifecycle::default(),
            outputs: Outputs::default(),
            stage: Box::new(stage),
        }
    }

    pub fn id(&self) -> Uuid {
        self.task_id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn status(&self) -> Status {
        self.lifecycle.status()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub(crate) fn attach(&mut self, job_id: Uuid) {
        self.job_id = job_id;
    }

    pub async fn start(&mut self, sampler: &dyn ResourceSampler) -> Result<(), LifecycleError> {
        self.lifecycle.check_start()?;
        let sample = sampler.sample().await;
        self.lifecycle.start(Utc::now(), sample)?;
        info!(task_id = %self.task_id, task = %self.spec.name, "Task started");
        Ok(())
    }

    pub async fn finish(&mut self, sampler: &dyn ResourceSampler) -> Result<(), LifecycleError> {
        self.lifecycle.check_end("finish")?;
        let sample = sampler.sample().await;
        self.lifecycle.finish(Utc::now(), sample)?;
        info!(
            task_id = %self.task_id,
            task = %self.spec.name,
            records = self.outputs.records_processed,
            duration = self.lifecycle.duration(),
            "Task finished"
        );
        Ok(())
    }

    pub async fn fail(
        &mut self,
        sampler: &dyn ResourceSampler,
        error: &str,
    ) -> Result<(), LifecycleError> {
        self.lifecycle.check_end("fail")?;
        let sample = sampler.sample().await;
        self.lifecycle.fail(Utc::now(), sample, error)?;
        error!(task_id = %self.task_id, task = %self.spec.name, error, "Task failed");
        Ok(())
    }

    /// Run the stage. Only meaningful between `start` and `finish`/`fail`.
    pub async fn run(&mut self, ctx: &RunContext) -> Result<(), TaskError> {
        let mut handle = TaskRun {
            task_id: self.task_id,
            job_id: self.job_id,
            spec: &self.spec,
            outputs: &mut self.outputs,
        };
        self.stage.run(&mut handle, ctx).await
    }

    /// Snapshot of the current state; cheap and side-effect free.
    pub fn stats(&self) -> TaskStats {
        let lc = &self.lifecycle;
        let start = lc.start_sample();
        let end = lc.end_sample();
        let usage = lc.usage();

        let task_image_status = self.outputs.task_image.as_ref().map(|_| {
            if self.outputs.image_failed && lc.status().is_terminal() {
                Status::Failed
            } else {
                lc.status()
            }
        });

        TaskStats {
            task_id: self.task_id,
            job_id: self.job_id,
            name: self.spec.name.clone(),
            pipeline_code: self.spec.pipeline_code.clone(),
            source_code: self.spec.source_code.clone(),
            task_type_code: self.spec.task_type,
            location: self.spec.location.clone(),
            location_status: self.outputs.location_status,
            status: lc.status(),
            exception: lc.exception().map(str::to_string),
            started_at: lc.started_at(),
            ended_at: lc.ended_at(),
            duration: lc.duration(),
            memory_usage_start: start.map(|s| s.memory_mb),
            cpu_usage_start: start.map(|s| s.cpu_percent),
            memory_usage_end: end.map(|s| s.memory_mb),
            cpu_usage_end: end.map(|s| s.cpu_percent),
            memory_usage: usage.map(|u| u.memory_mb),
            cpu_usage: usage.map(|u| u.cpu_percent),
            records_processed: self.outputs.records_processed,
            files_processed: self.outputs.files_processed,
            task_image: self.outputs.task_image.clone(),
            task_image_status,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::metrics::{ResourceSample, ScriptedSampler};

    struct Noop;

    #[async_trait]
    impl Runnable for Noop {
        async fn run(&mut self, _task: &mut TaskRun<'_>, _ctx: &RunContext) -> Result<(), TaskError> {
            Ok(())
        }
    }

    fn task() -> Task {
        Task::new(TaskSpec::new("extract things", "pl", "src", TaskType::Extract), Noop)
    }

    #[test]
    fn test_task_type_codes() {
        assert_eq!(serde_json::to_value(TaskType::Load).unwrap(), serde_json::json!("L"));
        assert_eq!(TaskType::Transform.code(), "T");
    }

    #[tokio::test]
    async fn test_fail_then_finish_keeps_failure() {
        let sampler = ScriptedSampler::new([
            ResourceSample::new(50.0, 200.0),
            ResourceSample::new(10.0, 150.0),
        ]);
        let mut task = task();
        task.start(&sampler).await.unwrap();
        task.fail(&sampler, "upstream 500").await.unwrap();
        assert!(task.finish(&sampler).await.is_err());

        let stats = task.stats();
        assert_eq!(stats.status, Status::Failed);
        assert_eq!(stats.exception.as_deref(), Some("upstream 500"));
        assert!(stats.ended_at.is_some());
        assert_eq!(stats.cpu_usage, Some(0.0));
        assert_eq!(stats.memory_usage, Some(0.0));
    }

    #[tokio::test]
    async fn test_stats_rebuilt_per_call() {
        let sampler = ScriptedSampler::constant(ResourceSample::new(1.0, 1.0));
        let mut task = task();
        assert_eq!(task.stats().status, Status::Pending);
        task.start(&sampler).await.unwrap();
        assert_eq!(task.stats().status, Status::Started);
        assert!(task.stats().duration.is_none());
        task.finish(&sampler).await.unwrap();
        assert_eq!(task.stats(), task.stats());
        assert_eq!(task.stats().status, Status::Finished);
    }

    #[tokio::test]
    async fn test_image_status_follows_outcome() {
        let sampler = ScriptedSampler::constant(ResourceSample::default());
        let mut task = task();
        task.outputs.task_image = Some("raw/x/y.json.gz".to_string());
        task.start(&sampler).await.unwrap();
        assert_eq!(task.stats().task_image_status, Some(Status::Started));
        task.outputs.image_failed = true;
        task.finish(&sampler).await.unwrap();
        let stats = task.stats();
        assert_eq!(stats.status, Status::Finished);
        assert_eq!(stats.task_image_status, Some(Status::Failed));
    }

    #[tokio::test]
    async fn test_no_image_no_image_status() {
        let sampler = ScriptedSampler::constant(ResourceSample::default());
        let mut task = task();
        task.start(&sampler).await.unwrap();
        task.finish(&sampler).await.unwrap();
        assert!(task.stats().task_image_status.is_none());
    }
}
