//! Jobs: an ordered list of tasks executed in-process
//!
//! [`Job::execute`] runs every task in insertion order. A task whose stage
//! returns an error is failed and the loop moves on; only a lifecycle
//! violation aborts the loop and fails the job itself. A job that reaches
//! the end of its list is `finished` even when some of its tasks failed, so
//! the job status says the orchestration completed, not that all data landed.
//!
//! [`Job::run_job`] adds persistence: job and task statistics go to the
//! warehouse through the records loader, then to `jobs/J_{id}` and
//! `jobs/T_{id}` in the bucket. Either sink may fail without affecting the
//! other, and no error escapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::bucket::{BlobKey, StatsKind, WriteMode};
use crate::context::RunContext;
use crate::lifecycle::{Lifecycle, LifecycleError, Status};
use crate::metrics::{HostInfo, ResourceSampler};
use crate::schema::TableSchema;
use crate::task::{Task, TaskStats};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Lifecycle violation: {0}")]
    Lifecycle(#[from] LifecycleError),
}

/// Row of `operations.job`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub job_id: Uuid,
    pub name: String,
    pub app_code: String,
    pub status: Status,
    pub exception: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub memory_usage_start: Option<f64>,
    pub cpu_usage_start: Option<f64>,
    pub memory_usage_end: Option<f64>,
    pub cpu_usage_end: Option<f64>,
    pub memory_usage: Option<f64>,
    pub cpu_usage: Option<f64>,
    pub host_name: String,
    pub execution_user: String,
    pub process_id: u32,
    pub number_of_tasks: usize,
}

/// What `run_job` produced and where it was recorded
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job: JobStats,
    pub tasks: Vec<TaskStats>,
    /// Stats reached the warehouse
    pub persisted: bool,
    /// Stats reached the bucket
    pub mirrored: bool,
}

impl JobReport {
    pub fn failed_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| t.status == Status::Failed).count()
    }
}

pub struct Job {
    job_id: Uuid,
    name: String,
    app_code: String,
    lifecycle: Lifecycle,
    tasks: Vec<Task>,
}

impl Job {
    pub fn new(name: impl Into<String>, app_code: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            name: name.into(),
            app_code: app_code.into(),
            lifecycle: Lifecycle::default(),
            tasks: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn id(&self) -> Uuid {
        self.job_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Status {
        self.lifecycle.status()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Append a task; it will run after every task added before it.
    pub fn add_task(&mut self, mut task: Task) {
        task.attach(self.job_id);
        self.tasks.push(task);
    }

    pub async fn start(&mut self, sampler: &dyn ResourceSampler) -> Result<(), LifecycleError> {
        self.lifecycle.check_start()?;
        let sample = sampler.sample().await;
        self.lifecycle.start(Utc::now(), sample)
    }

    pub async fn finish(&mut self, sampler: &dyn ResourceSampler) -> Result<(), LifecycleError> {
        self.lifecycle.check_end("finish")?;
        let sample = sampler.sample().await;
        self.lifecycle.finish(Utc::now(), sample)
    }

    pub async fn fail(
        &mut self,
        sampler: &dyn ResourceSampler,
        error: &str,
    ) -> Result<(), LifecycleError> {
        self.lifecycle.check_end("fail")?;
        let sample = sampler.sample().await;
        self.lifecycle.fail(Utc::now(), sample, error)
    }

    /// Run all tasks and return the job statistics.
    #[instrument(skip(self, ctx), fields(job_id = %self.job_id, job = %self.name))]
    pub async fn execute(&mut self, ctx: &RunContext) -> JobStats {
        if let Err(e) = self.start(ctx.sampler.as_ref()).await {
            warn!(error = %e, "Job cannot be executed");
            return self.stats(&ctx.host);
        }
        info!(tasks = self.tasks.len(), "Job started");
        self.checkpoint(ctx).await;

        let outcome = self.run_tasks(ctx).await;
        let closed = match outcome {
            Ok(()) => self.finish(ctx.sampler.as_ref()).await,
            Err(e) => {
                error!(error = %e, "Job aborted");
                self.fail(ctx.sampler.as_ref(), &e.to_string()).await
            },
        };
        if let Err(e) = closed {
            warn!(error = %e, "Job could not be closed");
        }

        let stats = self.stats(&ctx.host);
        info!(
            status = %stats.status,
            duration = stats.duration,
            failed_tasks = self.tasks.iter().filter(|t| t.status() == Status::Failed).count(),
            "Job ended"
        );
        stats
    }

    async fn run_tasks(&mut self, ctx: &RunContext) -> Result<(), JobError> {
        let sampler = ctx.sampler.as_ref();
        let total = self.tasks.len();

        for (index, task) in self.tasks.iter_mut().enumerate() {
            info!("Task {}/{}: {}", index + 1, total, task.name());
            task.start(sampler).await?;
            checkpoint_task(ctx, task).await;

            match task.run(ctx).await {
                Ok(()) => task.finish(sampler).await?,
                Err(e) => task.fail(sampler, &e.to_string()).await?,
            }
            checkpoint_task(ctx, task).await;
        }

        Ok(())
    }

    /// Execute, then record statistics in the warehouse and the bucket.
    pub async fn run_job(&mut self, ctx: &RunContext) -> JobReport {
        let job = self.execute(ctx).await;
        let tasks = self.task_stats();

        let persisted = match persist(ctx, &job, &tasks).await {
            Ok(()) => true,
            Err(e) => {
                error!(job_id = %self.job_id, error = %e, "Failed to persist job statistics");
                false
            },
        };

        let mirrored = match mirror(ctx, &job, &tasks).await {
            Ok(()) => true,
            Err(e) => {
                error!(job_id = %self.job_id, error = %e, "Failed to mirror job statistics");
                false
            },
        };

        JobReport {
            job,
            tasks,
            persisted,
            mirrored,
        }
    }

    pub fn task_stats(&self) -> Vec<TaskStats> {
        self.tasks.iter().map(Task::stats).collect()
    }

    /// Job statistics for the current state, stamped with `host`.
    pub fn stats(&self, host: &HostInfo) -> JobStats {
        let lc = &self.lifecycle;
        let start = lc.start_sample();
        let end = lc.end_sample();
        let usage = lc.usage();

        JobStats {
            job_id: self.job_id,
            name: self.name.clone(),
            app_code: self.app_code.clone(),
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
            host_name: host.host_name.clone(),
            execution_user: host.execution_user.clone(),
            process_id: host.process_id,
            number_of_tasks: self.tasks.len(),
        }
    }

    async fn checkpoint(&self, ctx: &RunContext) {
        let stats = self.stats(&ctx.host);
        if let Err(e) = ctx
            .loader
            .upsert_serialized(&TableSchema::job(), &[stats], None)
            .await
        {
            warn!(job_id = %self.job_id, error = %e, "Job checkpoint not recorded");
        }
    }
}

/// Best-effort write of a task row so later stages and audit rows can refer to it.
async fn checkpoint_task(ctx: &RunContext, task: &Task) {
    if let Err(e) = ctx
        .loader
        .upsert_serialized(&TableSchema::task(), &[task.stats()], None)
        .await
    {
        warn!(task_id = %task.id(), error = %e, "Task checkpoint not recorded");
    }
}

async fn persist(
    ctx: &RunContext,
    job: &JobStats,
    tasks: &[TaskStats],
) -> Result<(), crate::loader::LoaderError> {
    ctx.loader
        .upsert_serialized(&TableSchema::job(), std::slice::from_ref(job), None)
        .await?;
    ctx.loader
        .upsert_serialized(&TableSchema::task(), tasks, None)
        .await?;
    Ok(())
}

async fn mirror(
    ctx: &RunContext,
    job: &JobStats,
    tasks: &[TaskStats],
) -> Result<(), crate::bucket::StorageError> {
    ctx.bucket
        .write(
            std::slice::from_ref(job),
            &BlobKey::stats(StatsKind::Job, job.job_id),
            WriteMode::Overwrite,
        )
        .await?;
    ctx.bucket
        .write(
            tasks,
            &BlobKey::stats(StatsKind::Task, job.job_id),
            WriteMode::Overwrite,
        )
        .await?;
    Ok(())
}
