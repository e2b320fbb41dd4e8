//! Kiln Ingest
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Batch ETL orchestration: jobs made of extract, transform and load tasks,
//! staged through a gzip object bucket and landed in Postgres with audit and
//! lineage tracking.
//!
//! - [`job`] / [`task`]: lifecycle, resource sampling, statistics export
//! - [`extract`]: HTTP sources with retry and offset pagination
//! - [`stages`]: transform and load stages
//! - [`loader`]: insert-or-update with per-field change audit
//! - [`bucket`]: local or S3 blob storage of line-delimited gzip JSON
//! - [`pipeline`]: pipeline code to job construction

pub mod bucket;
pub mod catalog;
pub mod config;
pub mod context;
pub mod db;
pub mod extract;
pub mod job;
pub mod lifecycle;
pub mod loader;
pub mod metrics;
pub mod pipeline;
pub mod schema;
pub mod stages;
pub mod task;
pub mod warehouse;

pub use bucket::{BlobKey, BucketStore, StorageError, WriteMode};
pub use catalog::{SourceCatalog, SourceConfig};
pub use config::KilnConfig;
pub use context::RunContext;
pub use job::{Job, JobReport, JobStats};
pub use lifecycle::Status;
pub use loader::{LoadSummary, RecordsLoader};
pub use pipeline::{PipelineBuilder, PipelineRegistry};
pub use schema::TableSchema;
pub use task::{Runnable, Task, TaskRun, TaskSpec, TaskType};
pub use warehouse::{MemoryWarehouse, PgWarehouse, Warehouse};
