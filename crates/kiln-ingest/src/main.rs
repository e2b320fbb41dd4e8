//! Kiln - batch ETL runner

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kiln_common::logging::{init_logging, LogSettings};
use kiln_ingest::bucket::BucketStore;
use kiln_ingest::catalog::SourceCatalog;
use kiln_ingest::config::KilnConfig;
use kiln_ingest::context::RunContext;
use kiln_ingest::db;
use kiln_ingest::extract::ApiClient;
use kiln_ingest::metrics::{HostInfo, SystemSampler};
use kiln_ingest::pipeline::{EtlPipeline, ExtractPipeline, PipelineRegistry};
use kiln_ingest::schema::TableSchema;
use kiln_ingest::stages::FieldMapping;
use kiln_ingest::warehouse::PgWarehouse;
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "kiln", version, about = "Batch ETL orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and run the job of a pipeline
    Run {
        /// Pipeline code as stored in operations.pipeline
        pipeline: String,

        /// Job name (defaults to "pipeline <code>")
        #[arg(long)]
        job_name: Option<String>,

        /// Also transform and load every source into this table (schema.table)
        #[arg(long)]
        load_into: Option<String>,

        /// Primary key column of the --load-into table
        #[arg(long, default_value = "id")]
        key: String,
    },

    /// Apply the operations schema migrations
    Migrate,

    /// List the active sources of a pipeline
    Sources {
        /// Pipeline code
        pipeline: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = LogSettings::from_env().unwrap_or_default();
    if let Err(e) = init_logging(&settings) {
        eprintln!("Warning: logging disabled: {}", e);
    }

    if let Err(e) = execute(cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let config = KilnConfig::load()?;
    let pool = db::create_pool(&config.database)
        .await
        .context("Failed to connect to the warehouse")?;

    match cli.command {
        Commands::Migrate => {
            db::migrate(&pool).await?;
            info!("Migrations applied");
        },
        Commands::Sources { pipeline } => {
            let warehouse = PgWarehouse::new(pool);
            let sources = warehouse.active_sources(&pipeline).await?;
            if sources.is_empty() {
                println!("No active sources for pipeline {}", pipeline);
            }
            for source in sources {
                println!(
                    "{}\t{:?}\t{}",
                    source.source_code,
                    source.location_type,
                    source.url().unwrap_or_default()
                );
            }
        },
        Commands::Run {
            pipeline,
            job_name,
            load_into,
            key,
        } => {
            let warehouse = Arc::new(PgWarehouse::new(pool));
            let bucket = BucketStore::from_config(&config.bucket).await?;
            let client = ApiClient::new(&config.http)?;

            let mut registry =
                PipelineRegistry::new().with_fallback(Arc::new(ExtractPipeline::new(client.clone())));
            if let Some(target) = load_into {
                let Some((schema, table)) = target.split_once('.') else {
                    bail!("--load-into expects schema.table, got {}", target);
                };
                registry = registry.register(
                    pipeline.clone(),
                    Arc::new(EtlPipeline::new(
                        client,
                        None,
                        Arc::new(FieldMapping::new()),
                        TableSchema::new(schema, table, &key),
                    )),
                );
            }

            let ctx = RunContext::new(
                bucket,
                warehouse.clone(),
                warehouse.clone(),
                Arc::new(SystemSampler::new()),
                HostInfo::detect(),
            );

            let mut job = registry
                .build_job(&pipeline, &config.app_code, warehouse.as_ref())
                .await?;
            if let Some(name) = job_name {
                job = job.with_name(name);
            }

            let report = job.run_job(&ctx).await;
            info!(
                job_id = %report.job.job_id,
                status = report.job.status.as_str(),
                tasks = report.tasks.len(),
                failed_tasks = report.failed_tasks(),
                persisted = report.persisted,
                mirrored = report.mirrored,
                "Job complete"
            );
            if report.failed_tasks() > 0 {
                warn!(failed = report.failed_tasks(), "Some tasks failed");
            }
            println!(
                "Job {} {} ({} tasks, {} failed)",
                report.job.job_id,
                report.job.status.as_str(),
                report.tasks.len(),
                report.failed_tasks()
            );
        },
    }

    Ok(())
}
