use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

mod benford;
mod classifier;
mod config;
mod db;
mod decision;
mod features;
mod models;
mod normalize;
mod pipeline;

use classifier::JsonModelStore;
use models::Stage;

#[derive(Parser)]
#[command(name = "fraud-pipeline")]
#[command(about = "Consumption fraud detection pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Queue a consumption source file for the full pipeline
    Ingest {
        #[arg(long)]
        file: PathBuf,
    },
    /// Import confirmed-fraud labels from a tabular file
    Labels {
        #[arg(long)]
        file: PathBuf,
    },
    /// Claim and run queued stages until stopped
    Worker,
    /// Re-run a job's stages inline, starting from a given stage
    Run {
        #[arg(long)]
        job: Uuid,
        #[arg(long, default_value = "mcurvas")]
        from: String,
    },
    /// Show one job's status
    Status {
        #[arg(long)]
        job: Uuid,
    },
    /// List recent jobs
    Jobs {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show a job's results, highest hybrid score first
    Results {
        #[arg(long)]
        job: Uuid,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("consumption_fraud_pipeline=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let settings = config::Settings::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Ingest { file } => {
            let job_id = pipeline::submit(&pool, &file.to_string_lossy()).await?;
            println!("Job {job_id} queued for {}.", file.display());
        }
        Commands::Labels { file } => {
            let rows = db::import_labels(&pool, &file).await?;
            println!("Imported {rows} labels from {}.", file.display());
        }
        Commands::Worker => {
            let store = JsonModelStore::new(settings.model_path.clone());
            pipeline::worker_loop(&pool, &store, Duration::from_millis(settings.worker_poll_ms))
                .await?;
        }
        Commands::Run { job, from } => {
            let stage = Stage::parse(&from).with_context(|| {
                format!(
                    "unknown stage {from:?} (expected ingest, mcurvas, msupervisado, \
                     hibridacion or publish)"
                )
            })?;
            let store = JsonModelStore::new(settings.model_path.clone());
            pipeline::run_chain(&pool, &store, job, stage).await?;
            println!("Job {job} ran to completion from {stage}.");
        }
        Commands::Status { job } => match db::fetch_job(&pool, job).await? {
            Some(job) => print!("{}", job.summary()),
            None => println!("No job with id {job}."),
        },
        Commands::Jobs { limit } => {
            let jobs = db::list_jobs(&pool, limit).await?;
            if jobs.is_empty() {
                println!("No jobs yet.");
                return Ok(());
            }
            for job in jobs {
                println!(
                    "- {} {} {} ({})",
                    job.job_id,
                    job.status,
                    job.file_uri,
                    job.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::Results { job, limit } => {
            let results = db::fetch_results(&pool, job, limit).await?;
            if results.is_empty() {
                println!("No results for job {job}.");
                return Ok(());
            }
            println!("Top accounts by hybrid score:");
            for row in results {
                println!(
                    "- {} hybrid {:.4} decision {} via {} {} (threshold {:.2})",
                    row.cuenta,
                    row.score_hibrido,
                    row.decision,
                    row.model_name,
                    row.model_version,
                    row.umbral_aplicado
                );
            }
        }
    }

    Ok(())
}
