use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pim_storage::{PgStore, Store};
use pim_sync::{
    build_scheduler, export_snapshot, open_store, pipeline_from_config, Pipeline, PipelineConfig,
    PipelineWorker,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "pim-cli")]
#[command(about = "Product issue miner: ticket sync, issue extraction, clustering and trends")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull tickets updated since the watermark, or over a fixed window.
    Sync {
        #[arg(long)]
        backfill_days: Option<u32>,
    },
    /// Classify tickets that have not been analyzed yet.
    Analyze {
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Assign unclustered issues and name grown clusters.
    Cluster,
    /// Recompute week-over-week counts for every active cluster.
    Trends,
    /// Run sync, analysis, clustering and trends in order.
    Run {
        #[arg(long)]
        backfill_days: Option<u32>,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Fold one cluster into another.
    Merge {
        #[arg(long)]
        source: i64,
        #[arg(long)]
        target: i64,
    },
    /// Serve the trigger/status API and, when enabled, the cron jobs.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Write a parquet snapshot of clusters and issues.
    Export {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("PIM_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing result")?);
    Ok(())
}

async fn migrate(config: &PipelineConfig) -> Result<()> {
    let Some(url) = config.database_url.as_deref() else {
        bail!("DATABASE_URL must be set to run migrations");
    };
    let store = PgStore::connect(url, 1).await.context("connecting to postgres")?;
    store.migrate().await.context("applying migrations")?;
    info!("migrations applied");
    Ok(())
}

async fn wire(config: &PipelineConfig) -> Result<(Arc<dyn Store>, Arc<Pipeline>)> {
    let store = open_store(config).await?;
    let pipeline = pipeline_from_config(config, store.clone())?;
    Ok((store, Arc::new(pipeline)))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { backfill_days: None }) {
        Commands::Sync { backfill_days } => {
            let (_, pipeline) = wire(&config).await?;
            print_json(&pipeline.sync(backfill_days).await?)?;
        }
        Commands::Analyze { batch_size } => {
            let (_, pipeline) = wire(&config).await?;
            print_json(&pipeline.analyze(batch_size).await?)?;
        }
        Commands::Cluster => {
            let (_, pipeline) = wire(&config).await?;
            print_json(&pipeline.cluster().await?)?;
        }
        Commands::Trends => {
            let (_, pipeline) = wire(&config).await?;
            print_json(&pipeline.trends().await?)?;
        }
        Commands::Run {
            backfill_days,
            batch_size,
        } => {
            let (_, pipeline) = wire(&config).await?;
            let worker = PipelineWorker::new(pipeline);
            let result = worker.run_pipeline_now(backfill_days, batch_size).await?;
            print_json(&result)?;
            let failures = result.failures();
            if !failures.is_empty() {
                bail!("pipeline finished with failed stages: {}", failures.join("; "));
            }
        }
        Commands::Merge { source, target } => {
            let (_, pipeline) = wire(&config).await?;
            let moved = pipeline.clusters.merge(source, target).await?;
            println!("moved {moved} issues from cluster {source} into {target}");
        }
        Commands::Serve => {
            let (store, pipeline) = wire(&config).await?;
            let worker = PipelineWorker::new(pipeline);
            let scheduler = build_scheduler(worker.clone(), &config.schedule).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!("scheduler started");
            }
            let state = pim_web::AppState::new(worker, store, config.schedule.clone());
            pim_web::serve(state, config.web_port).await?;
        }
        Commands::Migrate => migrate(&config).await?,
        Commands::Export { dir } => {
            let store = open_store(&config).await?;
            let dir = dir.unwrap_or_else(|| config.export_dir.clone());
            let manifest = export_snapshot(store.as_ref(), &dir, Uuid::new_v4()).await?;
            print_json(&manifest)?;
        }
    }

    Ok(())
}
