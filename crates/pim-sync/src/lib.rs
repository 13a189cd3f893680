//! Ticket sync, issue extraction, clustering and trends, plus the worker that drives them.

use std::sync::Arc;

use anyhow::{Context, Result};
use pim_adapters::{LlmIssueClassifier, TicketingClient};
use pim_storage::{MemoryStore, PgStore, Store};
use tracing::{info, warn};

pub mod analysis;
pub mod cluster;
pub mod config;
pub mod export;
pub mod pipeline;
pub mod sync;
pub mod worker;

#[cfg(test)]
mod testing;

pub use analysis::{AnalysisConfig, AnalysisPipeline};
pub use cluster::{cluster_tokens, overlap_score, tokenize, ClusterConfig, ClusterEngine};
pub use config::PipelineConfig;
pub use export::{export_snapshot, SnapshotFile, SnapshotManifest};
pub use pipeline::{Pipeline, Progress};
pub use sync::{SyncEngine, SyncOptions};
pub use worker::{
    build_scheduler, scheduled_jobs, Busy, PipelineWorker, RunGuard, ScheduleConfig, ScheduledJob,
    TaskKind, TaskStatus, WorkerStatus,
};

pub const CRATE_NAME: &str = "pim-sync";

const DEFAULT_POOL_SIZE: u32 = 5;

/// Postgres when `DATABASE_URL` is set, otherwise a process-local store.
pub async fn open_store(config: &PipelineConfig) -> Result<Arc<dyn Store>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url, DEFAULT_POOL_SIZE)
                .await
                .context("connecting to postgres")?;
            info!("using postgres store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store, nothing will persist");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Wires the live ticketing and classifier clients into the three stages.
pub fn pipeline_from_config(config: &PipelineConfig, store: Arc<dyn Store>) -> Result<Pipeline> {
    let source = TicketingClient::new(config.ticketing.clone()).context("building ticketing client")?;
    let classifier =
        Arc::new(LlmIssueClassifier::new(config.classifier.clone()).context("building classifier client")?);

    Ok(Pipeline::new(
        SyncEngine::new(store.clone(), Arc::new(source), config.sync),
        AnalysisPipeline::new(store.clone(), classifier.clone(), config.analysis),
        ClusterEngine::new(store, classifier, ClusterConfig::default()),
    ))
}
