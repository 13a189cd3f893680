//! Sync, analysis, clustering and trends run back to back.

use anyhow::Result;
use chrono::Utc;
use pim_core::{
    AnalysisResult, ClusterResult, CombinedResult, StageOutcome, SyncResult, TrendResult,
};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::analysis::AnalysisPipeline;
use crate::cluster::ClusterEngine;
use crate::sync::SyncEngine;

/// Receives one line per stage transition while a run is in flight.
pub type Progress<'a> = dyn Fn(String) + Send + Sync + 'a;

/// The three pipeline stages, shared by the worker and the CLI.
pub struct Pipeline {
    pub sync: SyncEngine,
    pub analysis: AnalysisPipeline,
    pub clusters: ClusterEngine,
}

fn stage<T>(name: &str, result: Result<T>) -> StageOutcome<T> {
    if let Err(err) = &result {
        let detail = format!("{err:#}");
        error!(stage = name, error = %detail, "pipeline stage failed");
    }
    StageOutcome::from_result(result.map_err(|err| format!("{err:#}")))
}

impl Pipeline {
    pub fn new(sync: SyncEngine, analysis: AnalysisPipeline, clusters: ClusterEngine) -> Self {
        Self {
            sync,
            analysis,
            clusters,
        }
    }

    pub async fn sync(&self, backfill_days: Option<u32>) -> Result<SyncResult> {
        self.sync.sync(backfill_days).await
    }

    pub async fn analyze(&self, batch_size: Option<usize>) -> Result<AnalysisResult> {
        let batch_size = batch_size.unwrap_or(self.analysis.config().batch_size);
        self.analysis.analyze_unprocessed(batch_size).await
    }

    pub async fn cluster(&self) -> Result<ClusterResult> {
        self.clusters.assign_clusters().await
    }

    pub async fn trends(&self) -> Result<TrendResult> {
        self.clusters.update_trends(Utc::now()).await
    }

    /// Runs every stage in order. A failed stage is recorded and the next one
    /// still runs, since each stage reads only durable state.
    pub async fn run_full_pipeline(
        &self,
        backfill_days: Option<u32>,
        batch_size: Option<usize>,
        progress: &Progress<'_>,
    ) -> CombinedResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        async move {
            info!(?backfill_days, ?batch_size, "pipeline run started");

            progress("syncing tickets".to_string());
            let sync = stage("sync", self.sync(backfill_days).await);

            progress("analyzing tickets".to_string());
            let analysis = stage("analysis", self.analyze(batch_size).await);

            progress("clustering issues".to_string());
            let clustering = stage("clustering", self.cluster().await);

            progress("updating trends".to_string());
            let trends = stage("trends", self.trends().await);

            let result = CombinedResult {
                run_id,
                started_at,
                finished_at: Utc::now(),
                sync,
                analysis,
                clustering,
                trends,
            };
            let failures = result.failures();
            info!(failed_stages = failures.len(), "pipeline run finished");
            result
        }
        .instrument(info_span!("pipeline_run", %run_id))
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::analysis::AnalysisConfig;
    use crate::cluster::ClusterConfig;
    use crate::sync::SyncOptions;
    use crate::testing::{candidate, remote_ticket, FakeSource, Script, ScriptedClassifier};
    use chrono::Duration;
    use pim_core::Category;
    use pim_storage::{MemoryStore, Store};

    fn build(
        store: Arc<MemoryStore>,
        source: Arc<FakeSource>,
        classifier: Arc<ScriptedClassifier>,
    ) -> Pipeline {
        Pipeline::new(
            SyncEngine::new(store.clone(), source, SyncOptions::default()),
            AnalysisPipeline::new(store.clone(), classifier.clone(), AnalysisConfig::default()),
            ClusterEngine::new(store, classifier, ClusterConfig::default()),
        )
    }

    #[tokio::test]
    async fn full_run_moves_tickets_through_every_stage() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let source = Arc::new(FakeSource::with_tickets(vec![
            remote_ticket(1, now - Duration::hours(3), Some(10)),
            remote_ticket(2, now - Duration::hours(2), Some(11)),
        ]));
        let classifier = Arc::new(ScriptedClassifier::new(Script::Issues(vec![candidate(
            Category::TimeAndAttendance,
            "punch_in_out",
            "Clock-in button unresponsive on Android",
        )])));
        let pipeline = build(store.clone(), source, classifier);

        let lines = Mutex::new(Vec::new());
        let record = |line: String| lines.lock().unwrap().push(line);
        let result = pipeline.run_full_pipeline(None, None, &record).await;

        assert!(result.failures().is_empty(), "{:?}", result.failures());
        assert_eq!(lines.lock().unwrap().len(), 4);
        match (&result.sync, &result.analysis, &result.clustering, &result.trends) {
            (
                StageOutcome::Completed(sync),
                StageOutcome::Completed(analysis),
                StageOutcome::Completed(clustering),
                StageOutcome::Completed(trends),
            ) => {
                assert_eq!(sync.tickets_synced, 2);
                assert_eq!(analysis.issues_extracted, 2);
                assert_eq!(clustering.new_clusters, 1);
                assert_eq!(clustering.issues_clustered, 2);
                assert_eq!(clustering.joined_existing, 0);
                assert_eq!(trends.clusters_updated, 1);
            }
            other => panic!("unexpected outcomes {other:?}"),
        }

        let cluster = &store.clusters().await.unwrap()[0];
        assert_eq!(cluster.count_7d, 2);
        assert_eq!(cluster.unique_customers, 2);
    }

    #[tokio::test]
    async fn failed_sync_is_reported_and_later_stages_still_run() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(FakeSource {
            search_unreachable: true,
            ..FakeSource::default()
        });
        let classifier = Arc::new(ScriptedClassifier::new(Script::Issues(vec![])));
        let result = build(store, source, classifier)
            .run_full_pipeline(Some(7), Some(10), &|_| {})
            .await;

        let failures = result.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].starts_with("sync: searching for updated tickets"));
        assert!(matches!(result.analysis, StageOutcome::Completed(_)));
        assert!(matches!(result.trends, StageOutcome::Completed(_)));
    }
}
