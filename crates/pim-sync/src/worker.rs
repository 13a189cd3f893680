//! Single-flight task runner, its status object and cron wiring.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pim_core::{
    AnalysisResult, ClusterResult, CombinedResult, StageOutcome, SyncResult, TrendResult,
};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::pipeline::Pipeline;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Sync,
    Analysis,
    Clustering,
    Trends,
    Pipeline,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Analysis => "analysis",
            Self::Clustering => "clustering",
            Self::Trends => "trends",
            Self::Pipeline => "pipeline",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What operators poll to tell "ran with skipped items" from "did not run".
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub status: TaskStatus,
    pub task: Option<TaskKind>,
    pub progress: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_result: Option<serde_json::Value>,
    pub last_error: Option<String>,
}

/// Returned by every trigger while another task holds the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("a {running} task is already running")]
pub struct Busy {
    pub running: TaskKind,
}

type Shared = Arc<Mutex<WorkerStatus>>;

fn lock(state: &Shared) -> MutexGuard<'_, WorkerStatus> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Held for the lifetime of one task. Dropping it without `finish` marks the
/// task failed so the worker never stays stuck in `running`.
pub struct RunGuard {
    state: Shared,
    finished: bool,
}

impl RunGuard {
    pub fn progress(&self, line: String) {
        lock(&self.state).progress = Some(line);
    }

    fn finish(mut self, result: serde_json::Value, error: Option<String>) {
        let mut status = lock(&self.state);
        status.status = if error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        status.completed_at = Some(Utc::now());
        status.progress = None;
        status.last_result = Some(result);
        status.last_error = error;
        drop(status);
        self.finished = true;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut status = lock(&self.state);
        status.status = TaskStatus::Failed;
        status.completed_at = Some(Utc::now());
        status.progress = None;
        status.last_error = Some("task aborted before completion".to_string());
    }
}

#[derive(Clone)]
pub struct PipelineWorker {
    pipeline: Arc<Pipeline>,
    state: Shared,
}

impl PipelineWorker {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            state: Arc::new(Mutex::new(WorkerStatus::default())),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        lock(&self.state).clone()
    }

    /// Check-and-set under one lock. A busy worker is left untouched.
    pub fn try_begin(&self, task: TaskKind) -> Result<RunGuard, Busy> {
        let mut status = lock(&self.state);
        if status.status == TaskStatus::Running {
            return Err(Busy {
                running: status.task.unwrap_or(task),
            });
        }
        *status = WorkerStatus {
            status: TaskStatus::Running,
            task: Some(task),
            progress: Some(format!("starting {task}")),
            started_at: Some(Utc::now()),
            completed_at: None,
            last_result: status.last_result.take(),
            last_error: None,
        };
        Ok(RunGuard {
            state: self.state.clone(),
            finished: false,
        })
    }

    /// Runs the full pipeline on the caller's task.
    pub async fn run_pipeline_now(
        &self,
        backfill_days: Option<u32>,
        batch_size: Option<usize>,
    ) -> Result<CombinedResult, Busy> {
        let guard = self.try_begin(TaskKind::Pipeline)?;
        Ok(run_pipeline(&self.pipeline, guard, backfill_days, batch_size).await)
    }

    pub fn trigger_pipeline(
        &self,
        backfill_days: Option<u32>,
        batch_size: Option<usize>,
    ) -> Result<JoinHandle<CombinedResult>, Busy> {
        let guard = self.try_begin(TaskKind::Pipeline)?;
        let pipeline = self.pipeline.clone();
        Ok(tokio::spawn(async move {
            run_pipeline(&pipeline, guard, backfill_days, batch_size).await
        }))
    }

    pub fn trigger_sync(
        &self,
        backfill_days: Option<u32>,
    ) -> Result<JoinHandle<StageOutcome<SyncResult>>, Busy> {
        self.spawn_stage(TaskKind::Sync, move |pipeline| async move {
            pipeline.sync(backfill_days).await
        })
    }

    pub fn trigger_analysis(
        &self,
        batch_size: Option<usize>,
    ) -> Result<JoinHandle<StageOutcome<AnalysisResult>>, Busy> {
        self.spawn_stage(TaskKind::Analysis, move |pipeline| async move {
            pipeline.analyze(batch_size).await
        })
    }

    pub fn trigger_clustering(
        &self,
    ) -> Result<JoinHandle<StageOutcome<ClusterResult>>, Busy> {
        self.spawn_stage(TaskKind::Clustering, |pipeline| async move {
            pipeline.cluster().await
        })
    }

    pub fn trigger_trends(&self) -> Result<JoinHandle<StageOutcome<TrendResult>>, Busy> {
        self.spawn_stage(TaskKind::Trends, |pipeline| async move { pipeline.trends().await })
    }

    fn spawn_stage<T, F, Fut>(&self, task: TaskKind, run: F) -> Result<JoinHandle<StageOutcome<T>>, Busy>
    where
        T: Serialize + Send + 'static,
        F: FnOnce(Arc<Pipeline>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let guard = self.try_begin(task)?;
        let pipeline = self.pipeline.clone();
        Ok(tokio::spawn(async move {
            guard.progress(format!("running {task}"));
            let outcome = StageOutcome::from_result(run(pipeline).await.map_err(|err| format!("{err:#}")));
            let error = outcome.error().map(str::to_string);
            match &error {
                Some(detail) => warn!(%task, error = %detail, "task failed"),
                None => info!(%task, "task completed"),
            }
            guard.finish(serde_json::to_value(&outcome).unwrap_or_default(), error);
            outcome
        }))
    }
}

async fn run_pipeline(
    pipeline: &Pipeline,
    guard: RunGuard,
    backfill_days: Option<u32>,
    batch_size: Option<usize>,
) -> CombinedResult {
    let report = |line: String| guard.progress(line);
    let result = pipeline
        .run_full_pipeline(backfill_days, batch_size, &report)
        .await;
    let failures = result.failures();
    let error = (!failures.is_empty()).then(|| failures.join("; "));
    guard.finish(serde_json::to_value(&result).unwrap_or_default(), error);
    result
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub pipeline_cron: String,
    pub trends_cron: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pipeline_cron: "0 0 2 * * *".to_string(),
            trends_cron: "0 0 * * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledJob {
    pub id: &'static str,
    pub name: &'static str,
    pub cron: String,
}

pub fn scheduled_jobs(config: &ScheduleConfig) -> Vec<ScheduledJob> {
    vec![
        ScheduledJob {
            id: "daily_pipeline",
            name: "Sync, analyze, cluster and update trends",
            cron: config.pipeline_cron.clone(),
        },
        ScheduledJob {
            id: "hourly_trends",
            name: "Update cluster trends",
            cron: config.trends_cron.clone(),
        },
    ]
}

/// Builds (without starting) the cron scheduler. Jobs that fire while the
/// worker is busy are skipped.
pub async fn build_scheduler(worker: PipelineWorker, config: &ScheduleConfig) -> Result<Option<JobScheduler>> {
    if !config.enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let pipeline_worker = worker.clone();
    let pipeline_job = Job::new_async(&config.pipeline_cron, move |_uuid, _l| {
        let worker = pipeline_worker.clone();
        Box::pin(async move {
            match worker.trigger_pipeline(None, None) {
                Ok(handle) => {
                    if let Err(err) = handle.await {
                        warn!(error = %err, "scheduled pipeline task panicked");
                    }
                }
                Err(busy) => warn!(%busy, "scheduled pipeline skipped"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.pipeline_cron))?;
    sched.add(pipeline_job).await.context("adding pipeline job")?;

    let trends_job = Job::new_async(&config.trends_cron, move |_uuid, _l| {
        let worker = worker.clone();
        Box::pin(async move {
            match worker.trigger_trends() {
                Ok(handle) => {
                    if let Err(err) = handle.await {
                        warn!(error = %err, "scheduled trends task panicked");
                    }
                }
                Err(busy) => warn!(%busy, "scheduled trends update skipped"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.trends_cron))?;
    sched.add(trends_job).await.context("adding trends job")?;

    info!(
        pipeline_cron = %config.pipeline_cron,
        trends_cron = %config.trends_cron,
        "scheduler configured"
    );
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisConfig, AnalysisPipeline};
    use crate::cluster::{ClusterConfig, ClusterEngine};
    use crate::sync::{SyncEngine, SyncOptions};
    use crate::testing::{FakeSource, Script, ScriptedClassifier};
    use pim_storage::MemoryStore;

    fn worker(source: FakeSource) -> PipelineWorker {
        let store = Arc::new(MemoryStore::new());
        let classifier = Arc::new(ScriptedClassifier::new(Script::Issues(vec![])));
        PipelineWorker::new(Arc::new(Pipeline::new(
            SyncEngine::new(store.clone(), Arc::new(source), SyncOptions::default()),
            AnalysisPipeline::new(store.clone(), classifier.clone(), AnalysisConfig::default()),
            ClusterEngine::new(store, classifier, ClusterConfig::default()),
        )))
    }

    #[tokio::test]
    async fn second_trigger_while_running_is_rejected_without_side_effects() {
        let worker = worker(FakeSource::default());
        let guard = worker.try_begin(TaskKind::Pipeline).unwrap();
        guard.progress("syncing tickets".into());
        let before = worker.status();

        let busy = worker.trigger_pipeline(None, None).unwrap_err();
        assert_eq!(busy.running, TaskKind::Pipeline);
        assert!(worker.trigger_sync(None).is_err());
        assert!(worker.trigger_trends().is_err());
        assert!(worker.run_pipeline_now(None, None).await.is_err());
        assert_eq!(worker.status(), before);

        drop(guard);
        let after = worker.status();
        assert_eq!(after.status, TaskStatus::Failed);
        assert!(after.last_error.is_some());
        assert!(worker.try_begin(TaskKind::Trends).is_ok());
    }

    #[tokio::test]
    async fn stage_trigger_reports_completion_and_result() {
        let worker = worker(FakeSource::default());
        assert_eq!(worker.status().status, TaskStatus::Idle);

        let outcome = worker.trigger_sync(Some(1)).unwrap().await.unwrap();
        assert!(matches!(outcome, StageOutcome::Completed(_)));

        let status = worker.status();
        assert_eq!(status.status, TaskStatus::Completed);
        assert_eq!(status.task, Some(TaskKind::Sync));
        assert!(status.completed_at >= status.started_at);
        let result = status.last_result.unwrap();
        assert_eq!(result["outcome"], "completed");
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn failing_stage_marks_pipeline_failed_with_error_text() {
        let worker = worker(FakeSource {
            search_unreachable: true,
            ..FakeSource::default()
        });
        let result = worker.trigger_pipeline(None, None).unwrap().await.unwrap();
        assert_eq!(result.failures().len(), 1);

        let status = worker.status();
        assert_eq!(status.status, TaskStatus::Failed);
        assert!(status.last_error.unwrap().starts_with("sync: "));
        assert!(status.last_result.is_some());
        assert!(status.progress.is_none());

        // the worker is free again once a run ends
        assert!(worker.run_pipeline_now(None, None).await.is_ok());
    }

    #[tokio::test]
    async fn disabled_schedule_builds_no_scheduler() {
        let worker = worker(FakeSource::default());
        let config = ScheduleConfig::default();
        assert!(build_scheduler(worker, &config).await.unwrap().is_none());

        let jobs = scheduled_jobs(&config);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].cron, "0 0 2 * * *");
        assert_eq!(jobs[1].cron, "0 0 * * * *");
    }
}
