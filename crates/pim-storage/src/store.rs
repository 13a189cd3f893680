use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pim_core::{
    Category, ClusterActivity, ClusterAssignment, CommitSummary, ClusterMetrics, ExtractedIssue, IssueCluster,
    NewCluster, SyncState, SyncStatus, Ticket, TicketAnalysis, TicketUpsert, TrendWindows,
    UpsertOutcome,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Durable state shared by the pipeline stages.
///
/// Cluster writes go through [`ClusterMetrics`], [`ClusterAssignment`] and
/// [`Store::rename_cluster`]; none of them can touch the reviewer-owned
/// `pm_status` / `pm_notes` columns.
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts or updates by `external_id`. `analyzed_at` is never reset by an update.
    async fn upsert_ticket(
        &self,
        ticket: TicketUpsert,
        synced_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn ticket_by_external_id(&self, external_id: i64) -> Result<Option<Ticket>, StoreError>;

    /// Up to `limit` tickets with no `analyzed_at`, oldest `(created_at, id)` first.
    async fn unanalyzed_tickets(&self, limit: usize) -> Result<Vec<Ticket>, StoreError>;

    /// Persists issues and analyzed timestamps atomically. Tickets already analyzed
    /// are skipped and count toward neither total.
    async fn commit_analyses(&self, analyses: Vec<TicketAnalysis>) -> Result<CommitSummary, StoreError>;

    /// Issues with no cluster, ordered by `(extracted_at, id)`.
    async fn unclustered_issues(&self) -> Result<Vec<ExtractedIssue>, StoreError>;

    async fn issues_for_cluster(
        &self,
        cluster_id: i64,
        limit: usize,
    ) -> Result<Vec<ExtractedIssue>, StoreError>;

    async fn all_issues(&self) -> Result<Vec<ExtractedIssue>, StoreError>;

    /// Active clusters of one (category, subcategory), ordered by id.
    async fn active_clusters(
        &self,
        category: Category,
        subcategory: &str,
    ) -> Result<Vec<IssueCluster>, StoreError>;

    async fn all_active_clusters(&self) -> Result<Vec<IssueCluster>, StoreError>;

    /// Every cluster, active or not, ordered by id.
    async fn clusters(&self) -> Result<Vec<IssueCluster>, StoreError>;

    /// Creates a cluster holding exactly `first_issue_id`.
    async fn create_cluster(
        &self,
        cluster: NewCluster,
        first_issue_id: i64,
    ) -> Result<IssueCluster, StoreError>;

    /// Links an unclustered issue to a cluster. An issue that already has a
    /// cluster is a [`StoreError::Conflict`].
    async fn assign_issue(&self, assignment: ClusterAssignment) -> Result<(), StoreError>;

    /// Active clusters still carrying a provisional name with at least `min_issues` issues.
    async fn provisional_clusters(&self, min_issues: i64) -> Result<Vec<IssueCluster>, StoreError>;

    async fn rename_cluster(
        &self,
        cluster_id: i64,
        name: &str,
        summary: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn cluster_activity(
        &self,
        cluster_id: i64,
        windows: &TrendWindows,
    ) -> Result<ClusterActivity, StoreError>;

    async fn update_cluster_metrics(
        &self,
        cluster_id: i64,
        metrics: ClusterMetrics,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Moves every issue of `source` into `target`, deactivates `source` and
    /// recounts `target`. Returns the number of issues moved.
    async fn merge_clusters(
        &self,
        source: i64,
        target: i64,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    async fn sync_state(&self) -> Result<SyncState, StoreError>;

    /// Stores the new watermark and adds to the running synced count.
    async fn record_sync(
        &self,
        watermark: Option<DateTime<Utc>>,
        tickets_synced: i64,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn record_analysis(
        &self,
        tickets_analyzed: i64,
        issues_extracted: i64,
    ) -> Result<(), StoreError>;

    async fn sync_status(&self) -> Result<SyncStatus, StoreError>;
}
