use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pim_core::{
    Category, ClusterActivity, ClusterAssignment, CommitSummary, ClusterMetrics, ExtractedIssue, IssueCluster,
    NewCluster, SyncState, SyncStatus, Ticket, TicketAnalysis, TicketUpsert, TrendWindows,
    UpsertOutcome, PROVISIONAL_PREFIX,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::store::{Store, StoreError};

const TICKET_COLUMNS: &str = "id, external_id, subject, description, internal_notes, public_comments, \
     requester_id, requester_email, organization_id, organization_name, tags, status, priority, \
     created_at, updated_at, synced_at, analyzed_at";

const ISSUE_COLUMNS: &str = "id, ticket_id, category, subcategory, issue_type, severity, summary, \
     detail, representative_quote, confidence, cluster_id, extracted_at";

const CLUSTER_COLUMNS: &str = "id, category, subcategory, name, summary, issue_count, unique_customers, \
     first_seen, last_seen, count_7d, count_prior_7d, trend_pct, is_active, pm_status, pm_notes, \
     created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn parse_column<T: std::str::FromStr>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|err: T::Err| StoreError::Corrupt(format!("{column}: {err}")))
}

fn ticket_from_row(row: &PgRow) -> Result<Ticket, StoreError> {
    Ok(Ticket {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        subject: row.try_get("subject")?,
        description: row.try_get("description")?,
        internal_notes: row.try_get("internal_notes")?,
        public_comments: row.try_get("public_comments")?,
        requester_id: row.try_get("requester_id")?,
        requester_email: row.try_get("requester_email")?,
        organization_id: row.try_get("organization_id")?,
        organization_name: row.try_get("organization_name")?,
        tags: row.try_get("tags")?,
        status: row.try_get("status")?,
        priority: row.try_get("priority")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        synced_at: row.try_get("synced_at")?,
        analyzed_at: row.try_get("analyzed_at")?,
    })
}

fn issue_from_row(row: &PgRow) -> Result<ExtractedIssue, StoreError> {
    Ok(ExtractedIssue {
        id: row.try_get("id")?,
        ticket_id: row.try_get("ticket_id")?,
        category: parse_column(row, "category")?,
        subcategory: row.try_get("subcategory")?,
        issue_type: parse_column(row, "issue_type")?,
        severity: parse_column(row, "severity")?,
        summary: row.try_get("summary")?,
        detail: row.try_get("detail")?,
        representative_quote: row.try_get("representative_quote")?,
        confidence: row.try_get("confidence")?,
        cluster_id: row.try_get("cluster_id")?,
        extracted_at: row.try_get("extracted_at")?,
    })
}

fn cluster_from_row(row: &PgRow) -> Result<IssueCluster, StoreError> {
    Ok(IssueCluster {
        id: row.try_get("id")?,
        category: parse_column(row, "category")?,
        subcategory: row.try_get("subcategory")?,
        name: row.try_get("name")?,
        summary: row.try_get("summary")?,
        issue_count: row.try_get("issue_count")?,
        unique_customers: row.try_get("unique_customers")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
        count_7d: row.try_get("count_7d")?,
        count_prior_7d: row.try_get("count_prior_7d")?,
        trend_pct: row.try_get("trend_pct")?,
        is_active: row.try_get("is_active")?,
        pm_status: parse_column(row, "pm_status")?,
        pm_notes: row.try_get("pm_notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn collect<T>(
    rows: Vec<PgRow>,
    map: fn(&PgRow) -> Result<T, StoreError>,
) -> Result<Vec<T>, StoreError> {
    rows.iter().map(map).collect()
}

fn state_from_row(row: &PgRow) -> Result<SyncState, StoreError> {
    Ok(SyncState {
        watermark: row.try_get("watermark")?,
        last_sync_at: row.try_get("last_sync_at")?,
        tickets_synced: row.try_get("tickets_synced")?,
        tickets_analyzed: row.try_get("tickets_analyzed")?,
        issues_extracted: row.try_get("issues_extracted")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_ticket(
        &self,
        ticket: TicketUpsert,
        synced_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        // xmax = 0 only for freshly inserted rows
        let row = sqlx::query(
            r#"
            INSERT INTO tickets (external_id, subject, description, internal_notes, public_comments,
                                 requester_id, requester_email, organization_id, organization_name,
                                 tags, status, priority, created_at, updated_at, synced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (external_id) DO UPDATE
               SET subject = EXCLUDED.subject,
                   description = EXCLUDED.description,
                   internal_notes = EXCLUDED.internal_notes,
                   public_comments = EXCLUDED.public_comments,
                   requester_id = EXCLUDED.requester_id,
                   requester_email = EXCLUDED.requester_email,
                   organization_id = EXCLUDED.organization_id,
                   organization_name = EXCLUDED.organization_name,
                   tags = EXCLUDED.tags,
                   status = EXCLUDED.status,
                   priority = EXCLUDED.priority,
                   created_at = EXCLUDED.created_at,
                   updated_at = EXCLUDED.updated_at,
                   synced_at = EXCLUDED.synced_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(ticket.external_id)
        .bind(ticket.subject)
        .bind(ticket.description)
        .bind(ticket.internal_notes)
        .bind(ticket.public_comments)
        .bind(ticket.requester_id)
        .bind(ticket.requester_email)
        .bind(ticket.organization_id)
        .bind(ticket.organization_name)
        .bind(ticket.tags)
        .bind(ticket.status)
        .bind(ticket.priority)
        .bind(ticket.created_at)
        .bind(ticket.updated_at)
        .bind(synced_at)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn ticket_by_external_id(&self, external_id: i64) -> Result<Option<Ticket>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(ticket_from_row).transpose()
    }

    async fn unanalyzed_tickets(&self, limit: usize) -> Result<Vec<Ticket>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE analyzed_at IS NULL \
             ORDER BY created_at, id LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, ticket_from_row)
    }

    async fn commit_analyses(&self, analyses: Vec<TicketAnalysis>) -> Result<CommitSummary, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut summary = CommitSummary::default();
        for analysis in analyses {
            let marked = sqlx::query(
                "UPDATE tickets SET analyzed_at = $2 WHERE id = $1 AND analyzed_at IS NULL",
            )
            .bind(analysis.ticket_id)
            .bind(analysis.analyzed_at)
            .execute(&mut *tx)
            .await?;
            if marked.rows_affected() == 0 {
                continue;
            }
            summary.tickets_marked += 1;

            for issue in analysis.issues {
                sqlx::query(
                    r#"
                    INSERT INTO extracted_issues (ticket_id, category, subcategory, issue_type, severity,
                                                  summary, detail, representative_quote, confidence,
                                                  extracted_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    "#,
                )
                .bind(analysis.ticket_id)
                .bind(issue.category.as_str())
                .bind(&issue.subcategory)
                .bind(issue.issue_type.as_str())
                .bind(issue.severity.as_str())
                .bind(&issue.summary)
                .bind(&issue.detail)
                .bind(&issue.representative_quote)
                .bind(issue.confidence)
                .bind(analysis.analyzed_at)
                .execute(&mut *tx)
                .await?;
                summary.issues_inserted += 1;
            }
        }
        tx.commit().await?;
        Ok(summary)
    }

    async fn unclustered_issues(&self) -> Result<Vec<ExtractedIssue>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ISSUE_COLUMNS} FROM extracted_issues WHERE cluster_id IS NULL \
             ORDER BY extracted_at, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        collect(rows, issue_from_row)
    }

    async fn issues_for_cluster(
        &self,
        cluster_id: i64,
        limit: usize,
    ) -> Result<Vec<ExtractedIssue>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ISSUE_COLUMNS} FROM extracted_issues WHERE cluster_id = $1 ORDER BY id LIMIT $2"
        ))
        .bind(cluster_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, issue_from_row)
    }

    async fn all_issues(&self) -> Result<Vec<ExtractedIssue>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ISSUE_COLUMNS} FROM extracted_issues ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        collect(rows, issue_from_row)
    }

    async fn active_clusters(
        &self,
        category: Category,
        subcategory: &str,
    ) -> Result<Vec<IssueCluster>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM issue_clusters \
             WHERE is_active AND category = $1 AND subcategory = $2 ORDER BY id"
        ))
        .bind(category.as_str())
        .bind(subcategory)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, cluster_from_row)
    }

    async fn all_active_clusters(&self) -> Result<Vec<IssueCluster>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM issue_clusters WHERE is_active ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        collect(rows, cluster_from_row)
    }

    async fn clusters(&self) -> Result<Vec<IssueCluster>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM issue_clusters ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        collect(rows, cluster_from_row)
    }

    async fn create_cluster(
        &self,
        cluster: NewCluster,
        first_issue_id: i64,
    ) -> Result<IssueCluster, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "INSERT INTO issue_clusters (category, subcategory, name, issue_count, first_seen, \
                                         last_seen, created_at, updated_at) \
             VALUES ($1, $2, $3, 1, $4, $4, $4, $4) RETURNING {CLUSTER_COLUMNS}"
        ))
        .bind(cluster.category.as_str())
        .bind(&cluster.subcategory)
        .bind(&cluster.name)
        .bind(cluster.seen_at)
        .fetch_one(&mut *tx)
        .await?;
        let created = cluster_from_row(&row)?;

        let linked = sqlx::query(
            "UPDATE extracted_issues SET cluster_id = $1 WHERE id = $2 AND cluster_id IS NULL",
        )
        .bind(created.id)
        .bind(first_issue_id)
        .execute(&mut *tx)
        .await?;
        if linked.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "issue {first_issue_id} is missing or already clustered"
            )));
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn assign_issue(&self, assignment: ClusterAssignment) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let linked = sqlx::query(
            "UPDATE extracted_issues SET cluster_id = $1 WHERE id = $2 AND cluster_id IS NULL",
        )
        .bind(assignment.cluster_id)
        .bind(assignment.issue_id)
        .execute(&mut *tx)
        .await?;
        if linked.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "issue {} is missing or already clustered",
                assignment.issue_id
            )));
        }

        let counted = sqlx::query(
            r#"
            UPDATE issue_clusters
               SET issue_count = issue_count + 1,
                   first_seen = LEAST(COALESCE(first_seen, $2), $2),
                   last_seen = GREATEST(COALESCE(last_seen, $2), $2)
             WHERE id = $1
            "#,
        )
        .bind(assignment.cluster_id)
        .bind(assignment.seen_at)
        .execute(&mut *tx)
        .await?;
        if counted.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "cluster",
                id: assignment.cluster_id,
            });
        }
        tx.commit().await?;
        Ok(())
    }

    async fn provisional_clusters(&self, min_issues: i64) -> Result<Vec<IssueCluster>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM issue_clusters \
             WHERE is_active AND starts_with(name, $1) AND issue_count >= $2 ORDER BY id"
        ))
        .bind(PROVISIONAL_PREFIX)
        .bind(min_issues)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, cluster_from_row)
    }

    async fn rename_cluster(
        &self,
        cluster_id: i64,
        name: &str,
        summary: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE issue_clusters SET name = $2, summary = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(cluster_id)
        .bind(name)
        .bind(summary)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "cluster",
                id: cluster_id,
            });
        }
        Ok(())
    }

    async fn cluster_activity(
        &self,
        cluster_id: i64,
        windows: &TrendWindows,
    ) -> Result<ClusterActivity, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FILTER (WHERE i.extracted_at >= $3 AND i.extracted_at < $4) AS count_7d,
                   COUNT(*) FILTER (WHERE i.extracted_at >= $2 AND i.extracted_at < $3) AS count_prior_7d,
                   COUNT(DISTINCT t.organization_id) AS unique_customers
              FROM extracted_issues i
              JOIN tickets t ON t.id = i.ticket_id
             WHERE i.cluster_id = $1
            "#,
        )
        .bind(cluster_id)
        .bind(windows.prior_start)
        .bind(windows.recent_start)
        .bind(windows.end)
        .fetch_one(&self.pool)
        .await?;

        Ok(ClusterActivity {
            count_7d: row.try_get("count_7d")?,
            count_prior_7d: row.try_get("count_prior_7d")?,
            unique_customers: row.try_get("unique_customers")?,
        })
    }

    async fn update_cluster_metrics(
        &self,
        cluster_id: i64,
        metrics: ClusterMetrics,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE issue_clusters
               SET count_7d = $2,
                   count_prior_7d = $3,
                   trend_pct = $4,
                   unique_customers = $5,
                   updated_at = $6
             WHERE id = $1
            "#,
        )
        .bind(cluster_id)
        .bind(metrics.count_7d)
        .bind(metrics.count_prior_7d)
        .bind(metrics.trend_pct)
        .bind(metrics.unique_customers)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "cluster",
                id: cluster_id,
            });
        }
        Ok(())
    }

    async fn merge_clusters(
        &self,
        source: i64,
        target: i64,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        if source == target {
            return Err(StoreError::Conflict(format!("cannot merge cluster {source} into itself")));
        }
        let mut tx = self.pool.begin().await?;

        let target_active: Option<bool> =
            sqlx::query_scalar("SELECT is_active FROM issue_clusters WHERE id = $1 FOR UPDATE")
                .bind(target)
                .fetch_optional(&mut *tx)
                .await?;
        match target_active {
            None => return Err(StoreError::NotFound { entity: "cluster", id: target }),
            Some(false) => {
                return Err(StoreError::Conflict(format!("cluster {target} is inactive")))
            }
            Some(true) => {}
        }

        let deactivated = sqlx::query(
            "UPDATE issue_clusters SET is_active = FALSE, issue_count = 0, updated_at = $2 WHERE id = $1",
        )
        .bind(source)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if deactivated.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "cluster", id: source });
        }

        let moved = sqlx::query("UPDATE extracted_issues SET cluster_id = $2 WHERE cluster_id = $1")
            .bind(source)
            .bind(target)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query(
            r#"
            UPDATE issue_clusters c
               SET issue_count = agg.n,
                   first_seen = agg.first_seen,
                   last_seen = agg.last_seen,
                   updated_at = $2
              FROM (SELECT COUNT(*) AS n, MIN(extracted_at) AS first_seen, MAX(extracted_at) AS last_seen
                      FROM extracted_issues WHERE cluster_id = $1) agg
             WHERE c.id = $1
            "#,
        )
        .bind(target)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(moved as usize)
    }

    async fn sync_state(&self) -> Result<SyncState, StoreError> {
        let row = sqlx::query(
            "SELECT watermark, last_sync_at, tickets_synced, tickets_analyzed, issues_extracted \
             FROM sync_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(state_from_row)
            .transpose()
            .map(Option::unwrap_or_default)
    }

    async fn record_sync(
        &self,
        watermark: Option<DateTime<Utc>>,
        tickets_synced: i64,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (id, watermark, last_sync_at, tickets_synced)
            VALUES (1, $1, $2, $3)
            ON CONFLICT (id) DO UPDATE
               SET watermark = GREATEST(sync_state.watermark, EXCLUDED.watermark),
                   last_sync_at = EXCLUDED.last_sync_at,
                   tickets_synced = sync_state.tickets_synced + EXCLUDED.tickets_synced
            "#,
        )
        .bind(watermark)
        .bind(completed_at)
        .bind(tickets_synced)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_analysis(
        &self,
        tickets_analyzed: i64,
        issues_extracted: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (id, tickets_analyzed, issues_extracted)
            VALUES (1, $1, $2)
            ON CONFLICT (id) DO UPDATE
               SET tickets_analyzed = sync_state.tickets_analyzed + EXCLUDED.tickets_analyzed,
                   issues_extracted = sync_state.issues_extracted + EXCLUDED.issues_extracted
            "#,
        )
        .bind(tickets_analyzed)
        .bind(issues_extracted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sync_status(&self) -> Result<SyncStatus, StoreError> {
        let state = self.sync_state().await?;
        let totals = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM tickets) AS total_tickets, \
                    (SELECT COUNT(*) FROM extracted_issues) AS total_issues",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(SyncStatus {
            state,
            total_tickets: totals.try_get("total_tickets")?,
            total_issues: totals.try_get("total_issues")?,
        })
    }
}
