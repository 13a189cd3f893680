use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pim_core::{
    Category, ClusterActivity, ClusterAssignment, CommitSummary, ClusterMetrics, ExtractedIssue, IssueCluster,
    NewCluster, PmStatus, SyncState, SyncStatus, Ticket, TicketAnalysis, TicketUpsert,
    TrendWindows, UpsertOutcome, PROVISIONAL_PREFIX,
};
use tokio::sync::Mutex;

use crate::store::{Store, StoreError};

/// Arena-backed store; every id is its row's index plus one.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    tickets: Vec<Ticket>,
    issues: Vec<ExtractedIssue>,
    clusters: Vec<IssueCluster>,
    sync_state: SyncState,
}

impl Tables {
    fn ticket(&self, id: i64) -> Option<&Ticket> {
        self.tickets.get(index(id)?)
    }

    fn cluster_mut(&mut self, id: i64) -> Result<&mut IssueCluster, StoreError> {
        index(id)
            .and_then(|idx| self.clusters.get_mut(idx))
            .ok_or(StoreError::NotFound {
                entity: "cluster",
                id,
            })
    }
}

fn index(id: i64) -> Option<usize> {
    usize::try_from(id).ok()?.checked_sub(1)
}

fn next_id(len: usize) -> i64 {
    len as i64 + 1
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides a cluster's reviewer-owned fields, as the review UI would.
    pub async fn set_review(
        &self,
        cluster_id: i64,
        status: PmStatus,
        notes: Option<String>,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.lock().await;
        let cluster = tables.cluster_mut(cluster_id)?;
        cluster.pm_status = status;
        cluster.pm_notes = notes;
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_ticket(
        &self,
        ticket: TicketUpsert,
        synced_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut tables = self.inner.lock().await;
        if let Some(existing) = tables
            .tickets
            .iter_mut()
            .find(|t| t.external_id == ticket.external_id)
        {
            existing.subject = ticket.subject;
            existing.description = ticket.description;
            existing.internal_notes = ticket.internal_notes;
            existing.public_comments = ticket.public_comments;
            existing.requester_id = ticket.requester_id;
            existing.requester_email = ticket.requester_email;
            existing.organization_id = ticket.organization_id;
            existing.organization_name = ticket.organization_name;
            existing.tags = ticket.tags;
            existing.status = ticket.status;
            existing.priority = ticket.priority;
            existing.created_at = ticket.created_at;
            existing.updated_at = ticket.updated_at;
            existing.synced_at = synced_at;
            return Ok(UpsertOutcome::Updated);
        }

        let id = next_id(tables.tickets.len());
        tables.tickets.push(Ticket {
            id,
            external_id: ticket.external_id,
            subject: ticket.subject,
            description: ticket.description,
            internal_notes: ticket.internal_notes,
            public_comments: ticket.public_comments,
            requester_id: ticket.requester_id,
            requester_email: ticket.requester_email,
            organization_id: ticket.organization_id,
            organization_name: ticket.organization_name,
            tags: ticket.tags,
            status: ticket.status,
            priority: ticket.priority,
            created_at: ticket.created_at,
            updated_at: ticket.updated_at,
            synced_at,
            analyzed_at: None,
        });
        Ok(UpsertOutcome::Inserted)
    }

    async fn ticket_by_external_id(&self, external_id: i64) -> Result<Option<Ticket>, StoreError> {
        let tables = self.inner.lock().await;
        Ok(tables
            .tickets
            .iter()
            .find(|t| t.external_id == external_id)
            .cloned())
    }

    async fn unanalyzed_tickets(&self, limit: usize) -> Result<Vec<Ticket>, StoreError> {
        let tables = self.inner.lock().await;
        let mut pending: Vec<Ticket> = tables
            .tickets
            .iter()
            .filter(|t| t.analyzed_at.is_none())
            .cloned()
            .collect();
        pending.sort_by_key(|t| (t.created_at, t.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn commit_analyses(&self, analyses: Vec<TicketAnalysis>) -> Result<CommitSummary, StoreError> {
        let mut tables = self.inner.lock().await;
        for analysis in &analyses {
            if tables.ticket(analysis.ticket_id).is_none() {
                return Err(StoreError::NotFound {
                    entity: "ticket",
                    id: analysis.ticket_id,
                });
            }
        }

        let mut summary = CommitSummary::default();
        for analysis in analyses {
            let Some(idx) = index(analysis.ticket_id) else {
                continue;
            };
            if tables.tickets[idx].analyzed_at.is_some() {
                continue;
            }
            tables.tickets[idx].analyzed_at = Some(analysis.analyzed_at);
            summary.tickets_marked += 1;
            for candidate in analysis.issues {
                let id = next_id(tables.issues.len());
                tables.issues.push(ExtractedIssue {
                    id,
                    ticket_id: analysis.ticket_id,
                    category: candidate.category,
                    subcategory: candidate.subcategory,
                    issue_type: candidate.issue_type,
                    severity: candidate.severity,
                    summary: candidate.summary,
                    detail: candidate.detail,
                    representative_quote: candidate.representative_quote,
                    confidence: candidate.confidence,
                    cluster_id: None,
                    extracted_at: analysis.analyzed_at,
                });
                summary.issues_inserted += 1;
            }
        }
        Ok(summary)
    }

    async fn unclustered_issues(&self) -> Result<Vec<ExtractedIssue>, StoreError> {
        let tables = self.inner.lock().await;
        let mut issues: Vec<ExtractedIssue> = tables
            .issues
            .iter()
            .filter(|i| i.cluster_id.is_none())
            .cloned()
            .collect();
        issues.sort_by_key(|i| (i.extracted_at, i.id));
        Ok(issues)
    }

    async fn issues_for_cluster(
        &self,
        cluster_id: i64,
        limit: usize,
    ) -> Result<Vec<ExtractedIssue>, StoreError> {
        let tables = self.inner.lock().await;
        Ok(tables
            .issues
            .iter()
            .filter(|i| i.cluster_id == Some(cluster_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn all_issues(&self) -> Result<Vec<ExtractedIssue>, StoreError> {
        Ok(self.inner.lock().await.issues.clone())
    }

    async fn active_clusters(
        &self,
        category: Category,
        subcategory: &str,
    ) -> Result<Vec<IssueCluster>, StoreError> {
        let tables = self.inner.lock().await;
        Ok(tables
            .clusters
            .iter()
            .filter(|c| c.is_active && c.category == category && c.subcategory == subcategory)
            .cloned()
            .collect())
    }

    async fn all_active_clusters(&self) -> Result<Vec<IssueCluster>, StoreError> {
        let tables = self.inner.lock().await;
        Ok(tables.clusters.iter().filter(|c| c.is_active).cloned().collect())
    }

    async fn clusters(&self) -> Result<Vec<IssueCluster>, StoreError> {
        Ok(self.inner.lock().await.clusters.clone())
    }

    async fn create_cluster(
        &self,
        cluster: NewCluster,
        first_issue_id: i64,
    ) -> Result<IssueCluster, StoreError> {
        let mut tables = self.inner.lock().await;
        let issue_idx = index(first_issue_id)
            .filter(|idx| *idx < tables.issues.len())
            .ok_or(StoreError::NotFound {
                entity: "issue",
                id: first_issue_id,
            })?;
        if tables.issues[issue_idx].cluster_id.is_some() {
            return Err(StoreError::Conflict(format!(
                "issue {first_issue_id} is already clustered"
            )));
        }

        let id = next_id(tables.clusters.len());
        let created = IssueCluster {
            id,
            category: cluster.category,
            subcategory: cluster.subcategory,
            name: cluster.name,
            summary: None,
            issue_count: 1,
            unique_customers: 0,
            first_seen: Some(cluster.seen_at),
            last_seen: Some(cluster.seen_at),
            count_7d: 0,
            count_prior_7d: 0,
            trend_pct: None,
            is_active: true,
            pm_status: PmStatus::New,
            pm_notes: None,
            created_at: cluster.seen_at,
            updated_at: cluster.seen_at,
        };
        tables.clusters.push(created.clone());
        tables.issues[issue_idx].cluster_id = Some(id);
        Ok(created)
    }

    async fn assign_issue(&self, assignment: ClusterAssignment) -> Result<(), StoreError> {
        let mut tables = self.inner.lock().await;
        let issue_idx = index(assignment.issue_id)
            .filter(|idx| *idx < tables.issues.len())
            .ok_or(StoreError::NotFound {
                entity: "issue",
                id: assignment.issue_id,
            })?;
        if tables.issues[issue_idx].cluster_id.is_some() {
            return Err(StoreError::Conflict(format!(
                "issue {} is already clustered",
                assignment.issue_id
            )));
        }

        let cluster = tables.cluster_mut(assignment.cluster_id)?;
        cluster.issue_count += 1;
        cluster.last_seen = cluster.last_seen.max(Some(assignment.seen_at));
        cluster.first_seen = Some(
            cluster
                .first_seen
                .map_or(assignment.seen_at, |first| first.min(assignment.seen_at)),
        );
        tables.issues[issue_idx].cluster_id = Some(assignment.cluster_id);
        Ok(())
    }

    async fn provisional_clusters(&self, min_issues: i64) -> Result<Vec<IssueCluster>, StoreError> {
        let tables = self.inner.lock().await;
        Ok(tables
            .clusters
            .iter()
            .filter(|c| c.is_active && c.name.starts_with(PROVISIONAL_PREFIX) && c.issue_count >= min_issues)
            .cloned()
            .collect())
    }

    async fn rename_cluster(
        &self,
        cluster_id: i64,
        name: &str,
        summary: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.lock().await;
        let cluster = tables.cluster_mut(cluster_id)?;
        cluster.name = name.to_string();
        cluster.summary = Some(summary.to_string());
        cluster.updated_at = now;
        Ok(())
    }

    async fn cluster_activity(
        &self,
        cluster_id: i64,
        windows: &TrendWindows,
    ) -> Result<ClusterActivity, StoreError> {
        let tables = self.inner.lock().await;
        let mut activity = ClusterActivity::default();
        let mut orgs = HashSet::new();
        for issue in tables.issues.iter().filter(|i| i.cluster_id == Some(cluster_id)) {
            if windows.in_recent(issue.extracted_at) {
                activity.count_7d += 1;
            } else if windows.in_prior(issue.extracted_at) {
                activity.count_prior_7d += 1;
            }
            if let Some(org) = tables.ticket(issue.ticket_id).and_then(|t| t.organization_id) {
                orgs.insert(org);
            }
        }
        activity.unique_customers = orgs.len() as i64;
        Ok(activity)
    }

    async fn update_cluster_metrics(
        &self,
        cluster_id: i64,
        metrics: ClusterMetrics,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.lock().await;
        let cluster = tables.cluster_mut(cluster_id)?;
        cluster.count_7d = metrics.count_7d;
        cluster.count_prior_7d = metrics.count_prior_7d;
        cluster.trend_pct = Some(metrics.trend_pct);
        cluster.unique_customers = metrics.unique_customers;
        cluster.updated_at = now;
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
        let mut tables = self.inner.lock().await;
        tables.cluster_mut(source)?;
        if !tables.cluster_mut(target)?.is_active {
            return Err(StoreError::Conflict(format!("cluster {target} is inactive")));
        }

        let mut moved = 0;
        let mut seen: Vec<DateTime<Utc>> = Vec::new();
        for issue in tables.issues.iter_mut() {
            if issue.cluster_id == Some(source) {
                issue.cluster_id = Some(target);
                moved += 1;
            }
            if issue.cluster_id == Some(target) {
                seen.push(issue.extracted_at);
            }
        }

        let source_cluster = tables.cluster_mut(source)?;
        source_cluster.is_active = false;
        source_cluster.issue_count = 0;
        source_cluster.updated_at = now;

        let target_cluster = tables.cluster_mut(target)?;
        target_cluster.issue_count = seen.len() as i64;
        target_cluster.first_seen = seen.iter().min().copied();
        target_cluster.last_seen = seen.iter().max().copied();
        target_cluster.updated_at = now;
        Ok(moved)
    }

    async fn sync_state(&self) -> Result<SyncState, StoreError> {
        Ok(self.inner.lock().await.sync_state.clone())
    }

    async fn record_sync(
        &self,
        watermark: Option<DateTime<Utc>>,
        tickets_synced: i64,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.lock().await;
        let state = &mut tables.sync_state;
        state.watermark = watermark.max(state.watermark);
        state.last_sync_at = Some(completed_at);
        state.tickets_synced += tickets_synced;
        Ok(())
    }

    async fn record_analysis(
        &self,
        tickets_analyzed: i64,
        issues_extracted: i64,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.lock().await;
        tables.sync_state.tickets_analyzed += tickets_analyzed;
        tables.sync_state.issues_extracted += issues_extracted;
        Ok(())
    }

    async fn sync_status(&self) -> Result<SyncStatus, StoreError> {
        let tables = self.inner.lock().await;
        Ok(SyncStatus {
            state: tables.sync_state.clone(),
            total_tickets: tables.tickets.len() as i64,
            total_issues: tables.issues.len() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pim_core::{IssueCandidate, IssueType, Severity};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn ticket(external_id: i64, org: Option<i64>) -> TicketUpsert {
        TicketUpsert {
            external_id,
            subject: Some(format!("ticket {external_id}")),
            description: Some("clock-in fails".into()),
            internal_notes: "(No comments)".into(),
            public_comments: "(No comments)".into(),
            requester_id: Some(10),
            requester_email: None,
            organization_id: org,
            organization_name: None,
            tags: vec!["android".into()],
            status: Some("open".into()),
            priority: None,
            created_at: at(1, external_id as u32 % 20),
            updated_at: at(2, 0),
        }
    }

    fn candidate(summary: &str) -> IssueCandidate {
        IssueCandidate {
            category: Category::TimeAndAttendance,
            subcategory: "punch_in_out".into(),
            issue_type: IssueType::Bug,
            severity: Severity::High,
            summary: summary.into(),
            detail: None,
            representative_quote: None,
            confidence: Some(0.8),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_external_id() {
        let store = MemoryStore::new();
        assert_eq!(
            store.upsert_ticket(ticket(1, None), at(3, 0)).await.unwrap(),
            UpsertOutcome::Inserted
        );
        let mut changed = ticket(1, None);
        changed.status = Some("solved".into());
        assert_eq!(
            store.upsert_ticket(changed, at(3, 1)).await.unwrap(),
            UpsertOutcome::Updated
        );
        let status = store.sync_status().await.unwrap();
        assert_eq!(status.total_tickets, 1);
        let stored = store.ticket_by_external_id(1).await.unwrap().unwrap();
        assert_eq!(stored.status.as_deref(), Some("solved"));
        assert_eq!(stored.synced_at, at(3, 1));
    }

    #[tokio::test]
    async fn analyses_mark_tickets_once_and_skip_reanalysis() {
        let store = MemoryStore::new();
        store.upsert_ticket(ticket(5, Some(1)), at(3, 0)).await.unwrap();
        store.upsert_ticket(ticket(2, Some(1)), at(3, 0)).await.unwrap();

        let pending = store.unanalyzed_tickets(10).await.unwrap();
        let order: Vec<i64> = pending.iter().map(|t| t.external_id).collect();
        assert_eq!(order, vec![2, 5]);

        let first = TicketAnalysis {
            ticket_id: pending[0].id,
            analyzed_at: at(4, 0),
            issues: vec![candidate("a"), candidate("b")],
        };
        let committed = store.commit_analyses(vec![first.clone()]).await.unwrap();
        assert_eq!(committed.tickets_marked, 1);
        assert_eq!(committed.issues_inserted, 2);
        assert_eq!(store.commit_analyses(vec![first]).await.unwrap(), CommitSummary::default());
        assert_eq!(store.unanalyzed_tickets(10).await.unwrap().len(), 1);
        assert_eq!(store.all_issues().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn assignment_never_overwrites_an_existing_cluster() {
        let store = MemoryStore::new();
        store.upsert_ticket(ticket(1, Some(7)), at(3, 0)).await.unwrap();
        store
            .commit_analyses(vec![TicketAnalysis {
                ticket_id: 1,
                analyzed_at: at(4, 0),
                issues: vec![candidate("clock-in broken"), candidate("clock-in slow")],
            }])
            .await
            .unwrap();

        let cluster = store
            .create_cluster(
                NewCluster {
                    category: Category::TimeAndAttendance,
                    subcategory: "punch_in_out".into(),
                    name: "New: clock-in broken".into(),
                    seen_at: at(4, 0),
                },
                1,
            )
            .await
            .unwrap();
        store
            .assign_issue(ClusterAssignment {
                issue_id: 2,
                cluster_id: cluster.id,
                seen_at: at(5, 0),
            })
            .await
            .unwrap();
        let again = store
            .assign_issue(ClusterAssignment {
                issue_id: 2,
                cluster_id: cluster.id,
                seen_at: at(5, 0),
            })
            .await;
        assert!(matches!(again, Err(StoreError::Conflict(_))));

        let stored = &store.clusters().await.unwrap()[0];
        assert_eq!(stored.issue_count, 2);
        assert_eq!(stored.last_seen, Some(at(5, 0)));
        assert_eq!(store.provisional_clusters(2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn metrics_update_leaves_review_fields_alone() {
        let store = MemoryStore::new();
        store.upsert_ticket(ticket(1, Some(7)), at(3, 0)).await.unwrap();
        store
            .commit_analyses(vec![TicketAnalysis {
                ticket_id: 1,
                analyzed_at: at(10, 0),
                issues: vec![candidate("clock-in broken")],
            }])
            .await
            .unwrap();
        let cluster = store
            .create_cluster(
                NewCluster {
                    category: Category::TimeAndAttendance,
                    subcategory: "punch_in_out".into(),
                    name: "Clock-in failures".into(),
                    seen_at: at(10, 0),
                },
                1,
            )
            .await
            .unwrap();
        store
            .set_review(cluster.id, PmStatus::Acknowledged, Some("on roadmap".into()))
            .await
            .unwrap();

        let windows = TrendWindows::ending_at(at(12, 0));
        let activity = store.cluster_activity(cluster.id, &windows).await.unwrap();
        assert_eq!(activity.count_7d, 1);
        assert_eq!(activity.unique_customers, 1);
        store
            .update_cluster_metrics(cluster.id, ClusterMetrics::from_activity(activity), at(12, 0))
            .await
            .unwrap();

        let stored = &store.clusters().await.unwrap()[0];
        assert_eq!(stored.pm_status, PmStatus::Acknowledged);
        assert_eq!(stored.pm_notes.as_deref(), Some("on roadmap"));
        assert_eq!(stored.trend_pct, Some(100.0));
    }

    #[tokio::test]
    async fn merge_moves_issues_and_deactivates_source() {
        let store = MemoryStore::new();
        store.upsert_ticket(ticket(1, Some(7)), at(3, 0)).await.unwrap();
        store
            .commit_analyses(vec![TicketAnalysis {
                ticket_id: 1,
                analyzed_at: at(4, 0),
                issues: vec![candidate("one"), candidate("two")],
            }])
            .await
            .unwrap();
        let new = |name: &str| NewCluster {
            category: Category::TimeAndAttendance,
            subcategory: "punch_in_out".into(),
            name: name.into(),
            seen_at: at(4, 0),
        };
        let a = store.create_cluster(new("A"), 1).await.unwrap();
        let b = store.create_cluster(new("B"), 2).await.unwrap();

        assert_eq!(store.merge_clusters(b.id, a.id, at(6, 0)).await.unwrap(), 1);
        let clusters = store.clusters().await.unwrap();
        assert_eq!(clusters[0].issue_count, 2);
        assert!(!clusters[1].is_active);
        assert_eq!(store.issues_for_cluster(a.id, 10).await.unwrap().len(), 2);
        assert!(store.merge_clusters(a.id, a.id, at(6, 0)).await.is_err());
    }

    #[tokio::test]
    async fn watermark_never_moves_backwards() {
        let store = MemoryStore::new();
        let later = at(5, 0);
        store.record_sync(Some(later), 3, at(5, 1)).await.unwrap();
        store
            .record_sync(Some(later - Duration::hours(2)), 1, at(5, 2))
            .await
            .unwrap();
        let state = store.sync_state().await.unwrap();
        assert_eq!(state.watermark, Some(later));
        assert_eq!(state.tickets_synced, 4);
        assert_eq!(state.last_sync_at, Some(at(5, 2)));
    }
}
