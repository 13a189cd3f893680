//! Classification of unanalyzed tickets into extracted issues.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use pim_adapters::IssueClassifier;
use pim_core::{AnalysisResult, CommitSummary, TicketAnalysis};
use pim_storage::Store;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy)]
pub struct AnalysisConfig {
    pub batch_size: usize,
    /// Tickets buffered before their issues are written in one transaction.
    pub commit_every: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            commit_every: 10,
        }
    }
}

pub struct AnalysisPipeline {
    store: Arc<dyn Store>,
    classifier: Arc<dyn IssueClassifier>,
    config: AnalysisConfig,
}

impl AnalysisPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        classifier: Arc<dyn IssueClassifier>,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            store,
            classifier,
            config,
        }
    }

    pub fn config(&self) -> AnalysisConfig {
        self.config
    }

    /// Classifies up to `batch_size` unanalyzed tickets, one at a time.
    ///
    /// A ticket whose classifier call fails stays unanalyzed; output that could
    /// not be parsed still marks it analyzed. `tickets_processed` counts only
    /// tickets this run marked, not ones another run got to first.
    pub async fn analyze_unprocessed(&self, batch_size: usize) -> Result<AnalysisResult> {
        let tickets = self
            .store
            .unanalyzed_tickets(batch_size)
            .await
            .context("loading unanalyzed tickets")?;
        info!(pending = tickets.len(), batch_size, "starting ticket analysis");

        let commit_every = self.config.commit_every.max(1);
        let mut result = AnalysisResult::default();
        let mut buffer: Vec<TicketAnalysis> = Vec::with_capacity(commit_every);

        for ticket in tickets {
            let span = info_span!("analyze_ticket", ticket = ticket.external_id);
            match self
                .classifier
                .extract_issues(&ticket.view())
                .instrument(span)
                .await
            {
                Ok(outcome) => {
                    if outcome.no_issue && outcome.issues.is_empty() {
                        debug!(
                            ticket = ticket.external_id,
                            reason = outcome.skip_reason.as_deref().unwrap_or("none"),
                            "no product issue"
                        );
                    }
                    result.candidates_rejected += outcome.rejected;
                    buffer.push(TicketAnalysis {
                        ticket_id: ticket.id,
                        analyzed_at: Utc::now(),
                        issues: outcome.issues,
                    });
                }
                Err(err) => {
                    warn!(ticket = ticket.external_id, error = %err, "classification failed; ticket left for next run");
                    result.errors += 1;
                }
            }

            if buffer.len() >= commit_every {
                let committed = self.flush(&mut buffer).await?;
                result.tickets_processed += committed.tickets_marked;
                result.issues_extracted += committed.issues_inserted;
            }
        }
        let committed = self.flush(&mut buffer).await?;
        result.tickets_processed += committed.tickets_marked;
        result.issues_extracted += committed.issues_inserted;

        self.store
            .record_analysis(result.tickets_processed as i64, result.issues_extracted as i64)
            .await
            .context("recording analysis counts")?;
        info!(
            processed = result.tickets_processed,
            issues = result.issues_extracted,
            rejected = result.candidates_rejected,
            errors = result.errors,
            "ticket analysis finished"
        );
        Ok(result)
    }

    async fn flush(&self, buffer: &mut Vec<TicketAnalysis>) -> Result<CommitSummary> {
        if buffer.is_empty() {
            return Ok(CommitSummary::default());
        }
        let buffered = buffer.len();
        let committed = self
            .store
            .commit_analyses(std::mem::take(buffer))
            .await
            .context("committing analyzed tickets")?;
        if committed.tickets_marked < buffered {
            warn!(
                buffered,
                marked = committed.tickets_marked,
                "some tickets were already analyzed elsewhere"
            );
        }
        debug!(
            tickets = committed.tickets_marked,
            inserted = committed.issues_inserted,
            "analysis batch committed"
        );
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::testing::{at, candidate, ScriptedClassifier, Script};
    use async_trait::async_trait;
    use pim_adapters::{ClassifierError, ClusterNaming, ExtractionOutcome, IssueSummary};
    use pim_core::{Category, TicketUpsert, TicketView};
    use pim_storage::MemoryStore;

    /// Marks one ticket analyzed behind the pipeline's back while classifying it,
    /// the way an overlapping run would.
    struct RacingClassifier {
        store: Arc<MemoryStore>,
        raced_external_id: i64,
        inner: ScriptedClassifier,
    }

    #[async_trait]
    impl IssueClassifier for RacingClassifier {
        async fn extract_issues(&self, ticket: &TicketView) -> Result<ExtractionOutcome, ClassifierError> {
            if ticket.external_id == self.raced_external_id {
                let stored = self
                    .store
                    .ticket_by_external_id(ticket.external_id)
                    .await
                    .unwrap()
                    .unwrap();
                self.store
                    .commit_analyses(vec![TicketAnalysis {
                        ticket_id: stored.id,
                        analyzed_at: at(4, 0),
                        issues: vec![],
                    }])
                    .await
                    .unwrap();
            }
            self.inner.extract_issues(ticket).await
        }

        async fn name_cluster(&self, issues: &[IssueSummary]) -> Result<ClusterNaming, ClassifierError> {
            self.inner.name_cluster(issues).await
        }
    }

    async fn seed(store: &MemoryStore, ids: &[i64]) {
        for (offset, id) in ids.iter().enumerate() {
            store
                .upsert_ticket(
                    TicketUpsert {
                        external_id: *id,
                        subject: Some(format!("Ticket {id}")),
                        description: None,
                        internal_notes: "(No comments)".into(),
                        public_comments: "(No comments)".into(),
                        requester_id: None,
                        requester_email: None,
                        organization_id: Some(1),
                        organization_name: None,
                        tags: vec![],
                        status: None,
                        priority: None,
                        created_at: at(1, offset as u32),
                        updated_at: at(2, 0),
                    },
                    at(3, 0),
                )
                .await
                .unwrap();
        }
    }

    fn pipeline(store: Arc<MemoryStore>, classifier: Arc<ScriptedClassifier>, commit_every: usize) -> AnalysisPipeline {
        AnalysisPipeline::new(
            store,
            classifier,
            AnalysisConfig {
                batch_size: 100,
                commit_every,
            },
        )
    }

    #[tokio::test]
    async fn classifier_failure_leaves_only_that_ticket_unanalyzed() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &[1, 2, 3]).await;
        let classifier = Arc::new(
            ScriptedClassifier::new(Script::Issues(vec![candidate(
                Category::Payroll,
                "pay_runs",
                "Pay run stuck in pending",
            )]))
            .script(2, Script::Fail),
        );

        let result = pipeline(store.clone(), classifier.clone(), 10)
            .analyze_unprocessed(100)
            .await
            .unwrap();
        assert_eq!(result.tickets_processed, 2);
        assert_eq!(result.issues_extracted, 2);
        assert_eq!(result.errors, 1);

        let pending = store.unanalyzed_tickets(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].external_id, 2);

        classifier.set(2, Script::Issues(vec![]));
        let retry = pipeline(store.clone(), classifier, 10)
            .analyze_unprocessed(100)
            .await
            .unwrap();
        assert_eq!(retry.tickets_processed, 1);
        assert!(store.unanalyzed_tickets(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn parse_error_still_marks_ticket_analyzed() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &[10]).await;
        let classifier = Arc::new(ScriptedClassifier::new(Script::Raw("I think the issue is...".into())));

        let result = pipeline(store.clone(), classifier, 10)
            .analyze_unprocessed(100)
            .await
            .unwrap();
        assert_eq!(result.tickets_processed, 1);
        assert_eq!(result.issues_extracted, 0);
        assert!(store.unanalyzed_tickets(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_candidates_are_never_persisted() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &[20]).await;
        let raw = r#"{"issues": [
            {"category": "PAYROLL", "subcategory": "errors", "issue_type": "bug", "severity": "high",
             "summary": "Net pay rounding off by a cent", "confidence": 0.7},
            {"category": "PAYROLL", "subcategory": "pto", "issue_type": "bug", "severity": "high",
             "summary": "PTO is a time and attendance subcategory", "confidence": 0.7},
            {"category": "PAYROLL", "subcategory": "errors", "issue_type": "bug", "severity": "high",
             "summary": "Confidence too high", "confidence": 3}
        ], "no_product_issue": false}"#;
        let classifier = Arc::new(ScriptedClassifier::new(Script::Raw(raw.into())));

        let result = pipeline(store.clone(), classifier, 10)
            .analyze_unprocessed(100)
            .await
            .unwrap();
        assert_eq!(result.issues_extracted, 1);
        assert_eq!(result.candidates_rejected, 2);
        let issues = store.all_issues().await.unwrap();
        assert_eq!(issues.len(), 1);
        assert!(issues
            .iter()
            .all(|i| i.confidence.map_or(true, |c| (0.0..=1.0).contains(&c))));
    }

    #[tokio::test]
    async fn batch_size_bounds_work_and_order_is_by_creation() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &[30, 31, 32, 33, 34]).await;
        let classifier = Arc::new(ScriptedClassifier::new(Script::Issues(vec![])));

        let result = pipeline(store.clone(), classifier.clone(), 2)
            .analyze_unprocessed(3)
            .await
            .unwrap();
        assert_eq!(result.tickets_processed, 3);
        assert_eq!(classifier.extract_calls.load(Ordering::SeqCst), 3);

        let left: Vec<i64> = store
            .unanalyzed_tickets(10)
            .await
            .unwrap()
            .iter()
            .map(|t| t.external_id)
            .collect();
        assert_eq!(left, vec![33, 34]);
        assert_eq!(store.sync_state().await.unwrap().tickets_analyzed, 3);
    }

    #[tokio::test]
    async fn tickets_analyzed_by_another_run_are_not_counted() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &[40, 41, 42]).await;
        let classifier = Arc::new(RacingClassifier {
            store: store.clone(),
            raced_external_id: 41,
            inner: ScriptedClassifier::new(Script::Issues(vec![candidate(
                Category::Payroll,
                "pay_runs",
                "Pay run preview drops overtime",
            )])),
        });

        let result = AnalysisPipeline::new(
            store.clone(),
            classifier,
            AnalysisConfig {
                batch_size: 100,
                commit_every: 10,
            },
        )
        .analyze_unprocessed(100)
        .await
        .unwrap();

        assert_eq!(result.tickets_processed, 2);
        assert_eq!(result.issues_extracted, 2);
        assert!(store.unanalyzed_tickets(10).await.unwrap().is_empty());
        assert_eq!(store.all_issues().await.unwrap().len(), 2);
        let state = store.sync_state().await.unwrap();
        assert_eq!(state.tickets_analyzed, 2);
        assert_eq!(state.issues_extracted, 2);
    }
}
