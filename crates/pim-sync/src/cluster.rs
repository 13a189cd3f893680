//! Keyword-overlap clustering, lazy cluster naming and trend metrics.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pim_adapters::{IssueClassifier, IssueSummary};
use pim_core::{
    provisional_name, Category, ClusterAssignment, ClusterMetrics, ClusterResult, ExtractedIssue,
    NewCluster, TrendResult, TrendWindows, PROVISIONAL_PREFIX,
};
use pim_storage::{Store, StoreError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ClusterConfig {
    /// A candidate must score strictly above this to take an issue.
    pub match_threshold: f64,
    pub naming_min_issues: i64,
    pub naming_max_issues: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.3,
            naming_min_issues: 2,
            naming_max_issues: 20,
        }
    }
}

/// Lowercased words with edge punctuation trimmed; inner hyphens survive (`clock-in`).
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split_whitespace()
        .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|word| !word.is_empty())
        .collect()
}

/// Cluster name tokens, ignoring the provisional marker.
pub fn cluster_tokens(name: &str) -> BTreeSet<String> {
    tokenize(name.strip_prefix(PROVISIONAL_PREFIX).unwrap_or(name))
}

/// Share of the issue's words that also appear in the cluster name.
pub fn overlap_score(issue_words: &BTreeSet<String>, cluster_words: &BTreeSet<String>) -> f64 {
    let shared = issue_words.intersection(cluster_words).count();
    shared as f64 / issue_words.len().max(1) as f64
}

struct Candidate {
    cluster_id: i64,
    words: BTreeSet<String>,
    /// Opened earlier in this run rather than loaded from the store.
    fresh: bool,
}

/// Highest score above the threshold; ties go to the lowest cluster id.
fn best_match(words: &BTreeSet<String>, candidates: &[Candidate], threshold: f64) -> Option<(i64, f64)> {
    let mut best: Option<(i64, f64)> = None;
    for candidate in candidates {
        let score = overlap_score(words, &candidate.words);
        if score <= threshold {
            continue;
        }
        let better = match best {
            None => true,
            Some((best_id, best_score)) => {
                score > best_score || (score == best_score && candidate.cluster_id < best_id)
            }
        };
        if better {
            best = Some((candidate.cluster_id, score));
        }
    }
    best
}

pub struct ClusterEngine {
    store: Arc<dyn Store>,
    classifier: Arc<dyn IssueClassifier>,
    config: ClusterConfig,
}

impl ClusterEngine {
    pub fn new(store: Arc<dyn Store>, classifier: Arc<dyn IssueClassifier>, config: ClusterConfig) -> Self {
        Self {
            store,
            classifier,
            config,
        }
    }

    /// Places every unclustered issue, then names provisional clusters that grew.
    ///
    /// Issues only ever meet clusters of their own category and subcategory.
    pub async fn assign_clusters(&self) -> Result<ClusterResult> {
        let issues = self
            .store
            .unclustered_issues()
            .await
            .context("loading unclustered issues")?;
        info!(pending = issues.len(), "starting cluster assignment");

        let mut groups: BTreeMap<(Category, String), Vec<ExtractedIssue>> = BTreeMap::new();
        for issue in issues {
            groups
                .entry((issue.category, issue.subcategory.clone()))
                .or_default()
                .push(issue);
        }

        let mut result = ClusterResult::default();
        for ((category, subcategory), issues) in groups {
            self.assign_group(category, &subcategory, issues, &mut result)
                .await
                .with_context(|| format!("clustering {category}/{subcategory}"))?;
        }

        let (named, failed) = self.name_pending_clusters().await?;
        result.clusters_named = named;
        result.naming_errors = failed;

        info!(
            new_clusters = result.new_clusters,
            clustered = result.issues_clustered,
            joined_existing = result.joined_existing,
            named = result.clusters_named,
            naming_errors = result.naming_errors,
            "cluster assignment finished"
        );
        Ok(result)
    }

    async fn assign_group(
        &self,
        category: Category,
        subcategory: &str,
        issues: Vec<ExtractedIssue>,
        result: &mut ClusterResult,
    ) -> Result<()> {
        let mut candidates: Vec<Candidate> = self
            .store
            .active_clusters(category, subcategory)
            .await?
            .into_iter()
            .map(|cluster| Candidate {
                cluster_id: cluster.id,
                words: cluster_tokens(&cluster.name),
                fresh: false,
            })
            .collect();

        for issue in issues {
            let words = tokenize(&issue.summary);
            if let Some((cluster_id, score)) = best_match(&words, &candidates, self.config.match_threshold) {
                let fresh = candidates
                    .iter()
                    .any(|candidate| candidate.cluster_id == cluster_id && candidate.fresh);
                let assigned = self
                    .store
                    .assign_issue(ClusterAssignment {
                        issue_id: issue.id,
                        cluster_id,
                        seen_at: issue.extracted_at,
                    })
                    .await;
                match assigned {
                    Ok(()) => {
                        debug!(issue = issue.id, cluster = cluster_id, score, "issue joined cluster");
                        result.issues_clustered += 1;
                        if !fresh {
                            result.joined_existing += 1;
                        }
                    }
                    Err(StoreError::Conflict(reason)) => {
                        warn!(issue = issue.id, %reason, "issue already clustered; skipping");
                    }
                    Err(err) => return Err(err.into()),
                }
                continue;
            }

            let created = self
                .store
                .create_cluster(
                    NewCluster {
                        category,
                        subcategory: subcategory.to_string(),
                        name: provisional_name(&issue.summary),
                        seen_at: issue.extracted_at,
                    },
                    issue.id,
                )
                .await;
            match created {
                Ok(cluster) => {
                    debug!(issue = issue.id, cluster = cluster.id, "new provisional cluster");
                    result.new_clusters += 1;
                    result.issues_clustered += 1;
                    candidates.push(Candidate {
                        cluster_id: cluster.id,
                        words: cluster_tokens(&cluster.name),
                        fresh: true,
                    });
                }
                Err(StoreError::Conflict(reason)) => {
                    warn!(issue = issue.id, %reason, "issue already clustered; skipping");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Names provisional clusters holding enough issues. A failed naming call
    /// keeps the provisional name so the cluster is retried next run.
    pub async fn name_pending_clusters(&self) -> Result<(usize, usize)> {
        let pending = self
            .store
            .provisional_clusters(self.config.naming_min_issues)
            .await
            .context("loading provisional clusters")?;

        let mut named = 0;
        let mut failed = 0;
        for cluster in pending {
            let issues = self
                .store
                .issues_for_cluster(cluster.id, self.config.naming_max_issues)
                .await?;
            let summaries: Vec<IssueSummary> = issues
                .into_iter()
                .map(|issue| IssueSummary {
                    category: issue.category,
                    subcategory: issue.subcategory,
                    summary: issue.summary,
                    representative_quote: issue.representative_quote,
                })
                .collect();

            match self.classifier.name_cluster(&summaries).await {
                Ok(naming) => {
                    self.store
                        .rename_cluster(cluster.id, &naming.name, &naming.summary, Utc::now())
                        .await?;
                    info!(cluster = cluster.id, name = %naming.name, "cluster named");
                    named += 1;
                }
                Err(err) => {
                    warn!(cluster = cluster.id, error = %err, "cluster naming failed; keeping provisional name");
                    failed += 1;
                }
            }
        }
        Ok((named, failed))
    }

    /// Recomputes week-over-week counts and customer reach for every active cluster.
    /// Reviewer-owned fields are never written.
    pub async fn update_trends(&self, now: DateTime<Utc>) -> Result<TrendResult> {
        let windows = TrendWindows::ending_at(now);
        let clusters = self
            .store
            .all_active_clusters()
            .await
            .context("loading active clusters")?;

        let mut result = TrendResult::default();
        for cluster in clusters {
            let activity = self.store.cluster_activity(cluster.id, &windows).await?;
            let metrics = ClusterMetrics::from_activity(activity);
            self.store
                .update_cluster_metrics(cluster.id, metrics, now)
                .await?;
            result.clusters_updated += 1;
        }
        info!(clusters = result.clusters_updated, "cluster trends updated");
        Ok(result)
    }

    /// Folds `source` into `target`. Not part of the scheduled pipeline.
    pub async fn merge(&self, source: i64, target: i64) -> Result<usize> {
        let moved = self
            .store
            .merge_clusters(source, target, Utc::now())
            .await
            .with_context(|| format!("merging cluster {source} into {target}"))?;
        info!(source, target, moved, "clusters merged");
        Ok(moved)
    }
}
