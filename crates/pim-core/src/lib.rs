//! Core domain model, taxonomy and stage results for the product issue miner.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pim-core";

/// Name prefix marking a cluster that has not been named by the classifier yet.
pub const PROVISIONAL_PREFIX: &str = "New:";

const PROVISIONAL_SUMMARY_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    TimeAndAttendance,
    Payroll,
    Settings,
}

impl Category {
    pub const ALL: [Category; 3] = [Self::TimeAndAttendance, Self::Payroll, Self::Settings];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimeAndAttendance => "TIME_AND_ATTENDANCE",
            Self::Payroll => "PAYROLL",
            Self::Settings => "SETTINGS",
        }
    }

    pub fn subcategories(&self) -> &'static [&'static str] {
        match self {
            Self::TimeAndAttendance => &[
                "hardware_issues",
                "punch_in_out",
                "biometric_registration",
                "pto",
                "reporting",
                "corrections",
            ],
            Self::Payroll => &[
                "pay_runs",
                "tax_questions",
                "direct_deposits",
                "reporting",
                "errors",
            ],
            Self::Settings => &["employee_registration", "biometric_enrollment", "deductions"],
        }
    }

    pub fn allows(&self, subcategory: &str) -> bool {
        self.subcategories().contains(&subcategory)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownCategory(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Bug,
    Friction,
    UxConfusion,
    FeatureRequest,
    DocumentationGap,
    DataIssue,
}

impl IssueType {
    pub const ALL: [IssueType; 6] = [
        Self::Bug,
        Self::Friction,
        Self::UxConfusion,
        Self::FeatureRequest,
        Self::DocumentationGap,
        Self::DataIssue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bug => "bug",
            Self::Friction => "friction",
            Self::UxConfusion => "ux_confusion",
            Self::FeatureRequest => "feature_request",
            Self::DocumentationGap => "documentation_gap",
            Self::DataIssue => "data_issue",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownIssueType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownSeverity(s.to_string()))
    }
}

/// Reviewer workflow state of a cluster. Owned by the reviewer-facing API, never by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PmStatus {
    #[default]
    New,
    Reviewing,
    Acknowledged,
    Fixed,
    WontFix,
}

impl PmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Reviewing => "reviewing",
            Self::Acknowledged => "acknowledged",
            Self::Fixed => "fixed",
            Self::WontFix => "wont_fix",
        }
    }
}

impl FromStr for PmStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "reviewing" => Ok(Self::Reviewing),
            "acknowledged" => Ok(Self::Acknowledged),
            "fixed" => Ok(Self::Fixed),
            "wont_fix" => Ok(Self::WontFix),
            other => Err(ValidationError::UnknownPmStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("unknown category {0:?}")]
    UnknownCategory(String),
    #[error("subcategory {subcategory:?} is not valid for {category}")]
    SubcategoryMismatch {
        category: Category,
        subcategory: String,
    },
    #[error("unknown issue type {0:?}")]
    UnknownIssueType(String),
    #[error("unknown severity {0:?}")]
    UnknownSeverity(String),
    #[error("unknown pm status {0:?}")]
    UnknownPmStatus(String),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("summary is empty")]
    EmptySummary,
    #[error("confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),
}

/// Candidate issue exactly as the classifier emitted it. Nothing here has been checked.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawIssueCandidate {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub issue_type: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub representative_quote: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// A candidate that passed taxonomy validation and may be persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueCandidate {
    pub category: Category,
    pub subcategory: String,
    pub issue_type: IssueType,
    pub severity: Severity,
    pub summary: String,
    pub detail: Option<String>,
    pub representative_quote: Option<String>,
    pub confidence: Option<f64>,
}

impl TryFrom<RawIssueCandidate> for IssueCandidate {
    type Error = ValidationError;

    fn try_from(raw: RawIssueCandidate) -> Result<Self, Self::Error> {
        let category: Category = raw
            .category
            .as_deref()
            .ok_or(ValidationError::MissingField("category"))?
            .parse()?;
        let subcategory = raw
            .subcategory
            .ok_or(ValidationError::MissingField("subcategory"))?;
        if !category.allows(&subcategory) {
            return Err(ValidationError::SubcategoryMismatch {
                category,
                subcategory,
            });
        }
        let issue_type: IssueType = raw
            .issue_type
            .as_deref()
            .ok_or(ValidationError::MissingField("issue_type"))?
            .parse()?;
        let severity: Severity = raw
            .severity
            .as_deref()
            .ok_or(ValidationError::MissingField("severity"))?
            .parse()?;
        let summary = raw.summary.unwrap_or_default().trim().to_string();
        if summary.is_empty() {
            return Err(ValidationError::EmptySummary);
        }
        if let Some(confidence) = raw.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(ValidationError::ConfidenceOutOfRange(confidence));
            }
        }

        Ok(Self {
            category,
            subcategory,
            issue_type,
            severity,
            summary,
            detail: non_empty(raw.detail),
            representative_quote: non_empty(raw.representative_quote),
            confidence: raw.confidence,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Ticket fields as fetched from the ticketing system, keyed by `external_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketUpsert {
    pub external_id: i64,
    pub subject: Option<String>,
    pub description: Option<String>,
    pub internal_notes: String,
    pub public_comments: String,
    pub requester_id: Option<i64>,
    pub requester_email: Option<String>,
    pub organization_id: Option<i64>,
    pub organization_name: Option<String>,
    pub tags: Vec<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub external_id: i64,
    pub subject: Option<String>,
    pub description: Option<String>,
    pub internal_notes: String,
    pub public_comments: String,
    pub requester_id: Option<i64>,
    pub requester_email: Option<String>,
    pub organization_id: Option<i64>,
    pub organization_name: Option<String>,
    pub tags: Vec<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
    pub analyzed_at: Option<DateTime<Utc>>,
}

impl Ticket {
    pub fn view(&self) -> TicketView {
        TicketView {
            external_id: self.external_id,
            subject: self.subject.clone(),
            description: self.description.clone(),
            public_comments: self.public_comments.clone(),
            internal_notes: self.internal_notes.clone(),
            requester_email: self.requester_email.clone(),
            organization_name: self.organization_name.clone(),
            tags: self.tags.clone(),
            created_at: self.created_at,
        }
    }
}

/// The slice of a ticket handed to the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketView {
    pub external_id: i64,
    pub subject: Option<String>,
    pub description: Option<String>,
    pub public_comments: String,
    pub internal_notes: String,
    pub requester_email: Option<String>,
    pub organization_name: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// What one `commit_analyses` call actually wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub tickets_marked: usize,
    pub issues_inserted: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedIssue {
    pub id: i64,
    pub ticket_id: i64,
    pub category: Category,
    pub subcategory: String,
    pub issue_type: IssueType,
    pub severity: Severity,
    pub summary: String,
    pub detail: Option<String>,
    pub representative_quote: Option<String>,
    pub confidence: Option<f64>,
    pub cluster_id: Option<i64>,
    pub extracted_at: DateTime<Utc>,
}

/// Classifier output for one ticket, persisted together with its analyzed timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct TicketAnalysis {
    pub ticket_id: i64,
    pub analyzed_at: DateTime<Utc>,
    pub issues: Vec<IssueCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueCluster {
    pub id: i64,
    pub category: Category,
    pub subcategory: String,
    pub name: String,
    pub summary: Option<String>,
    pub issue_count: i64,
    pub unique_customers: i64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub count_7d: i64,
    pub count_prior_7d: i64,
    pub trend_pct: Option<f64>,
    pub is_active: bool,
    pub pm_status: PmStatus,
    pub pm_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IssueCluster {
    pub fn is_provisional(&self) -> bool {
        self.name.starts_with(PROVISIONAL_PREFIX)
    }
}

/// Name given to a freshly created cluster until the classifier names it.
pub fn provisional_name(summary: &str) -> String {
    let truncated: String = summary.chars().take(PROVISIONAL_SUMMARY_CHARS).collect();
    format!("{PROVISIONAL_PREFIX} {truncated}")
}

/// Cluster created around its first issue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCluster {
    pub category: Category,
    pub subcategory: String,
    pub name: String,
    pub seen_at: DateTime<Utc>,
}

/// Issue joined to an existing cluster during a clustering pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterAssignment {
    pub issue_id: i64,
    pub cluster_id: i64,
    pub seen_at: DateTime<Utc>,
}

/// Metric columns recomputed by the trend pass. Reviewer-owned columns are not representable here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetrics {
    pub count_7d: i64,
    pub count_prior_7d: i64,
    pub trend_pct: f64,
    pub unique_customers: i64,
}

impl ClusterMetrics {
    pub fn from_activity(activity: ClusterActivity) -> Self {
        Self {
            count_7d: activity.count_7d,
            count_prior_7d: activity.count_prior_7d,
            trend_pct: trend_pct(activity.count_7d, activity.count_prior_7d),
            unique_customers: activity.unique_customers,
        }
    }
}

/// The two half-open weeks compared by the trend pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrendWindows {
    pub prior_start: DateTime<Utc>,
    pub recent_start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TrendWindows {
    /// `[now-14d, now-7d)` and `[now-7d, now)`.
    pub fn ending_at(now: DateTime<Utc>) -> Self {
        Self {
            prior_start: now - chrono::Duration::days(14),
            recent_start: now - chrono::Duration::days(7),
            end: now,
        }
    }

    pub fn in_recent(&self, at: DateTime<Utc>) -> bool {
        at >= self.recent_start && at < self.end
    }

    pub fn in_prior(&self, at: DateTime<Utc>) -> bool {
        at >= self.prior_start && at < self.recent_start
    }
}

/// Raw counts behind a cluster's metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterActivity {
    pub count_7d: i64,
    pub count_prior_7d: i64,
    pub unique_customers: i64,
}

/// Week-over-week change in percent, rounded to two decimals.
///
/// With no prior activity the result is 100 for any new activity and 0 otherwise.
pub fn trend_pct(count_7d: i64, count_prior_7d: i64) -> f64 {
    if count_prior_7d > 0 {
        let pct = (count_7d - count_prior_7d) as f64 / count_prior_7d as f64 * 100.0;
        (pct * 100.0).round() / 100.0
    } else if count_7d > 0 {
        100.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub watermark: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub tickets_synced: i64,
    pub tickets_analyzed: i64,
    pub issues_extracted: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub total_tickets: i64,
    pub total_issues: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub tickets_synced: usize,
    pub tickets_updated: usize,
    pub errors: usize,
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub tickets_processed: usize,
    pub issues_extracted: usize,
    pub candidates_rejected: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterResult {
    pub new_clusters: usize,
    /// Every issue that received a cluster this run, whether it opened one or joined one.
    pub issues_clustered: usize,
    pub joined_existing: usize,
    pub clusters_named: usize,
    pub naming_errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendResult {
    pub clusters_updated: usize,
}

/// Outcome of one stage inside a combined run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome<T> {
    Completed(T),
    Failed { error: String },
}

impl<T> StageOutcome<T> {
    pub fn from_result<E: fmt::Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Completed(value),
            Err(err) => Self::Failed {
                error: err.to_string(),
            },
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Completed(_) => None,
            Self::Failed { error } => Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sync: StageOutcome<SyncResult>,
    pub analysis: StageOutcome<AnalysisResult>,
    pub clustering: StageOutcome<ClusterResult>,
    pub trends: StageOutcome<TrendResult>,
}

impl CombinedResult {
    /// Stage failures as `stage: error` lines, empty when every stage completed.
    pub fn failures(&self) -> Vec<String> {
        [
            ("sync", self.sync.error()),
            ("analysis", self.analysis.error()),
            ("clustering", self.clustering.error()),
            ("trends", self.trends.error()),
        ]
        .into_iter()
        .filter_map(|(stage, err)| err.map(|e| format!("{stage}: {e}")))
        .collect()
    }
}
