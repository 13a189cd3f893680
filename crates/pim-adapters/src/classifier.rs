//! Classification adapter and the parse-and-validate boundary for its output.

use std::time::Duration;

use async_trait::async_trait;
use pim_core::{Category, IssueCandidate, IssueType, RawIssueCandidate, Severity, TicketView};
use pim_storage::{
    ApiError, Auth, BackoffPolicy, ClientConfig, RateLimitConfig, RateLimitedHttpClient,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const PARSE_ERROR_REASON: &str = "parse_error";

/// Longest cluster name kept from the classifier.
pub const MAX_CLUSTER_NAME_CHARS: usize = 100;

const MAX_TOKENS_EXTRACTION: u32 = 1024;
const MAX_TOKENS_NAMING: u32 = 256;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("unparseable classifier output: {0}")]
    Parse(String),
}

/// Validated result of one extraction call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionOutcome {
    pub issues: Vec<IssueCandidate>,
    pub no_issue: bool,
    pub skip_reason: Option<String>,
    /// Candidates dropped at the validation boundary.
    pub rejected: usize,
}

impl ExtractionOutcome {
    pub fn parse_error() -> Self {
        Self {
            no_issue: true,
            skip_reason: Some(PARSE_ERROR_REASON.to_string()),
            ..Self::default()
        }
    }
}

/// What the naming call sees of each clustered issue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssueSummary {
    pub category: Category,
    pub subcategory: String,
    pub summary: String,
    pub representative_quote: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNaming {
    pub name: String,
    pub summary: String,
}

#[async_trait]
pub trait IssueClassifier: Send + Sync {
    /// Never fails on malformed output; only transport failures surface as errors.
    async fn extract_issues(&self, ticket: &TicketView) -> Result<ExtractionOutcome, ClassifierError>;

    async fn name_cluster(&self, issues: &[IssueSummary]) -> Result<ClusterNaming, ClassifierError>;
}

/// `issues` and `no_product_issue` may be absent or null.
#[derive(Deserialize)]
struct RawExtraction {
    #[serde(default)]
    issues: Option<Vec<JsonValue>>,
    #[serde(default)]
    no_product_issue: Option<bool>,
    #[serde(default)]
    skip_reason: Option<String>,
}

#[derive(Deserialize)]
struct RawNaming {
    cluster_name: Option<String>,
    #[serde(default)]
    cluster_summary: Option<String>,
}

/// Models sometimes wrap JSON in a markdown fence.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Parses extraction output for one ticket, keeping every candidate that validates.
pub fn parse_extraction(text: &str, external_id: i64) -> ExtractionOutcome {
    let raw: RawExtraction = match serde_json::from_str(strip_code_fence(text)) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(ticket = external_id, error = %err, "classifier output is not valid extraction JSON");
            return ExtractionOutcome::parse_error();
        }
    };

    let issues = raw.issues.unwrap_or_default();
    let mut outcome = ExtractionOutcome {
        no_issue: raw.no_product_issue.unwrap_or(issues.is_empty()),
        skip_reason: raw.skip_reason.filter(|r| !r.trim().is_empty()),
        ..ExtractionOutcome::default()
    };
    for (index, value) in issues.into_iter().enumerate() {
        let candidate = serde_json::from_value::<RawIssueCandidate>(value)
            .map_err(|err| err.to_string())
            .and_then(|raw| IssueCandidate::try_from(raw).map_err(|err| err.to_string()));
        match candidate {
            Ok(candidate) => outcome.issues.push(candidate),
            Err(reason) => {
                warn!(ticket = external_id, index, %reason, "dropping invalid issue candidate");
                outcome.rejected += 1;
            }
        }
    }
    outcome
}

pub fn parse_naming(text: &str) -> Result<ClusterNaming, ClassifierError> {
    let raw: RawNaming = serde_json::from_str(strip_code_fence(text))
        .map_err(|err| ClassifierError::Parse(err.to_string()))?;
    let name: String = raw
        .cluster_name
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .chars()
        .take(MAX_CLUSTER_NAME_CHARS)
        .collect();
    if name.is_empty() {
        return Err(ClassifierError::Parse("cluster_name is missing".into()));
    }
    Ok(ClusterNaming {
        name: name.trim_end().to_string(),
        summary: raw.cluster_summary.unwrap_or_default().trim().to_string(),
    })
}

fn taxonomy_listing() -> String {
    let categories = Category::ALL
        .iter()
        .map(|c| format!("- {}: {}", c, c.subcategories().join(", ")))
        .collect::<Vec<_>>()
        .join("\n");
    let types = IssueType::ALL.map(|t| t.as_str()).join(", ");
    let severities = Severity::ALL.map(|s| s.as_str()).join(", ");
    format!("Categories and subcategories:\n{categories}\nIssue types: {types}\nSeverities: {severities}")
}

fn extraction_system_prompt() -> String {
    format!(
        "You read customer support tickets for a workforce management product and pull out \
         product issues: bugs, friction, confusing UX, missing features, documentation gaps and \
         data problems. Ignore pure how-to questions and billing chatter.\n\n{}\n\n\
         Reply with JSON only, shaped as {{\"issues\": [{{\"category\", \"subcategory\", \
         \"issue_type\", \"severity\", \"summary\", \"detail\", \"representative_quote\", \
         \"confidence\"}}], \"no_product_issue\": bool, \"skip_reason\": string|null}}. \
         Summaries are one line. Confidence is between 0 and 1.",
        taxonomy_listing()
    )
}

const NAMING_SYSTEM_PROMPT: &str = "You name groups of related product issues for a product \
     manager. Reply with JSON only: {\"cluster_name\": short title under 100 characters, \
     \"cluster_summary\": two or three sentences on the shared problem}.";

fn or_placeholder<'a>(value: &'a Option<String>, placeholder: &'a str) -> &'a str {
    value.as_deref().filter(|v| !v.trim().is_empty()).unwrap_or(placeholder)
}

pub fn extraction_user_prompt(ticket: &TicketView) -> String {
    let tags = if ticket.tags.is_empty() {
        "None".to_string()
    } else {
        ticket.tags.join(", ")
    };
    format!(
        "TICKET ID: {}\nSUBJECT: {}\nCREATED: {}\nREQUESTER: {} ({})\nTAGS: {tags}\n\n\
         DESCRIPTION:\n{}\n\nPUBLIC COMMENTS:\n{}\n\nINTERNAL NOTES:\n{}",
        ticket.external_id,
        or_placeholder(&ticket.subject, "No subject"),
        ticket.created_at.to_rfc3339(),
        or_placeholder(&ticket.requester_email, "Unknown"),
        or_placeholder(&ticket.organization_name, "No org"),
        or_placeholder(&ticket.description, "No description"),
        ticket.public_comments,
        ticket.internal_notes,
    )
}

/// Naming prompt over at most 20 summaries and 10 quotes.
pub fn naming_user_prompt(issues: &[IssueSummary]) -> String {
    let (category, subcategory) = issues
        .first()
        .map(|i| (i.category.as_str(), i.subcategory.as_str()))
        .unwrap_or(("Unknown", "Unknown"));
    let summaries = issues
        .iter()
        .take(20)
        .map(|i| format!("- {}", i.summary))
        .collect::<Vec<_>>()
        .join("\n");
    let quotes = issues
        .iter()
        .filter_map(|i| i.representative_quote.as_deref())
        .take(10)
        .map(|q| format!("- \"{q}\""))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Category: {category}\nSubcategory: {subcategory}\nNumber of tickets: {}\n\n\
         Issue summaries:\n{summaries}\n\nRepresentative quotes:\n{quotes}",
        issues.len()
    )
}

#[derive(Clone)]
pub struct ClassifierConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub rate_limit_per_min: usize,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl std::fmt::Debug for ClassifierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .field("model", &self.model)
            .field("rate_limit_per_min", &self.rate_limit_per_min)
            .finish()
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

/// Classifier backed by a messages-style LLM endpoint.
#[derive(Debug, Clone)]
pub struct LlmIssueClassifier {
    http: RateLimitedHttpClient,
    model: String,
    extraction_prompt: String,
}

impl LlmIssueClassifier {
    pub fn new(config: ClassifierConfig) -> anyhow::Result<Self> {
        let mut client = ClientConfig::new(config.base_url);
        client.timeout = config.timeout;
        client.backoff = config.backoff;
        client.rate_limit = RateLimitConfig::per_minute(config.rate_limit_per_min);
        client.auth = Some(Auth::Header {
            name: "x-api-key",
            value: config.api_key,
        });
        client.extra_headers = vec![("anthropic-version", "2023-06-01".to_string())];
        Ok(Self {
            http: RateLimitedHttpClient::new(client)?,
            model: config.model,
            extraction_prompt: extraction_system_prompt(),
        })
    }

    async fn complete(&self, system: &str, user: &str, max_tokens: u32) -> Result<String, ClassifierError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens,
            system,
            messages: [Message {
                role: "user",
                content: user,
            }],
        };
        let response: MessagesResponse = self.http.post_json("messages", &request).await?;
        Ok(response
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join(""))
    }
}

#[async_trait]
impl IssueClassifier for LlmIssueClassifier {
    /// A 2xx reply whose envelope cannot be decoded is treated like malformed
    /// model text, so one bad ticket cannot hold the queue.
    async fn extract_issues(&self, ticket: &TicketView) -> Result<ExtractionOutcome, ClassifierError> {
        let completed = self
            .complete(&self.extraction_prompt, &extraction_user_prompt(ticket), MAX_TOKENS_EXTRACTION)
            .await;
        match completed {
            Ok(text) => Ok(parse_extraction(&text, ticket.external_id)),
            Err(ClassifierError::Api(ApiError::Decode { url, detail })) => {
                warn!(ticket = ticket.external_id, %url, %detail, "undecodable classifier reply");
                Ok(ExtractionOutcome::parse_error())
            }
            Err(err) => Err(err),
        }
    }

    async fn name_cluster(&self, issues: &[IssueSummary]) -> Result<ClusterNaming, ClassifierError> {
        let text = self
            .complete(NAMING_SYSTEM_PROMPT, &naming_user_prompt(issues), MAX_TOKENS_NAMING)
            .await?;
        parse_naming(&text)
    }
}
