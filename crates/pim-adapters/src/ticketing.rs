//! Ticketing-system adapter: search, ticket detail, comments and directory lookups.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use pim_core::TicketUpsert;
use pim_storage::{
    ApiError, Auth, BackoffPolicy, ClientConfig, RateLimitConfig, RateLimitedHttpClient,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Largest page the search endpoint serves.
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTicket {
    pub id: i64,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub requester_id: Option<i64>,
    #[serde(default)]
    pub organization_id: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_public() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteComment {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub author_id: Option<i64>,
    #[serde(default = "default_public")]
    pub public: bool,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub plain_body: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteUser {
    pub id: i64,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteOrganization {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub results: Vec<RemoteTicket>,
    #[serde(default)]
    pub next_page: Option<String>,
    #[serde(default)]
    pub count: Option<i64>,
}

#[derive(Deserialize)]
struct TicketEnvelope {
    ticket: RemoteTicket,
}

#[derive(Deserialize)]
struct CommentPage {
    #[serde(default)]
    comments: Vec<RemoteComment>,
    #[serde(default)]
    next_page: Option<String>,
}

#[derive(Deserialize)]
struct UserEnvelope {
    user: RemoteUser,
}

#[derive(Deserialize)]
struct OrganizationEnvelope {
    organization: RemoteOrganization,
}

#[async_trait]
pub trait TicketSource: Send + Sync {
    /// One page of tickets matching `query`, oldest update first. `page` starts at 1.
    async fn search(&self, query: &str, page: u32, per_page: u32) -> Result<SearchPage, ApiError>;

    async fn get_ticket(&self, id: i64) -> Result<RemoteTicket, ApiError>;

    /// Every comment of a ticket, following comment pagination to the end.
    async fn get_comments(&self, id: i64) -> Result<Vec<RemoteComment>, ApiError>;

    async fn get_user(&self, id: i64) -> Result<RemoteUser, ApiError>;

    async fn get_organization(&self, id: i64) -> Result<RemoteOrganization, ApiError>;
}

/// Lazily walks every search page for `query`, yielding one batch per page.
///
/// Each call starts again from page 1. The stream ends after the first error,
/// an empty page, or a page with no `next_page`.
pub fn paginate<'a, S>(
    source: &'a S,
    query: &'a str,
    per_page: u32,
) -> impl Stream<Item = Result<Vec<RemoteTicket>, ApiError>> + Send + 'a
where
    S: TicketSource + ?Sized,
{
    let per_page = per_page.clamp(1, MAX_PAGE_SIZE);
    stream::unfold(Some(1u32), move |page| async move {
        let page = page?;
        match source.search(query, page, per_page).await {
            Ok(found) => {
                if found.results.is_empty() {
                    return None;
                }
                debug!(page, fetched = found.results.len(), total = ?found.count, "search page fetched");
                let next = found.next_page.as_ref().map(|_| page + 1);
                Some((Ok(found.results), next))
            }
            Err(err) => Some((Err(err), None)),
        }
    })
}

#[derive(Clone)]
pub struct TicketingConfig {
    pub base_url: String,
    pub email: String,
    pub api_token: String,
    pub rate_limit_per_min: usize,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl std::fmt::Debug for TicketingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketingConfig")
            .field("base_url", &self.base_url)
            .field("email", &self.email)
            .field("api_token", &"***")
            .field("rate_limit_per_min", &self.rate_limit_per_min)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TicketingConfig {
    pub fn for_subdomain(subdomain: &str, email: &str, api_token: &str) -> Self {
        Self {
            base_url: format!("https://{subdomain}.zendesk.com/api/v2"),
            email: email.to_string(),
            api_token: api_token.to_string(),
            rate_limit_per_min: 700,
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Zendesk-style REST client authenticated with `{email}/token` basic auth.
#[derive(Debug, Clone)]
pub struct TicketingClient {
    http: RateLimitedHttpClient,
}

impl TicketingClient {
    pub fn new(config: TicketingConfig) -> anyhow::Result<Self> {
        let mut client = ClientConfig::new(config.base_url);
        client.timeout = config.timeout;
        client.backoff = config.backoff;
        client.rate_limit = RateLimitConfig::per_minute(config.rate_limit_per_min);
        client.auth = Some(Auth::Basic {
            username: format!("{}/token", config.email),
            password: config.api_token,
        });
        Ok(Self {
            http: RateLimitedHttpClient::new(client)?,
        })
    }

    pub fn http(&self) -> &RateLimitedHttpClient {
        &self.http
    }
}

#[async_trait]
impl TicketSource for TicketingClient {
    async fn search(&self, query: &str, page: u32, per_page: u32) -> Result<SearchPage, ApiError> {
        let params = [
            ("query", query.to_string()),
            ("sort_by", "updated_at".to_string()),
            ("sort_order", "asc".to_string()),
            ("page", page.to_string()),
            ("per_page", per_page.clamp(1, MAX_PAGE_SIZE).to_string()),
        ];
        self.http.get_json("search.json", &params).await
    }

    async fn get_ticket(&self, id: i64) -> Result<RemoteTicket, ApiError> {
        let envelope: TicketEnvelope = self.http.get_json(&format!("tickets/{id}.json"), &[]).await?;
        Ok(envelope.ticket)
    }

    async fn get_comments(&self, id: i64) -> Result<Vec<RemoteComment>, ApiError> {
        let mut comments = Vec::new();
        let mut next = Some(format!("tickets/{id}/comments.json"));
        while let Some(url) = next.take() {
            let page: CommentPage = self.http.get_json(&url, &[]).await?;
            comments.extend(page.comments);
            next = page.next_page;
        }
        Ok(comments)
    }

    async fn get_user(&self, id: i64) -> Result<RemoteUser, ApiError> {
        let envelope: UserEnvelope = self.http.get_json(&format!("users/{id}.json"), &[]).await?;
        Ok(envelope.user)
    }

    async fn get_organization(&self, id: i64) -> Result<RemoteOrganization, ApiError> {
        let envelope: OrganizationEnvelope = self
            .http
            .get_json(&format!("organizations/{id}.json"), &[])
            .await?;
        Ok(envelope.organization)
    }
}

/// Incremental search query for tickets updated strictly after `since`.
pub fn updated_since_query(since: DateTime<Utc>) -> String {
    format!("type:ticket updated>{}", since.format("%Y-%m-%dT%H:%M:%SZ"))
}

/// Renders comments as numbered text blocks; an empty list renders as `(No comments)`.
pub fn format_comments(comments: &[&RemoteComment]) -> String {
    if comments.is_empty() {
        return "(No comments)".to_string();
    }
    comments
        .iter()
        .enumerate()
        .map(|(i, comment)| {
            let kind = if comment.public {
                "Public Comment"
            } else {
                "Internal Note"
            };
            let author = comment
                .author_id
                .map_or_else(|| "Unknown".to_string(), |id| id.to_string());
            let created = comment
                .created_at
                .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_default();
            let body = [&comment.plain_body, &comment.body]
                .into_iter()
                .flatten()
                .find(|b| !b.is_empty())
                .map_or("(empty comment)", String::as_str);
            format!(
                "--- Comment {} ({kind}) ---\nAuthor ID: {author}\nCreated: {created}\n\n{body}\n",
                i + 1
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Splits comments on the public flag into `(internal_notes, public_comments)` text.
pub fn split_comments(comments: &[RemoteComment]) -> (String, String) {
    let (public, internal): (Vec<&RemoteComment>, Vec<&RemoteComment>) =
        comments.iter().partition(|c| c.public);
    (format_comments(&internal), format_comments(&public))
}

/// Joins a ticket, its comments and resolved directory names into the stored shape.
pub fn to_upsert(
    ticket: RemoteTicket,
    comments: &[RemoteComment],
    requester_email: Option<String>,
    organization_name: Option<String>,
) -> TicketUpsert {
    let (internal_notes, public_comments) = split_comments(comments);
    TicketUpsert {
        external_id: ticket.id,
        subject: ticket.subject,
        description: ticket.description,
        internal_notes,
        public_comments,
        requester_id: ticket.requester_id,
        requester_email,
        organization_id: ticket.organization_id,
        organization_name,
        tags: ticket.tags,
        status: ticket.status,
        priority: ticket.priority,
        created_at: ticket.created_at,
        updated_at: ticket.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn comment(public: bool, plain: Option<&str>, body: Option<&str>) -> RemoteComment {
        RemoteComment {
            id: Some(1),
            author_id: Some(42),
            public,
            body: body.map(Into::into),
            plain_body: plain.map(Into::into),
            created_at: Some(Utc.with_ymd_and_hms(2026, 2, 3, 14, 5, 9).unwrap()),
        }
    }

    #[test]
    fn comments_render_with_plain_body_preferred() {
        let public = comment(true, Some("plain text"), Some("<p>html</p>"));
        let rendered = format_comments(&[&public]);
        assert_eq!(
            rendered,
            "--- Comment 1 (Public Comment) ---\nAuthor ID: 42\nCreated: 2026-02-03 14:05:09 UTC\n\nplain text\n"
        );
    }

    #[test]
    fn comments_split_on_public_flag() {
        let comments = vec![
            comment(true, None, Some("customer says hi")),
            comment(false, None, None),
            comment(true, Some("second"), None),
        ];
        let (internal, public) = split_comments(&comments);
        assert!(internal.starts_with("--- Comment 1 (Internal Note) ---"));
        assert!(internal.contains("(empty comment)"));
        assert!(public.contains("--- Comment 2 (Public Comment) ---"));
        assert!(public.contains("customer says hi"));
        assert_eq!(format_comments(&[]), "(No comments)");
    }

    #[test]
    fn comments_default_to_public_when_flag_missing() {
        let parsed: RemoteComment = serde_json::from_str(r#"{"id": 3, "body": "hello"}"#).unwrap();
        assert!(parsed.public);
    }

    #[test]
    fn incremental_query_uses_utc_seconds() {
        let since = Utc.with_ymd_and_hms(2026, 1, 31, 23, 59, 1).unwrap();
        assert_eq!(updated_since_query(since), "type:ticket updated>2026-01-31T23:59:01Z");
    }

    #[test]
    fn credentials_are_redacted_in_debug() {
        let config = TicketingConfig::for_subdomain("acme", "ops@acme.test", "s3cr3t");
        let printed = format!("{config:?}");
        assert!(!printed.contains("s3cr3t"));
        assert_eq!(config.base_url, "https://acme.zendesk.com/api/v2");
    }
}
