//! Scripted collaborators for pipeline tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pim_adapters::{
    parse_extraction, ClassifierError, ClusterNaming, ExtractionOutcome, IssueClassifier,
    IssueSummary, RemoteComment, RemoteOrganization, RemoteTicket, RemoteUser, SearchPage,
    TicketSource,
};
use pim_core::{Category, IssueCandidate, IssueType, Severity, TicketView};
use pim_storage::ApiError;

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
}

pub fn remote_ticket(id: i64, updated_at: DateTime<Utc>, org: Option<i64>) -> RemoteTicket {
    RemoteTicket {
        id,
        subject: Some(format!("Ticket {id}")),
        description: Some("The clock-in button does nothing".into()),
        requester_id: Some(500 + id % 3),
        organization_id: org,
        tags: vec!["android".into()],
        status: Some("open".into()),
        priority: Some("normal".into()),
        created_at: updated_at - chrono::Duration::hours(1),
        updated_at,
    }
}

pub fn transient(detail: &str) -> ApiError {
    ApiError::TransientApi {
        attempts: 3,
        detail: detail.to_string(),
    }
}

/// In-memory ticketing API. Search honours `updated>` and pages by `per_page`.
#[derive(Default)]
pub struct FakeSource {
    pub tickets: Mutex<Vec<RemoteTicket>>,
    pub comments: HashMap<i64, Vec<RemoteComment>>,
    pub failing_tickets: Mutex<HashSet<i64>>,
    pub search_unreachable: bool,
    pub ticket_calls: AtomicUsize,
    pub user_calls: AtomicUsize,
    pub org_calls: AtomicUsize,
}

impl FakeSource {
    pub fn with_tickets(tickets: Vec<RemoteTicket>) -> Self {
        Self {
            tickets: Mutex::new(tickets),
            ..Self::default()
        }
    }

    pub fn fail_ticket(&self, id: i64) {
        self.failing_tickets.lock().unwrap().insert(id);
    }

    pub fn heal_ticket(&self, id: i64) {
        self.failing_tickets.lock().unwrap().remove(&id);
    }

    pub fn touch(&self, id: i64, updated_at: DateTime<Utc>) {
        let mut tickets = self.tickets.lock().unwrap();
        if let Some(ticket) = tickets.iter_mut().find(|t| t.id == id) {
            ticket.updated_at = updated_at;
            ticket.status = Some("solved".into());
        }
    }
}

fn since_of(query: &str) -> Option<DateTime<Utc>> {
    let raw = query.split("updated>").nth(1)?.split_whitespace().next()?;
    DateTime::parse_from_rfc3339(raw).ok().map(|d| d.with_timezone(&Utc))
}

#[async_trait]
impl TicketSource for FakeSource {
    async fn search(&self, query: &str, page: u32, per_page: u32) -> Result<SearchPage, ApiError> {
        if self.search_unreachable {
            return Err(transient("connection refused"));
        }
        let since = since_of(query);
        let mut matching: Vec<RemoteTicket> = self
            .tickets
            .lock()
            .unwrap()
            .iter()
            .filter(|t| since.map_or(true, |s| t.updated_at > s))
            .cloned()
            .collect();
        matching.sort_by_key(|t| (t.updated_at, t.id));

        let per_page = per_page as usize;
        let skip = (page as usize - 1) * per_page;
        let results: Vec<RemoteTicket> = matching.iter().skip(skip).take(per_page).cloned().collect();
        let next_page = (skip + per_page < matching.len()).then(|| format!("page={}", page + 1));
        Ok(SearchPage {
            results,
            next_page,
            count: Some(matching.len() as i64),
        })
    }

    async fn get_ticket(&self, id: i64) -> Result<RemoteTicket, ApiError> {
        self.ticket_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_tickets.lock().unwrap().contains(&id) {
            return Err(transient("upstream 502"));
        }
        self.tickets
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(ApiError::ClientRequest {
                status: 404,
                url: format!("tickets/{id}.json"),
                body: String::new(),
            })
    }

    async fn get_comments(&self, id: i64) -> Result<Vec<RemoteComment>, ApiError> {
        Ok(self.comments.get(&id).cloned().unwrap_or_default())
    }

    async fn get_user(&self, id: i64) -> Result<RemoteUser, ApiError> {
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        Ok(RemoteUser {
            id,
            email: Some(format!("user{id}@acme.test")),
        })
    }

    async fn get_organization(&self, id: i64) -> Result<RemoteOrganization, ApiError> {
        self.org_calls.fetch_add(1, Ordering::SeqCst);
        if id == 404 {
            return Err(ApiError::ClientRequest {
                status: 404,
                url: format!("organizations/{id}.json"),
                body: String::new(),
            });
        }
        Ok(RemoteOrganization {
            id,
            name: Some(format!("Org {id}")),
        })
    }
}

pub fn candidate(category: Category, subcategory: &str, summary: &str) -> IssueCandidate {
    IssueCandidate {
        category,
        subcategory: subcategory.into(),
        issue_type: IssueType::Bug,
        severity: Severity::Medium,
        summary: summary.into(),
        detail: None,
        representative_quote: Some(format!("\"{summary}\" keeps happening")),
        confidence: Some(0.8),
    }
}

#[derive(Clone)]
pub enum Script {
    Issues(Vec<IssueCandidate>),
    /// Raw model text, run through the real output parser.
    Raw(String),
    Fail,
}

/// Classifier answering from a per-ticket script keyed by external id.
pub struct ScriptedClassifier {
    pub scripts: Mutex<HashMap<i64, Script>>,
    pub fallback: Script,
    pub naming_fails: bool,
    pub extract_calls: AtomicUsize,
    pub naming_calls: AtomicUsize,
}

impl ScriptedClassifier {
    pub fn new(fallback: Script) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback,
            naming_fails: false,
            extract_calls: AtomicUsize::new(0),
            naming_calls: AtomicUsize::new(0),
        }
    }

    pub fn script(self, external_id: i64, script: Script) -> Self {
        self.scripts.lock().unwrap().insert(external_id, script);
        self
    }

    pub fn set(&self, external_id: i64, script: Script) {
        self.scripts.lock().unwrap().insert(external_id, script);
    }
}

#[async_trait]
impl IssueClassifier for ScriptedClassifier {
    async fn extract_issues(&self, ticket: &TicketView) -> Result<ExtractionOutcome, ClassifierError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&ticket.external_id)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());
        match script {
            Script::Issues(issues) => Ok(ExtractionOutcome {
                no_issue: issues.is_empty(),
                issues,
                ..ExtractionOutcome::default()
            }),
            Script::Raw(text) => Ok(parse_extraction(&text, ticket.external_id)),
            Script::Fail => Err(ClassifierError::Api(transient("classifier overloaded"))),
        }
    }

    async fn name_cluster(&self, issues: &[IssueSummary]) -> Result<ClusterNaming, ClassifierError> {
        self.naming_calls.fetch_add(1, Ordering::SeqCst);
        if self.naming_fails {
            return Err(ClassifierError::Parse("not json".into()));
        }
        let first = issues.first().map(|i| i.summary.as_str()).unwrap_or("Unknown");
        Ok(ClusterNaming {
            name: format!("{first} ({} reports)", issues.len()),
            summary: format!("{} customers report: {first}", issues.len()),
        })
    }
}
