//! External collaborators: the ticketing API and the issue classifier.

pub mod classifier;
pub mod ticketing;

pub use classifier::{
    parse_extraction, parse_naming, ClassifierConfig, ClassifierError, ClusterNaming,
    ExtractionOutcome, IssueClassifier, IssueSummary, LlmIssueClassifier, PARSE_ERROR_REASON,
};
pub use ticketing::{
    format_comments, paginate, split_comments, to_upsert, updated_since_query, RemoteComment,
    RemoteOrganization, RemoteTicket, RemoteUser, SearchPage, TicketSource, TicketingClient,
    TicketingConfig, MAX_PAGE_SIZE,
};

pub const CRATE_NAME: &str = "pim-adapters";
