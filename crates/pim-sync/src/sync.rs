//! Incremental and backfill ticket sync.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use futures::{StreamExt, TryStreamExt};
use pim_adapters::{paginate, to_upsert, updated_since_query, RemoteTicket, TicketSource};
use pim_core::{SyncResult, UpsertOutcome};
use pim_storage::Store;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Tickets fetched at once; the shared request budget still applies.
    pub concurrency: usize,
    pub page_size: u32,
    /// How far back the very first incremental run looks.
    pub first_run_lookback: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            page_size: 100,
            first_run_lookback: Duration::days(1),
        }
    }
}

type Memo = Mutex<HashMap<i64, Arc<OnceCell<Option<String>>>>>;

/// Per-run memo of requester emails and organization names. Concurrent
/// lookups of one id share a single request.
#[derive(Default)]
struct Directory {
    emails: Memo,
    organizations: Memo,
}

async fn memo_cell(memo: &Memo, id: i64) -> Arc<OnceCell<Option<String>>> {
    memo.lock().await.entry(id).or_default().clone()
}

impl Directory {
    async fn requester_email(&self, source: &dyn TicketSource, id: Option<i64>) -> Option<String> {
        let id = id?;
        let cell = memo_cell(&self.emails, id).await;
        cell.get_or_init(|| async move {
            match source.get_user(id).await {
                Ok(user) => user.email,
                Err(err) => {
                    warn!(requester_id = id, error = %err, "could not resolve requester");
                    None
                }
            }
        })
        .await
        .clone()
    }

    async fn organization_name(&self, source: &dyn TicketSource, id: Option<i64>) -> Option<String> {
        let id = id?;
        let cell = memo_cell(&self.organizations, id).await;
        cell.get_or_init(|| async move {
            match source.get_organization(id).await {
                Ok(org) => org.name,
                Err(err) => {
                    warn!(organization_id = id, error = %err, "could not resolve organization");
                    None
                }
            }
        })
        .await
        .clone()
    }
}

struct TicketReport {
    external_id: i64,
    updated_at: DateTime<Utc>,
    outcome: Result<UpsertOutcome>,
}

pub struct SyncEngine {
    store: Arc<dyn Store>,
    source: Arc<dyn TicketSource>,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn Store>, source: Arc<dyn TicketSource>, options: SyncOptions) -> Self {
        Self {
            store,
            source,
            options,
        }
    }

    pub async fn sync(&self, backfill_days: Option<u32>) -> Result<SyncResult> {
        self.sync_at(Utc::now(), backfill_days).await
    }

    /// Pulls every ticket updated after the start point and upserts it.
    ///
    /// The watermark is written once, after the whole walk. It never passes a
    /// ticket that failed, so the next run fetches that ticket again.
    pub async fn sync_at(&self, now: DateTime<Utc>, backfill_days: Option<u32>) -> Result<SyncResult> {
        let state = self.store.sync_state().await.context("loading sync state")?;
        let start = match (backfill_days, state.watermark) {
            (Some(days), _) => now - Duration::days(i64::from(days)),
            (None, Some(watermark)) => watermark,
            (None, None) => now - self.options.first_run_lookback,
        };
        let query = updated_since_query(start);
        info!(%start, backfill_days = ?backfill_days, %query, "starting ticket sync");

        let directory = Directory::default();
        let mut result = SyncResult::default();
        let mut latest_seen: Option<DateTime<Utc>> = None;
        let mut earliest_failed: Option<DateTime<Utc>> = None;

        let mut pages = Box::pin(paginate(self.source.as_ref(), &query, self.options.page_size));
        while let Some(batch) = pages
            .try_next()
            .await
            .context("searching for updated tickets")?
        {
            let reports: Vec<TicketReport> = futures::stream::iter(batch)
                .map(|ticket| self.sync_ticket(ticket, &directory, now))
                .buffered(self.options.concurrency.max(1))
                .collect()
                .await;

            for report in reports {
                latest_seen = latest_seen.max(Some(report.updated_at));
                match report.outcome {
                    Ok(outcome) => {
                        result.tickets_synced += 1;
                        if outcome == UpsertOutcome::Updated {
                            result.tickets_updated += 1;
                        }
                    }
                    Err(err) => {
                        let detail = format!("{err:#}");
                        warn!(ticket = report.external_id, error = %detail, "ticket sync failed");
                        result.errors += 1;
                        earliest_failed = Some(
                            earliest_failed.map_or(report.updated_at, |e| e.min(report.updated_at)),
                        );
                    }
                }
            }
            debug!(synced = result.tickets_synced, errors = result.errors, "search page processed");
        }

        let advanced = match (latest_seen, earliest_failed) {
            (Some(latest), Some(failed)) => Some(latest.min(failed - Duration::seconds(1))),
            (Some(latest), None) => Some(latest),
            (None, _) if state.watermark.is_none() => Some(start),
            (None, _) => None,
        };
        self.store
            .record_sync(advanced, result.tickets_synced as i64, Utc::now())
            .await
            .context("recording sync state")?;
        result.watermark = self.store.sync_state().await?.watermark;

        info!(
            synced = result.tickets_synced,
            updated = result.tickets_updated,
            errors = result.errors,
            watermark = ?result.watermark,
            "ticket sync finished"
        );
        Ok(result)
    }

    async fn sync_ticket(
        &self,
        summary: RemoteTicket,
        directory: &Directory,
        synced_at: DateTime<Utc>,
    ) -> TicketReport {
        let external_id = summary.id;
        let updated_at = summary.updated_at;
        let outcome = self
            .fetch_and_upsert(external_id, directory, synced_at)
            .instrument(info_span!("sync_ticket", ticket = external_id))
            .await;
        TicketReport {
            external_id,
            updated_at,
            outcome,
        }
    }

    async fn fetch_and_upsert(
        &self,
        external_id: i64,
        directory: &Directory,
        synced_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let source = self.source.as_ref();
        let (ticket, comments) =
            tokio::try_join!(source.get_ticket(external_id), source.get_comments(external_id))
                .context("fetching ticket and comments")?;

        let (requester_email, organization_name) = tokio::join!(
            directory.requester_email(source, ticket.requester_id),
            directory.organization_name(source, ticket.organization_id),
        );

        let upsert = to_upsert(ticket, &comments, requester_email, organization_name);
        let outcome = self
            .store
            .upsert_ticket(upsert, synced_at)
            .await
            .context("upserting ticket")?;
        Ok(outcome)
    }
}
