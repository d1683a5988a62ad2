//! Dispute aggregation.
//!
//! One [`DisputeRecord`] joins the dispute's ledger summary, the timestamp of
//! its `DisputeCreated` block, the disputed job's metadata and the off-chain
//! message thread. Party names come from the profile cache and fall back to
//! [`UNKNOWN_LABEL`]; message roles are derived from the job's employer and
//! assigned workers.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::or_default;
use crate::api::{ApiError, MarketApi, ThreadMessage};
use crate::batch::BatchOutcome;
use crate::cache::ProfileCache;
use crate::ledger::{DisputeDao, LedgerProvider, LedgerResult};
use crate::model::{
    ledger_time, Address, ChatMessage, ChatRole, DisputeRecord, DisputeStatus, Party, Resolution,
    Votes, UNKNOWN_LABEL,
};

/// Fixed voting window after a dispute opens.
pub const VOTING_WINDOW_DAYS: i64 = 7;

pub const STAGE_DISPUTES: &str = "disputes";

/// Off-chain dispute threads.
#[async_trait]
pub trait ThreadSource: Send + Sync {
    async fn dispute_messages(&self, dispute_id: u64) -> Result<Vec<ThreadMessage>, ApiError>;
}

#[async_trait]
impl ThreadSource for MarketApi {
    async fn dispute_messages(&self, dispute_id: u64) -> Result<Vec<ThreadMessage>, ApiError> {
        MarketApi::dispute_messages(self, dispute_id).await
    }
}

/// Outcome of a resolved dispute. A tie goes against the worker.
pub fn derive_resolution(resolved: bool, votes_for: u64, votes_against: u64) -> Option<Resolution> {
    if !resolved {
        return None;
    }
    if votes_for > votes_against {
        Some(Resolution::InFavorOfWorker)
    } else {
        Some(Resolution::AgainstWorker)
    }
}

/// Close of the voting window opened at `opened`; `None` past chrono's range.
pub fn voting_ends(opened: DateTime<Utc>) -> Option<DateTime<Utc>> {
    opened.checked_add_signed(Duration::days(VOTING_WINDOW_DAYS))
}

/// Role of a thread participant. Employer wins over worker.
pub fn resolve_role(sender: &Address, employer: &Address, workers: &[Address]) -> ChatRole {
    if sender == employer {
        ChatRole::Employer
    } else if workers.contains(sender) {
        ChatRole::Worker
    } else {
        ChatRole::Juror
    }
}

/// Attach display name and role to a stored thread message.
pub async fn enrich_message(
    cache: &ProfileCache,
    message: ThreadMessage,
    employer: &Address,
    workers: &[Address],
) -> ChatMessage {
    ChatMessage {
        sender_display_name: cache.display_name_or(&message.sender, UNKNOWN_LABEL).await,
        role: resolve_role(&message.sender, employer, workers),
        sender: message.sender,
        content: message.content,
        timestamp: message.created_at,
    }
}

/// Every dispute on the DAO, with threads when `threads` is given.
///
/// Fails only when the dispute count itself cannot be read; per-dispute
/// summary failures are recorded in the batch.
pub async fn fetch_disputes(
    dao: &dyn DisputeDao,
    provider: &dyn LedgerProvider,
    cache: &ProfileCache,
    threads: Option<&dyn ThreadSource>,
) -> LedgerResult<BatchOutcome<DisputeRecord>> {
    let count = dao.dispute_count().await?;

    let opened_blocks: HashMap<u64, u64> = match dao.dispute_created_events().await {
        Ok(logs) => logs
            .into_iter()
            .map(|log| (log.dispute_id, log.block_number))
            .collect(),
        Err(e) => {
            warn!(error = %e, "DisputeCreated log query failed, open dates unknown");
            HashMap::new()
        }
    };

    let reads = join_all((0..count).map(|id| {
        let opened_block = opened_blocks.get(&id).copied();
        async move {
            let record = read_dispute(dao, provider, cache, threads, id, opened_block).await;
            (id, record)
        }
    }))
    .await;

    let disputes = BatchOutcome::collect(STAGE_DISPUTES, reads);
    debug!(count = count, fetched = disputes.items.len(), "Disputes aggregated");
    Ok(disputes)
}

/// Disputes the caller opened or employs on.
pub fn disputes_for(disputes: &[DisputeRecord], address: &Address) -> Vec<DisputeRecord> {
    disputes
        .iter()
        .filter(|d| d.involves(address))
        .cloned()
        .collect()
}

async fn read_dispute(
    dao: &dyn DisputeDao,
    provider: &dyn LedgerProvider,
    cache: &ProfileCache,
    threads: Option<&dyn ThreadSource>,
    id: u64,
    opened_block: Option<u64>,
) -> LedgerResult<DisputeRecord> {
    let summary = dao.dispute_summary(id).await?;
    let job_address = summary.job_address;
    let job = provider.job(job_address);

    let (title, employer, description, workers, opened_date) = tokio::join!(
        job.title(),
        job.employer(),
        job.description(),
        job.assigned_workers(),
        opened_date(provider, id, opened_block),
    );
    let employer = or_default(&job_address, "employer", employer);
    let assigned_workers = or_default(&job_address, "assignedWorkers", workers);
    let worker = assigned_workers.first().copied();

    let (employer_name, worker_name, messages) = tokio::join!(
        cache.display_name_or(&employer, UNKNOWN_LABEL),
        async {
            match worker {
                Some(w) => Some(cache.display_name_or(&w, UNKNOWN_LABEL).await),
                None => None,
            }
        },
        read_thread(cache, threads, id, &employer, &assigned_workers),
    );

    let resolution = derive_resolution(summary.resolved, summary.votes_for, summary.votes_against);
    Ok(DisputeRecord {
        id,
        job_address,
        job_title: or_default(&job_address, "title", title),
        description: or_default(&job_address, "description", description),
        employer: Party {
            address: employer,
            name: employer_name,
        },
        worker: worker.zip(worker_name).map(|(address, name)| Party { address, name }),
        assigned_workers,
        initiator: summary.initiator,
        resolved: summary.resolved,
        status: if summary.resolved {
            DisputeStatus::Resolved
        } else {
            DisputeStatus::Pending
        },
        resolution,
        opened_date,
        voting_ends: opened_date.and_then(voting_ends),
        votes: Votes {
            votes_for: summary.votes_for,
            against: summary.votes_against,
        },
        reason: summary.reason,
        messages,
    })
}

async fn opened_date(
    provider: &dyn LedgerProvider,
    id: u64,
    opened_block: Option<u64>,
) -> Option<DateTime<Utc>> {
    let Some(block) = opened_block else {
        debug!(dispute_id = id, "No DisputeCreated log, open date unknown");
        return None;
    };
    match provider.block_timestamp(block).await {
        Ok(seconds) => ledger_time(seconds),
        Err(e) => {
            warn!(dispute_id = id, block = block, error = %e, "Block timestamp unavailable");
            None
        }
    }
}

async fn read_thread(
    cache: &ProfileCache,
    threads: Option<&dyn ThreadSource>,
    id: u64,
    employer: &Address,
    workers: &[Address],
) -> Vec<ChatMessage> {
    let Some(threads) = threads else {
        return Vec::new();
    };
    let stored = match threads.dispute_messages(id).await {
        Ok(stored) => stored,
        Err(e) => {
            warn!(dispute_id = id, error = %e, "Dispute thread unavailable");
            return Vec::new();
        }
    };

    let mut messages = join_all(
        stored
            .into_iter()
            .map(|message| enrich_message(cache, message, employer, workers)),
    )
    .await;
    messages.sort_by_key(|m| m.timestamp);
    messages
}
