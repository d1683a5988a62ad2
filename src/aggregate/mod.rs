//! Denormalising aggregators.
//!
//! Each aggregator joins ledger reads, off-chain records and cached profiles
//! into the read-projections published by the pipeline. Field reads degrade
//! to defaults; per-item failures are collected into a
//! [`BatchOutcome`](crate::batch::BatchOutcome).

pub mod conversations;
pub mod disputes;
pub mod jobs;

use tracing::warn;

use crate::ledger::LedgerResult;
use crate::model::Address;

pub use conversations::{counterparty, group_conversations, insert_message};
pub use disputes::{
    derive_resolution, disputes_for, enrich_message, fetch_disputes, resolve_role, ThreadSource,
    VOTING_WINDOW_DAYS,
};
pub use jobs::{
    employer_job_addresses, fetch_employer_jobs, fetch_job_universe, fetch_worker_jobs,
    EmployerJobs, JobUniverse,
};

/// Value of a non-essential ledger read, or its default on failure.
pub(crate) fn or_default<T: Default>(
    contract: &Address,
    field: &'static str,
    result: LedgerResult<T>,
) -> T {
    result.unwrap_or_else(|e| {
        warn!(contract = %contract, field = field, error = %e, "Ledger read failed, using default");
        T::default()
    })
}
