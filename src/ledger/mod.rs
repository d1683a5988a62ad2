//! Ledger contract-call abstraction.
//!
//! The contracts themselves (job lifecycle, payouts, dispute voting) are
//! external. This module only describes the read/write surface the
//! aggregation layer consumes, as a set of traits bound through a
//! [`LedgerProvider`]:
//!
//! - [`JobFactory`]: job registry and `JobCreated` events
//! - [`JobContract`]: per-job scalar getters, applicants, indexed tags
//! - [`ReputationRegistry`]: average ratings
//! - [`DisputeDao`]: dispute summaries, `DisputeCreated` events, votes
//!
//! [`memory::MemoryLedger`] implements all of them in-process.

pub mod memory;
pub mod scan;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::model::Address;

pub use memory::{LedgerFixture, MemoryLedger};
pub use scan::{scan_all, ScanOutcome, ScanStop};

/// Contract call failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Indexed getter probed past the end of its collection
    #[error("Index {index} out of range")]
    OutOfRange { index: u64 },

    /// Contract reverted the call
    #[error("Call reverted: {0}")]
    Reverted(String),

    /// Node/transport failure; the call may succeed if repeated
    #[error("Transport error: {0}")]
    Transport(String),

    /// Return data did not have the expected shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// Mutating call attempted on a handle bound without a signer
    #[error("No signer bound to contract handle")]
    NoSigner,
}

impl LedgerError {
    /// Whether this failure marks the end of an indexed collection.
    ///
    /// Out-of-range reads surface as reverts on most bindings, so both are
    /// treated as end-of-collection.
    pub fn is_end_of_collection(&self) -> bool {
        matches!(self, LedgerError::OutOfRange { .. } | LedgerError::Reverted(_))
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// `JobCreated(jobId, employer, jobAddress)` log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCreatedLog {
    pub job_id: u64,
    pub employer: Address,
    pub job_address: Address,
    pub block_number: u64,
}

/// `DisputeCreated(id)` log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeCreatedLog {
    pub dispute_id: u64,
    pub block_number: u64,
}

/// `getApplicant(address)` return tuple.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicantInfo {
    pub application_text: String,
    pub applied_at: u64,
    pub is_active: bool,
}

/// `getDisputeSummary(id)` return tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisputeSummary {
    pub job_address: Address,
    pub initiator: Address,
    pub resolved: bool,
    pub votes_for: u64,
    pub votes_against: u64,
    pub reason: String,
}

/// `getAverageRating(address)` return tuple; the average is scaled ×100.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AverageRating {
    pub average_x100: u64,
    pub total_ratings: u64,
}

/// Receipt of a mined mutating call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block_number: u64,
}

#[async_trait]
pub trait JobFactory: Send + Sync {
    fn address(&self) -> Address;

    async fn all_jobs(&self) -> LedgerResult<Vec<Address>>;

    /// `JobCreated` logs, optionally filtered on the indexed employer topic.
    async fn job_created_events(&self, employer: Option<Address>)
        -> LedgerResult<Vec<JobCreatedLog>>;
}

#[async_trait]
pub trait JobContract: Send + Sync {
    fn address(&self) -> Address;

    async fn employer(&self) -> LedgerResult<Address>;
    async fn title(&self) -> LedgerResult<String>;
    async fn description(&self) -> LedgerResult<String>;
    async fn pay_type(&self) -> LedgerResult<u8>;
    async fn weekly_pay(&self) -> LedgerResult<u128>;
    async fn total_pay(&self) -> LedgerResult<u128>;
    async fn duration_weeks(&self) -> LedgerResult<u64>;
    async fn positions(&self) -> LedgerResult<u64>;
    async fn created_at(&self) -> LedgerResult<u64>;
    async fn job_cancelled(&self) -> LedgerResult<bool>;
    async fn last_payout_at(&self) -> LedgerResult<u64>;
    async fn payouts_made(&self) -> LedgerResult<u64>;
    async fn assigned_workers(&self) -> LedgerResult<Vec<Address>>;
    async fn all_applicants(&self) -> LedgerResult<Vec<Address>>;
    async fn applicant(&self, applicant: Address) -> LedgerResult<ApplicantInfo>;
    async fn is_worker(&self, worker: Address) -> LedgerResult<bool>;
    async fn total_applications(&self) -> LedgerResult<u64>;

    /// Indexed `tags(i)` getter; there is no length accessor.
    async fn tag(&self, index: u64) -> LedgerResult<String>;

    /// Address of the reputation registry this job reports to.
    async fn reputation(&self) -> LedgerResult<Address>;
}

#[async_trait]
pub trait ReputationRegistry: Send + Sync {
    async fn average_rating(&self, subject: Address) -> LedgerResult<AverageRating>;
}

#[async_trait]
pub trait DisputeDao: Send + Sync {
    fn address(&self) -> Address;

    async fn dispute_count(&self) -> LedgerResult<u64>;
    async fn dispute_summary(&self, id: u64) -> LedgerResult<DisputeSummary>;
    async fn dispute_created_events(&self) -> LedgerResult<Vec<DisputeCreatedLog>>;

    /// Open a dispute on `job`; needs a signer-bound handle.
    async fn create_dispute(&self, job: Address, reason: &str) -> LedgerResult<TxReceipt>;

    /// Cast a juror vote; needs a signer-bound handle.
    async fn vote(&self, id: u64, support_worker: bool) -> LedgerResult<TxReceipt>;
}

/// Request-capable ledger provider.
///
/// Contract handles are cheap bindings; mutating calls go out under the
/// signer the handle was bound with.
#[async_trait]
pub trait LedgerProvider: Send + Sync {
    /// Stable identifier; a change means every contract handle is stale.
    fn id(&self) -> &str;

    fn job_factory(&self, signer: Option<Address>) -> Arc<dyn JobFactory>;

    fn dispute_dao(&self, signer: Option<Address>) -> Arc<dyn DisputeDao>;

    fn job(&self, address: Address) -> Arc<dyn JobContract>;

    fn reputation(&self, address: Address) -> Arc<dyn ReputationRegistry>;

    async fn block_timestamp(&self, block_number: u64) -> LedgerResult<u64>;
}
