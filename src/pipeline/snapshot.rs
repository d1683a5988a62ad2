//! Published state and pipeline inputs.

use serde::Serialize;
use std::sync::Arc;

use crate::batch::ItemFailure;
use crate::ledger::{DisputeDao, JobFactory, LedgerProvider};
use crate::model::{
    Address, ApplicantRecord, Conversation, DisputeRecord, EmployerJob, Identity, JobRecord,
    JobSummary,
};

/// Upstream input: wallet identity plus the wallet's provider, if any.
#[derive(Clone, Default)]
pub struct IdentityInput {
    pub identity: Identity,
    pub provider: Option<Arc<dyn LedgerProvider>>,
}

impl IdentityInput {
    pub fn connected(address: Address, provider: Arc<dyn LedgerProvider>) -> Self {
        Self {
            identity: Identity::connected(address),
            provider: Some(provider),
        }
    }

    pub fn disconnected() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for IdentityInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityInput")
            .field("identity", &self.identity)
            .field("provider", &self.provider.as_ref().map(|p| p.id().to_string()))
            .finish()
    }
}

/// Contract bindings for one `(provider, address)` pair.
#[derive(Clone)]
pub struct ContractHandles {
    pub provider: Arc<dyn LedgerProvider>,
    pub job_factory: Arc<dyn JobFactory>,
    pub dispute_dao: Arc<dyn DisputeDao>,
    /// Signer for mutating calls; `None` on the read-only fallback
    pub signer: Option<Address>,
}

impl ContractHandles {
    pub fn bind(provider: Arc<dyn LedgerProvider>, signer: Option<Address>) -> Self {
        Self {
            job_factory: provider.job_factory(signer),
            dispute_dao: provider.dispute_dao(signer),
            provider,
            signer,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.signer.is_none()
    }
}

/// Denormalised view handed to the presentation layer.
///
/// Every field is replaced wholesale by the stage that owns it; the
/// `generation` identifies the identity change the content belongs to.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    pub generation: u64,
    pub identity: Identity,
    pub provider: Option<String>,
    pub jobs: Vec<JobSummary>,
    pub employer_jobs: Vec<EmployerJob>,
    pub applicants: Vec<ApplicantRecord>,
    pub my_jobs: Vec<JobRecord>,
    pub disputes: Vec<DisputeRecord>,
    pub my_disputes: Vec<DisputeRecord>,
    pub conversations: Vec<Conversation>,
    pub diagnostics: Vec<ItemFailure>,
}

impl MarketSnapshot {
    pub fn empty(generation: u64, identity: Identity) -> Self {
        Self {
            generation,
            identity,
            ..Default::default()
        }
    }

    /// Replace the diagnostics owned by `stages`.
    pub fn replace_diagnostics(&mut self, stages: &[&str], failures: Vec<ItemFailure>) {
        self.diagnostics
            .retain(|f| !stages.contains(&f.stage.as_str()));
        self.diagnostics.extend(failures);
    }

    pub fn dispute(&self, id: u64) -> Option<&DisputeRecord> {
        self.disputes.iter().find(|d| d.id == id)
    }
}

/// Failure of a whole stage, recorded alongside per-item failures.
pub(crate) fn stage_failure(stage: &str, call: &str, error: impl std::fmt::Display) -> ItemFailure {
    ItemFailure {
        stage: stage.to_string(),
        item: call.to_string(),
        error: error.to_string(),
    }
}
