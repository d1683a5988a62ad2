//! In-process ledger.
//!
//! `MemoryLedger` holds a recorded ledger state ([`LedgerFixture`], loadable
//! from JSON) and serves every contract trait from it. It backs the CLI when
//! no node is available and doubles as the test ledger: call counters,
//! artificial latency and per-call fault injection are built in.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::debug;

use super::*;
use crate::model::Address;

/// Seconds between synthetic blocks mined by mutating calls.
const BLOCK_INTERVAL_SECS: u64 = 12;

// =============================================================================
// Fixture
// =============================================================================

/// Recorded ledger state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LedgerFixture {
    pub job_factory: Address,
    pub dispute_dao: Address,
    pub jobs: Vec<JobFixture>,
    pub disputes: Vec<DisputeFixture>,
    pub ratings: Vec<RatingFixture>,
    /// Block number → unix timestamp
    pub blocks: BTreeMap<u64, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobFixture {
    pub address: Address,
    pub job_id: u64,
    pub employer: Address,
    pub title: String,
    pub description: String,
    pub pay_type: u8,
    pub weekly_pay: u128,
    pub total_pay: u128,
    pub duration_weeks: u64,
    pub positions: u64,
    pub created_at: u64,
    pub cancelled: bool,
    pub last_payout_at: u64,
    pub payouts_made: u64,
    pub assigned_workers: Vec<Address>,
    pub applicants: Vec<ApplicantFixture>,
    pub tags: Vec<String>,
    pub reputation: Address,
    pub block_number: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApplicantFixture {
    pub address: Address,
    pub application_text: String,
    pub applied_at: u64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DisputeFixture {
    pub job: Address,
    pub initiator: Address,
    pub resolved: bool,
    pub votes_for: u64,
    pub votes_against: u64,
    pub reason: String,
    /// Block of the `DisputeCreated` event; `None` when no event was indexed
    pub block_number: Option<u64>,
    pub voters: Vec<Address>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RatingFixture {
    pub registry: Address,
    pub subject: Address,
    pub average_x100: u64,
    pub total_ratings: u64,
}

// =============================================================================
// Shared state
// =============================================================================

#[derive(Debug, Default)]
struct Faults {
    job_list: Option<LedgerError>,
    jobs: HashMap<Address, LedgerError>,
    tags: HashMap<Address, (u64, LedgerError)>,
    disputes: HashMap<u64, LedgerError>,
}

#[derive(Debug, Default)]
struct LedgerState {
    fixture: RwLock<LedgerFixture>,
    faults: RwLock<Faults>,
    calls: DashMap<&'static str, u64>,
    latency: RwLock<Option<Duration>>,
    tx_counter: std::sync::atomic::AtomicU64,
}

impl LedgerState {
    fn fixture(&self) -> RwLockReadGuard<'_, LedgerFixture> {
        self.fixture.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn fixture_mut(&self) -> RwLockWriteGuard<'_, LedgerFixture> {
        self.fixture.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> RwLockReadGuard<'_, Faults> {
        self.faults.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults_mut(&self) -> RwLockWriteGuard<'_, Faults> {
        self.faults.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call and apply configured latency.
    async fn enter(&self, method: &'static str) {
        *self.calls.entry(method).or_insert(0) += 1;
        let latency = *self.latency.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
    }

    /// Mine a synthetic block and return its number.
    fn mine_block(&self) -> (u64, String) {
        let mut fixture = self.fixture_mut();
        let (last_number, last_time) = fixture
            .blocks
            .iter()
            .next_back()
            .map(|(n, t)| (*n, *t))
            .unwrap_or((0, chrono::Utc::now().timestamp().max(0) as u64));
        let number = last_number + 1;
        fixture.blocks.insert(number, last_time + BLOCK_INTERVAL_SECS);
        let nonce = self
            .tx_counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        (number, format!("0x{:064x}", nonce + 1))
    }
}

// =============================================================================
// Provider
// =============================================================================

/// Ledger provider serving a [`LedgerFixture`] from memory.
#[derive(Clone)]
pub struct MemoryLedger {
    id: String,
    state: Arc<LedgerState>,
}

impl MemoryLedger {
    pub fn new(fixture: LedgerFixture) -> Self {
        Self {
            id: "memory".to_string(),
            state: Arc::new(LedgerState {
                fixture: RwLock::new(fixture),
                ..Default::default()
            }),
        }
    }

    /// Load a fixture recorded as JSON.
    pub fn from_json_file(path: impl AsRef<Path>) -> crate::types::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let fixture: LedgerFixture = serde_json::from_str(&content)?;
        debug!(
            path = %path.as_ref().display(),
            jobs = fixture.jobs.len(),
            disputes = fixture.disputes.len(),
            "Loaded ledger fixture"
        );
        Ok(Self::new(fixture))
    }

    /// Distinct provider identity, as a different wallet connection would have.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Apply a change to the recorded state.
    pub fn update(&self, change: impl FnOnce(&mut LedgerFixture)) {
        change(&mut self.state.fixture_mut());
    }

    /// Make every call on `job` fail.
    pub fn fail_job(&self, job: Address, error: LedgerError) {
        self.state.faults_mut().jobs.insert(job, error);
    }

    /// Make `getAllJobs()` fail.
    pub fn fail_job_list(&self, error: LedgerError) {
        self.state.faults_mut().job_list = Some(error);
    }

    /// Make `tags(index)` on `job` fail with `error`.
    pub fn fail_tag(&self, job: Address, index: u64, error: LedgerError) {
        self.state.faults_mut().tags.insert(job, (index, error));
    }

    /// Make `getDisputeSummary(id)` fail.
    pub fn fail_dispute(&self, id: u64, error: LedgerError) {
        self.state.faults_mut().disputes.insert(id, error);
    }

    pub fn clear_faults(&self) {
        *self.state.faults_mut() = Faults::default();
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.state.latency.write().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Number of calls made to `method` (getter name in snake case).
    pub fn call_count(&self, method: &str) -> u64 {
        self.state
            .calls
            .get(method)
            .map(|count| *count)
            .unwrap_or(0)
    }
}

#[async_trait]
impl LedgerProvider for MemoryLedger {
    fn id(&self) -> &str {
        &self.id
    }

    fn job_factory(&self, _signer: Option<Address>) -> Arc<dyn JobFactory> {
        Arc::new(MemoryJobFactory {
            state: Arc::clone(&self.state),
        })
    }

    fn dispute_dao(&self, signer: Option<Address>) -> Arc<dyn DisputeDao> {
        Arc::new(MemoryDisputeDao {
            state: Arc::clone(&self.state),
            signer,
        })
    }

    fn job(&self, address: Address) -> Arc<dyn JobContract> {
        Arc::new(MemoryJob {
            state: Arc::clone(&self.state),
            address,
        })
    }

    fn reputation(&self, address: Address) -> Arc<dyn ReputationRegistry> {
        Arc::new(MemoryReputation {
            state: Arc::clone(&self.state),
            address,
        })
    }

    async fn block_timestamp(&self, block_number: u64) -> LedgerResult<u64> {
        self.state.enter("block_timestamp").await;
        self.state
            .fixture()
            .blocks
            .get(&block_number)
            .copied()
            .ok_or_else(|| LedgerError::Reverted(format!("unknown block {block_number}")))
    }
}

// =============================================================================
// Job factory
// =============================================================================

struct MemoryJobFactory {
    state: Arc<LedgerState>,
}

#[async_trait]
impl JobFactory for MemoryJobFactory {
    fn address(&self) -> Address {
        self.state.fixture().job_factory
    }

    async fn all_jobs(&self) -> LedgerResult<Vec<Address>> {
        self.state.enter("all_jobs").await;
        if let Some(e) = self.state.faults().job_list.clone() {
            return Err(e);
        }
        Ok(self.state.fixture().jobs.iter().map(|j| j.address).collect())
    }

    async fn job_created_events(
        &self,
        employer: Option<Address>,
    ) -> LedgerResult<Vec<JobCreatedLog>> {
        self.state.enter("job_created_events").await;
        Ok(self
            .state
            .fixture()
            .jobs
            .iter()
            .filter(|job| employer.map_or(true, |e| job.employer == e))
            .map(|job| JobCreatedLog {
                job_id: job.job_id,
                employer: job.employer,
                job_address: job.address,
                block_number: job.block_number,
            })
            .collect())
    }
}

// =============================================================================
// Job
// =============================================================================

struct MemoryJob {
    state: Arc<LedgerState>,
    address: Address,
}

impl MemoryJob {
    fn with_job<T>(&self, read: impl FnOnce(&JobFixture) -> T) -> LedgerResult<T> {
        if let Some(e) = self.state.faults().jobs.get(&self.address) {
            return Err(e.clone());
        }
        let fixture = self.state.fixture();
        fixture
            .jobs
            .iter()
            .find(|job| job.address == self.address)
            .map(read)
            .ok_or_else(|| LedgerError::Reverted(format!("no job contract at {}", self.address)))
    }
}

#[async_trait]
impl JobContract for MemoryJob {
    fn address(&self) -> Address {
        self.address
    }

    async fn employer(&self) -> LedgerResult<Address> {
        self.state.enter("employer").await;
        self.with_job(|job| job.employer)
    }

    async fn title(&self) -> LedgerResult<String> {
        self.state.enter("title").await;
        self.with_job(|job| job.title.clone())
    }

    async fn description(&self) -> LedgerResult<String> {
        self.state.enter("description").await;
        self.with_job(|job| job.description.clone())
    }

    async fn pay_type(&self) -> LedgerResult<u8> {
        self.state.enter("pay_type").await;
        self.with_job(|job| job.pay_type)
    }

    async fn weekly_pay(&self) -> LedgerResult<u128> {
        self.state.enter("weekly_pay").await;
        self.with_job(|job| job.weekly_pay)
    }

    async fn total_pay(&self) -> LedgerResult<u128> {
        self.state.enter("total_pay").await;
        self.with_job(|job| job.total_pay)
    }

    async fn duration_weeks(&self) -> LedgerResult<u64> {
        self.state.enter("duration_weeks").await;
        self.with_job(|job| job.duration_weeks)
    }

    async fn positions(&self) -> LedgerResult<u64> {
        self.state.enter("positions").await;
        self.with_job(|job| job.positions)
    }

    async fn created_at(&self) -> LedgerResult<u64> {
        self.state.enter("created_at").await;
        self.with_job(|job| job.created_at)
    }

    async fn job_cancelled(&self) -> LedgerResult<bool> {
        self.state.enter("job_cancelled").await;
        self.with_job(|job| job.cancelled)
    }

    async fn last_payout_at(&self) -> LedgerResult<u64> {
        self.state.enter("last_payout_at").await;
        self.with_job(|job| job.last_payout_at)
    }

    async fn payouts_made(&self) -> LedgerResult<u64> {
        self.state.enter("payouts_made").await;
        self.with_job(|job| job.payouts_made)
    }

    async fn assigned_workers(&self) -> LedgerResult<Vec<Address>> {
        self.state.enter("assigned_workers").await;
        self.with_job(|job| job.assigned_workers.clone())
    }

    async fn all_applicants(&self) -> LedgerResult<Vec<Address>> {
        self.state.enter("all_applicants").await;
        self.with_job(|job| job.applicants.iter().map(|a| a.address).collect())
    }

    async fn applicant(&self, applicant: Address) -> LedgerResult<ApplicantInfo> {
        self.state.enter("applicant").await;
        self.with_job(|job| {
            job.applicants
                .iter()
                .find(|a| a.address == applicant)
                .map(|a| ApplicantInfo {
                    application_text: a.application_text.clone(),
                    applied_at: a.applied_at,
                    is_active: a.is_active,
                })
        })?
        .ok_or_else(|| LedgerError::Reverted(format!("{applicant} has not applied")))
    }

    async fn is_worker(&self, worker: Address) -> LedgerResult<bool> {
        self.state.enter("is_worker").await;
        self.with_job(|job| job.assigned_workers.contains(&worker))
    }

    async fn total_applications(&self) -> LedgerResult<u64> {
        self.state.enter("total_applications").await;
        self.with_job(|job| job.applicants.len() as u64)
    }

    async fn tag(&self, index: u64) -> LedgerResult<String> {
        self.state.enter("tag").await;
        if let Some((failing, e)) = self.state.faults().tags.get(&self.address) {
            if *failing == index {
                return Err(e.clone());
            }
        }
        self.with_job(|job| job.tags.get(index as usize).cloned())?
            .ok_or(LedgerError::OutOfRange { index })
    }

    async fn reputation(&self) -> LedgerResult<Address> {
        self.state.enter("reputation").await;
        self.with_job(|job| job.reputation)
    }
}

// =============================================================================
// Reputation registry
// =============================================================================

struct MemoryReputation {
    state: Arc<LedgerState>,
    address: Address,
}

#[async_trait]
impl ReputationRegistry for MemoryReputation {
    async fn average_rating(&self, subject: Address) -> LedgerResult<AverageRating> {
        self.state.enter("average_rating").await;
        // Unrated subjects read as zero, like an unset mapping slot.
        Ok(self
            .state
            .fixture()
            .ratings
            .iter()
            .find(|r| r.registry == self.address && r.subject == subject)
            .map(|r| AverageRating {
                average_x100: r.average_x100,
                total_ratings: r.total_ratings,
            })
            .unwrap_or_default())
    }
}

// =============================================================================
// Dispute DAO
// =============================================================================

struct MemoryDisputeDao {
    state: Arc<LedgerState>,
    signer: Option<Address>,
}

#[async_trait]
impl DisputeDao for MemoryDisputeDao {
    fn address(&self) -> Address {
        self.state.fixture().dispute_dao
    }

    async fn dispute_count(&self) -> LedgerResult<u64> {
        self.state.enter("dispute_count").await;
        Ok(self.state.fixture().disputes.len() as u64)
    }

    async fn dispute_summary(&self, id: u64) -> LedgerResult<DisputeSummary> {
        self.state.enter("dispute_summary").await;
        if let Some(e) = self.state.faults().disputes.get(&id) {
            return Err(e.clone());
        }
        let fixture = self.state.fixture();
        let dispute = fixture
            .disputes
            .get(id as usize)
            .ok_or(LedgerError::OutOfRange { index: id })?;
        Ok(DisputeSummary {
            job_address: dispute.job,
            initiator: dispute.initiator,
            resolved: dispute.resolved,
            votes_for: dispute.votes_for,
            votes_against: dispute.votes_against,
            reason: dispute.reason.clone(),
        })
    }

    async fn dispute_created_events(&self) -> LedgerResult<Vec<DisputeCreatedLog>> {
        self.state.enter("dispute_created_events").await;
        Ok(self
            .state
            .fixture()
            .disputes
            .iter()
            .enumerate()
            .filter_map(|(id, d)| {
                d.block_number.map(|block_number| DisputeCreatedLog {
                    dispute_id: id as u64,
                    block_number,
                })
            })
            .collect())
    }

    async fn create_dispute(&self, job: Address, reason: &str) -> LedgerResult<TxReceipt> {
        self.state.enter("create_dispute").await;
        let signer = self.signer.ok_or(LedgerError::NoSigner)?;
        if !self.state.fixture().jobs.iter().any(|j| j.address == job) {
            return Err(LedgerError::Reverted(format!("no job contract at {job}")));
        }

        let (block_number, tx_hash) = self.state.mine_block();
        self.state.fixture_mut().disputes.push(DisputeFixture {
            job,
            initiator: signer,
            reason: reason.to_string(),
            block_number: Some(block_number),
            ..Default::default()
        });
        Ok(TxReceipt {
            tx_hash,
            block_number,
        })
    }

    async fn vote(&self, id: u64, support_worker: bool) -> LedgerResult<TxReceipt> {
        self.state.enter("vote").await;
        let signer = self.signer.ok_or(LedgerError::NoSigner)?;
        {
            let mut fixture = self.state.fixture_mut();
            let dispute = fixture
                .disputes
                .get_mut(id as usize)
                .ok_or(LedgerError::OutOfRange { index: id })?;
            if dispute.resolved {
                return Err(LedgerError::Reverted("dispute already resolved".into()));
            }
            if dispute.voters.contains(&signer) {
                return Err(LedgerError::Reverted("already voted".into()));
            }
            dispute.voters.push(signer);
            if support_worker {
                dispute.votes_for += 1;
            } else {
                dispute.votes_against += 1;
            }
        }

        let (block_number, tx_hash) = self.state.mine_block();
        Ok(TxReceipt {
            tx_hash,
            block_number,
        })
    }
}
