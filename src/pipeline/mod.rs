//! Dependent fetch pipeline.
//!
//! Stages, in dependency order:
//!
//! | Stage | Needs | Publishes |
//! |---|---|---|
//! | contracts | provider, address | handles (internal) |
//! | jobs | contracts | `jobs` |
//! | employer job addresses | contracts, address | (internal) |
//! | disputes | contracts | `disputes`, `myDisputes` |
//! | conversations | address | `conversations` |
//! | employer jobs | employer job addresses | `employerJobs`, `applicants` |
//! | my jobs | jobs, address | `myJobs` |
//!
//! Every identity change bumps a generation counter and resets the snapshot.
//! A stage run publishes only if the snapshot still carries the generation
//! the run started under, so a superseded run can never overwrite fresher
//! state. Stage runs are not cancelled; their output is discarded.

pub mod snapshot;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::aggregate::disputes::STAGE_DISPUTES;
use crate::aggregate::jobs::{STAGE_APPLICANTS, STAGE_EMPLOYER_JOBS, STAGE_JOBS, STAGE_MY_JOBS};
use crate::aggregate::{
    counterparty, disputes_for, employer_job_addresses, enrich_message, fetch_disputes,
    fetch_employer_jobs, fetch_job_universe, fetch_worker_jobs, group_conversations,
    insert_message, ThreadSource,
};
use crate::api::MarketApi;
use crate::batch::BatchOutcome;
use crate::cache::ProfileCache;
use crate::ledger::{LedgerProvider, LedgerResult, TxReceipt};
use crate::model::{Address, ChatMessage, DirectMessage, DisputeRecord, Identity};
use crate::transport::SessionEvent;
use crate::types::{MarketError, Result};

pub use snapshot::{ContractHandles, IdentityInput, MarketSnapshot};

use snapshot::stage_failure;

pub const STAGE_EMPLOYER_ADDRESSES: &str = "employer_job_addresses";
pub const STAGE_CONVERSATIONS: &str = "conversations";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Page size for chat thread history
    pub chat_page_limit: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chat_page_limit: 50,
        }
    }
}

/// Inputs and stage-internal outputs of the current generation.
#[derive(Default)]
struct Staged {
    generation: u64,
    input: IdentityInput,
    handles: Option<ContractHandles>,
}

pub struct Pipeline {
    api: Arc<MarketApi>,
    cache: Arc<ProfileCache>,
    read_only: Option<Arc<dyn LedgerProvider>>,
    config: PipelineConfig,
    generation: AtomicU64,
    staged: Mutex<Staged>,
    snapshot: watch::Sender<MarketSnapshot>,
}

impl Pipeline {
    pub fn new(
        api: Arc<MarketApi>,
        cache: Arc<ProfileCache>,
        read_only: Option<Arc<dyn LedgerProvider>>,
        config: PipelineConfig,
    ) -> Self {
        let (snapshot, _) = watch::channel(MarketSnapshot::default());
        Self {
            api,
            cache,
            read_only,
            config,
            generation: AtomicU64::new(0),
            staged: Mutex::new(Staged::default()),
            snapshot,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<MarketSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> MarketSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn cache(&self) -> &Arc<ProfileCache> {
        &self.cache
    }

    fn staged(&self) -> std::sync::MutexGuard<'_, Staged> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// Start a new generation for `input` and reset every stage output.
    pub fn set_identity(&self, input: IdentityInput) -> u64 {
        let mut staged = self.staged();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            generation = generation,
            address = ?input.identity.address,
            connected = input.identity.is_connected,
            "Identity changed, re-staging pipeline"
        );
        self.snapshot
            .send_replace(MarketSnapshot::empty(generation, input.identity));
        *staged = Staged {
            generation,
            input,
            handles: None,
        };
        generation
    }

    /// Re-stage on every identity change and on forced logout.
    ///
    /// Returns when the identity channel closes.
    pub async fn drive(self: Arc<Self>, mut inputs: watch::Receiver<IdentityInput>) {
        let mut session = self.api.transport().subscribe();
        let mut session_open = true;

        let initial = inputs.borrow_and_update().clone();
        self.restage(initial);

        loop {
            tokio::select! {
                changed = inputs.changed() => {
                    if changed.is_err() {
                        debug!("Identity source closed, stopping pipeline driver");
                        break;
                    }
                    let input = inputs.borrow_and_update().clone();
                    self.restage(input);
                }
                event = session.recv(), if session_open => match event {
                    Ok(SessionEvent::ForcedLogout) => {
                        if self.identity().is_connected {
                            warn!("Forced logout, resetting identity");
                            self.restage(IdentityInput::disconnected());
                        }
                    }
                    Ok(SessionEvent::Refreshed) => debug!("Session refreshed"),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Session events lagged");
                    }
                    Err(RecvError::Closed) => session_open = false,
                },
            }
        }
    }

    fn restage(self: &Arc<Self>, input: IdentityInput) {
        self.set_identity(input);
        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.refresh().await });
    }

    // =========================================================================
    // Stages
    // =========================================================================

    /// Run every stage for the current generation.
    ///
    /// Each stage publishes as soon as its own reads settle. Employer jobs
    /// wait only on the employer job addresses and my jobs only on the job
    /// universe.
    pub async fn refresh(&self) {
        let (generation, input) = {
            let staged = self.staged();
            (staged.generation, staged.input.clone())
        };

        let Some(handles) = self.stage_contracts(generation, &input) else {
            debug!(generation = generation, "No ledger provider, stages stay empty");
            return;
        };
        let me = input.identity.connected_address();
        let handles = &handles;

        let jobs = async {
            let all_jobs = self.stage_jobs(generation, handles).await;
            if let Some(me) = me {
                self.stage_my_jobs(generation, handles, &all_jobs, me).await;
            }
        };
        let employer_jobs = async {
            if let Some(me) = me {
                let owned = self.stage_employer_addresses(generation, handles, me).await;
                self.stage_employer_jobs(generation, handles, &owned).await;
            }
        };
        let disputes = self.stage_disputes(generation, handles, me);
        let conversations = async {
            if let Some(me) = me {
                self.stage_conversations(generation, &me).await;
            }
        };

        tokio::join!(jobs, employer_jobs, disputes, conversations);
        debug!(generation = generation, "Pipeline refresh complete");
    }

    /// Publish the job universe; returns every job address for dependents.
    async fn stage_jobs(&self, generation: u64, handles: &ContractHandles) -> Vec<Address> {
        let factory = handles.job_factory.as_ref();
        match fetch_job_universe(factory, handles.provider.as_ref(), &self.cache).await {
            Ok(universe) => {
                self.publish(generation, STAGE_JOBS, |s| {
                    s.jobs = universe.jobs.items;
                    s.replace_diagnostics(&[STAGE_JOBS], universe.jobs.failures);
                });
                universe.addresses
            }
            Err(e) => {
                warn!(factory = %factory.address(), error = %e, "Job universe unavailable");
                self.publish(generation, STAGE_JOBS, |s| {
                    s.jobs.clear();
                    s.replace_diagnostics(
                        &[STAGE_JOBS],
                        vec![stage_failure(STAGE_JOBS, "getAllJobs", &e)],
                    );
                });
                Vec::new()
            }
        }
    }

    async fn stage_my_jobs(
        &self,
        generation: u64,
        handles: &ContractHandles,
        all_jobs: &[Address],
        me: Address,
    ) {
        let provider = handles.provider.as_ref();
        let my_jobs = fetch_worker_jobs(provider, &self.cache, all_jobs, me).await;
        self.publish(generation, STAGE_MY_JOBS, |s| {
            s.my_jobs = my_jobs.items;
            s.replace_diagnostics(&[STAGE_MY_JOBS], my_jobs.failures);
        });
    }

    async fn stage_employer_addresses(
        &self,
        generation: u64,
        handles: &ContractHandles,
        me: Address,
    ) -> Vec<Address> {
        match employer_job_addresses(handles.job_factory.as_ref(), me).await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(error = %e, "Employer job lookup failed");
                self.publish(generation, STAGE_EMPLOYER_ADDRESSES, |s| {
                    s.replace_diagnostics(
                        &[STAGE_EMPLOYER_ADDRESSES],
                        vec![stage_failure(STAGE_EMPLOYER_ADDRESSES, "JobCreated", &e)],
                    );
                });
                Vec::new()
            }
        }
    }

    async fn stage_employer_jobs(
        &self,
        generation: u64,
        handles: &ContractHandles,
        owned: &[Address],
    ) {
        let provider = handles.provider.as_ref();
        let employer_jobs = fetch_employer_jobs(provider, &self.cache, owned).await;
        self.publish(generation, STAGE_EMPLOYER_JOBS, |s| {
            s.employer_jobs = employer_jobs.jobs.items;
            s.applicants = employer_jobs.applicants.items;
            let mut failures = employer_jobs.jobs.failures;
            failures.extend(employer_jobs.applicants.failures);
            s.replace_diagnostics(&[STAGE_EMPLOYER_JOBS, STAGE_APPLICANTS], failures);
        });
    }

    async fn stage_disputes(
        &self,
        generation: u64,
        handles: &ContractHandles,
        me: Option<Address>,
    ) {
        // Threads are session-scoped; browsing without a wallet skips them.
        let threads: Option<&dyn ThreadSource> = me.map(|_| self.api.as_ref() as &dyn ThreadSource);
        let disputes = fetch_disputes(
            handles.dispute_dao.as_ref(),
            handles.provider.as_ref(),
            &self.cache,
            threads,
        )
        .await;
        self.publish_disputes(generation, me, disputes);
    }

    async fn stage_conversations(&self, generation: u64, me: &Address) {
        let messages = match self.api.conversations().await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "Conversation feed unavailable");
                Vec::new()
            }
        };
        let conversations = group_conversations(&self.cache, me, messages).await;
        self.publish(generation, STAGE_CONVERSATIONS, |s| s.conversations = conversations);
    }

    /// Bind contract handles: the wallet's provider when connected, otherwise
    /// the read-only fallback.
    fn stage_contracts(&self, generation: u64, input: &IdentityInput) -> Option<ContractHandles> {
        let signer = input.identity.connected_address();
        let handles = match (&input.provider, signer) {
            (Some(provider), Some(signer)) => {
                ContractHandles::bind(Arc::clone(provider), Some(signer))
            }
            _ => ContractHandles::bind(Arc::clone(self.read_only.as_ref()?), None),
        };

        let mut staged = self.staged();
        if staged.generation != generation {
            return None;
        }
        debug!(
            generation = generation,
            provider = handles.provider.id(),
            job_factory = %handles.job_factory.address(),
            dispute_dao = %handles.dispute_dao.address(),
            read_only = handles.is_read_only(),
            "Contract handles bound"
        );
        staged.handles = Some(handles.clone());
        drop(staged);

        let provider_id = handles.provider.id().to_string();
        self.publish(generation, "contracts", |s| s.provider = Some(provider_id));
        Some(handles)
    }

    fn publish_disputes(
        &self,
        generation: u64,
        me: Option<Address>,
        disputes: LedgerResult<BatchOutcome<DisputeRecord>>,
    ) {
        match disputes {
            Ok(disputes) => {
                let mine = me
                    .map(|me| disputes_for(&disputes.items, &me))
                    .unwrap_or_default();
                self.publish(generation, STAGE_DISPUTES, |s| {
                    s.disputes = disputes.items;
                    s.my_disputes = mine;
                    s.replace_diagnostics(&[STAGE_DISPUTES], disputes.failures);
                });
            }
            Err(e) => {
                warn!(error = %e, "Disputes unavailable");
                self.publish(generation, STAGE_DISPUTES, |s| {
                    s.disputes.clear();
                    s.my_disputes.clear();
                    s.replace_diagnostics(
                        &[STAGE_DISPUTES],
                        vec![stage_failure(STAGE_DISPUTES, "getDisputeCount", &e)],
                    );
                });
            }
        }
    }

    /// Apply a stage's output if `generation` is still current.
    fn publish(
        &self,
        generation: u64,
        stage: &str,
        apply: impl FnOnce(&mut MarketSnapshot),
    ) -> bool {
        let applied = self.snapshot.send_if_modified(|snapshot| {
            if snapshot.generation != generation {
                return false;
            }
            apply(snapshot);
            true
        });
        if !applied {
            debug!(
                stage = stage,
                generation = generation,
                current = self.generation(),
                "Discarding stale stage output"
            );
        }
        applied
    }

    fn current_handles(&self) -> Result<(u64, ContractHandles)> {
        let staged = self.staged();
        let handles = staged.handles.clone().ok_or(MarketError::NoProvider)?;
        Ok((staged.generation, handles))
    }

    fn connected(&self) -> Result<(u64, Address)> {
        let staged = self.staged();
        let address = staged
            .input
            .identity
            .connected_address()
            .ok_or(MarketError::NotConnected)?;
        Ok((staged.generation, address))
    }

    /// Re-run the disputes stage for the current generation.
    async fn refresh_disputes(&self) -> Result<()> {
        let (generation, handles) = self.current_handles()?;
        let me = self.identity().connected_address();
        self.stage_disputes(generation, &handles, me).await;
        Ok(())
    }

    // =========================================================================
    // Mutators
    // =========================================================================

    /// Post to a dispute thread and append the message to the snapshot.
    pub async fn post_dispute_message(
        &self,
        dispute_id: u64,
        content: &str,
    ) -> Result<ChatMessage> {
        let (generation, _) = self.connected()?;
        let (employer, workers) = {
            let snapshot = self.snapshot.borrow();
            let dispute = snapshot
                .dispute(dispute_id)
                .ok_or(MarketError::DisputeNotFound(dispute_id))?;
            (dispute.employer.address, dispute.assigned_workers.clone())
        };

        let stored = self.api.post_dispute_message(dispute_id, content).await?;
        let message = enrich_message(&self.cache, stored, &employer, &workers).await;

        let appended = message.clone();
        self.publish(generation, STAGE_DISPUTES, move |s| {
            for dispute in s
                .disputes
                .iter_mut()
                .chain(s.my_disputes.iter_mut())
                .filter(|d| d.id == dispute_id)
            {
                dispute.messages.push(appended.clone());
                dispute.messages.sort_by_key(|m| m.timestamp);
            }
        });
        Ok(message)
    }

    /// Send a direct message and file it under its conversation.
    pub async fn send_chat_message(&self, to: &Address, content: &str) -> Result<DirectMessage> {
        let (generation, me) = self.connected()?;
        let sent = self.api.send_chat_message(to, content).await?;

        let Some(peer) = counterparty(&sent, &me) else {
            warn!(
                sender = %sent.sender,
                receiver = %sent.receiver,
                "Sent message does not involve current user"
            );
            return Ok(sent);
        };
        let display_name = self.cache.display_name(&peer).await;

        // Applied to the conversations current at publish time.
        let message = sent.clone();
        self.publish(generation, STAGE_CONVERSATIONS, move |s| {
            insert_message(&mut s.conversations, &me, message, display_name);
        });
        Ok(sent)
    }

    /// One page of history with `peer`, oldest first.
    pub async fn load_thread(&self, peer: &Address, page: u32) -> Result<Vec<DirectMessage>> {
        self.connected()?;
        let mut messages = self
            .api
            .chat_messages(peer, page, self.config.chat_page_limit)
            .await?;
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    /// Open a dispute on `job`, then re-run the disputes stage.
    pub async fn create_dispute(&self, job: &Address, reason: &str) -> Result<TxReceipt> {
        let (_, handles) = self.signing_handles()?;
        let receipt = handles.dispute_dao.create_dispute(*job, reason).await?;
        info!(job = %job, tx = %receipt.tx_hash, "Dispute created");
        self.refresh_disputes().await?;
        Ok(receipt)
    }

    /// Cast a juror vote, then re-run the disputes stage.
    pub async fn vote(&self, dispute_id: u64, support_worker: bool) -> Result<TxReceipt> {
        let (_, handles) = self.signing_handles()?;
        let receipt = handles.dispute_dao.vote(dispute_id, support_worker).await?;
        info!(
            dispute_id = dispute_id,
            support_worker = support_worker,
            tx = %receipt.tx_hash,
            "Vote cast"
        );
        self.refresh_disputes().await?;
        Ok(receipt)
    }

    fn signing_handles(&self) -> Result<(u64, ContractHandles)> {
        self.connected()?;
        let (generation, handles) = self.current_handles()?;
        if handles.is_read_only() {
            return Err(MarketError::NotConnected);
        }
        Ok((generation, handles))
    }

    /// Identity of the current generation.
    pub fn identity(&self) -> Identity {
        self.staged().input.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::fixtures::addr;
    use crate::ledger::memory::{DisputeFixture, JobFixture};
    use crate::ledger::{LedgerFixture, MemoryLedger};
    use crate::transport::{AuthTransport, MemoryTokenStore, SessionTokens, TransportConfig};
    use std::time::Duration;

    fn pipeline(read_only: Option<MemoryLedger>) -> Pipeline {
        // Nothing listens here; REST calls fail fast and degrade.
        let transport = AuthTransport::new(
            TransportConfig {
                base_url: "http://127.0.0.1:9".into(),
                request_timeout: Duration::from_millis(200),
            },
            Arc::new(MemoryTokenStore::new(SessionTokens::default())),
        );
        let api = Arc::new(MarketApi::new(Arc::new(transport)));
        let cache = Arc::new(ProfileCache::new(api.clone()));
        Pipeline::new(
            api,
            cache,
            read_only.map(|l| Arc::new(l) as Arc<dyn LedgerProvider>),
            PipelineConfig::default(),
        )
    }

    fn ledger() -> MemoryLedger {
        MemoryLedger::new(LedgerFixture {
            jobs: vec![
                JobFixture {
                    address: addr(0x01),
                    employer: addr(0xaa),
                    title: "Indexer".into(),
                    assigned_workers: vec![addr(0xbb)],
                    ..Default::default()
                },
                JobFixture {
                    address: addr(0x02),
                    employer: addr(0xcc),
                    title: "Auditor".into(),
                    ..Default::default()
                },
            ],
            disputes: vec![DisputeFixture {
                job: addr(0x01),
                initiator: addr(0xbb),
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_without_any_provider_stages_stay_empty() {
        let pipeline = pipeline(None);
        pipeline.set_identity(IdentityInput::disconnected());
        pipeline.refresh().await;

        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.generation, 1);
        assert!(snapshot.jobs.is_empty());
        assert!(snapshot.provider.is_none());
    }

    #[tokio::test]
    async fn test_read_only_browsing_without_wallet() {
        let pipeline = pipeline(Some(ledger()));
        pipeline.set_identity(IdentityInput::disconnected());
        pipeline.refresh().await;

        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.jobs.len(), 2);
        assert_eq!(snapshot.disputes.len(), 1);
        // Identity-scoped stages stay empty.
        assert!(snapshot.my_jobs.is_empty());
        assert!(snapshot.my_disputes.is_empty());
        assert!(snapshot.employer_jobs.is_empty());
        assert!(snapshot.conversations.is_empty());
    }

    #[tokio::test]
    async fn test_connected_identity_fills_scoped_stages() {
        let wallet = ledger().with_id("wallet");
        let pipeline = pipeline(None);
        pipeline.set_identity(IdentityInput::connected(addr(0xaa), Arc::new(wallet)));
        pipeline.refresh().await;

        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.provider.as_deref(), Some("wallet"));
        assert_eq!(snapshot.employer_jobs.len(), 1);
        assert_eq!(snapshot.employer_jobs[0].summary.title, "Indexer");
        assert_eq!(snapshot.my_disputes.len(), 1);
        assert!(snapshot.my_jobs.is_empty());
    }

    #[tokio::test]
    async fn test_stale_generation_output_is_discarded() {
        let slow = ledger();
        slow.set_latency(Some(Duration::from_millis(50)));
        let pipeline = pipeline(Some(slow));

        let first = pipeline.set_identity(IdentityInput::disconnected());
        let stale_run = pipeline.refresh();
        let restage = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            pipeline.set_identity(IdentityInput::disconnected())
        };
        let (_, second) = tokio::join!(stale_run, restage);

        assert!(second > first);
        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.generation, second);
        assert!(snapshot.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_mutators_require_connection() {
        let pipeline = pipeline(Some(ledger()));
        pipeline.set_identity(IdentityInput::disconnected());
        pipeline.refresh().await;

        assert!(matches!(
            pipeline.vote(0, true).await,
            Err(MarketError::NotConnected)
        ));
        assert!(matches!(
            pipeline.send_chat_message(&addr(0xbb), "hi").await,
            Err(MarketError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_vote_reruns_dispute_stage() {
        let wallet = ledger();
        let pipeline = pipeline(None);
        pipeline.set_identity(IdentityInput::connected(addr(0xee), Arc::new(wallet.clone())));
        pipeline.refresh().await;
        assert_eq!(pipeline.snapshot().disputes[0].votes.votes_for, 0);

        pipeline.vote(0, true).await.unwrap();

        assert_eq!(pipeline.snapshot().disputes[0].votes.votes_for, 1);
        assert_eq!(wallet.call_count("dispute_count"), 2);
    }
}
