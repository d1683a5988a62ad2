//! Job listings, owned jobs and worker jobs.
//!
//! A job is dropped (and recorded as a failure) only when its `employer` or
//! `jobCancelled` read fails: without those neither ownership nor the
//! cancellation filter can be established. Cancelled jobs never appear in any
//! output. Every other field read falls back to its default.

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::or_default;
use crate::batch::BatchOutcome;
use crate::cache::ProfileCache;
use crate::ledger::{scan_all, JobContract, JobFactory, LedgerError, LedgerProvider, LedgerResult};
use crate::model::{
    ledger_time, Address, ApplicantRecord, ApplicantStatus, EmployerJob, JobRecord, JobSummary,
    PayType, Rating,
};

pub const STAGE_JOBS: &str = "jobs";
pub const STAGE_EMPLOYER_JOBS: &str = "employer_jobs";
pub const STAGE_APPLICANTS: &str = "applicants";
pub const STAGE_MY_JOBS: &str = "my_jobs";

/// Every job the factory knows about, and the non-cancelled listings.
#[derive(Debug, Clone, Default)]
pub struct JobUniverse {
    pub addresses: Vec<Address>,
    pub jobs: BatchOutcome<JobSummary>,
}

#[derive(Debug, Clone, Default)]
pub struct EmployerJobs {
    pub jobs: BatchOutcome<EmployerJob>,
    pub applicants: BatchOutcome<ApplicantRecord>,
}

/// Full read of one live job.
struct JobSnapshot {
    summary: JobSummary,
    assigned_workers: Vec<Address>,
    last_payout_at: u64,
    payouts_made: u64,
    reputation: Address,
}

async fn read_job(
    provider: &dyn LedgerProvider,
    cache: &ProfileCache,
    address: Address,
) -> LedgerResult<Option<JobSnapshot>> {
    let job = provider.job(address);

    if job.job_cancelled().await? {
        debug!(job = %address, "Skipping cancelled job");
        return Ok(None);
    }
    let employer = job.employer().await?;

    let (
        title,
        description,
        pay_type,
        weekly_pay,
        total_pay,
        duration_weeks,
        positions,
        created_at,
        last_payout_at,
        payouts_made,
        assigned_workers,
        reputation,
    ) = tokio::join!(
        job.title(),
        job.description(),
        job.pay_type(),
        job.weekly_pay(),
        job.total_pay(),
        job.duration_weeks(),
        job.positions(),
        job.created_at(),
        job.last_payout_at(),
        job.payouts_made(),
        job.assigned_workers(),
        job.reputation(),
    );

    let pay_code = or_default(&address, "payType", pay_type);
    let pay_type = PayType::from_code(pay_code)
        .ok_or_else(|| LedgerError::Decode(format!("unknown pay type {pay_code}")))?;
    let assigned_workers = or_default(&address, "assignedWorkers", assigned_workers);
    let reputation = or_default(&address, "reputation", reputation);

    let (tags, employer_rating, employer_display_name) = tokio::join!(
        read_tags(&job),
        read_rating(provider, reputation, employer),
        cache.display_name(&employer),
    );

    let summary = JobSummary {
        address,
        employer_address: employer,
        employer_display_name,
        title: or_default(&address, "title", title),
        description: or_default(&address, "description", description),
        pay_type,
        weekly_pay: or_default(&address, "weeklyPay", weekly_pay),
        total_pay: or_default(&address, "totalPay", total_pay),
        duration_weeks: or_default(&address, "durationWeeks", duration_weeks),
        created_at: ledger_time(or_default(&address, "createdAt", created_at)),
        tags,
        positions: or_default(&address, "positions", positions),
        positions_filled: assigned_workers.len() as u64,
        employer_rating,
    };

    Ok(Some(JobSnapshot {
        summary,
        assigned_workers,
        last_payout_at: or_default(&address, "lastPayoutAt", last_payout_at),
        payouts_made: or_default(&address, "payoutsMade", payouts_made),
        reputation,
    }))
}

async fn read_tags(job: &Arc<dyn JobContract>) -> Vec<String> {
    let outcome = scan_all(move |i| job.tag(i)).await;
    if outcome.is_truncated() {
        warn!(job = %job.address(), count = outcome.items.len(), "Tag list may be truncated");
    }
    outcome.items
}

/// Rating of `subject` in the registry at `registry`; unrated is zero.
async fn read_rating(provider: &dyn LedgerProvider, registry: Address, subject: Address) -> Rating {
    if registry.is_zero() {
        return Rating::default();
    }
    let average = provider.reputation(registry).average_rating(subject).await;
    let average = or_default(&registry, "averageRating", average);
    Rating::from_scaled(average.average_x100, average.total_ratings)
}

/// Job universe: every factory job, fanned out and filtered on cancellation.
pub async fn fetch_job_universe(
    factory: &dyn JobFactory,
    provider: &dyn LedgerProvider,
    cache: &ProfileCache,
) -> LedgerResult<JobUniverse> {
    let addresses = factory.all_jobs().await?;
    let reads = join_all(
        addresses
            .iter()
            .map(|address| async move { (*address, read_job(provider, cache, *address).await) }),
    )
    .await;

    let jobs = BatchOutcome::collect_filtered(
        STAGE_JOBS,
        reads
            .into_iter()
            .map(|(address, read)| (address, read.map(|job| job.map(|job| job.summary)))),
    );
    debug!(total = addresses.len(), listed = jobs.items.len(), "Job universe fetched");

    Ok(JobUniverse { addresses, jobs })
}

/// Jobs created by `employer`, from the factory's `JobCreated` logs.
pub async fn employer_job_addresses(
    factory: &dyn JobFactory,
    employer: Address,
) -> LedgerResult<Vec<Address>> {
    let logs = factory.job_created_events(Some(employer)).await?;
    let mut seen = HashSet::new();
    Ok(logs
        .into_iter()
        // Logs are filtered on the indexed topic; re-check the decoded field.
        .filter(|log| log.employer == employer)
        .map(|log| log.job_address)
        .filter(|address| seen.insert(*address))
        .collect())
}

/// Owned-job detail with every applicant.
pub async fn fetch_employer_jobs(
    provider: &dyn LedgerProvider,
    cache: &ProfileCache,
    addresses: &[Address],
) -> EmployerJobs {
    let reads = join_all(addresses.iter().map(|address| async move {
        (*address, read_employer_job(provider, cache, *address).await)
    }))
    .await;

    let mut applicants = BatchOutcome::default();
    let mut jobs_results = Vec::with_capacity(reads.len());
    for (address, read) in reads {
        let read = read.map(|found| {
            found.map(|(job, job_applicants)| {
                applicants.items.extend(job_applicants.items);
                applicants.failures.extend(job_applicants.failures);
                job
            })
        });
        jobs_results.push((address, read));
    }

    EmployerJobs {
        jobs: BatchOutcome::collect_filtered(STAGE_EMPLOYER_JOBS, jobs_results),
        applicants,
    }
}

async fn read_employer_job(
    provider: &dyn LedgerProvider,
    cache: &ProfileCache,
    address: Address,
) -> LedgerResult<Option<(EmployerJob, BatchOutcome<ApplicantRecord>)>> {
    let Some(snapshot) = read_job(provider, cache, address).await? else {
        return Ok(None);
    };
    let job = provider.job(address);

    let (total_applications, applicant_addresses) =
        tokio::join!(job.total_applications(), job.all_applicants());
    let applicant_addresses = or_default(&address, "allApplicants", applicant_addresses);

    let reads = join_all(applicant_addresses.iter().map(|applicant| {
        let job = &job;
        let snapshot = &snapshot;
        async move {
            let record = read_applicant(provider, cache, &**job, snapshot, *applicant).await;
            (ApplicantRecord::record_id(&address, applicant), record)
        }
    }))
    .await;
    let applicants = BatchOutcome::collect(STAGE_APPLICANTS, reads);

    let employer_job = EmployerJob {
        total_applications: or_default(&address, "totalApplications", total_applications),
        assigned_workers: snapshot.assigned_workers,
        summary: snapshot.summary,
    };
    Ok(Some((employer_job, applicants)))
}

async fn read_applicant(
    provider: &dyn LedgerProvider,
    cache: &ProfileCache,
    job: &dyn JobContract,
    snapshot: &JobSnapshot,
    applicant: Address,
) -> LedgerResult<ApplicantRecord> {
    let (info, profile, rating) = tokio::join!(
        job.applicant(applicant),
        cache.get(&applicant),
        read_rating(provider, snapshot.reputation, applicant),
    );
    let info = info?;

    let status = if snapshot.assigned_workers.contains(&applicant) || !info.is_active {
        ApplicantStatus::Reviewed
    } else {
        ApplicantStatus::Pending
    };
    let (display_name, tags) = match profile {
        Some(p) if !p.display_name.trim().is_empty() => (p.display_name, p.skills),
        Some(p) => (applicant.short_label(), p.skills),
        None => (applicant.short_label(), Vec::new()),
    };

    Ok(ApplicantRecord {
        id: ApplicantRecord::record_id(&snapshot.summary.address, &applicant),
        address: applicant,
        job_address: snapshot.summary.address,
        job_title: snapshot.summary.title.clone(),
        display_name,
        application_text: info.application_text,
        applied_at: ledger_time(info.applied_at),
        status,
        rating,
        tags,
    })
}

/// Jobs from `addresses` where `worker` is an assigned worker.
pub async fn fetch_worker_jobs(
    provider: &dyn LedgerProvider,
    cache: &ProfileCache,
    addresses: &[Address],
    worker: Address,
) -> BatchOutcome<JobRecord> {
    let reads = join_all(addresses.iter().map(|address| async move {
        (*address, read_worker_job(provider, cache, *address, worker).await)
    }))
    .await;
    BatchOutcome::collect_filtered(STAGE_MY_JOBS, reads)
}

async fn read_worker_job(
    provider: &dyn LedgerProvider,
    cache: &ProfileCache,
    address: Address,
    worker: Address,
) -> LedgerResult<Option<JobRecord>> {
    if !provider.job(address).is_worker(worker).await? {
        return Ok(None);
    }
    Ok(read_job(provider, cache, address).await?.map(|snapshot| JobRecord {
        summary: snapshot.summary,
        assigned_workers: snapshot.assigned_workers,
        last_payout_at: ledger_time(snapshot.last_payout_at),
        payouts_made: snapshot.payouts_made,
    }))
}
