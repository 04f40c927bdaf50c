use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use sidecar_model::{
    InstanceMetadata, JobId, RestoreJob, RestoreJobStatus, RestoreRange, TokenRange,
};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{
    config::RestoreJobConfig,
    manager::{RestoreJobManagerGroup, SubmitStatus},
    ports::{
        InstanceMetadataFetcher, LocalTokenRangesProvider, RestoreJobStore, RestoreMetrics,
        RestoreRangeStore, RestoreSliceStore, RingTopology, SchemaReadiness,
    },
};
use crate::{
    error::{Result, SidecarError},
    job::is_stale,
    tasks::{PeriodicTask, ScheduleDecision, TaskRescheduler},
};

/// Name the discoverer is scheduled under.
pub const RESTORE_JOB_DISCOVERER: &str = "restore-job-discoverer";

/// Slices are currently always looked up in the first bucket.
pub const DEFAULT_BUCKET_ID: i16 = 0;

/// Reason recorded on jobs aborted for outliving their expiry.
pub const EXPIRED_ABORT_REASON: &str = "Expired";

/// Source of the current time for a discovery pass.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Everything the discoverer reads from or writes to outside itself.
#[derive(Clone)]
pub struct DiscoveryCollaborators {
    pub schema: Arc<dyn SchemaReadiness>,
    pub jobs: Arc<dyn RestoreJobStore>,
    pub slices: Arc<dyn RestoreSliceStore>,
    pub ranges: Arc<dyn RestoreRangeStore>,
    pub local_token_ranges: Arc<dyn LocalTokenRangesProvider>,
    pub instances: Arc<dyn InstanceMetadataFetcher>,
    pub topology: Arc<dyn RingTopology>,
    pub metrics: Arc<dyn RestoreMetrics>,
}

impl fmt::Debug for DiscoveryCollaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryCollaborators").finish_non_exhaustive()
    }
}

/// Periodic task that discovers restore jobs, expires stale ones, and
/// submits the slices of managed jobs to the local instances owning them.
///
/// Passes never overlap: a pass requested while another is running returns
/// immediately. The polling delay is short while any job is in flight and
/// long otherwise; crossing between the two asks the executor for an
/// immediate reschedule.
pub struct RestoreJobDiscoverer {
    config: RestoreJobConfig,
    deps: DiscoveryCollaborators,
    managers: Arc<RestoreJobManagerGroup>,
    clock: Clock,
    executing: AtomicBool,
    inflight_jobs: AtomicUsize,
    recency_days: AtomicU32,
    logged_jobs: Mutex<JobIdsByDay>,
    executor: RwLock<Option<Arc<dyn TaskRescheduler>>>,
}

impl fmt::Debug for RestoreJobDiscoverer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreJobDiscoverer")
            .field("config", &self.config)
            .field("executing", &self.is_executing())
            .field("inflight_jobs", &self.inflight_jobs())
            .field("recency_days", &self.job_discovery_recency_days())
            .field("executor_registered", &self.executor.read().is_some())
            .finish()
    }
}

struct ExecutingGuard<'a>(&'a AtomicBool);

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Per-pass snapshot and counters.
struct RunContext {
    now: DateTime<Utc>,
    today: NaiveDate,
    earliest_in_days: u32,
    expired_jobs: usize,
    aborted_jobs: usize,
}

impl RunContext {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            today: now.date_naive(),
            earliest_in_days: 0,
            expired_jobs: 0,
            aborted_jobs: 0,
        }
    }
}

impl RestoreJobDiscoverer {
    pub fn new(
        config: RestoreJobConfig,
        deps: DiscoveryCollaborators,
        managers: Arc<RestoreJobManagerGroup>,
    ) -> Self {
        let recency_days = config.job_discovery_minimum_recency_days;
        Self {
            config,
            deps,
            managers,
            clock: Arc::new(Utc::now),
            executing: AtomicBool::new(false),
            inflight_jobs: AtomicUsize::new(0),
            recency_days: AtomicU32::new(recency_days),
            logged_jobs: Mutex::new(JobIdsByDay::default()),
            executor: RwLock::new(None),
        }
    }

    /// Replace the wall clock, e.g. to replay passes at chosen instants.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::Acquire)
    }

    pub fn inflight_jobs(&self) -> usize {
        self.inflight_jobs.load(Ordering::Acquire)
    }

    pub fn has_inflight_jobs(&self) -> bool {
        self.inflight_jobs() > 0
    }

    /// Current lookback window of the job query. Never below the configured
    /// minimum.
    pub fn job_discovery_recency_days(&self) -> u32 {
        self.recency_days.load(Ordering::Acquire)
    }

    /// Run a pass unless one is already running.
    ///
    /// Returns `Ok(false)` without side effects when another pass holds the
    /// guard. Safe to call from outside the periodic schedule.
    pub async fn try_execute_discovery(&self) -> Result<bool> {
        if self
            .executing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Restore job discovery already running; skipping");
            return Ok(false);
        }
        let _guard = ExecutingGuard(&self.executing);
        self.execute_internal().await?;
        Ok(true)
    }

    fn should_skip(&self) -> bool {
        let schema_missing = !self.deps.schema.is_initialized();
        if schema_missing {
            trace!("Skipping restore job discovery: sidecar schema not initialized");
        }
        let executing = self.is_executing();
        if executing {
            trace!("Skipping restore job discovery: previous pass still running");
        }
        schema_missing || executing
    }

    async fn execute_internal(&self) -> Result<()> {
        let executor = self.executor.read().clone().ok_or_else(|| {
            SidecarError::ContractViolation("periodic task executor is not registered".into())
        })?;

        info!(
            inflight_jobs = self.inflight_jobs(),
            delay = %humantime::format_duration(self.delay()),
            recency_days = self.job_discovery_recency_days(),
            "Discovering restore jobs"
        );

        let had_inflight_jobs = self.has_inflight_jobs();
        let mut context = RunContext::new((self.clock)());
        let jobs = self
            .deps
            .jobs
            .find_all_recent(context.now, self.job_discovery_recency_days())
            .await?;

        self.inflight_jobs.store(0, Ordering::Release);
        for job in &jobs {
            if let Err(err) = self.process_one_job(job, &mut context).await {
                warn!(job_id = %job.job_id, "Failed to process restore job: {err}");
            }
        }
        self.logged_jobs.lock().cleanup();

        let recency_days = context
            .earliest_in_days
            .max(self.config.job_discovery_minimum_recency_days);
        self.recency_days.store(recency_days, Ordering::Release);

        let inflight_jobs = self.inflight_jobs();
        info!(
            inflight_jobs,
            recency_days,
            expired_jobs = context.expired_jobs,
            aborted_jobs = context.aborted_jobs,
            "Exit restore job discovery"
        );
        self.deps.metrics.set_active_jobs(inflight_jobs);

        if had_inflight_jobs != (inflight_jobs > 0) {
            debug!(
                next_delay = %humantime::format_duration(self.delay()),
                "Discovery cadence changed; rescheduling"
            );
            executor.reschedule(self.name());
        }
        Ok(())
    }

    async fn process_one_job(&self, job: &RestoreJob, context: &mut RunContext) -> Result<()> {
        let should_log = self.logged_jobs.lock().should_log_job(job);
        if should_log {
            info!(
                job_id = %job.job_id,
                status = %job.status,
                keyspace = %job.keyspace_name,
                table = %job.table_name,
                managed = job.managed_by_sidecar,
                "Found restore job"
            );
        }

        match job.status {
            RestoreJobStatus::Created
            | RestoreJobStatus::StageReady
            | RestoreJobStatus::Staged
            | RestoreJobStatus::ImportReady => {
                if has_expired(job, context.now) {
                    context.expired_jobs += 1;
                    if self.abort_job(job).await {
                        context.aborted_jobs += 1;
                        self.finalize_job(job);
                    }
                    return Ok(());
                }

                context.earliest_in_days = context
                    .earliest_in_days
                    .max(days_between(context.today, job.created_day()));
                self.managers.update_restore_job(job);

                let submitted = if job.is_managed_by_sidecar() {
                    self.deps.topology.register(job);
                    self.find_slices_and_submit(job).await
                } else {
                    Ok(())
                };
                // still pending even if this round of submission failed
                self.inflight_jobs.fetch_add(1, Ordering::AcqRel);
                submitted
            }
            RestoreJobStatus::Succeeded | RestoreJobStatus::Failed | RestoreJobStatus::Aborted => {
                self.finalize_job(job);
                Ok(())
            }
            RestoreJobStatus::Unknown => {
                warn!(job_id = %job.job_id, status = %job.status, "Encountered unknown restore job status");
                Ok(())
            }
        }
    }

    async fn abort_job(&self, job: &RestoreJob) -> bool {
        info!(job_id = %job.job_id, expire_at = %job.expire_at, "Aborting expired restore job");
        match self.deps.jobs.abort(job.job_id, EXPIRED_ABORT_REASON).await {
            Ok(()) => true,
            Err(err) => {
                warn!(job_id = %job.job_id, "Failed to abort expired restore job: {err}");
                false
            }
        }
    }

    fn finalize_job(&self, job: &RestoreJob) {
        self.managers.remove_job_internal(job.job_id);
        if job.is_managed_by_sidecar() {
            self.deps.topology.unregister(job);
        }
    }

    /// Submit every recorded slice overlapping a token range owned by a
    /// local instance.
    async fn find_slices_and_submit(&self, job: &RestoreJob) -> Result<()> {
        let owned = self
            .deps
            .local_token_ranges
            .local_token_ranges(&job.keyspace_name)?;
        for (instance_id, ranges) in owned {
            let instance = self.deps.instances.instance(instance_id)?;
            for range in &ranges {
                self.find_slices_of_range_and_submit(&instance, job, range)
                    .await?;
            }
        }
        Ok(())
    }

    async fn find_slices_of_range_and_submit(
        &self,
        instance: &InstanceMetadata,
        job: &RestoreJob,
        range: &TokenRange,
    ) -> Result<()> {
        let slices = self
            .deps
            .slices
            .select_by_job_by_bucket_by_token_range(job, DEFAULT_BUCKET_ID, range)
            .await?;

        for slice in slices {
            let topology = self.deps.topology.cached_replica_by_token_range(job);
            for split in slice.split_maybe(topology.as_ref()) {
                let upload_id = unique_upload_id(split.job_id, &split.slice_id);
                let restore_range = RestoreRange::from_slice(&split, instance, upload_id);
                if self.submit(instance, job, restore_range.clone()).await?
                    == Some(SubmitStatus::Created)
                {
                    self.deps.ranges.create(&restore_range).await?;
                }
            }
        }
        Ok(())
    }

    /// `None` when the instance refused the range; the failure is
    /// persisted on the range.
    async fn submit(
        &self,
        instance: &InstanceMetadata,
        job: &RestoreJob,
        mut range: RestoreRange,
    ) -> Result<Option<SubmitStatus>> {
        match self.managers.try_submit(instance, range.clone(), job).await {
            Ok(status) => Ok(Some(status)),
            Err(err) if err.is_fatal() => {
                error!(
                    job_id = %job.job_id,
                    range = %range.range,
                    instance = %instance.host,
                    "Restore range failed: {err}"
                );
                range.fail(err.to_string());
                self.deps.ranges.update_status(&range).await?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl PeriodicTask for RestoreJobDiscoverer {
    fn name(&self) -> &str {
        RESTORE_JOB_DISCOVERER
    }

    fn schedule_decision(&self) -> ScheduleDecision {
        if self.should_skip() {
            ScheduleDecision::Skip
        } else {
            ScheduleDecision::Execute
        }
    }

    fn delay(&self) -> Duration {
        if self.has_inflight_jobs() {
            self.config.active_loop_delay()
        } else {
            self.config.idle_loop_delay()
        }
    }

    async fn execute(&self) -> Result<()> {
        self.try_execute_discovery().await.map(|_| ())
    }

    fn register_periodic_task_executor(&self, executor: Arc<dyn TaskRescheduler>) {
        *self.executor.write() = Some(executor);
    }
}

fn has_expired(job: &RestoreJob, now: DateTime<Utc>) -> bool {
    // a job from the future (clock skew) falls back to its expiry instant
    is_stale(job.created_at(), now, job.ttl()).unwrap_or_else(|_| job.has_expired(now))
}

/// Whole days between two dates, never negative.
fn days_between(a: NaiveDate, b: NaiveDate) -> u32 {
    u32::try_from(a.signed_duration_since(b).num_days().unsigned_abs()).unwrap_or(u32::MAX)
}

fn unique_upload_id(job_id: JobId, slice_id: &str) -> String {
    let slice: String = slice_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{job_id}-{slice}-{}", Uuid::new_v4().simple())
}

/// Last logged status of each job, grouped by creation day.
///
/// Days not seen in a pass are dropped at the end of it, so the digest only
/// ever holds the days the job query still returns.
#[derive(Debug, Default)]
struct JobIdsByDay {
    jobs_by_day: HashMap<NaiveDate, HashMap<JobId, RestoreJobStatus>>,
    discovered_days: HashSet<NaiveDate>,
}

impl JobIdsByDay {
    /// Log when the job is new, still CREATED, or changed status.
    fn should_log_job(&mut self, job: &RestoreJob) -> bool {
        let day = job.created_day();
        self.discovered_days.insert(day);
        let previous = self
            .jobs_by_day
            .entry(day)
            .or_default()
            .insert(job.job_id, job.status);
        match previous {
            None => true,
            Some(_) if job.status == RestoreJobStatus::Created => true,
            Some(previous) => previous != job.status,
        }
    }

    fn cleanup(&mut self) {
        let discovered = std::mem::take(&mut self.discovered_days);
        self.jobs_by_day.retain(|day, _| discovered.contains(day));
    }
}
