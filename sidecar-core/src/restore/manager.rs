use std::{fmt, sync::Arc};

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::RwLock;
use sidecar_model::{InstanceId, InstanceMetadata, JobId, RangeKey, RestoreJob, RestoreRange};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info};

use super::storage::StorageClientPool;
use crate::error::{Result, SidecarError};

/// Outcome of handing a range to an instance manager.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmitStatus {
    /// First acceptance of this (job, instance, range).
    Created,
    /// Already tracked; nothing changed.
    Exists,
}

/// Live view of a tracked job shared with range processing.
///
/// Job parameters may be refreshed after submission (rotated credentials,
/// a new expiry), so processing reads them through this handle rather than
/// from a copy taken at submission time.
#[derive(Clone)]
pub struct TrackedJob {
    job: Arc<RwLock<RestoreJob>>,
    cancel: CancellationToken,
}

impl fmt::Debug for TrackedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedJob")
            .field("job_id", &self.job_id())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl TrackedJob {
    fn new(job: RestoreJob) -> Self {
        Self {
            job: Arc::new(RwLock::new(job)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.read().job_id
    }

    pub fn snapshot(&self) -> RestoreJob {
        self.job.read().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the job has been finalized.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    fn refresh(&self, job: &RestoreJob) {
        *self.job.write() = job.clone();
    }
}

/// A newly accepted range ready to be downloaded.
#[derive(Debug, Clone)]
pub struct RangeTask {
    pub range: RestoreRange,
    pub job: TrackedJob,
}

/// Performs the work of accepted ranges.
pub trait RangeProcessor: Send + Sync + fmt::Debug {
    /// Start processing. Must not block; the outcome is reported through
    /// the range store.
    fn submit(&self, task: RangeTask);
}

struct JobRanges {
    job: TrackedJob,
    ranges: DashMap<RangeKey, RestoreRange>,
}

/// Accepts and deduplicates ranges owned by one Cassandra instance.
pub struct RestoreJobManager {
    instance_id: InstanceId,
    jobs: DashMap<JobId, Arc<JobRanges>>,
    processor: Arc<dyn RangeProcessor>,
}

impl fmt::Debug for RestoreJobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreJobManager")
            .field("instance_id", &self.instance_id)
            .field("jobs", &self.jobs.len())
            .field("processor", &self.processor)
            .finish()
    }
}

impl RestoreJobManager {
    pub fn new(instance_id: InstanceId, processor: Arc<dyn RangeProcessor>) -> Self {
        Self {
            instance_id,
            jobs: DashMap::new(),
            processor,
        }
    }

    /// Accept `range` unless it is already tracked.
    ///
    /// Fails with [`SidecarError::RestoreJobFatal`] when the range cannot be
    /// hosted here, e.g. its staging directory cannot be created.
    pub async fn try_submit(&self, range: RestoreRange, job: &RestoreJob) -> Result<SubmitStatus> {
        if range.owner.id != self.instance_id {
            return Err(SidecarError::RestoreJobFatal(format!(
                "range {} is owned by instance {}, not {}",
                range.range, range.owner.id, self.instance_id
            )));
        }

        let key = range.key();
        let tracked = self
            .jobs
            .entry(job.job_id)
            .or_insert_with(|| {
                Arc::new(JobRanges {
                    job: TrackedJob::new(job.clone()),
                    ranges: DashMap::new(),
                })
            })
            .clone();

        if tracked.ranges.contains_key(&key) {
            return Ok(SubmitStatus::Exists);
        }

        tokio::fs::create_dir_all(&range.stage_directory)
            .await
            .map_err(|err| {
                SidecarError::RestoreJobFatal(format!(
                    "cannot create staging directory {}: {err}",
                    range.stage_directory.display()
                ))
            })?;

        match tracked.ranges.entry(key) {
            Entry::Occupied(_) => Ok(SubmitStatus::Exists),
            Entry::Vacant(vacant) => {
                vacant.insert(range.clone());
                debug!(
                    job_id = %job.job_id,
                    instance_id = self.instance_id,
                    range = %range.range,
                    upload_id = %range.upload_id,
                    "Accepted restore range"
                );
                self.processor.submit(RangeTask {
                    range,
                    job: tracked.job.clone(),
                });
                Ok(SubmitStatus::Created)
            }
        }
    }

    pub fn update_restore_job(&self, job: &RestoreJob) {
        if let Some(tracked) = self.jobs.get(&job.job_id) {
            tracked.job.refresh(job);
        }
    }

    /// Forget the job and signal its ranges to stop. Returns whether the
    /// job was tracked.
    pub fn remove_job(&self, job_id: JobId) -> bool {
        match self.jobs.remove(&job_id) {
            Some((_, tracked)) => {
                tracked.job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn range_count(&self, job_id: JobId) -> usize {
        self.jobs
            .get(&job_id)
            .map(|tracked| tracked.ranges.len())
            .unwrap_or_default()
    }
}

/// One [`RestoreJobManager`] per local Cassandra instance.
pub struct RestoreJobManagerGroup {
    managers: DashMap<InstanceId, Arc<RestoreJobManager>>,
    pool: Arc<StorageClientPool>,
    processor: Arc<dyn RangeProcessor>,
}

impl fmt::Debug for RestoreJobManagerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreJobManagerGroup")
            .field("instances", &self.managers.len())
            .field("pool", &self.pool)
            .field("processor", &self.processor)
            .finish()
    }
}

impl RestoreJobManagerGroup {
    pub fn new(pool: Arc<StorageClientPool>, processor: Arc<dyn RangeProcessor>) -> Self {
        Self {
            managers: DashMap::new(),
            pool,
            processor,
        }
    }

    /// Submit `range` to the manager of `instance`.
    pub async fn try_submit(
        &self,
        instance: &InstanceMetadata,
        range: RestoreRange,
        job: &RestoreJob,
    ) -> Result<SubmitStatus> {
        let manager = self.manager(instance.id);
        manager.try_submit(range, job).await
    }

    /// Refresh cached job parameters on every instance tracking the job.
    pub fn update_restore_job(&self, job: &RestoreJob) {
        for manager in self.managers.iter() {
            manager.update_restore_job(job);
        }
    }

    /// Drop all tracking for a finalized job and release its credentials.
    pub fn remove_job_internal(&self, job_id: JobId) {
        let removed = self
            .managers
            .iter()
            .filter(|manager| manager.remove_job(job_id))
            .count();
        self.pool.revoke_credentials(job_id);
        if removed > 0 {
            info!(%job_id, instances = removed, "Stopped tracking restore job");
        }
    }

    pub fn is_tracked(&self, job_id: JobId) -> bool {
        self.managers
            .iter()
            .any(|manager| manager.jobs.contains_key(&job_id))
    }

    pub fn range_count(&self, job_id: JobId) -> usize {
        self.managers
            .iter()
            .map(|manager| manager.range_count(job_id))
            .sum()
    }

    fn manager(&self, instance_id: InstanceId) -> Arc<RestoreJobManager> {
        self.managers
            .entry(instance_id)
            .or_insert_with(|| {
                Arc::new(RestoreJobManager::new(
                    instance_id,
                    Arc::clone(&self.processor),
                ))
            })
            .clone()
    }
}
