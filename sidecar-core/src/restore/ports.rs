//! Collaborators the restore engine consumes.
//!
//! Persistence goes through the async accessor traits; cluster views
//! (token ownership, replica topology, instance metadata) are synchronous
//! lookups against caches kept elsewhere in the sidecar.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sidecar_model::{
    InstanceId, InstanceMetadata, JobId, RestoreJob, RestoreJobSecrets, RestoreJobStatus,
    RestoreRange, RestoreSlice, TokenRange, TokenRangeReplicas,
};

use crate::error::Result;

/// Partial update of a stored job. `None` leaves a field untouched.
#[derive(Clone, Debug, Default)]
pub struct RestoreJobUpdate {
    pub status: Option<RestoreJobStatus>,
    pub expire_at: Option<DateTime<Utc>>,
    pub secrets: Option<RestoreJobSecrets>,
    pub job_agent: Option<String>,
}

#[async_trait]
pub trait RestoreJobStore: Send + Sync {
    /// Jobs created no more than `recency_days` days before `now`.
    async fn find_all_recent(
        &self,
        now: DateTime<Utc>,
        recency_days: u32,
    ) -> Result<Vec<RestoreJob>>;

    async fn find(&self, job_id: JobId) -> Result<Option<RestoreJob>>;

    async fn update(&self, job_id: JobId, update: RestoreJobUpdate) -> Result<RestoreJob>;

    /// Mark the job ABORTED, recording `reason`.
    async fn abort(&self, job_id: JobId, reason: &str) -> Result<()>;
}

#[async_trait]
pub trait RestoreSliceStore: Send + Sync {
    /// Slices of the job in `bucket_id` whose range intersects `range`.
    async fn select_by_job_by_bucket_by_token_range(
        &self,
        job: &RestoreJob,
        bucket_id: i16,
        range: &TokenRange,
    ) -> Result<Vec<RestoreSlice>>;
}

#[async_trait]
pub trait RestoreRangeStore: Send + Sync {
    async fn create(&self, range: &RestoreRange) -> Result<()>;

    async fn update_status(&self, range: &RestoreRange) -> Result<()>;
}

/// Token ranges owned by the instances this sidecar manages.
#[cfg_attr(test, mockall::automock)]
pub trait LocalTokenRangesProvider: Send + Sync {
    fn local_token_ranges(
        &self,
        keyspace: &str,
    ) -> Result<HashMap<InstanceId, BTreeSet<TokenRange>>>;
}

/// Cached replica topology, refreshed for registered jobs.
#[cfg_attr(test, mockall::automock)]
pub trait RingTopology: Send + Sync {
    fn register(&self, job: &RestoreJob);

    fn unregister(&self, job: &RestoreJob);

    /// Latest topology for the job's keyspace, if one has been fetched.
    fn cached_replica_by_token_range(&self, job: &RestoreJob) -> Option<TokenRangeReplicas>;
}

#[cfg_attr(test, mockall::automock)]
pub trait InstanceMetadataFetcher: Send + Sync {
    fn instance(&self, instance_id: InstanceId) -> Result<InstanceMetadata>;
}

/// Sink for restore gauges.
pub trait RestoreMetrics: Send + Sync {
    fn set_active_jobs(&self, count: usize);
}

/// Whether the sidecar's own schema exists yet. Discovery waits for it.
pub trait SchemaReadiness: Send + Sync {
    fn is_initialized(&self) -> bool;
}
