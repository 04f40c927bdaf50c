//! In-process implementations of the restore collaborators.
//!
//! Used for local runs and tests. State lives behind async mutexes the same
//! way a real accessor would be shared between the discoverer and request
//! handlers.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use sidecar_model::{
    InstanceId, InstanceMetadata, JobId, RangeKey, RestoreJob, RestoreJobStatus, RestoreRange,
    RestoreSlice, TokenRange, TokenRangeReplicas,
};
use tokio::sync::Mutex;

use super::config::RestoreJobConfig;
use super::ports::{
    InstanceMetadataFetcher, LocalTokenRangesProvider, RestoreJobStore, RestoreJobUpdate,
    RestoreMetrics, RestoreRangeStore, RestoreSliceStore, RingTopology, SchemaReadiness,
};
use crate::error::{Result, SidecarError};

#[derive(Debug, Default)]
struct StoreState {
    jobs: HashMap<JobId, RestoreJob>,
    abort_reasons: HashMap<JobId, String>,
    slices: Vec<RestoreSlice>,
    ranges: HashMap<RangeKey, RestoreRange>,
}

/// Job, slice and range store backed by process memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryRestoreStore {
    state: Arc<Mutex<StoreState>>,
    fail_aborts: Arc<AtomicBool>,
    fail_queries: Arc<AtomicBool>,
    abort_calls: Arc<AtomicUsize>,
    range_creates: Arc<AtomicUsize>,
}

impl InMemoryRestoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_job(&self, job: RestoreJob) {
        self.state.lock().await.jobs.insert(job.job_id, job);
    }

    pub async fn insert_slice(&self, slice: RestoreSlice) {
        self.state.lock().await.slices.push(slice);
    }

    pub async fn set_status(&self, job_id: JobId, status: RestoreJobStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| SidecarError::NotFound(format!("restore job {job_id}")))?;
        job.status = status;
        Ok(())
    }

    /// Make every subsequent `abort` fail with a store error.
    pub fn fail_aborts(&self, fail: bool) {
        self.fail_aborts.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `find_all_recent` fail with a store error.
    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    pub fn abort_calls(&self) -> usize {
        self.abort_calls.load(Ordering::SeqCst)
    }

    /// Number of `create` calls, duplicates included.
    pub fn range_creates(&self) -> usize {
        self.range_creates.load(Ordering::SeqCst)
    }

    pub async fn abort_reason(&self, job_id: JobId) -> Option<String> {
        self.state.lock().await.abort_reasons.get(&job_id).cloned()
    }

    pub async fn ranges(&self, job_id: JobId) -> Vec<RestoreRange> {
        let state = self.state.lock().await;
        let mut ranges: Vec<_> = state
            .ranges
            .values()
            .filter(|range| range.job_id == job_id)
            .cloned()
            .collect();
        ranges.sort_by(|a, b| (a.owner.id, a.range).cmp(&(b.owner.id, b.range)));
        ranges
    }
}

#[async_trait]
impl RestoreJobStore for InMemoryRestoreStore {
    async fn find_all_recent(
        &self,
        now: DateTime<Utc>,
        recency_days: u32,
    ) -> Result<Vec<RestoreJob>> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(SidecarError::Store("job query unavailable".into()));
        }
        let today = now.date_naive();
        let state = self.state.lock().await;
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|job| (today - job.created_day()).num_days() <= i64::from(recency_days))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.job_id.to_uuid());
        Ok(jobs)
    }

    async fn find(&self, job_id: JobId) -> Result<Option<RestoreJob>> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn update(&self, job_id: JobId, update: RestoreJobUpdate) -> Result<RestoreJob> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| SidecarError::NotFound(format!("restore job {job_id}")))?;
        if let Some(status) = update.status {
            job.status = status;
        }
        if let Some(expire_at) = update.expire_at {
            job.expire_at = expire_at;
        }
        if let Some(secrets) = update.secrets {
            job.secrets = Some(secrets);
        }
        if let Some(agent) = update.job_agent {
            job.job_agent = Some(agent);
        }
        Ok(job.clone())
    }

    async fn abort(&self, job_id: JobId, reason: &str) -> Result<()> {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_aborts.load(Ordering::SeqCst) {
            return Err(SidecarError::Store(format!("abort of {job_id} rejected")));
        }
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| SidecarError::NotFound(format!("restore job {job_id}")))?;
        job.status = RestoreJobStatus::Aborted;
        state.abort_reasons.insert(job_id, reason.to_owned());
        Ok(())
    }
}

#[async_trait]
impl RestoreSliceStore for InMemoryRestoreStore {
    async fn select_by_job_by_bucket_by_token_range(
        &self,
        job: &RestoreJob,
        bucket_id: i16,
        range: &TokenRange,
    ) -> Result<Vec<RestoreSlice>> {
        let state = self.state.lock().await;
        Ok(state
            .slices
            .iter()
            .filter(|slice| {
                slice.job_id == job.job_id
                    && slice.bucket_id == bucket_id
                    && slice.range.intersects(range)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RestoreRangeStore for InMemoryRestoreStore {
    async fn create(&self, range: &RestoreRange) -> Result<()> {
        self.range_creates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state.ranges.insert(range.key(), range.clone());
        Ok(())
    }

    async fn update_status(&self, range: &RestoreRange) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ranges.insert(range.key(), range.clone());
        Ok(())
    }
}

/// Convenience constructor for a job created at `created_at` that lives
/// for `ttl`.
pub fn restore_job(
    keyspace: &str,
    table: &str,
    created_at: DateTime<Utc>,
    ttl: TimeDelta,
) -> RestoreJob {
    RestoreJob {
        job_id: JobId::from_datetime(created_at),
        keyspace_name: keyspace.to_owned(),
        table_name: table.to_owned(),
        job_agent: None,
        status: RestoreJobStatus::Created,
        expire_at: created_at + ttl,
        secrets: None,
        slice_count: 0,
        managed_by_sidecar: true,
    }
}

/// Like [`restore_job`], with the expiry a deployment stamps on new jobs.
pub fn configured_restore_job(
    config: &RestoreJobConfig,
    keyspace: &str,
    table: &str,
    created_at: DateTime<Utc>,
) -> RestoreJob {
    let mut job = restore_job(keyspace, table, created_at, TimeDelta::zero());
    job.expire_at = config.expire_at(created_at);
    job
}

/// Gauge sink keeping the last published value.
#[derive(Debug, Default)]
pub struct AtomicRestoreMetrics {
    active_jobs: AtomicUsize,
}

impl AtomicRestoreMetrics {
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::Relaxed)
    }
}

impl RestoreMetrics for AtomicRestoreMetrics {
    fn set_active_jobs(&self, count: usize) {
        self.active_jobs.store(count, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct StaticSchemaReadiness(AtomicBool);

impl StaticSchemaReadiness {
    pub fn new(ready: bool) -> Self {
        Self(AtomicBool::new(ready))
    }

    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }
}

impl SchemaReadiness for StaticSchemaReadiness {
    fn is_initialized(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fixed token ownership, identical for every keyspace.
#[derive(Debug, Default)]
pub struct StaticTokenRanges {
    ranges: RwLock<HashMap<InstanceId, BTreeSet<TokenRange>>>,
}

impl StaticTokenRanges {
    pub fn new(ranges: HashMap<InstanceId, BTreeSet<TokenRange>>) -> Self {
        Self {
            ranges: RwLock::new(ranges),
        }
    }

    pub fn replace(&self, ranges: HashMap<InstanceId, BTreeSet<TokenRange>>) {
        *self.ranges.write() = ranges;
    }
}

impl LocalTokenRangesProvider for StaticTokenRanges {
    fn local_token_ranges(
        &self,
        _keyspace: &str,
    ) -> Result<HashMap<InstanceId, BTreeSet<TokenRange>>> {
        Ok(self.ranges.read().clone())
    }
}

#[derive(Debug, Default)]
pub struct StaticInstances {
    instances: HashMap<InstanceId, InstanceMetadata>,
}

impl StaticInstances {
    pub fn new(instances: impl IntoIterator<Item = InstanceMetadata>) -> Self {
        Self {
            instances: instances
                .into_iter()
                .map(|instance| (instance.id, instance))
                .collect(),
        }
    }
}

impl InstanceMetadataFetcher for StaticInstances {
    fn instance(&self, instance_id: InstanceId) -> Result<InstanceMetadata> {
        self.instances
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| SidecarError::NotFound(format!("instance {instance_id}")))
    }
}

/// Topology cache with a single, manually set topology for all keyspaces.
#[derive(Debug, Default)]
pub struct InMemoryRingTopology {
    registered: RwLock<HashSet<JobId>>,
    topology: RwLock<Option<TokenRangeReplicas>>,
}

impl InMemoryRingTopology {
    pub fn set_topology(&self, topology: Option<TokenRangeReplicas>) {
        *self.topology.write() = topology;
    }

    pub fn is_registered(&self, job_id: JobId) -> bool {
        self.registered.read().contains(&job_id)
    }
}

impl RingTopology for InMemoryRingTopology {
    fn register(&self, job: &RestoreJob) {
        self.registered.write().insert(job.job_id);
    }

    fn unregister(&self, job: &RestoreJob) {
        self.registered.write().remove(&job.job_id);
    }

    fn cached_replica_by_token_range(&self, job: &RestoreJob) -> Option<TokenRangeReplicas> {
        if !self.is_registered(job.job_id) {
            return None;
        }
        self.topology.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recent_jobs_respect_the_day_window() {
        let store = InMemoryRestoreStore::new();
        let now = Utc::now();
        let fresh = restore_job("ks", "t", now - TimeDelta::days(1), TimeDelta::days(30));
        let old = restore_job("ks", "t", now - TimeDelta::days(10), TimeDelta::days(30));
        store.insert_job(fresh.clone()).await;
        store.insert_job(old.clone()).await;

        let recent = store.find_all_recent(now, 5).await.unwrap();
        assert_eq!(recent, vec![fresh.clone()]);

        let all = store.find_all_recent(now, 10).await.unwrap();
        assert_eq!(all, vec![old, fresh]);
    }

    #[tokio::test]
    async fn abort_records_reason_unless_failing() {
        let store = InMemoryRestoreStore::new();
        let job = restore_job("ks", "t", Utc::now(), TimeDelta::hours(1));
        store.insert_job(job.clone()).await;

        store.fail_aborts(true);
        assert!(store.abort(job.job_id, "Expired").await.is_err());
        let unchanged = store.find(job.job_id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, RestoreJobStatus::Created);

        store.fail_aborts(false);
        store.abort(job.job_id, "Expired").await.unwrap();
        let aborted = store.find(job.job_id).await.unwrap().unwrap();
        assert_eq!(aborted.status, RestoreJobStatus::Aborted);
        assert_eq!(store.abort_reason(job.job_id).await.as_deref(), Some("Expired"));
        assert_eq!(store.abort_calls(), 2);
    }

    #[tokio::test]
    async fn partial_update_touches_only_given_fields() {
        let store = InMemoryRestoreStore::new();
        let job = restore_job("ks", "t", Utc::now(), TimeDelta::hours(1));
        store.insert_job(job.clone()).await;

        let updated = store
            .update(
                job.job_id,
                RestoreJobUpdate {
                    status: Some(RestoreJobStatus::StageReady),
                    ..RestoreJobUpdate::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.status, RestoreJobStatus::StageReady);
        assert_eq!(updated.expire_at, job.expire_at);
    }
}
