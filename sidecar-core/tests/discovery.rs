use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use sidecar_core::{
    Result,
    model::{
        InstanceMetadata, JobId, RangeStatus, RestoreJob, RestoreJobStatus, RestoreSlice,
        TokenRange,
    },
    restore::{
        DEFAULT_BUCKET_ID, DiscoveryCollaborators, EXPIRED_ABORT_REASON, RangeProcessor,
        RangeTask, RestoreJobConfig, RestoreJobDiscoverer, RestoreJobManagerGroup,
        RestoreJobStore, RestoreJobUpdate, StorageClientConfig, StorageClientPool,
        memory::{
            AtomicRestoreMetrics, InMemoryRestoreStore, InMemoryRingTopology,
            StaticInstances, StaticSchemaReadiness, StaticTokenRanges, configured_restore_job,
            restore_job,
        },
    },
    tasks::{PeriodicTask, PeriodicTaskExecutor, TaskRescheduler},
};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct RecordingProcessor {
    submitted: Mutex<Vec<RangeTask>>,
}

impl RangeProcessor for RecordingProcessor {
    fn submit(&self, task: RangeTask) {
        self.submitted.lock().push(task);
    }
}

#[derive(Debug, Default)]
struct RecordingRescheduler {
    requests: AtomicUsize,
}

impl TaskRescheduler for RecordingRescheduler {
    fn reschedule(&self, _task_name: &str) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

/// Job store that counts queries and can hold a query open until released.
#[derive(Debug, Default)]
struct GatedJobStore {
    inner: InMemoryRestoreStore,
    queries: AtomicUsize,
    gated: std::sync::atomic::AtomicBool,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl RestoreJobStore for GatedJobStore {
    async fn find_all_recent(
        &self,
        now: DateTime<Utc>,
        recency_days: u32,
    ) -> Result<Vec<RestoreJob>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.find_all_recent(now, recency_days).await
    }

    async fn find(&self, job_id: JobId) -> Result<Option<RestoreJob>> {
        self.inner.find(job_id).await
    }

    async fn update(&self, job_id: JobId, update: RestoreJobUpdate) -> Result<RestoreJob> {
        self.inner.update(job_id, update).await
    }

    async fn abort(&self, job_id: JobId, reason: &str) -> Result<()> {
        self.inner.abort(job_id, reason).await
    }
}

struct Fixture {
    store: InMemoryRestoreStore,
    jobs: Arc<GatedJobStore>,
    topology: Arc<InMemoryRingTopology>,
    tokens: Arc<StaticTokenRanges>,
    metrics: Arc<AtomicRestoreMetrics>,
    processor: Arc<RecordingProcessor>,
    managers: Arc<RestoreJobManagerGroup>,
    rescheduler: Arc<RecordingRescheduler>,
    clock: Arc<Mutex<DateTime<Utc>>>,
    discoverer: Arc<RestoreJobDiscoverer>,
    _staging: tempfile::TempDir,
}

impl Fixture {
    fn new(config: RestoreJobConfig) -> Self {
        Self::build(config, false)
    }

    /// Instance whose staging directory path is occupied by a plain file.
    fn with_unusable_staging(config: RestoreJobConfig) -> Self {
        Self::build(config, true)
    }

    fn build(config: RestoreJobConfig, unusable_staging: bool) -> Self {
        let staging = tempfile::tempdir().expect("staging dir");
        let staging_dir = if unusable_staging {
            let blocker = staging.path().join("blocked");
            std::fs::write(&blocker, b"").expect("blocker file");
            blocker
        } else {
            staging.path().to_path_buf()
        };
        let store = InMemoryRestoreStore::new();
        let jobs = Arc::new(GatedJobStore {
            inner: store.clone(),
            ..GatedJobStore::default()
        });
        let topology = Arc::new(InMemoryRingTopology::default());
        let tokens = Arc::new(StaticTokenRanges::new(HashMap::from([(
            1,
            BTreeSet::from([range(0, 1_000)]),
        )])));
        let instances = Arc::new(StaticInstances::new([InstanceMetadata::new(
            1,
            "127.0.0.1",
            9042,
            staging_dir,
        )]));
        let metrics = Arc::new(AtomicRestoreMetrics::default());
        let processor = Arc::new(RecordingProcessor::default());
        let managers = Arc::new(RestoreJobManagerGroup::new(
            Arc::new(StorageClientPool::new(StorageClientConfig::default())),
            processor.clone(),
        ));
        let clock = Arc::new(Mutex::new(Utc::now()));

        let deps = DiscoveryCollaborators {
            schema: Arc::new(StaticSchemaReadiness::new(true)),
            jobs: jobs.clone(),
            slices: Arc::new(store.clone()),
            ranges: Arc::new(store.clone()),
            local_token_ranges: tokens.clone(),
            instances,
            topology: topology.clone(),
            metrics: metrics.clone(),
        };
        let shared_clock = Arc::clone(&clock);
        let discoverer = Arc::new(
            RestoreJobDiscoverer::new(config, deps, managers.clone())
                .with_clock(Arc::new(move || *shared_clock.lock())),
        );
        let rescheduler = Arc::new(RecordingRescheduler::default());
        discoverer.register_periodic_task_executor(rescheduler.clone());

        Self {
            store,
            jobs,
            topology,
            tokens,
            metrics,
            processor,
            managers,
            rescheduler,
            clock,
            discoverer,
            _staging: staging,
        }
    }

    fn set_now(&self, now: DateTime<Utc>) {
        *self.clock.lock() = now;
    }

    async fn pass(&self) {
        let ran = self
            .discoverer
            .try_execute_discovery()
            .await
            .expect("discovery pass");
        assert!(ran, "pass should not be skipped");
    }

    fn reschedules(&self) -> usize {
        self.rescheduler.requests.load(Ordering::SeqCst)
    }
}

fn range(start: i128, end: i128) -> TokenRange {
    TokenRange::new(start, end).expect("valid range")
}

fn slice(job: &RestoreJob, id: &str, token_range: TokenRange) -> RestoreSlice {
    RestoreSlice {
        job_id: job.job_id,
        slice_id: id.to_owned(),
        bucket_id: DEFAULT_BUCKET_ID,
        keyspace_name: job.keyspace_name.clone(),
        table_name: job.table_name.clone(),
        storage_bucket: "restore-bucket".into(),
        storage_key: format!("{}/{id}.zip", job.keyspace_name),
        checksum: "00ff".into(),
        range: token_range,
        compressed_size: 1_024,
        uncompressed_size: 4_096,
    }
}

#[tokio::test]
async fn unchanged_job_is_submitted_and_persisted_once() {
    let fx = Fixture::new(RestoreJobConfig::default());
    let job = restore_job("ks", "tbl", Utc::now(), TimeDelta::hours(4));
    fx.store.insert_job(job.clone()).await;
    fx.store.insert_slice(slice(&job, "s1", range(10, 20))).await;
    fx.store.insert_slice(slice(&job, "s2", range(500, 900))).await;
    // outside every local range
    fx.store.insert_slice(slice(&job, "s3", range(2_000, 3_000))).await;

    fx.pass().await;
    fx.pass().await;
    fx.pass().await;

    let ranges = fx.store.ranges(job.job_id).await;
    assert_eq!(ranges.len(), 2);
    assert!(ranges.iter().all(|r| r.status == RangeStatus::Created));
    assert_eq!(fx.store.range_creates(), 2);
    assert_eq!(fx.processor.submitted.lock().len(), 2);
    assert_eq!(fx.managers.range_count(job.job_id), 2);
    assert!(fx.topology.is_registered(job.job_id));
}

#[tokio::test]
async fn topology_change_splits_slices_along_replica_boundaries() {
    use sidecar_core::model::{ReplicaRange, TokenRangeReplicas};

    let fx = Fixture::new(RestoreJobConfig::default());
    let job = restore_job("ks", "tbl", Utc::now(), TimeDelta::hours(4));
    fx.store.insert_job(job.clone()).await;
    fx.store.insert_slice(slice(&job, "s1", range(0, 300))).await;
    fx.topology.set_topology(Some(TokenRangeReplicas::new(vec![
        ReplicaRange {
            range: range(-100, 100),
            replicas: vec!["127.0.0.1".into()],
        },
        ReplicaRange {
            range: range(100, 1_000),
            replicas: vec!["127.0.0.1".into()],
        },
    ])));

    fx.pass().await;

    let ranges: Vec<_> = fx
        .store
        .ranges(job.job_id)
        .await
        .into_iter()
        .map(|r| r.range)
        .collect();
    assert_eq!(ranges, vec![range(0, 100), range(100, 300)]);
}

#[tokio::test]
async fn terminal_jobs_are_finalized_whether_managed_or_not() {
    for status in [
        RestoreJobStatus::Succeeded,
        RestoreJobStatus::Failed,
        RestoreJobStatus::Aborted,
    ] {
        for managed in [true, false] {
            let fx = Fixture::new(RestoreJobConfig::default());
            let mut job = restore_job("ks", "tbl", Utc::now(), TimeDelta::hours(4));
            job.managed_by_sidecar = managed;
            fx.store.insert_job(job.clone()).await;
            fx.store.insert_slice(slice(&job, "s1", range(10, 20))).await;

            fx.pass().await;
            assert_eq!(fx.discoverer.inflight_jobs(), 1);
            assert_eq!(fx.managers.is_tracked(job.job_id), managed);

            fx.store.set_status(job.job_id, status).await.expect("status");
            fx.pass().await;

            assert_eq!(fx.discoverer.inflight_jobs(), 0, "{status} managed={managed}");
            assert!(!fx.managers.is_tracked(job.job_id));
            assert!(!fx.topology.is_registered(job.job_id));
            if managed {
                assert!(fx.processor.submitted.lock()[0].job.is_cancelled());
            }
        }
    }
}

#[tokio::test]
async fn unknown_status_is_left_untouched() {
    let fx = Fixture::new(RestoreJobConfig::default());
    let job = restore_job("ks", "tbl", Utc::now(), TimeDelta::hours(4));
    fx.store.insert_job(job.clone()).await;
    fx.store.insert_slice(slice(&job, "s1", range(10, 20))).await;
    fx.pass().await;

    fx.store
        .set_status(job.job_id, RestoreJobStatus::Unknown)
        .await
        .expect("status");
    fx.pass().await;

    assert_eq!(fx.discoverer.inflight_jobs(), 0);
    assert!(fx.managers.is_tracked(job.job_id));
    assert!(fx.topology.is_registered(job.job_id));
    assert_eq!(fx.store.abort_calls(), 0);
}

#[tokio::test]
async fn recency_window_never_drops_below_the_minimum() {
    let config = RestoreJobConfig {
        job_discovery_minimum_recency_days: 3,
        ..RestoreJobConfig::default()
    };
    let fx = Fixture::new(config);
    let now = Utc::now();
    assert_eq!(fx.discoverer.job_discovery_recency_days(), 3);

    // empty store
    fx.pass().await;
    assert_eq!(fx.discoverer.job_discovery_recency_days(), 3);

    let recent = restore_job("ks", "tbl", now - TimeDelta::days(1), TimeDelta::days(30));
    let oldest = restore_job("ks", "tbl", now - TimeDelta::days(3), TimeDelta::days(30));
    fx.store.insert_job(recent.clone()).await;
    fx.store.insert_job(oldest.clone()).await;
    fx.pass().await;
    assert_eq!(fx.discoverer.inflight_jobs(), 2);
    assert_eq!(fx.discoverer.job_discovery_recency_days(), 3);

    fx.store
        .set_status(oldest.job_id, RestoreJobStatus::Succeeded)
        .await
        .expect("status");
    fx.pass().await;
    assert_eq!(fx.discoverer.inflight_jobs(), 1);
    assert_eq!(fx.discoverer.job_discovery_recency_days(), 3);

    fx.store
        .set_status(recent.job_id, RestoreJobStatus::Succeeded)
        .await
        .expect("status");
    fx.pass().await;
    assert_eq!(fx.discoverer.job_discovery_recency_days(), 3);
}

#[tokio::test]
async fn delay_switches_with_in_flight_state_and_reschedules_once_per_flip() {
    let fx = Fixture::new(RestoreJobConfig::default());
    let idle = Duration::from_millis(600_000);
    let active = Duration::from_millis(5_000);
    assert_eq!(fx.discoverer.delay(), idle);

    fx.pass().await;
    assert_eq!(fx.reschedules(), 0);

    let job = restore_job("ks", "tbl", Utc::now(), TimeDelta::hours(4));
    fx.store.insert_job(job.clone()).await;
    fx.pass().await;
    assert_eq!(fx.discoverer.delay(), active);
    assert_eq!(fx.reschedules(), 1);
    assert_eq!(fx.metrics.active_jobs(), 1);

    fx.pass().await;
    fx.pass().await;
    assert_eq!(fx.reschedules(), 1);

    fx.store
        .set_status(job.job_id, RestoreJobStatus::Succeeded)
        .await
        .expect("status");
    fx.pass().await;
    assert_eq!(fx.discoverer.delay(), idle);
    assert_eq!(fx.reschedules(), 2);
    assert_eq!(fx.metrics.active_jobs(), 0);
}

#[tokio::test]
async fn expired_job_is_aborted_then_finalized_and_retried_on_store_failure() {
    let fx = Fixture::new(RestoreJobConfig::default());
    let t0 = Utc::now() - TimeDelta::hours(3);
    let job = restore_job("ks", "tbl", t0, TimeDelta::hours(1));
    fx.store.insert_job(job.clone()).await;
    fx.store.insert_slice(slice(&job, "s1", range(10, 20))).await;

    fx.set_now(t0 + TimeDelta::minutes(30));
    fx.pass().await;
    assert_eq!(fx.discoverer.inflight_jobs(), 1);
    assert_eq!(fx.store.abort_calls(), 0);
    assert!(fx.managers.is_tracked(job.job_id));

    fx.set_now(t0 + TimeDelta::minutes(61));
    fx.store.fail_aborts(true);
    fx.pass().await;
    assert_eq!(fx.discoverer.inflight_jobs(), 0);
    assert_eq!(fx.store.abort_calls(), 1);
    let stored = fx.store.find(job.job_id).await.expect("find").expect("job");
    assert_eq!(stored.status, RestoreJobStatus::Created);
    // not finalized; retried next pass
    assert!(fx.managers.is_tracked(job.job_id));
    assert!(fx.topology.is_registered(job.job_id));

    fx.store.fail_aborts(false);
    fx.pass().await;
    assert_eq!(fx.store.abort_calls(), 2);
    let stored = fx.store.find(job.job_id).await.expect("find").expect("job");
    assert_eq!(stored.status, RestoreJobStatus::Aborted);
    assert_eq!(
        fx.store.abort_reason(job.job_id).await.as_deref(),
        Some(EXPIRED_ABORT_REASON)
    );
    assert!(!fx.managers.is_tracked(job.job_id));
    assert!(!fx.topology.is_registered(job.job_id));

    // aborted jobs are terminal from now on
    fx.pass().await;
    assert_eq!(fx.store.abort_calls(), 2);
}

#[tokio::test]
async fn configured_ttl_drives_expiry() {
    let config = RestoreJobConfig {
        job_ttl_secs: 2 * 24 * 60 * 60,
        ..RestoreJobConfig::default()
    };
    let t0 = Utc::now() - TimeDelta::days(4);
    let job = configured_restore_job(&config, "ks", "tbl", t0);
    let fx = Fixture::new(config);
    fx.store.insert_job(job.clone()).await;

    fx.set_now(t0 + TimeDelta::days(1));
    fx.pass().await;
    assert_eq!(fx.discoverer.inflight_jobs(), 1);

    fx.set_now(t0 + TimeDelta::days(2) + TimeDelta::minutes(1));
    fx.pass().await;
    assert_eq!(fx.discoverer.inflight_jobs(), 0);
    let stored = fx.store.find(job.job_id).await.expect("find").expect("job");
    assert_eq!(stored.status, RestoreJobStatus::Aborted);
}

#[tokio::test]
async fn one_failing_job_does_not_stop_the_pass() {
    let fx = Fixture::new(RestoreJobConfig::default());
    let first = restore_job("ks", "tbl", Utc::now(), TimeDelta::hours(4));
    let second = restore_job("ks", "other", Utc::now(), TimeDelta::hours(4));
    fx.store.insert_job(first.clone()).await;
    fx.store.insert_job(second).await;
    fx.store.insert_slice(slice(&first, "s1", range(10, 20))).await;

    // instance 2 owns ranges but has no metadata: submission for every job
    // fails at the lookup
    fx.tokens.replace(HashMap::from([
        (1, BTreeSet::from([range(0, 1_000)])),
        (2, BTreeSet::from([range(1_000, 2_000)])),
    ]));
    fx.pass().await;

    // both jobs remain pending; the lookup error is per job
    assert_eq!(fx.discoverer.inflight_jobs(), 2);
    assert_eq!(fx.metrics.active_jobs(), 2);
}

#[tokio::test]
async fn fatal_submission_marks_only_that_range_failed() {
    let fx = Fixture::with_unusable_staging(RestoreJobConfig::default());
    let job = restore_job("ks", "tbl", Utc::now(), TimeDelta::hours(4));
    fx.store.insert_job(job.clone()).await;
    fx.store.insert_slice(slice(&job, "s1", range(10, 20))).await;

    fx.pass().await;

    let ranges = fx.store.ranges(job.job_id).await;
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].status, RangeStatus::Failed);
    assert!(ranges[0].failure_reason.is_some());
    assert_eq!(fx.store.range_creates(), 0);
    assert!(fx.processor.submitted.lock().is_empty());
    assert_eq!(fx.discoverer.inflight_jobs(), 1);
}

#[tokio::test]
async fn concurrent_trigger_during_a_pass_is_a_no_op() {
    let fx = Fixture::new(RestoreJobConfig::default());
    fx.store
        .insert_job(restore_job("ks", "tbl", Utc::now(), TimeDelta::hours(4)))
        .await;
    fx.jobs.gated.store(true, Ordering::SeqCst);

    let running = {
        let discoverer = Arc::clone(&fx.discoverer);
        tokio::spawn(async move { discoverer.try_execute_discovery().await })
    };
    fx.jobs.entered.notified().await;
    assert!(fx.discoverer.is_executing());

    let second = fx.discoverer.try_execute_discovery().await.expect("second call");
    assert!(!second);
    assert_eq!(fx.jobs.queries.load(Ordering::SeqCst), 1);
    assert_eq!(fx.discoverer.inflight_jobs(), 0);
    assert_eq!(fx.reschedules(), 0);

    fx.jobs.release.notify_one();
    let first = running.await.expect("join").expect("first pass");
    assert!(first);
    assert_eq!(fx.discoverer.inflight_jobs(), 1);
    assert!(!fx.discoverer.is_executing());
}

#[tokio::test]
async fn store_query_failure_fails_the_pass_but_keeps_counters() {
    let fx = Fixture::new(RestoreJobConfig::default());
    fx.store
        .insert_job(restore_job("ks", "tbl", Utc::now(), TimeDelta::hours(4)))
        .await;
    fx.pass().await;
    assert_eq!(fx.discoverer.inflight_jobs(), 1);

    fx.store.fail_queries(true);
    assert!(fx.discoverer.try_execute_discovery().await.is_err());
    assert_eq!(fx.discoverer.inflight_jobs(), 1);
    assert!(!fx.discoverer.is_executing());
}

#[tokio::test(start_paused = true)]
async fn executor_polls_at_active_cadence_once_work_appears() {
    let fx = Fixture::new(RestoreJobConfig::default());
    let job = restore_job("ks", "tbl", Utc::now(), TimeDelta::hours(4));
    fx.store.insert_job(job).await;
    // no local ranges: keeps the pass free of filesystem work
    fx.tokens.replace(HashMap::new());

    let executor = PeriodicTaskExecutor::new();
    executor
        .schedule(fx.discoverer.clone())
        .expect("schedule discoverer");

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(fx.jobs.queries.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(fx.jobs.queries.load(Ordering::SeqCst), 3);

    executor.close().await;
}
