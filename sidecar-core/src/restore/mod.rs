//! Restore jobs: discovery, per-instance submission, range downloads and
//! the storage clients they use.
//!
//! The [`RestoreJobDiscoverer`] is the entry point. Each pass it reads the
//! recent jobs from the job store, aborts the expired ones, and for every
//! job managed by this sidecar submits the slices covering locally owned
//! token ranges to the [`RestoreJobManagerGroup`]. Accepted ranges are
//! downloaded by a [`RangeProcessor`], which borrows credentialed clients
//! from the [`StorageClientPool`].

pub mod config;
pub mod discoverer;
pub mod manager;
pub mod memory;
pub mod ports;
pub mod processor;
pub mod storage;

pub use config::{ProxyConfig, RestoreJobConfig, StorageClientConfig};
pub use discoverer::{
    Clock, DEFAULT_BUCKET_ID, DiscoveryCollaborators, EXPIRED_ABORT_REASON,
    RESTORE_JOB_DISCOVERER, RestoreJobDiscoverer,
};
pub use manager::{
    RangeProcessor, RangeTask, RestoreJobManager, RestoreJobManagerGroup, SubmitStatus,
    TrackedJob,
};
pub use processor::DownloadRangeProcessor;
pub use ports::{
    InstanceMetadataFetcher, LocalTokenRangesProvider, RestoreJobStore, RestoreJobUpdate,
    RestoreMetrics, RestoreRangeStore, RestoreSliceStore, RingTopology, SchemaReadiness,
};
pub use storage::{IngressRateLimiter, StorageClient, StorageClientPool};
