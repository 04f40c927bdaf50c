use std::{fmt, path::PathBuf, sync::Arc};

use sidecar_model::{RestoreJob, RestoreRange};
use tokio::{io::AsyncWriteExt, sync::Semaphore};
use tracing::{debug, info, warn};

use super::{
    manager::{RangeProcessor, RangeTask, TrackedJob},
    ports::RestoreRangeStore,
    storage::StorageClientPool,
};
use crate::error::{Result, SidecarError};

/// Downloads accepted ranges into their staging directories.
///
/// At most `max_concurrency` ranges download at once across all instances.
/// The storage client is requested only when a download actually starts,
/// so credentials are bound as late as possible.
#[derive(Clone)]
pub struct DownloadRangeProcessor {
    pool: Arc<StorageClientPool>,
    ranges: Arc<dyn RestoreRangeStore>,
    permits: Arc<Semaphore>,
    chunk_size: u64,
}

impl fmt::Debug for DownloadRangeProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadRangeProcessor")
            .field("available_permits", &self.permits.available_permits())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl DownloadRangeProcessor {
    pub fn new(
        pool: Arc<StorageClientPool>,
        ranges: Arc<dyn RestoreRangeStore>,
        max_concurrency: usize,
    ) -> Self {
        let chunk_size = pool.config().range_get_object_bytes_size.max(1);
        Self {
            pool,
            ranges,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            chunk_size,
        }
    }

    async fn process(self, task: RangeTask) {
        let RangeTask { mut range, job } = task;

        let _permit = tokio::select! {
            _ = job.cancelled() => {
                debug!(job_id = %range.job_id, upload_id = %range.upload_id, "Range dropped before download");
                return;
            }
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        match self.download(&range, &job).await {
            Ok(bytes) => {
                range.mark_staged();
                info!(
                    job_id = %range.job_id,
                    range = %range.range,
                    upload_id = %range.upload_id,
                    bytes,
                    "Staged restore range"
                );
            }
            Err(SidecarError::Cancelled(reason)) => {
                debug!(job_id = %range.job_id, upload_id = %range.upload_id, %reason, "Range download stopped");
                return;
            }
            // credentials are revoked on finalization, so an in-flight chunk
            // of a finished job fails instead of reporting cancellation
            Err(err) if job.is_cancelled() => {
                debug!(job_id = %range.job_id, upload_id = %range.upload_id, "Range download abandoned with its job: {err}");
                return;
            }
            Err(err) => {
                warn!(
                    job_id = %range.job_id,
                    range = %range.range,
                    upload_id = %range.upload_id,
                    "Range download failed: {err}"
                );
                range.fail(err.to_string());
            }
        }

        if let Err(err) = self.ranges.update_status(&range).await {
            warn!(job_id = %range.job_id, upload_id = %range.upload_id, "Failed to persist range status: {err}");
        }
    }

    async fn download(&self, range: &RestoreRange, job: &TrackedJob) -> Result<u64> {
        let snapshot: RestoreJob = job.snapshot();
        let client = self.pool.storage_client(&snapshot)?;
        let bucket = range.storage_bucket.as_str();
        let key = range.storage_key.as_str();

        let size = match range.slice_compressed_size {
            0 => client.object_size(range.job_id, bucket, key).await?,
            known => known,
        };

        let target = staged_file(range);
        let mut file = tokio::fs::File::create(&target).await?;
        let mut offset = 0u64;
        while offset < size {
            if job.is_cancelled() {
                return Err(SidecarError::Cancelled(format!("job {} finalized", range.job_id)));
            }
            let last = (offset + self.chunk_size - 1).min(size - 1);
            let chunk = client.download_range(range.job_id, bucket, key, offset..=last).await?;
            file.write_all(&chunk).await?;
            offset += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(offset)
    }
}

impl RangeProcessor for DownloadRangeProcessor {
    fn submit(&self, task: RangeTask) {
        tokio::spawn(self.clone().process(task));
    }
}

/// `<stage dir>/<last segment of the object key>`, falling back to the
/// slice id for keys ending in a separator.
pub fn staged_file(range: &RestoreRange) -> PathBuf {
    let name = range
        .storage_key
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(range.slice_id.as_str());
    range.stage_directory.join(name)
}
