use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sidecar_model::JobId;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::error::OperationalJobError;
use crate::error::{Result, SidecarError};

/// Externally visible state of an operational job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationalJobStatus {
    Created,
    Running,
    Succeeded,
    Failed,
}

impl OperationalJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Completion value of a job. Set exactly once.
pub type JobOutcome = std::result::Result<(), OperationalJobError>;

/// Result of a bounded wait on a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    /// The job finished successfully within the wait.
    Completed,
    /// The wait elapsed first; the job may still finish later.
    StillRunning,
}

/// Whether something created at `created_at` outlived `ttl` as of
/// `reference`.
///
/// Rejects a reference earlier than the creation time and a negative ttl.
pub fn is_stale(
    created_at: DateTime<Utc>,
    reference: DateTime<Utc>,
    ttl: TimeDelta,
) -> Result<bool> {
    if reference < created_at {
        return Err(SidecarError::InvalidArgument(format!(
            "reference time {reference} precedes creation time {created_at}"
        )));
    }
    if ttl < TimeDelta::zero() {
        return Err(SidecarError::InvalidArgument(format!(
            "ttl must not be negative, got {ttl}"
        )));
    }
    Ok(reference - created_at > ttl)
}

/// The job-specific part of an operational job.
pub trait JobBody: Send + Sync + 'static {
    /// Blocking job body. Runs on the blocking thread pool.
    fn execute_internal(&self) -> anyhow::Result<()>;

    /// Whether the operation is already observable on the Cassandra node.
    ///
    /// Long-lived operations (e.g. a decommission in progress) override this
    /// so the job reports RUNNING even before this process has picked it up.
    fn is_running_on_cassandra(&self) -> bool {
        false
    }
}

/// Tracks one execution of a [`JobBody`].
pub struct OperationalJob<B: JobBody> {
    job_id: JobId,
    body: Arc<B>,
    executing: AtomicBool,
    outcome: watch::Sender<Option<JobOutcome>>,
}

impl<B: JobBody> fmt::Debug for OperationalJob<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationalJob")
            .field("job_id", &self.job_id)
            .field("body", &std::any::type_name::<B>())
            .field("status", &self.status())
            .finish()
    }
}

impl<B: JobBody> OperationalJob<B> {
    /// Create a job in CREATED state. Only time-ordered ids are accepted.
    pub fn new(job_id: Uuid, body: B) -> Result<Self> {
        let job_id = JobId::from_uuid(job_id).map_err(|err| {
            SidecarError::InvalidArgument(format!(
                "operational jobs accept only time-ordered ids: {err}"
            ))
        })?;
        let (outcome, _) = watch::channel(None);
        Ok(Self {
            job_id,
            body: Arc::new(body),
            executing: AtomicBool::new(false),
            outcome,
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn body(&self) -> &B {
        &self.body
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.job_id.created_at()
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::Acquire)
    }

    pub fn status(&self) -> OperationalJobStatus {
        let outcome = self.outcome.borrow();
        match outcome.as_ref() {
            Some(Ok(())) => OperationalJobStatus::Succeeded,
            Some(Err(_)) => OperationalJobStatus::Failed,
            None if self.is_executing() => OperationalJobStatus::Running,
            None if self.body.is_running_on_cassandra() => {
                OperationalJobStatus::Running
            }
            None => OperationalJobStatus::Created,
        }
    }

    /// Outcome if the job already finished.
    pub fn result(&self) -> Option<JobOutcome> {
        self.outcome.borrow().clone()
    }

    /// Whether the job outlived `ttl` as of `reference`. See [`is_stale`].
    pub fn is_stale(&self, reference: DateTime<Utc>, ttl: TimeDelta) -> Result<bool> {
        is_stale(self.creation_time(), reference, ttl)
    }

    /// Run the job body to completion and record the outcome.
    pub async fn execute(&self) {
        self.executing.store(true, Ordering::Release);
        info!(job_id = %self.job_id, "Executing job");

        let body = Arc::clone(&self.body);
        let outcome = match tokio::task::spawn_blocking(move || body.execute_internal()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(OperationalJobError::wraps(err)),
            Err(join_err) => Err(OperationalJobError::with_cause(
                "job body did not run to completion",
                join_err,
            )),
        };

        if let Err(err) = &outcome {
            error!(job_id = %self.job_id, reason = %err, "Job execution failed");
        }

        if self.complete(outcome) {
            debug!(job_id = %self.job_id, status = ?self.status(), "Complete job execution");
        }
    }

    /// Record the outcome. Returns false when an outcome was already set.
    fn complete(&self, outcome: JobOutcome) -> bool {
        self.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    /// Wait at most `max_wait` for the outcome without blocking the caller.
    ///
    /// A finished job resolves immediately with its real outcome. Otherwise
    /// the job's completion races a timer; when the timer wins the result is
    /// [`WaitOutcome::StillRunning`].
    pub async fn async_result(
        &self,
        max_wait: Duration,
    ) -> std::result::Result<WaitOutcome, OperationalJobError> {
        let mut rx = self.outcome.subscribe();
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return outcome.map(|()| WaitOutcome::Completed);
        }

        let timer = tokio::time::sleep(max_wait);
        tokio::pin!(timer);

        tokio::select! {
            finished = rx.wait_for(Option::is_some) => {
                let outcome = match finished {
                    Ok(value) => value.clone(),
                    // sender lives as long as the job itself
                    Err(_) => None,
                };
                match outcome {
                    Some(outcome) => outcome.map(|()| WaitOutcome::Completed),
                    None => Ok(WaitOutcome::StillRunning),
                }
            }
            _ = &mut timer => Ok(WaitOutcome::StillRunning),
        }
    }
}
