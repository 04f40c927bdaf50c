use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::error::Result;

/// Outcome of the pre-run check of a periodic task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScheduleDecision {
    Execute,
    /// Skip this run and wait another `delay()`.
    Skip,
}

/// Handle a task uses to request an immediate re-evaluation of its delay.
pub trait TaskRescheduler: Send + Sync + fmt::Debug {
    /// Restart the named task's wait with a freshly computed `delay()`.
    ///
    /// Has no effect on a run already in progress; the new delay is
    /// picked up when that run completes.
    fn reschedule(&self, task_name: &str);
}

#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    /// Unique name, used as the scheduling key.
    fn name(&self) -> &str;

    fn schedule_decision(&self) -> ScheduleDecision {
        ScheduleDecision::Execute
    }

    fn initial_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Delay before the next run. Re-read after every run and after every
    /// reschedule request.
    fn delay(&self) -> Duration;

    /// One run of the task. Errors are logged by the executor and do not
    /// stop future runs.
    async fn execute(&self) -> Result<()>;

    /// Called once when the task is scheduled.
    fn register_periodic_task_executor(&self, _executor: Arc<dyn TaskRescheduler>) {}
}
