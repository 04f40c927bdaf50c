//! Recurring background tasks.
//!
//! A [`PeriodicTask`] decides before every run whether to execute or skip and
//! reports a fresh delay after every run. The [`PeriodicTaskExecutor`] drives
//! registered tasks and honours out-of-band [`TaskRescheduler::reschedule`]
//! requests so a task can switch cadence without waiting out its current
//! delay.

pub mod executor;
pub mod periodic;

pub use executor::PeriodicTaskExecutor;
pub use periodic::{PeriodicTask, ScheduleDecision, TaskRescheduler};
