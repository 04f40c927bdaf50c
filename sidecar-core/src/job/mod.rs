//! Lifecycle and result delivery for background operational jobs.
//!
//! An [`OperationalJob`] wraps a blocking [`JobBody`] and tracks whether it
//! has been picked up, is running, or has finished. Callers can wait for the
//! outcome with an upper bound without parking a thread.

pub mod error;
pub mod operational;

pub use error::OperationalJobError;
pub use operational::{
    JobBody, JobOutcome, OperationalJob, OperationalJobStatus, WaitOutcome,
    is_stale,
};
