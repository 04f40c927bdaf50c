//! Restore job orchestration for the Cassandra sidecar.
//!
//! - [`job`]: lifecycle and bounded waits for background operational jobs.
//! - [`tasks`]: adaptive periodic scheduling.
//! - [`restore`]: restore job discovery, submission, downloads and the
//!   storage client pool.
#![allow(missing_docs)]

pub mod error;
pub mod job;
pub mod restore;
pub mod tasks;

pub use error::{Result, SidecarError};
pub use sidecar_model as model;
