//! Core data model definitions shared across the sidecar restore crates.
#![allow(missing_docs)]

pub use ::chrono;

pub mod error;
pub mod ids;
pub mod instance;
pub mod restore;
pub mod token;

pub use error::{ModelError, Result as ModelResult};
pub use ids::{InstanceId, JobId};
pub use instance::{InstanceMetadata, InstanceRef};
pub use restore::{
    RangeKey, RangeStatus, ReplicaRange, RestoreJob, RestoreJobSecrets,
    RestoreJobStatus, RestoreRange, RestoreSlice, StorageCredentials,
    TokenRangeReplicas,
};
pub use token::{Token, TokenRange};
