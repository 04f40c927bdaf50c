//! Restore job records as stored in the sidecar's internal keyspace.

use std::{fmt, path::PathBuf, str::FromStr};

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    ids::{InstanceId, JobId},
    instance::{InstanceMetadata, InstanceRef},
    token::TokenRange,
};

/// Lifecycle of a restore job. Only the last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum RestoreJobStatus {
    Created,
    StageReady,
    Staged,
    ImportReady,
    Succeeded,
    Failed,
    Aborted,
    /// A value written by a newer or corrupted writer that this build does
    /// not understand. Never reclassified.
    #[cfg_attr(feature = "serde", serde(other))]
    Unknown,
}

impl RestoreJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::StageReady => "STAGE_READY",
            Self::Staged => "STAGED",
            Self::ImportReady => "IMPORT_READY",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl FromStr for RestoreJobStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "CREATED" => Self::Created,
            "STAGE_READY" => Self::StageReady,
            "STAGED" => Self::Staged,
            "IMPORT_READY" => Self::ImportReady,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            "ABORTED" => Self::Aborted,
            _ => Self::Unknown,
        })
    }
}

impl fmt::Display for RestoreJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Short-lived object storage credentials. Key material is wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StorageCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub region: String,
}

impl fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

/// Credentials supplied by the job creator: read access to the source
/// bucket and write access for progress markers.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RestoreJobSecrets {
    pub read_credentials: StorageCredentials,
    pub write_credentials: StorageCredentials,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RestoreJob {
    pub job_id: JobId,
    pub keyspace_name: String,
    pub table_name: String,
    pub job_agent: Option<String>,
    pub status: RestoreJobStatus,
    pub expire_at: DateTime<Utc>,
    pub secrets: Option<RestoreJobSecrets>,
    /// Number of slices the creator expects to upload. Informational only.
    pub slice_count: u64,
    /// Whether the sidecar drives slice discovery for this job, as opposed
    /// to a client pushing slices to each instance directly.
    pub managed_by_sidecar: bool,
}

impl RestoreJob {
    pub fn created_at(&self) -> DateTime<Utc> {
        self.job_id.created_at()
    }

    pub fn created_day(&self) -> NaiveDate {
        self.job_id.created_day()
    }

    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expire_at
    }

    /// Lifetime granted at creation: `expire_at - created_at`.
    pub fn ttl(&self) -> TimeDelta {
        self.expire_at - self.created_at()
    }

    pub fn is_managed_by_sidecar(&self) -> bool {
        self.managed_by_sidecar
    }

    /// Region of the source bucket, taken from the read credentials.
    pub fn storage_region(&self) -> Option<&str> {
        self.secrets
            .as_ref()
            .map(|secrets| secrets.read_credentials.region.as_str())
    }
}

/// One replica set entry of the ring topology: a range and the instances
/// that accept writes for it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReplicaRange {
    pub range: TokenRange,
    pub replicas: Vec<String>,
}

/// Snapshot of write replicas per token range for a keyspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TokenRangeReplicas {
    pub write_replicas: Vec<ReplicaRange>,
}

impl TokenRangeReplicas {
    pub fn new(write_replicas: Vec<ReplicaRange>) -> Self {
        Self { write_replicas }
    }
}

/// A storage object produced for one token range of a restore job.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RestoreSlice {
    pub job_id: JobId,
    pub slice_id: String,
    pub bucket_id: i16,
    pub keyspace_name: String,
    pub table_name: String,
    pub storage_bucket: String,
    pub storage_key: String,
    pub checksum: String,
    pub range: TokenRange,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

impl RestoreSlice {
    /// Split the slice along the replica topology boundaries it crosses.
    ///
    /// Returns the slice unchanged when there is no topology, when it fits
    /// inside a single topology range, or when no topology range overlaps
    /// it at all. Parts of the slice that no topology range covers become
    /// pieces of their own, so the pieces always tile the whole slice.
    pub fn split_maybe(
        &self,
        topology: Option<&TokenRangeReplicas>,
    ) -> Vec<RestoreSlice> {
        let Some(topology) = topology else {
            return vec![self.clone()];
        };
        if topology
            .write_replicas
            .iter()
            .any(|replica| replica.range.encloses(&self.range))
        {
            return vec![self.clone()];
        }

        let mut overlaps: Vec<TokenRange> = topology
            .write_replicas
            .iter()
            .filter_map(|replica| replica.range.intersection(&self.range))
            .collect();
        overlaps.sort();

        let mut pieces = Vec::with_capacity(overlaps.len() * 2 + 1);
        let mut cursor = self.range.start();
        for overlap in overlaps {
            if overlap.end() <= cursor {
                continue;
            }
            let start = overlap.start().max(cursor);
            pieces.extend(TokenRange::new(cursor, start).ok());
            pieces.extend(TokenRange::new(start, overlap.end()).ok());
            cursor = overlap.end();
        }
        pieces.extend(TokenRange::new(cursor, self.range.end()).ok());

        if pieces.len() <= 1 {
            return vec![self.clone()];
        }

        pieces
            .into_iter()
            .map(|range| RestoreSlice {
                range,
                ..self.clone()
            })
            .collect()
    }
}

/// Download state of a range on its owner instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum RangeStatus {
    Created,
    Staged,
    Failed,
}

/// Identity of a unit of download work. At most one range exists per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RangeKey {
    pub job_id: JobId,
    pub instance_id: InstanceId,
    pub range: TokenRange,
}

/// Instance-scoped unit of download work derived from a slice.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RestoreRange {
    pub job_id: JobId,
    pub slice_id: String,
    pub bucket_id: i16,
    pub keyspace_name: String,
    pub table_name: String,
    pub storage_bucket: String,
    pub storage_key: String,
    pub slice_checksum: String,
    pub slice_compressed_size: u64,
    pub range: TokenRange,
    pub owner: InstanceRef,
    pub upload_id: String,
    pub stage_directory: PathBuf,
    pub status: RangeStatus,
    pub failure_reason: Option<String>,
}

impl RestoreRange {
    /// Derive a range from a slice for the given owner. The staging
    /// directory is `<instance staging dir>/<upload id>`.
    pub fn from_slice(
        slice: &RestoreSlice,
        owner: &InstanceMetadata,
        upload_id: impl Into<String>,
    ) -> Self {
        let upload_id = upload_id.into();
        Self {
            job_id: slice.job_id,
            slice_id: slice.slice_id.clone(),
            bucket_id: slice.bucket_id,
            keyspace_name: slice.keyspace_name.clone(),
            table_name: slice.table_name.clone(),
            storage_bucket: slice.storage_bucket.clone(),
            storage_key: slice.storage_key.clone(),
            slice_checksum: slice.checksum.clone(),
            slice_compressed_size: slice.compressed_size,
            range: slice.range,
            owner: owner.owner(),
            stage_directory: owner.staging_dir.join(&upload_id),
            upload_id,
            status: RangeStatus::Created,
            failure_reason: None,
        }
    }

    pub fn key(&self) -> RangeKey {
        RangeKey {
            job_id: self.job_id,
            instance_id: self.owner.id,
            range: self.range,
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = RangeStatus::Failed;
        self.failure_reason = Some(reason.into());
    }

    pub fn mark_staged(&mut self) {
        self.status = RangeStatus::Staged;
        self.failure_reason = None;
    }
}
