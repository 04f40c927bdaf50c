use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use uuid::{NoContext, Timestamp, Uuid, Version};

use crate::error::ModelError;

/// Time-ordered job identifier. Only UUIDv7 values are accepted so the
/// creation instant can always be recovered from the id itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "Uuid", into = "Uuid"))]
pub struct JobId(Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::now_v7())
    }

    /// Build an id whose embedded timestamp is `created_at`.
    pub fn from_datetime(created_at: DateTime<Utc>) -> Self {
        let millis = created_at.timestamp_millis().max(0) as u64;
        let ts = Timestamp::from_unix(
            NoContext,
            millis / 1_000,
            ((millis % 1_000) * 1_000_000) as u32,
        );
        JobId(Uuid::new_v7(ts))
    }

    /// Wrap an existing UUID, rejecting anything that is not time-ordered.
    pub fn from_uuid(id: Uuid) -> Result<Self, ModelError> {
        match id.get_version() {
            Some(Version::SortRand) => Ok(JobId(id)),
            other => Err(ModelError::InvalidId(format!(
                "job ids must be time-ordered (v7) uuids, got {other:?} for {id}"
            ))),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        let id = Uuid::parse_str(raw.trim())
            .map_err(|err| ModelError::InvalidId(format!("{raw}: {err}")))?;
        Self::from_uuid(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn to_uuid(&self) -> Uuid {
        self.0
    }

    /// Unix timestamp of the job creation in milliseconds.
    pub fn creation_millis(&self) -> i64 {
        // v7 ids always carry a timestamp; the constructor enforces the version
        self.0
            .get_timestamp()
            .map(|ts| {
                let (secs, nanos) = ts.to_unix();
                (secs as i64) * 1_000 + (nanos / 1_000_000) as i64
            })
            .unwrap_or_default()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.creation_millis())
            .single()
            .unwrap_or_default()
    }

    /// Calendar day (UTC) the job was created on.
    pub fn created_day(&self) -> NaiveDate {
        self.created_at().date_naive()
    }
}

impl AsRef<Uuid> for JobId {
    fn as_ref(&self) -> &Uuid {
        &self.0
    }
}

impl TryFrom<Uuid> for JobId {
    type Error = ModelError;

    fn try_from(value: Uuid) -> Result<Self, Self::Error> {
        JobId::from_uuid(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a Cassandra instance managed by this sidecar.
pub type InstanceId = u32;
