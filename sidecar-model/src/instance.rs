use std::path::PathBuf;

use crate::ids::InstanceId;

/// Connection and filesystem details of one Cassandra instance managed by
/// this sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstanceMetadata {
    pub id: InstanceId,
    pub host: String,
    pub port: u16,
    pub data_dirs: Vec<PathBuf>,
    /// Directory that restore downloads are staged under before import.
    pub staging_dir: PathBuf,
}

impl InstanceMetadata {
    pub fn new(
        id: InstanceId,
        host: impl Into<String>,
        port: u16,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            data_dirs: Vec::new(),
            staging_dir: staging_dir.into(),
        }
    }

    pub fn owner(&self) -> InstanceRef {
        InstanceRef {
            id: self.id,
            host: self.host.clone(),
        }
    }
}

/// Lightweight reference to the instance owning a restore range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstanceRef {
    pub id: InstanceId,
    pub host: String,
}
