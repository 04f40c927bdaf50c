use serde::{Deserialize, Serialize};
use sidecar_core::restore::{RestoreJobConfig, StorageClientConfig};

/// Root configuration document.
///
/// Sections mirror the file layout:
///
/// ```toml
/// [restore_job]
/// job_discovery_minimum_recency_days = 7
///
/// [storage_client]
/// concurrency = 8
///
/// [logging]
/// default_directive = "info,sidecar_core=debug"
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SidecarConfig {
    pub restore_job: RestoreJobConfig,
    pub storage_client: StorageClientConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset or unparsable.
    pub default_directive: String,
    /// Colorize output. Turn off when logs are shipped to a collector.
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_directive: "info,sidecar_core::tasks=warn".to_string(),
            ansi: true,
        }
    }
}
