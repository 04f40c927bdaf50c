use std::{fmt, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Knobs for restore job discovery and range processing.
///
/// Every field has a default so a deployment only spells out what it
/// changes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RestoreJobConfig {
    /// Poll cadence while at least one job is in flight.
    pub job_discovery_active_loop_delay_ms: u64,
    /// Poll cadence while nothing is in flight.
    pub job_discovery_idle_loop_delay_ms: u64,
    /// Lower bound of the discovery lookback window, in days.
    pub job_discovery_minimum_recency_days: u32,
    /// Lifetime granted to new jobs.
    pub job_ttl_secs: u64,
    /// Maximum concurrent range downloads on this sidecar.
    pub restore_max_concurrency: usize,
}

impl Default for RestoreJobConfig {
    fn default() -> Self {
        Self {
            job_discovery_active_loop_delay_ms: 5_000,
            job_discovery_idle_loop_delay_ms: 600_000,
            job_discovery_minimum_recency_days: 5,
            job_ttl_secs: 90 * 24 * 60 * 60,
            restore_max_concurrency: 20,
        }
    }
}

impl RestoreJobConfig {
    pub fn active_loop_delay(&self) -> Duration {
        Duration::from_millis(self.job_discovery_active_loop_delay_ms)
    }

    pub fn idle_loop_delay(&self) -> Duration {
        Duration::from_millis(self.job_discovery_idle_loop_delay_ms)
    }

    pub fn job_ttl(&self) -> TimeDelta {
        i64::try_from(self.job_ttl_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }

    /// Expiry stamped on a job created at `created_at`. Saturates instead of
    /// overflowing for absurd TTLs.
    pub fn expire_at(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at
            .checked_add_signed(self.job_ttl())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Forward proxy for all storage traffic.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ProxyConfig {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ProxyConfig {
    pub fn is_configured(&self) -> bool {
        self.url.as_deref().is_some_and(|url| !url.trim().is_empty())
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() || self.password.is_some()
    }
}

/// Settings shared by every regional storage client.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageClientConfig {
    /// Transfers allowed at once across all regional clients.
    pub concurrency: usize,
    /// Idle connections are released after this long.
    pub thread_keep_alive_secs: u64,
    /// Prefix for the user agent and log target of storage clients.
    pub thread_name_prefix: String,
    /// Bounds a single attempt and the whole call alike; retries belong to
    /// the caller.
    pub api_call_timeout_ms: u64,
    /// Chunk size of ranged object reads.
    pub range_get_object_bytes_size: u64,
    /// Aggregate download bandwidth cap. `0` disables the limiter.
    pub ingress_rate_limit_bytes_per_sec: u64,
    pub proxy: Option<ProxyConfig>,
    /// Custom endpoint, e.g. a local object store. Forces path-style
    /// addressing.
    pub endpoint_override: Option<String>,
}

impl Default for StorageClientConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            thread_keep_alive_secs: 60,
            thread_name_prefix: "storage-client".to_string(),
            api_call_timeout_ms: 60_000,
            range_get_object_bytes_size: 5 * 1024 * 1024,
            ingress_rate_limit_bytes_per_sec: 0,
            proxy: None,
            endpoint_override: None,
        }
    }
}

impl StorageClientConfig {
    pub fn api_call_timeout(&self) -> Duration {
        Duration::from_millis(self.api_call_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.thread_keep_alive_secs)
    }
}
