use sidecar_core::restore::{ProxyConfig, RestoreJobConfig, StorageClientConfig};
use thiserror::Error;

use crate::models::SidecarConfig;

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("restore_job.{field} {reason}")]
    InvalidRestoreJob { field: &'static str, reason: String },
    #[error("storage_client.{field} {reason}")]
    InvalidStorageClient { field: &'static str, reason: String },
    #[error("invalid storage proxy url `{url}`: {source}")]
    InvalidProxyUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid storage endpoint override `{url}`: {source}")]
    InvalidEndpointOverride {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    /// Emits every warning through `tracing`.
    pub fn log(&self) {
        for warning in &self.items {
            match &warning.hint {
                Some(hint) => tracing::warn!(hint = %hint, "{}", warning.message),
                None => tracing::warn!("{}", warning.message),
            }
        }
    }
}

/// Rejects settings the engine cannot run with and collects the ones that
/// merely look suspicious.
pub fn apply_guard_rails(
    config: &SidecarConfig,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = validate_restore_job(&config.restore_job)?;
    warnings.extend(validate_storage_client(&config.storage_client)?);
    Ok(warnings)
}

fn validate_restore_job(
    config: &RestoreJobConfig,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    if config.job_discovery_minimum_recency_days == 0 {
        return Err(ConfigGuardRailError::InvalidRestoreJob {
            field: "job_discovery_minimum_recency_days",
            reason: "must be at least 1".into(),
        });
    }

    if config.job_discovery_active_loop_delay_ms == 0 {
        return Err(ConfigGuardRailError::InvalidRestoreJob {
            field: "job_discovery_active_loop_delay_ms",
            reason: "must be greater than zero".into(),
        });
    }

    if config.job_discovery_active_loop_delay_ms
        > config.job_discovery_idle_loop_delay_ms
    {
        return Err(ConfigGuardRailError::InvalidRestoreJob {
            field: "job_discovery_active_loop_delay_ms",
            reason: format!(
                "({}) must not exceed job_discovery_idle_loop_delay_ms ({})",
                humantime::format_duration(config.active_loop_delay()),
                humantime::format_duration(config.idle_loop_delay()),
            ),
        });
    }

    if config.restore_max_concurrency == 0 {
        return Err(ConfigGuardRailError::InvalidRestoreJob {
            field: "restore_max_concurrency",
            reason: "must be greater than zero".into(),
        });
    }

    if config.job_ttl_secs == 0 {
        return Err(ConfigGuardRailError::InvalidRestoreJob {
            field: "job_ttl_secs",
            reason: "must be greater than zero".into(),
        });
    }

    let recency_secs =
        u64::from(config.job_discovery_minimum_recency_days) * 24 * 60 * 60;
    if config.job_ttl_secs <= recency_secs {
        warnings.push_with_hint(
            "job_ttl_secs is shorter than the minimum discovery window",
            "Expired jobs are still scanned until they age out of the window",
        );
    }

    Ok(warnings)
}

fn validate_storage_client(
    config: &StorageClientConfig,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    if config.concurrency == 0 {
        return Err(ConfigGuardRailError::InvalidStorageClient {
            field: "concurrency",
            reason: "must be greater than zero".into(),
        });
    }

    if config.api_call_timeout_ms == 0 {
        return Err(ConfigGuardRailError::InvalidStorageClient {
            field: "api_call_timeout_ms",
            reason: "must be greater than zero".into(),
        });
    }

    if config.range_get_object_bytes_size == 0 {
        return Err(ConfigGuardRailError::InvalidStorageClient {
            field: "range_get_object_bytes_size",
            reason: "must be greater than zero".into(),
        });
    }

    if let Some(endpoint) = config.endpoint_override.as_deref() {
        url::Url::parse(endpoint).map_err(|source| {
            ConfigGuardRailError::InvalidEndpointOverride {
                url: endpoint.to_string(),
                source,
            }
        })?;
    }

    if let Some(proxy) = config.proxy.as_ref() {
        validate_proxy(proxy, &mut warnings)?;
    }

    let limit = config.ingress_rate_limit_bytes_per_sec;
    if limit > 0 && limit < config.range_get_object_bytes_size {
        warnings.push_with_hint(
            format!(
                "ingress rate limit ({limit} B/s) is below one range chunk ({} B)",
                config.range_get_object_bytes_size
            ),
            "Every chunk will take longer than a second; raise the limit or shrink range_get_object_bytes_size",
        );
    }

    if config.thread_name_prefix.trim().is_empty() {
        warnings.push("storage_client.thread_name_prefix is empty");
    }

    Ok(warnings)
}

fn validate_proxy(
    proxy: &ProxyConfig,
    warnings: &mut ConfigWarnings,
) -> Result<(), ConfigGuardRailError> {
    if !proxy.is_configured() {
        if proxy.has_credentials() {
            warnings.push_with_hint(
                "proxy credentials are set without a proxy url; they are ignored",
                "Set storage_client.proxy.url or drop the credentials",
            );
        }
        return Ok(());
    }

    if let Some(raw) = proxy.url.as_deref() {
        url::Url::parse(raw.trim()).map_err(|source| {
            ConfigGuardRailError::InvalidProxyUrl {
                url: raw.to_string(),
                source,
            }
        })?;
    }

    if proxy.username.is_some() != proxy.password.is_some() {
        warnings.push(
            "proxy username and password should be set together; basic auth is sent with an empty counterpart",
        );
    }

    Ok(())
}
