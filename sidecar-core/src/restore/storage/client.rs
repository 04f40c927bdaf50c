use std::{
    fmt,
    ops::RangeInclusive,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::DashMap;
use reqwest::{
    Method, StatusCode,
    header::{CONTENT_LENGTH, HeaderValue, RANGE},
};
use sidecar_model::{JobId, RestoreJob, StorageCredentials};
use tokio::sync::Semaphore;
use tracing::{debug, trace};
use url::Url;

use super::{rate_limit::IngressRateLimiter, signer::RequestSigner};
use crate::{
    error::{Result, SidecarError},
    restore::config::StorageClientConfig,
};

#[derive(Clone, Debug)]
enum Endpoint {
    /// `https://<bucket>.s3.<region>.amazonaws.com/<key>`
    VirtualHosted,
    /// `<base>/<bucket>/<key>`
    PathStyle(Url),
}

/// Object storage client bound to one region and shared by every job
/// reading from it.
///
/// Each job binds its own credentials; requests always carry the
/// credentials of the job they are made for.
pub struct StorageClient {
    region: String,
    http: reqwest::Client,
    endpoint: Endpoint,
    credentials: DashMap<JobId, StorageCredentials>,
    permits: Arc<Semaphore>,
    limiter: Arc<IngressRateLimiter>,
    signer: Arc<dyn RequestSigner>,
    closed: AtomicBool,
}

impl fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageClient")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("bound_jobs", &self.credentials.len())
            .field("available_permits", &self.permits.available_permits())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl StorageClient {
    pub(super) fn build(
        region: &str,
        config: &StorageClientConfig,
        permits: Arc<Semaphore>,
        limiter: Arc<IngressRateLimiter>,
        signer: Arc<dyn RequestSigner>,
    ) -> Result<Self> {
        let timeout = config.api_call_timeout();
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_idle_timeout(config.keep_alive())
            .pool_max_idle_per_host(config.concurrency.max(1))
            .user_agent(format!(
                "{}/{}",
                config.thread_name_prefix,
                env!("CARGO_PKG_VERSION")
            ));

        if let Some(proxy) = config.proxy.as_ref().filter(|proxy| proxy.is_configured())
            && let Some(url) = proxy.url.as_deref()
        {
            let mut forward = reqwest::Proxy::all(url)?;
            if let (Some(username), Some(password)) =
                (proxy.username.as_deref(), proxy.password.as_deref())
            {
                forward = forward.basic_auth(username, password);
            }
            builder = builder.proxy(forward);
        }

        let endpoint = match config.endpoint_override.as_deref() {
            Some(raw) => Endpoint::PathStyle(Url::parse(raw).map_err(|err| {
                SidecarError::InvalidArgument(format!("invalid endpoint override {raw}: {err}"))
            })?),
            None => Endpoint::VirtualHosted,
        };

        debug!(region, "Built storage client");

        Ok(Self {
            region: region.to_owned(),
            http: builder.build()?,
            endpoint,
            credentials: DashMap::new(),
            permits,
            limiter,
            signer,
            closed: AtomicBool::new(false),
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Bind the job's current read credentials, replacing older ones.
    pub fn authenticate(&self, job: &RestoreJob) -> Result<()> {
        let secrets = job.secrets.as_ref().ok_or_else(|| {
            SidecarError::RestoreJobFatal(format!("restore job {} carries no secrets", job.job_id))
        })?;
        self.credentials
            .insert(job.job_id, secrets.read_credentials.clone());
        Ok(())
    }

    pub fn revoke(&self, job_id: JobId) {
        if self.credentials.remove(&job_id).is_some() {
            trace!(%job_id, region = %self.region, "Revoked storage credentials");
        }
    }

    pub fn is_authenticated(&self, job_id: JobId) -> bool {
        self.credentials.contains_key(&job_id)
    }

    #[cfg(test)]
    pub(crate) fn bound_session_token(&self, job_id: JobId) -> Option<String> {
        self.credentials
            .get(&job_id)
            .map(|entry| entry.value().session_token.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release every credential binding and refuse further requests.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.credentials.clear();
    }

    /// Read `bytes` (inclusive) of an object. One attempt, bounded by the
    /// configured api-call timeout.
    pub async fn download_range(
        &self,
        job_id: JobId,
        bucket: &str,
        key: &str,
        bytes: RangeInclusive<u64>,
    ) -> Result<Vec<u8>> {
        let (start, end) = bytes.into_inner();
        if end < start {
            return Err(SidecarError::InvalidArgument(format!(
                "empty byte range {start}..={end}"
            )));
        }

        let _permit = self.acquire_permit().await?;
        self.limiter.acquire(end - start + 1).await;

        let mut request = self.http.request(Method::GET, self.object_url(bucket, key)?).build()?;
        let range = HeaderValue::from_str(&format!("bytes={start}-{end}"))
            .map_err(|err| SidecarError::Storage(err.to_string()))?;
        request.headers_mut().insert(RANGE, range);

        let response = self.send(job_id, request).await?;
        let status = response.status();
        if !matches!(status, StatusCode::OK | StatusCode::PARTIAL_CONTENT) {
            return Err(SidecarError::Storage(format!(
                "GET {bucket}/{key} bytes={start}-{end} returned {status}"
            )));
        }

        let body = response.bytes().await?;
        let expected = end - start + 1;
        // A 200 carries the whole object; it only answers the request when
        // the requested range is that whole object.
        let ranged = status == StatusCode::PARTIAL_CONTENT || start == 0;
        if !ranged || body.len() as u64 != expected {
            return Err(SidecarError::Storage(format!(
                "GET {bucket}/{key} bytes={start}-{end} returned {status} with {} bytes, expected {expected}",
                body.len()
            )));
        }
        Ok(body.to_vec())
    }

    /// Length of an object in bytes.
    pub async fn object_size(&self, job_id: JobId, bucket: &str, key: &str) -> Result<u64> {
        let _permit = self.acquire_permit().await?;
        let request = self.http.request(Method::HEAD, self.object_url(bucket, key)?).build()?;
        let response = self.send(job_id, request).await?;
        if !response.status().is_success() {
            return Err(SidecarError::Storage(format!(
                "HEAD {bucket}/{key} returned {}",
                response.status()
            )));
        }
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| {
                SidecarError::Storage(format!("HEAD {bucket}/{key} returned no content length"))
            })
    }

    async fn acquire_permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        if self.is_closed() {
            return Err(SidecarError::Storage(format!(
                "storage client for region {} is closed",
                self.region
            )));
        }
        self.permits
            .acquire()
            .await
            .map_err(|_| SidecarError::Cancelled("storage transfer permits closed".into()))
    }

    async fn send(&self, job_id: JobId, mut request: reqwest::Request) -> Result<reqwest::Response> {
        let credentials = self
            .credentials
            .get(&job_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                SidecarError::Storage(format!(
                    "no credentials bound for job {job_id} in region {}",
                    self.region
                ))
            })?;
        self.signer.sign(&mut request, &credentials)?;
        Ok(self.http.execute(request).await?)
    }

    fn object_url(&self, bucket: &str, key: &str) -> Result<Url> {
        let (mut url, with_bucket) = match &self.endpoint {
            Endpoint::PathStyle(base) => (base.clone(), true),
            Endpoint::VirtualHosted => {
                let raw = format!("https://{bucket}.s3.{}.amazonaws.com/", self.region);
                let url = Url::parse(&raw).map_err(|err| {
                    SidecarError::InvalidArgument(format!("invalid bucket name {bucket}: {err}"))
                })?;
                (url, false)
            }
        };

        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                SidecarError::InvalidArgument(format!("endpoint cannot hold a path: {bucket}"))
            })?;
            segments.pop_if_empty();
            if with_bucket {
                segments.push(bucket);
            }
            segments.extend(key.split('/'));
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::storage::signer::SessionTokenSigner;

    fn client(config: &StorageClientConfig) -> StorageClient {
        StorageClient::build(
            "us-west-2",
            config,
            Arc::new(Semaphore::new(1)),
            Arc::new(IngressRateLimiter::unlimited()),
            Arc::new(SessionTokenSigner),
        )
        .unwrap()
    }

    #[test]
    fn virtual_hosted_urls_keep_key_separators() {
        let client = client(&StorageClientConfig::default());
        let url = client.object_url("backups", "ks/tbl/slice 1.zip").unwrap();
        assert_eq!(
            url.as_str(),
            "https://backups.s3.us-west-2.amazonaws.com/ks/tbl/slice%201.zip"
        );
    }

    #[test]
    fn endpoint_override_switches_to_path_style() {
        let config = StorageClientConfig {
            endpoint_override: Some("http://127.0.0.1:9000".into()),
            ..StorageClientConfig::default()
        };
        let client = client(&config);
        let url = client.object_url("backups", "ks/slice.zip").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/backups/ks/slice.zip");
    }

    #[test]
    fn rejects_malformed_endpoint_override() {
        let config = StorageClientConfig {
            endpoint_override: Some("not a url".into()),
            ..StorageClientConfig::default()
        };
        let err = StorageClient::build(
            "us-west-2",
            &config,
            Arc::new(Semaphore::new(1)),
            Arc::new(IngressRateLimiter::unlimited()),
            Arc::new(SessionTokenSigner),
        )
        .unwrap_err();
        assert!(matches!(err, SidecarError::InvalidArgument(_)));
    }
}
