use std::{fmt, sync::Arc};

use dashmap::DashMap;
use sidecar_model::{JobId, RestoreJob};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::{
    client::StorageClient,
    rate_limit::IngressRateLimiter,
    signer::{RequestSigner, SessionTokenSigner},
};
use crate::{
    error::{Result, SidecarError},
    restore::config::StorageClientConfig,
};

/// Hands out storage clients, one per region, each re-authenticated with
/// the requesting job's current credentials.
///
/// Regional clients are shared and live until [`close`](Self::close); a
/// job's binding to its client is removed only by
/// [`revoke_credentials`](Self::revoke_credentials) once the job is done.
pub struct StorageClientPool {
    config: StorageClientConfig,
    clients_by_region: DashMap<String, Arc<StorageClient>>,
    client_by_job: DashMap<JobId, Arc<StorageClient>>,
    permits: Arc<Semaphore>,
    limiter: Arc<IngressRateLimiter>,
    signer: Arc<dyn RequestSigner>,
}

impl fmt::Debug for StorageClientPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageClientPool")
            .field("regions", &self.clients_by_region.len())
            .field("bound_jobs", &self.client_by_job.len())
            .field("available_permits", &self.permits.available_permits())
            .field("limiter", &self.limiter)
            .finish()
    }
}

impl StorageClientPool {
    pub fn new(config: StorageClientConfig) -> Self {
        Self::with_signer(config, Arc::new(SessionTokenSigner))
    }

    pub fn with_signer(config: StorageClientConfig, signer: Arc<dyn RequestSigner>) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let limiter = Arc::new(IngressRateLimiter::new(
            config.ingress_rate_limit_bytes_per_sec,
        ));
        Self {
            config,
            clients_by_region: DashMap::new(),
            client_by_job: DashMap::new(),
            permits,
            limiter,
            signer,
        }
    }

    pub fn config(&self) -> &StorageClientConfig {
        &self.config
    }

    /// Client for the job's region, authenticated with the job's current
    /// credentials.
    pub fn storage_client(&self, job: &RestoreJob) -> Result<Arc<StorageClient>> {
        let region = job.storage_region().ok_or_else(|| {
            SidecarError::RestoreJobFatal(format!("restore job {} carries no secrets", job.job_id))
        })?;

        let bound = self
            .client_by_job
            .get(&job.job_id)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|client| client.region() == region && !client.is_closed());

        let client = match bound {
            Some(client) => client,
            None => {
                let client = self.regional_client(region)?;
                if let Some(previous) = self.client_by_job.insert(job.job_id, Arc::clone(&client))
                    && !Arc::ptr_eq(&previous, &client)
                {
                    previous.revoke(job.job_id);
                }
                client
            }
        };

        client.authenticate(job)?;
        Ok(client)
    }

    /// Drop the job's credential binding. The regional client stays open
    /// for other jobs.
    pub fn revoke_credentials(&self, job_id: JobId) {
        if let Some((_, client)) = self.client_by_job.remove(&job_id) {
            client.revoke(job_id);
            debug!(%job_id, region = client.region(), "Released storage client binding");
        }
    }

    pub fn is_bound(&self, job_id: JobId) -> bool {
        self.client_by_job.contains_key(&job_id)
    }

    pub fn region_count(&self) -> usize {
        self.clients_by_region.len()
    }

    /// Close every regional client and forget all bindings.
    pub fn close(&self) {
        for entry in self.clients_by_region.iter() {
            entry.value().close();
        }
        info!(
            regions = self.clients_by_region.len(),
            jobs = self.client_by_job.len(),
            "Closing storage client pool"
        );
        self.clients_by_region.clear();
        self.client_by_job.clear();
    }

    fn regional_client(&self, region: &str) -> Result<Arc<StorageClient>> {
        let entry = self
            .clients_by_region
            .entry(region.to_owned())
            .or_try_insert_with(|| {
                StorageClient::build(
                    region,
                    &self.config,
                    Arc::clone(&self.permits),
                    Arc::clone(&self.limiter),
                    Arc::clone(&self.signer),
                )
                .map(Arc::new)
            })?;
        Ok(Arc::clone(entry.value()))
    }
}
