use std::{error::Error as StdError, sync::Arc};

use thiserror::Error;

/// The single failure kind reported by operational jobs.
///
/// Failures raised anywhere inside a job body are normalised into this type.
/// When the cause chain already carries an `OperationalJobError` it is
/// reused as-is, so layers never stack one wrapper on top of another.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct OperationalJobError {
    message: String,
    #[source]
    cause: Option<Arc<dyn StdError + Send + Sync + 'static>>,
}

impl OperationalJobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        message: impl Into<String>,
        cause: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    /// Normalise any job failure. An existing `OperationalJobError` found
    /// anywhere in the chain is returned instead of a new wrapper.
    pub fn wraps(err: anyhow::Error) -> Self {
        if let Some(existing) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<OperationalJobError>())
        {
            return existing.clone();
        }

        let message = err.to_string();
        let boxed: Box<dyn StdError + Send + Sync + 'static> = err.into();
        Self {
            message,
            cause: Some(Arc::from(boxed)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn wraps_plain_errors_once() {
        let err = anyhow::anyhow!("disk full");
        let wrapped = OperationalJobError::wraps(err);
        assert_eq!(wrapped.message(), "disk full");
        assert!(wrapped.source().is_some());
    }

    #[test]
    fn reuses_job_error_found_in_the_chain() {
        let inner = OperationalJobError::new("decommission rejected");
        let err = anyhow::Error::new(inner)
            .context("while running body")
            .context("outer layer");
        let wrapped = OperationalJobError::wraps(err);
        assert_eq!(wrapped.message(), "decommission rejected");
        assert!(wrapped.source().is_none());
    }

    #[test]
    fn reuses_job_error_behind_a_foreign_error() {
        let result: Result<(), OperationalJobError> =
            Err(OperationalJobError::new("node is leaving"));
        let err = result.context("probe failed").unwrap_err();
        assert_eq!(
            OperationalJobError::wraps(err).message(),
            "node is leaving"
        );
    }
}
