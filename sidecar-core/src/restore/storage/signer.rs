use std::fmt;

use reqwest::header::HeaderValue;
use sidecar_model::StorageCredentials;

use crate::error::{Result, SidecarError};

/// Header carrying the session token of temporary credentials.
pub const SECURITY_TOKEN_HEADER: &str = "x-amz-security-token";

/// Applies a job's credentials to an outgoing storage request.
pub trait RequestSigner: Send + Sync + fmt::Debug {
    fn sign(&self, request: &mut reqwest::Request, credentials: &StorageCredentials) -> Result<()>;
}

/// Attaches the session token only. Suitable for endpoints that
/// authorise on the token, e.g. behind a signing gateway.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionTokenSigner;

impl RequestSigner for SessionTokenSigner {
    fn sign(&self, request: &mut reqwest::Request, credentials: &StorageCredentials) -> Result<()> {
        if credentials.session_token.is_empty() {
            return Ok(());
        }
        let mut token = HeaderValue::from_str(&credentials.session_token)
            .map_err(|err| SidecarError::Storage(format!("unusable session token: {err}")))?;
        token.set_sensitive(true);
        request.headers_mut().insert(SECURITY_TOKEN_HEADER, token);
        Ok(())
    }
}
