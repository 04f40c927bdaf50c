//! Credentialed, rate-limited object storage access.

pub mod client;
pub mod pool;
pub mod rate_limit;
pub mod signer;

pub use client::StorageClient;
pub use pool::StorageClientPool;
pub use rate_limit::IngressRateLimiter;
pub use signer::{RequestSigner, SECURITY_TOKEN_HEADER, SessionTokenSigner};
