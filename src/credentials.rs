use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential refresh failed: {0}")]
    Refresh(String),
}

/// Re-issues the ambient object-store credential.
///
/// Called once when the process starts and again at the top of every
/// invocation. Implementations must be idempotent: a warm process may call
/// `refresh` any number of times.
#[async_trait]
pub trait CredentialProvider: Send + Sync + std::fmt::Debug {
    async fn refresh(&self) -> Result<(), CredentialError>;
}
