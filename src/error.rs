use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the MedStore client and its transfer pipelines.
#[derive(Debug, Error)]
pub enum MedStoreError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// 401/403 from the platform. Never retried.
    #[error("authentication rejected (status {0}), check your API key")]
    Auth(u16),

    /// 413 from the platform, usually a too-large GraphQL envelope.
    #[error("request too large (status 413), consider lowering concurrency")]
    PayloadTooLarge,

    /// Unexpected HTTP status outside the fatal set.
    #[error("server returned status {0}")]
    Status(u16),

    /// Application-level error reported in the GraphQL `errors` array.
    #[error("api error: {0}")]
    Api(String),

    /// A single file transfer that exhausted its retry budget.
    #[error("transfer of {path} failed after {attempts} attempts: {reason}")]
    Transfer {
        path: String,
        attempts: u32,
        reason: String,
    },

    #[error("unsupported file type for {0}, only DICOM files can be imported")]
    UnsupportedFile(PathBuf),

    /// A pipeline precondition that aborts the whole run.
    #[error("{0}")]
    Precondition(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// DICOM reconstruction failure for one instance.
    #[error("dicom assembly failed: {0}")]
    Assemble(String),
}

impl MedStoreError {
    /// The closed set of error kinds that must never be retried.
    ///
    /// Everything else (connection errors, 5xx, unexpected statuses) is
    /// considered transient and eligible for backoff-and-retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MedStoreError::Auth(_)
                | MedStoreError::PayloadTooLarge
                | MedStoreError::Api(_)
                | MedStoreError::UnsupportedFile(_)
                | MedStoreError::Precondition(_)
                | MedStoreError::Config(_)
                | MedStoreError::Assemble(_)
        )
    }
}
