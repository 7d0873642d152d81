use thiserror::Error;

/// Why a message did not reach the search engine.
///
/// The variants split into two groups: permanent failures are dropped,
/// transient ones send the raw message to the backlog.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed envelope: no '@' separating api key from log type")]
    MalformedEnvelope,

    #[error("user not found for api key {0}")]
    UserNotFound(String),

    #[error("user directory unavailable: {0}")]
    DirectoryUnavailable(#[source] anyhow::Error),

    #[error("dispatch to {target} failed: {source}")]
    DispatchFailure {
        target: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// Transient failures are retried from the backlog
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::DirectoryUnavailable(_) | PipelineError::DispatchFailure { .. }
        )
    }
}
