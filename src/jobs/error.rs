use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Sync already running")]
    AlreadyRunning,

    #[error("Tesla not connected - no point syncing")]
    TargetNotConnected,

    #[error("External operation failed: {0}")]
    ExternalOperationFailed(String),

    #[error("External operation timed out after {}s", .0.as_secs())]
    ExternalOperationTimedOut(Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Pre-start rejections are the caller's problem; everything else is ours.
    pub fn is_rejection(&self) -> bool {
        matches!(self, JobError::AlreadyRunning | JobError::TargetNotConnected)
    }
}
