//! Scheduler error types.

use buildit_core::BuildId;
use thiserror::Error;

/// Why a build request was not admitted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    /// The queue is at its configured depth; the caller should retry later.
    #[error("queue full ({depth}/{max_depth}), retry later")]
    Backpressure { depth: usize, max_depth: usize },

    #[error("build {0} is already admitted")]
    Duplicate(BuildId),
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("webhook rejected: {0}")]
    Webhook(#[from] buildit_core::Error),

    #[error("coordinator has stopped")]
    Stopped,
}
