use std::io;
use std::time::Duration;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Cli(String),

    #[error("no build pod found for {build} within {timeout:?}")]
    NotFound { build: String, timeout: Duration },

    #[error("{build} matches {} pods ({}); narrow it with --selector", .pods.len(), .pods.join(", "))]
    Ambiguous { build: String, pods: Vec<String> },

    #[error("pod watch connection lost: {0}")]
    WatchConnection(String),

    #[error("pod watch resume position expired")]
    WatchExpired,

    #[error("log stream for step {step} failed: {reason}")]
    StreamConnection { step: String, reason: String },

    #[error("cancelled")]
    Cancelled,

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

