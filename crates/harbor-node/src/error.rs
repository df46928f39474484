use thiserror::Error;

use harbor_core::CoreError;

/// Errors of the node process
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read job file {path}: {message}")]
    JobFile { path: String, message: String },

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;
