use thiserror::Error;

use crate::application::container_runtime::RuntimeError;
use crate::domain::execution_plan::PlanError;
use crate::domain::interpolation::InterpolationError;

/// Core error type for the Harbor execution engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Flow not found in the repository
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// Operation state index out of range for a flow
    #[error("Operation state not found: flow {flow_id}, index {index}")]
    OpStateNotFound {
        /// Flow the lookup was made against
        flow_id: String,
        /// Position of the operation in the job definition
        index: usize,
    },

    /// Operation not present in the execution plan
    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    /// The job definition was rejected by the plan builder
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// An argument referenced data that is not available
    #[error("Interpolation error: {0}")]
    Interpolation(#[from] InterpolationError),

    /// Container runtime failure
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Operation arguments do not match the operation type
    #[error("Invalid arguments for operation {op_id}: {message}")]
    InvalidArguments {
        /// Offending operation
        op_id: String,
        /// What is wrong with the arguments
        message: String,
    },

    /// Startup health checks did not pass
    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Input/output error
    #[error("Input/output error: {0}")]
    IOError(String),

    /// Flow execution error
    #[error("Flow execution error: {0}")]
    FlowExecutionError(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::IOError(err.to_string())
    }
}
