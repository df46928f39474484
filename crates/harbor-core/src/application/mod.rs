//! Application services of the execution engine

/// Two-level cancellation
pub mod abort;

/// Container runtime contract
pub mod container_runtime;

/// Operation type specific execution
pub mod operation_provider;

/// Single operation lifecycle
pub mod operation_runner;

/// Image and volume usage tracking
pub mod resource_cache;

/// Flow scheduling
pub mod task_manager;
