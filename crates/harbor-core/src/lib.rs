//!
//! Harbor Core - job execution engine of the Harbor compute node
//!
//! This crate turns a declarative job definition into an execution plan and
//! runs it against a container runtime: operations are grouped into tiers,
//! dependents are unlocked as soon as the operations they wait on become
//! ready, cancellation flows from one main signal to every operation, and
//! results are extracted from container output.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - job definitions, flows, plans and repository contracts
pub mod domain;

/// Application services - runtime contract, runners and scheduling
pub mod application;

/// Core types
pub mod types;

/// Error types
pub mod error;

pub use error::CoreError;
pub use types::{EngineConfig, LogEntry, LogType};

pub use application::abort::AbortSignal;
pub use application::container_runtime::{
    ContainerHandle, ContainerInfo, ContainerRuntime, RunContainerOptions, RuntimeError,
    RuntimeResult, VolumeBinding, VolumeRef,
};
pub use application::operation_provider::{OperationEvent, OperationProvider};
pub use application::resource_cache::{ResourceCache, ResourceUsage, ResyncReport};
pub use application::task_manager::TaskManager;

pub use domain::execution_plan::{ExecutionPlan, PlanError, PlanValidationError};
pub use domain::flow::{
    Endpoint, EndpointStatus, Flow, FlowId, FlowMutation, FlowState, FlowStatePatch, FlowStatus,
    OpState, OpStatePatch, OpStatus, StopReason,
};
pub use domain::interpolation::{InterpolationError, InterpolationStore};
pub use domain::job_definition::{JobDefinition, Operation, OperationType};
pub use domain::repository::FlowRepository;
