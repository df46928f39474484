//! Testing utilities for the Harbor compute node.
//!
//! This crate provides mocks, test implementations (fakes), builders and
//! assertion utilities shared by the unit and integration tests of the
//! workspace.

pub mod assertions;
pub mod builders;
pub mod implementations;
pub mod mocks;
pub mod util;

/// Re-export commonly used types for convenience
pub use mockall;

pub use builders::{JobDefinitionBuilder, OperationBuilder};
pub use implementations::{ContainerScript, FakeContainerRuntime, RuntimeCall};
pub use mocks::container_runtime::MockContainerRuntime;
pub use util::{fast_engine_config, init_test_tracing, wait_for_op_status, TestEngine};
