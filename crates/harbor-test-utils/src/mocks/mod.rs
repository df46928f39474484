//! Mock implementations of the Harbor interfaces.
//!
//! Mocks are generated with `mockall` and come with a `create_mock_*`
//! constructor preloaded with permissive default expectations.

pub mod container_runtime;

pub use container_runtime::*;
