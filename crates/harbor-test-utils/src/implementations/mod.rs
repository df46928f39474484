//! Test implementations (fakes) of the Harbor interfaces.
//!
//! Fakes keep real state in memory and are preferred over mocks when a test
//! drives a whole flow through the engine.

pub mod fake_runtime;

pub use fake_runtime::*;
