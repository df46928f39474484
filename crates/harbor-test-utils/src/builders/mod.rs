//! Builders for test fixtures.

mod job_definition;

pub use job_definition::*;
