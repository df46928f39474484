//! Assertion utilities for validating flows.
//!
//! Helpers return a `Result` so tests can either unwrap them or inspect the
//! failure.

mod flow_state;

pub use flow_state::*;
