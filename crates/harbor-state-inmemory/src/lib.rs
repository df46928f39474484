//! In-memory flow repository for the Harbor compute node
//!
//! This crate provides an in-memory implementation of the
//! [`FlowRepository`](harbor_core::FlowRepository) trait defined in
//! harbor-core. It is primarily useful for development, testing, and
//! single-shot runs where persistence across restarts is not required.

pub mod repository;
pub use repository::InMemoryFlowRepository;
