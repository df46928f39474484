//! Domain model for the Harbor execution engine

pub mod execution_plan;
pub mod flow;
pub mod interpolation;
pub mod job_definition;
pub mod repository;
pub mod results;
