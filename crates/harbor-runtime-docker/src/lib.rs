//! Docker adapter of the Harbor container runtime contract
//!
//! Drives the local Docker daemon through the `docker` CLI. Containers are
//! launched detached, followed with `docker logs --follow` and awaited with
//! `docker wait`.

mod args;
mod inspect;
mod runtime;

pub use args::run_args;
pub use runtime::DockerCliRuntime;
