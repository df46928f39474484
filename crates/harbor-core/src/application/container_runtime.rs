//! Container runtime contract
//!
//! The engine never talks to Docker directly. Everything it needs from a
//! container engine goes through [`ContainerRuntime`], so adapters (the Docker
//! CLI, a test fake) can be swapped freely.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::types::LogEntry;

/// Container runtime error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The image could not be pulled
    #[error("Failed to pull image {image}: {message}")]
    ImagePull {
        /// Image reference
        image: String,
        /// Runtime message
        message: String,
    },

    /// The container does not exist
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// The runtime itself cannot be reached
    #[error("Runtime unavailable: {0}")]
    Unavailable(String),

    /// A runtime command failed
    #[error("Runtime command failed: {0}")]
    CommandFailed(String),

    /// The call was abandoned because its signal was aborted
    #[error("Runtime call cancelled")]
    Cancelled,
}

/// Result type of runtime calls
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Volume mounted into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    /// Volume name on the runtime
    pub name: String,
    /// Mount point inside the container
    pub dest: String,
}

/// Options of a container launch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunContainerOptions {
    /// Container name, also its hostname on the flow network
    pub name: String,
    /// Command
    pub cmd: Vec<String>,
    /// Entrypoint override; empty keeps the image's
    pub entrypoint: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Networks to attach
    pub networks: Vec<String>,
    /// Volumes to mount
    pub volumes: Vec<VolumeBinding>,
    /// Request GPU access
    pub gpu: bool,
    /// Working directory
    pub work_dir: Option<String>,
}

/// Handle of a launched container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Runtime id
    pub id: String,
    /// Container name
    pub name: String,
}

/// Snapshot of a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Runtime id
    pub id: String,
    /// Container name
    pub name: String,
    /// Image the container runs
    pub image: String,
    /// Whether the container is still running
    pub running: bool,
    /// Exit code, once exited
    pub exit_code: Option<i64>,
    /// Address on the first attached network
    pub ip_address: Option<String>,
}

/// Created volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRef {
    /// Volume name on the runtime
    pub name: String,
}

/// Primitives a container engine provides to the execution engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull an image, abandoning the pull when the signal is cancelled
    async fn pull_image(&self, image: &str, signal: &CancellationToken) -> RuntimeResult<()>;

    /// Create a network; succeeds if it already exists
    async fn create_network(&self, name: &str) -> RuntimeResult<()>;

    /// Delete a network; succeeds if it does not exist
    async fn delete_network(&self, name: &str) -> RuntimeResult<()>;

    /// Create a volume, named by the runtime when no name is given
    async fn create_volume(&self, name: Option<String>) -> RuntimeResult<VolumeRef>;

    /// Delete a volume
    async fn delete_volume(&self, name: &str) -> RuntimeResult<()>;

    /// Launch a detached container
    async fn run_container(
        &self,
        image: &str,
        options: &RunContainerOptions,
        signal: &CancellationToken,
    ) -> RuntimeResult<ContainerHandle>;

    /// Inspect a container
    async fn get_container(&self, id: &str) -> RuntimeResult<ContainerInfo>;

    /// Whether the container exists
    async fn does_container_exist(&self, id: &str) -> RuntimeResult<bool>;

    /// Whether the container has exited
    async fn is_container_exited(&self, id: &str) -> RuntimeResult<bool>;

    /// Stop and remove a container
    async fn stop_and_delete_container(&self, id: &str) -> RuntimeResult<()>;

    /// Whether the runtime is reachable
    async fn healthy(&self) -> RuntimeResult<bool>;

    /// Follow the output of a container until it exits
    async fn container_logs(&self, id: &str) -> RuntimeResult<BoxStream<'static, LogEntry>>;

    /// Wait for a container to exit and return its exit code
    async fn wait_container(&self, id: &str) -> RuntimeResult<i64>;

    /// List local image references
    async fn list_images(&self) -> RuntimeResult<Vec<String>>;

    /// List volume names
    async fn list_volumes(&self) -> RuntimeResult<Vec<String>>;

    /// Delete a local image
    async fn delete_image(&self, image: &str) -> RuntimeResult<()>;
}
