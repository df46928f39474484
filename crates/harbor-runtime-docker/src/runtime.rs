use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use harbor_core::{
    ContainerHandle, ContainerInfo, ContainerRuntime, LogEntry, LogType, RunContainerOptions,
    RuntimeError, RuntimeResult, VolumeRef,
};

use crate::args::run_args;
use crate::inspect::parse_inspect;

/// Container runtime driving the `docker` CLI
#[derive(Debug, Clone)]
pub struct DockerCliRuntime {
    docker_bin: String,
}

impl Default for DockerCliRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// Failed CLI invocation
#[derive(Debug)]
struct CliFailure {
    stderr: String,
}

impl CliFailure {
    fn is_not_found(&self) -> bool {
        let stderr = self.stderr.to_lowercase();
        stderr.contains("no such") || stderr.contains("not found")
    }

    fn is_already_exists(&self) -> bool {
        self.stderr.to_lowercase().contains("already exists")
    }
}

impl DockerCliRuntime {
    /// Create a runtime invoking the given docker binary
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(&self.docker_bin);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    // Outer error: the CLI could not be run at all. Inner error: it ran and failed.
    async fn exec<I, S>(&self, args: I) -> RuntimeResult<Result<String, CliFailure>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|err| RuntimeError::Unavailable(format!("{}: {err}", self.docker_bin)))?;

        if output.status.success() {
            Ok(Ok(String::from_utf8_lossy(&output.stdout).trim().to_string()))
        } else {
            Ok(Err(CliFailure {
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }))
        }
    }

    async fn exec_cancellable<I, S>(
        &self,
        args: I,
        signal: &CancellationToken,
    ) -> RuntimeResult<Result<String, CliFailure>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        if signal.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        tokio::select! {
            // Dropping the pending output future kills the child.
            _ = signal.cancelled() => Err(RuntimeError::Cancelled),
            result = self.exec(args) => result,
        }
    }

    async fn exec_ok<I, S>(&self, args: I) -> RuntimeResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.exec(args)
            .await?
            .map_err(|failure| RuntimeError::CommandFailed(failure.stderr))
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<ContainerInfo> {
        match self
            .exec(["inspect", "--type=container", "--format={{json .}}", id])
            .await?
        {
            Ok(json) => parse_inspect(&json)
                .map_err(|err| RuntimeError::CommandFailed(format!("unreadable inspect output: {err}"))),
            Err(failure) if failure.is_not_found() => {
                Err(RuntimeError::ContainerNotFound(id.to_string()))
            }
            Err(failure) => Err(RuntimeError::CommandFailed(failure.stderr)),
        }
    }
}

fn line_stream<R>(reader: R, log_type: LogType) -> BoxStream<'static, LogEntry>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let lines = BufReader::new(reader).lines();
    stream::unfold(lines, move |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((LogEntry::new(log_type, format!("{line}\n")), lines)),
            Ok(None) => None,
            Err(err) => {
                debug!(error = %err, "Log stream closed");
                None
            }
        }
    })
    .boxed()
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn pull_image(&self, image: &str, signal: &CancellationToken) -> RuntimeResult<()> {
        info!(image = %image, "Pulling image");
        match self.exec_cancellable(["pull", "--quiet", image], signal).await? {
            Ok(_) => Ok(()),
            Err(failure) => Err(RuntimeError::ImagePull {
                image: image.to_string(),
                message: failure.stderr,
            }),
        }
    }

    async fn create_network(&self, name: &str) -> RuntimeResult<()> {
        match self.exec(["network", "create", name]).await? {
            Ok(_) => Ok(()),
            Err(failure) if failure.is_already_exists() => Ok(()),
            Err(failure) => Err(RuntimeError::CommandFailed(failure.stderr)),
        }
    }

    async fn delete_network(&self, name: &str) -> RuntimeResult<()> {
        match self.exec(["network", "rm", name]).await? {
            Ok(_) => Ok(()),
            Err(failure) if failure.is_not_found() => Ok(()),
            Err(failure) => Err(RuntimeError::CommandFailed(failure.stderr)),
        }
    }

    async fn create_volume(&self, name: Option<String>) -> RuntimeResult<VolumeRef> {
        let mut args = vec!["volume".to_string(), "create".to_string()];
        args.extend(name);
        let name = self.exec_ok(args).await?;
        Ok(VolumeRef { name })
    }

    async fn delete_volume(&self, name: &str) -> RuntimeResult<()> {
        match self.exec(["volume", "rm", "--force", name]).await? {
            Ok(_) => Ok(()),
            Err(failure) if failure.is_not_found() => Ok(()),
            Err(failure) => Err(RuntimeError::CommandFailed(failure.stderr)),
        }
    }

    async fn run_container(
        &self,
        image: &str,
        options: &RunContainerOptions,
        signal: &CancellationToken,
    ) -> RuntimeResult<ContainerHandle> {
        let id = match self
            .exec_cancellable(run_args(image, options), signal)
            .await?
        {
            Ok(id) => id,
            Err(failure) => return Err(RuntimeError::CommandFailed(failure.stderr)),
        };

        for network in options.networks.iter().skip(1) {
            if let Err(err) = self.exec_ok(["network", "connect", network.as_str(), id.as_str()]).await {
                warn!(container = %id, network = %network, error = %err, "Failed to connect network");
            }
        }

        debug!(container = %id, name = %options.name, "Container launched");
        Ok(ContainerHandle {
            id,
            name: options.name.clone(),
        })
    }

    async fn get_container(&self, id: &str) -> RuntimeResult<ContainerInfo> {
        self.inspect(id).await
    }

    async fn does_container_exist(&self, id: &str) -> RuntimeResult<bool> {
        match self.inspect(id).await {
            Ok(_) => Ok(true),
            Err(RuntimeError::ContainerNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn is_container_exited(&self, id: &str) -> RuntimeResult<bool> {
        Ok(!self.inspect(id).await?.running)
    }

    async fn stop_and_delete_container(&self, id: &str) -> RuntimeResult<()> {
        match self.exec(["rm", "--force", "--volumes", id]).await? {
            Ok(_) => Ok(()),
            Err(failure) if failure.is_not_found() => Ok(()),
            Err(failure) => Err(RuntimeError::CommandFailed(failure.stderr)),
        }
    }

    async fn healthy(&self) -> RuntimeResult<bool> {
        Ok(self
            .exec(["version", "--format={{.Server.Version}}"])
            .await?
            .is_ok())
    }

    async fn container_logs(&self, id: &str) -> RuntimeResult<BoxStream<'static, LogEntry>> {
        let mut child = self
            .command(["logs", "--follow", id])
            .spawn()
            .map_err(|err| RuntimeError::Unavailable(format!("{}: {err}", self.docker_bin)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::CommandFailed("docker logs has no stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RuntimeError::CommandFailed("docker logs has no stderr".to_string()))?;

        // The stream owns the child; dropping it kills `docker logs`.
        let merged = stream::select(
            line_stream(stdout, LogType::Stdout),
            line_stream(stderr, LogType::Stderr),
        )
        .map(move |entry| {
            let _ = &child;
            entry
        });

        Ok(merged.boxed())
    }

    async fn wait_container(&self, id: &str) -> RuntimeResult<i64> {
        match self.exec(["wait", id]).await? {
            Ok(code) => code.parse().map_err(|err| {
                RuntimeError::CommandFailed(format!("unexpected docker wait output {code:?}: {err}"))
            }),
            Err(failure) if failure.is_not_found() => {
                Err(RuntimeError::ContainerNotFound(id.to_string()))
            }
            Err(failure) => Err(RuntimeError::CommandFailed(failure.stderr)),
        }
    }

    async fn list_images(&self) -> RuntimeResult<Vec<String>> {
        let output = self
            .exec_ok(["images", "--format={{.Repository}}:{{.Tag}}"])
            .await?;
        Ok(output
            .lines()
            .filter(|line| !line.is_empty() && !line.contains("<none>"))
            .map(str::to_string)
            .collect())
    }

    async fn list_volumes(&self) -> RuntimeResult<Vec<String>> {
        let output = self.exec_ok(["volume", "ls", "--format={{.Name}}"]).await?;
        Ok(output
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn delete_image(&self, image: &str) -> RuntimeResult<()> {
        match self.exec(["rmi", image]).await? {
            Ok(_) => Ok(()),
            Err(failure) if failure.is_not_found() => Ok(()),
            Err(failure) => Err(RuntimeError::CommandFailed(failure.stderr)),
        }
    }
}
