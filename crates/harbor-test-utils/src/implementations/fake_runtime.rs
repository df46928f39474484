//! Scripted in-memory container runtime.
//!
//! Containers are not executed; each one follows a [`ContainerScript`] that
//! decides which log lines it prints, how long it lives and how it exits.
//! Scripts are looked up by container name, then by image; containers
//! without a script interpret `sh -c "echo ..."` commands and exit with 0.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use harbor_core::{
    ContainerHandle, ContainerInfo, ContainerRuntime, LogEntry, RunContainerOptions, RuntimeError,
    RuntimeResult, VolumeRef,
};

/// Exit code reported for containers removed while running
pub const KILLED_EXIT_CODE: i64 = 137;

const LATE_LOG_DELAY: Duration = Duration::from_millis(20);

/// A call received by the fake runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    PullImage(String),
    CreateNetwork(String),
    DeleteNetwork(String),
    CreateVolume(Option<String>),
    DeleteVolume(String),
    RunContainer { image: String, name: String },
    GetContainer(String),
    DoesContainerExist(String),
    IsContainerExited(String),
    StopAndDeleteContainer(String),
    Healthy,
    ContainerLogs(String),
    WaitContainer(String),
    ListImages,
    ListVolumes,
    DeleteImage(String),
}

/// Behavior of one fake container
#[derive(Debug, Clone, Default)]
pub struct ContainerScript {
    logs: Vec<LogEntry>,
    exit_code: i64,
    run_for: Duration,
    until_stopped: bool,
    until_started: Option<String>,
    fail_run: Option<String>,
    logs_after_exit: bool,
}

impl ContainerScript {
    /// A container that prints nothing and exits with 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Print a line on stdout
    pub fn stdout(mut self, line: &str) -> Self {
        self.logs.push(LogEntry::stdout(format!("{line}\n")));
        self
    }

    /// Print a line on stderr
    pub fn stderr(mut self, line: &str) -> Self {
        self.logs.push(LogEntry::stderr(format!("{line}\n")));
        self
    }

    /// Exit with the given code
    pub fn exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    /// Stay alive for a while before exiting
    pub fn run_for(mut self, duration: Duration) -> Self {
        self.run_for = duration;
        self
    }

    /// Never exit on its own
    pub fn until_stopped(mut self) -> Self {
        self.until_stopped = true;
        self
    }

    /// Exit once a container running `image` has been started
    pub fn until_started(mut self, image: &str) -> Self {
        self.until_started = Some(image.to_string());
        self
    }

    /// Hand out the log lines only once the container has exited
    pub fn logs_after_exit(mut self) -> Self {
        self.logs_after_exit = true;
        self
    }

    /// Fail the launch itself
    pub fn fail_run(mut self, message: &str) -> Self {
        self.fail_run = Some(message.to_string());
        self
    }

    fn from_command(cmd: &[String]) -> Self {
        let script = Self::new();
        match cmd {
            [shell, flag, command] if shell.ends_with("sh") && flag == "-c" => {
                match command.strip_prefix("echo ") {
                    Some(text) => script.stdout(text.trim_matches(|c| c == '"' || c == '\'')),
                    None => script,
                }
            }
            _ => script,
        }
    }
}

struct FakeContainer {
    name: String,
    image: String,
    logs: Vec<LogEntry>,
    logs_after_exit: bool,
    exit: Arc<watch::Sender<Option<i64>>>,
    removed: bool,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<RuntimeCall>,
    scripts_by_name: HashMap<String, ContainerScript>,
    scripts_by_image: HashMap<String, ContainerScript>,
    pull_failures: HashMap<String, String>,
    containers: HashMap<String, FakeContainer>,
    started_images: HashSet<String>,
    images: BTreeSet<String>,
    volumes: BTreeSet<String>,
    networks: BTreeSet<String>,
    next_id: u64,
    unhealthy: bool,
    ip_address: Option<String>,
}

/// In-memory [`ContainerRuntime`] driven by scripts
#[derive(Clone, Default)]
pub struct FakeContainerRuntime {
    state: Arc<Mutex<FakeState>>,
}

impl std::fmt::Debug for FakeContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FakeContainerRuntime")
            .field("calls", &state.calls.len())
            .field("containers", &state.containers.len())
            .finish()
    }
}

fn finish(exit: &watch::Sender<Option<i64>>, code: i64) {
    exit.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(code);
            true
        } else {
            false
        }
    });
}

impl FakeContainerRuntime {
    /// Create an empty fake runtime
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the container with the given name
    pub fn script_container(&self, name: &str, script: ContainerScript) -> &Self {
        self.state
            .lock()
            .scripts_by_name
            .insert(name.to_string(), script);
        self
    }

    /// Script every container running the given image
    pub fn script_image(&self, image: &str, script: ContainerScript) -> &Self {
        self.state
            .lock()
            .scripts_by_image
            .insert(image.to_string(), script);
        self
    }

    /// Make pulls of an image fail
    pub fn fail_pull(&self, image: &str, message: &str) -> &Self {
        self.state
            .lock()
            .pull_failures
            .insert(image.to_string(), message.to_string());
        self
    }

    /// Pretend an image is present locally
    pub fn with_image(&self, image: &str) -> &Self {
        self.state.lock().images.insert(image.to_string());
        self
    }

    /// Pretend a volume exists
    pub fn with_volume(&self, volume: &str) -> &Self {
        self.state.lock().volumes.insert(volume.to_string());
        self
    }

    /// Address reported by `get_container` for every container
    pub fn with_ip_address(&self, address: &str) -> &Self {
        self.state.lock().ip_address = Some(address.to_string());
        self
    }

    /// Report the runtime as unreachable from `healthy()`
    pub fn set_unhealthy(&self) {
        self.state.lock().unhealthy = true;
    }

    /// Every call received so far
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state.lock().calls.clone()
    }

    /// Number of calls received so far
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Names of containers that exist and have not exited
    pub fn running_containers(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .containers
            .values()
            .filter(|c| !c.removed && c.exit.borrow().is_none())
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Names of containers that were launched and not removed
    pub fn existing_containers(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .containers
            .values()
            .filter(|c| !c.removed)
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Networks that currently exist
    pub fn networks(&self) -> Vec<String> {
        self.state.lock().networks.iter().cloned().collect()
    }

    /// Volumes that currently exist
    pub fn volumes(&self) -> Vec<String> {
        self.state.lock().volumes.iter().cloned().collect()
    }

    fn record(&self, call: RuntimeCall) {
        self.state.lock().calls.push(call);
    }

    fn container_exit(&self, id: &str) -> RuntimeResult<Arc<watch::Sender<Option<i64>>>> {
        let state = self.state.lock();
        match state.containers.get(id) {
            Some(container) if !container.removed => Ok(Arc::clone(&container.exit)),
            _ => Err(RuntimeError::ContainerNotFound(id.to_string())),
        }
    }

    fn spawn_driver(&self, script: &ContainerScript, exit: Arc<watch::Sender<Option<i64>>>) {
        if script.until_stopped {
            return;
        }

        let state = Arc::clone(&self.state);
        let until_started = script.until_started.clone();
        let run_for = script.run_for;
        let code = script.exit_code;

        tokio::spawn(async move {
            if let Some(image) = until_started {
                while !state.lock().started_images.contains(&image) {
                    if exit.borrow().is_some() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            if !run_for.is_zero() {
                tokio::time::sleep(run_for).await;
            }
            finish(&exit, code);
        });
    }
}

async fn wait_exit(mut receiver: watch::Receiver<Option<i64>>) -> Option<i64> {
    loop {
        if let Some(code) = *receiver.borrow_and_update() {
            return Some(code);
        }
        if receiver.changed().await.is_err() {
            return *receiver.borrow();
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn pull_image(&self, image: &str, signal: &CancellationToken) -> RuntimeResult<()> {
        self.record(RuntimeCall::PullImage(image.to_string()));
        if signal.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }

        let mut state = self.state.lock();
        if let Some(message) = state.pull_failures.get(image) {
            return Err(RuntimeError::ImagePull {
                image: image.to_string(),
                message: message.clone(),
            });
        }
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn create_network(&self, name: &str) -> RuntimeResult<()> {
        self.record(RuntimeCall::CreateNetwork(name.to_string()));
        self.state.lock().networks.insert(name.to_string());
        Ok(())
    }

    async fn delete_network(&self, name: &str) -> RuntimeResult<()> {
        self.record(RuntimeCall::DeleteNetwork(name.to_string()));
        self.state.lock().networks.remove(name);
        Ok(())
    }

    async fn create_volume(&self, name: Option<String>) -> RuntimeResult<VolumeRef> {
        self.record(RuntimeCall::CreateVolume(name.clone()));
        let mut state = self.state.lock();
        let name = name.unwrap_or_else(|| {
            state.next_id += 1;
            format!("volume-{}", state.next_id)
        });
        state.volumes.insert(name.clone());
        Ok(VolumeRef { name })
    }

    async fn delete_volume(&self, name: &str) -> RuntimeResult<()> {
        self.record(RuntimeCall::DeleteVolume(name.to_string()));
        self.state.lock().volumes.remove(name);
        Ok(())
    }

    async fn run_container(
        &self,
        image: &str,
        options: &RunContainerOptions,
        signal: &CancellationToken,
    ) -> RuntimeResult<ContainerHandle> {
        self.record(RuntimeCall::RunContainer {
            image: image.to_string(),
            name: options.name.clone(),
        });
        if signal.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }

        let (id, script, exit) = {
            let mut state = self.state.lock();
            let script = state
                .scripts_by_name
                .get(&options.name)
                .or_else(|| state.scripts_by_image.get(image))
                .cloned()
                .unwrap_or_else(|| ContainerScript::from_command(&options.cmd));

            if let Some(message) = &script.fail_run {
                return Err(RuntimeError::CommandFailed(message.clone()));
            }

            state.next_id += 1;
            let id = format!("fake-{:04}", state.next_id);
            let (exit, _) = watch::channel(None);
            let exit = Arc::new(exit);
            state.containers.insert(
                id.clone(),
                FakeContainer {
                    name: options.name.clone(),
                    image: image.to_string(),
                    logs: script.logs.clone(),
                    logs_after_exit: script.logs_after_exit,
                    exit: Arc::clone(&exit),
                    removed: false,
                },
            );
            state.started_images.insert(image.to_string());
            (id, script, exit)
        };

        self.spawn_driver(&script, exit);
        Ok(ContainerHandle {
            id,
            name: options.name.clone(),
        })
    }

    async fn get_container(&self, id: &str) -> RuntimeResult<ContainerInfo> {
        self.record(RuntimeCall::GetContainer(id.to_string()));
        let state = self.state.lock();
        match state.containers.get(id) {
            Some(container) if !container.removed => {
                let exit_code = *container.exit.borrow();
                Ok(ContainerInfo {
                    id: id.to_string(),
                    name: container.name.clone(),
                    image: container.image.clone(),
                    running: exit_code.is_none(),
                    exit_code,
                    ip_address: state.ip_address.clone(),
                })
            }
            _ => Err(RuntimeError::ContainerNotFound(id.to_string())),
        }
    }

    async fn does_container_exist(&self, id: &str) -> RuntimeResult<bool> {
        self.record(RuntimeCall::DoesContainerExist(id.to_string()));
        let state = self.state.lock();
        Ok(state
            .containers
            .get(id)
            .map(|container| !container.removed)
            .unwrap_or(false))
    }

    async fn is_container_exited(&self, id: &str) -> RuntimeResult<bool> {
        self.record(RuntimeCall::IsContainerExited(id.to_string()));
        let exit = self.container_exit(id)?;
        let exited = exit.borrow().is_some();
        Ok(exited)
    }

    async fn stop_and_delete_container(&self, id: &str) -> RuntimeResult<()> {
        self.record(RuntimeCall::StopAndDeleteContainer(id.to_string()));
        let mut state = self.state.lock();
        if let Some(container) = state.containers.get_mut(id) {
            container.removed = true;
            finish(&container.exit, KILLED_EXIT_CODE);
        }
        Ok(())
    }

    async fn healthy(&self) -> RuntimeResult<bool> {
        self.record(RuntimeCall::Healthy);
        Ok(!self.state.lock().unhealthy)
    }

    async fn container_logs(&self, id: &str) -> RuntimeResult<BoxStream<'static, LogEntry>> {
        self.record(RuntimeCall::ContainerLogs(id.to_string()));
        let (logs, logs_after_exit, exit) = {
            let state = self.state.lock();
            match state.containers.get(id) {
                Some(container) => (
                    container.logs.clone(),
                    container.logs_after_exit,
                    Arc::clone(&container.exit),
                ),
                None => return Err(RuntimeError::ContainerNotFound(id.to_string())),
            }
        };

        if logs_after_exit {
            // Lag behind the exit so `wait_container` always resolves first
            let head = stream::once(async move {
                wait_exit(exit.subscribe()).await;
                tokio::time::sleep(LATE_LOG_DELAY).await;
            })
            .filter_map(|_| async { None });
            return Ok(head.chain(stream::iter(logs)).boxed());
        }

        // The stream ends once the container has exited
        let tail = stream::once(wait_exit(exit.subscribe())).filter_map(|_| async { None });
        Ok(stream::iter(logs).chain(tail).boxed())
    }

    async fn wait_container(&self, id: &str) -> RuntimeResult<i64> {
        self.record(RuntimeCall::WaitContainer(id.to_string()));
        let receiver = {
            let state = self.state.lock();
            match state.containers.get(id) {
                Some(container) => container.exit.subscribe(),
                None => return Err(RuntimeError::ContainerNotFound(id.to_string())),
            }
        };

        wait_exit(receiver)
            .await
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))
    }

    async fn list_images(&self) -> RuntimeResult<Vec<String>> {
        self.record(RuntimeCall::ListImages);
        Ok(self.state.lock().images.iter().cloned().collect())
    }

    async fn list_volumes(&self) -> RuntimeResult<Vec<String>> {
        self.record(RuntimeCall::ListVolumes);
        Ok(self.state.lock().volumes.iter().cloned().collect())
    }

    async fn delete_image(&self, image: &str) -> RuntimeResult<()> {
        self.record(RuntimeCall::DeleteImage(image.to_string()));
        self.state.lock().images.remove(image);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn options(name: &str, cmd: &[&str]) -> RunContainerOptions {
        RunContainerOptions {
            name: name.to_string(),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_echo_command_prints_and_exits() {
        let runtime = FakeContainerRuntime::new();
        let signal = CancellationToken::new();

        let handle = runtime
            .run_container("ubuntu", &options("c", &["/bin/sh", "-c", "echo hi"]), &signal)
            .await
            .unwrap();
        let logs: Vec<LogEntry> = runtime.container_logs(&handle.id).await.unwrap().collect().await;
        let code = runtime.wait_container(&handle.id).await.unwrap();

        assert_eq!(logs, vec![LogEntry::stdout("hi\n")]);
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_until_stopped_container_is_killed() {
        let runtime = FakeContainerRuntime::new();
        runtime.script_container("c", ContainerScript::new().until_stopped());
        let signal = CancellationToken::new();

        let handle = runtime
            .run_container("ubuntu", &options("c", &[]), &signal)
            .await
            .unwrap();
        assert_eq!(runtime.running_containers(), vec!["c".to_string()]);

        let waiter = {
            let runtime = runtime.clone();
            let id = handle.id.clone();
            tokio::spawn(async move { runtime.wait_container(&id).await })
        };
        runtime.stop_and_delete_container(&handle.id).await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), KILLED_EXIT_CODE);
        assert!(!runtime.does_container_exist(&handle.id).await.unwrap());
        assert!(runtime.running_containers().is_empty());
    }

    #[tokio::test]
    async fn test_pull_failures_and_cancellation() {
        let runtime = FakeContainerRuntime::new();
        runtime.fail_pull("broken", "manifest unknown");
        let signal = CancellationToken::new();

        assert!(matches!(
            runtime.pull_image("broken", &signal).await,
            Err(RuntimeError::ImagePull { .. })
        ));

        signal.cancel();
        assert_eq!(
            runtime.pull_image("ubuntu", &signal).await,
            Err(RuntimeError::Cancelled)
        );
        assert_eq!(runtime.call_count(), 2);
    }

    #[tokio::test]
    async fn test_until_started_waits_for_image() {
        let runtime = FakeContainerRuntime::new();
        runtime.script_container("a", ContainerScript::new().until_started("other"));
        let signal = CancellationToken::new();

        let a = runtime
            .run_container("first", &options("a", &[]), &signal)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!runtime.is_container_exited(&a.id).await.unwrap());

        runtime
            .run_container("other", &options("b", &[]), &signal)
            .await
            .unwrap();

        let code = tokio::time::timeout(Duration::from_secs(1), runtime.wait_container(&a.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_late_logs_follow_the_exit() {
        let runtime = FakeContainerRuntime::new();
        runtime.script_container("c", ContainerScript::new().stdout("ready").logs_after_exit());
        let signal = CancellationToken::new();

        let handle = runtime
            .run_container("ubuntu", &options("c", &[]), &signal)
            .await
            .unwrap();
        let mut logs = runtime.container_logs(&handle.id).await.unwrap();

        let first = tokio::select! {
            biased;
            code = runtime.wait_container(&handle.id) => Err(code.unwrap()),
            entry = logs.next() => Ok(entry),
        };
        assert_eq!(first, Err(0));
        assert_eq!(logs.next().await, Some(LogEntry::stdout("ready\n")));
        assert_eq!(logs.next().await, None);
    }
}
