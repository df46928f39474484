//! Mock implementation of the ContainerRuntime trait.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use mockall::mock;
use tokio_util::sync::CancellationToken;

use harbor_core::{
    ContainerHandle, ContainerInfo, ContainerRuntime, LogEntry, RunContainerOptions,
    RuntimeResult, VolumeRef,
};

mock! {
    pub ContainerRuntime {}

    #[async_trait]
    impl ContainerRuntime for ContainerRuntime {
        async fn pull_image(&self, image: &str, signal: &CancellationToken) -> RuntimeResult<()>;
        async fn create_network(&self, name: &str) -> RuntimeResult<()>;
        async fn delete_network(&self, name: &str) -> RuntimeResult<()>;
        async fn create_volume(&self, name: Option<String>) -> RuntimeResult<VolumeRef>;
        async fn delete_volume(&self, name: &str) -> RuntimeResult<()>;
        async fn run_container(
            &self,
            image: &str,
            options: &RunContainerOptions,
            signal: &CancellationToken,
        ) -> RuntimeResult<ContainerHandle>;
        async fn get_container(&self, id: &str) -> RuntimeResult<ContainerInfo>;
        async fn does_container_exist(&self, id: &str) -> RuntimeResult<bool>;
        async fn is_container_exited(&self, id: &str) -> RuntimeResult<bool>;
        async fn stop_and_delete_container(&self, id: &str) -> RuntimeResult<()>;
        async fn healthy(&self) -> RuntimeResult<bool>;
        async fn container_logs(&self, id: &str) -> RuntimeResult<BoxStream<'static, LogEntry>>;
        async fn wait_container(&self, id: &str) -> RuntimeResult<i64>;
        async fn list_images(&self) -> RuntimeResult<Vec<String>>;
        async fn list_volumes(&self) -> RuntimeResult<Vec<String>>;
        async fn delete_image(&self, image: &str) -> RuntimeResult<()>;
    }
}

/// Creates a new mock ContainerRuntime with default expectations.
///
/// Every container exits immediately with 0 and prints nothing; the runtime
/// holds no images or volumes.
pub fn create_mock_container_runtime() -> MockContainerRuntime {
    let mut mock = MockContainerRuntime::new();

    mock.expect_pull_image().returning(|_, _| Ok(()));
    mock.expect_create_network().returning(|_| Ok(()));
    mock.expect_delete_network().returning(|_| Ok(()));
    mock.expect_create_volume().returning(|name| {
        Ok(VolumeRef {
            name: name.unwrap_or_else(|| "mock-volume".to_string()),
        })
    });
    mock.expect_delete_volume().returning(|_| Ok(()));
    mock.expect_run_container().returning(|image, options, _| {
        Ok(ContainerHandle {
            id: format!("mock-{}-{}", options.name, image),
            name: options.name.clone(),
        })
    });
    mock.expect_stop_and_delete_container().returning(|_| Ok(()));
    mock.expect_healthy().returning(|| Ok(true));
    mock.expect_container_logs()
        .returning(|_| Ok(stream::empty().boxed()));
    mock.expect_wait_container().returning(|_| Ok(0));
    mock.expect_list_images().returning(|| Ok(Vec::new()));
    mock.expect_list_volumes().returning(|| Ok(Vec::new()));
    mock.expect_delete_image().returning(|_| Ok(()));

    mock
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::RuntimeError;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn test_mock_container_runtime_default_behavior() {
        let mock = create_mock_container_runtime();
        let signal = CancellationToken::new();

        assert!(mock.pull_image("ubuntu", &signal).await.is_ok());
        assert!(mock.healthy().await.unwrap());
        assert!(mock.list_images().await.unwrap().is_empty());

        let options = RunContainerOptions {
            name: "harbor-job-run".to_string(),
            ..Default::default()
        };
        let handle = mock.run_container("ubuntu", &options, &signal).await.unwrap();
        assert_eq!(handle.name, "harbor-job-run");
        assert_eq!(mock.wait_container(&handle.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mock_container_runtime_custom_behavior() {
        let mut mock = MockContainerRuntime::new();
        mock.expect_get_container()
            .with(eq("missing"))
            .times(1)
            .returning(|id| Err(RuntimeError::ContainerNotFound(id.to_string())));

        let err = mock.get_container("missing").await.unwrap_err();

        assert_eq!(err, RuntimeError::ContainerNotFound("missing".to_string()));
    }
}
