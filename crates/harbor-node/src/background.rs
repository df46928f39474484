//! Periodic housekeeping the engine leaves to its host

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use harbor_core::{ContainerRuntime, CoreError, FlowId, FlowRepository, ResourceCache};

/// Delete finished flows that ended before `now - retention`
pub async fn cleanup_expired_flows(
    repository: &dyn FlowRepository,
    retention: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<Vec<FlowId>, CoreError> {
    let cutoff = now - retention;
    let mut deleted = Vec::new();

    for flow in repository.list_flows().await? {
        let expired = flow
            .state
            .end_time
            .map(|end| end < cutoff)
            .unwrap_or(false);
        if expired {
            repository.delete_flow(&flow.id).await?;
            debug!(flow_id = %flow.id, "Deleted expired flow");
            deleted.push(flow.id);
        }
    }

    Ok(deleted)
}

/// Resync the resource cache on an interval until cancelled
pub fn spawn_cache_resync(
    cache: Arc<ResourceCache>,
    runtime: Arc<dyn ContainerRuntime>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = cache.resync(runtime.as_ref()).await {
                        warn!(error = %err, "Resource cache resync failed");
                    }
                }
            }
        }
    })
}

/// Delete expired flows on an interval until cancelled
pub fn spawn_flow_retention(
    repository: Arc<dyn FlowRepository>,
    retention: chrono::Duration,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match cleanup_expired_flows(repository.as_ref(), retention, Utc::now()).await {
                        Ok(deleted) if !deleted.is_empty() => {
                            info!(count = deleted.len(), "Deleted expired flows");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "Flow retention cleanup failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::{Flow, FlowStatus};
    use harbor_state_inmemory::InMemoryFlowRepository;
    use harbor_test_utils::{JobDefinitionBuilder, OperationBuilder};
    use pretty_assertions::assert_eq;

    fn flow(id: &str, end_time: Option<DateTime<Utc>>) -> Flow {
        let definition = JobDefinitionBuilder::new()
            .op(OperationBuilder::run("a", "ubuntu"))
            .build();
        let mut flow = Flow::new(FlowId::from(id), definition);
        if let Some(end) = end_time {
            flow.state.status = FlowStatus::Success;
            flow.state.end_time = Some(end);
        }
        flow
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_old_finished_flows() {
        let repository = InMemoryFlowRepository::new();
        let now = Utc::now();
        for flow in [
            flow("old", Some(now - chrono::Duration::hours(80))),
            flow("recent", Some(now - chrono::Duration::hours(1))),
            flow("running", None),
        ] {
            repository.set_flow(&flow.id.clone(), flow).await.unwrap();
        }

        let deleted = cleanup_expired_flows(&repository, chrono::Duration::hours(72), now)
            .await
            .unwrap();

        assert_eq!(deleted, vec![FlowId::from("old")]);
        let mut remaining: Vec<String> = repository
            .list_flows()
            .await
            .unwrap()
            .into_iter()
            .map(|flow| flow.id.0)
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["recent".to_string(), "running".to_string()]);
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_cancel() {
        let shutdown = CancellationToken::new();
        let runtime = harbor_test_utils::FakeContainerRuntime::new();
        let resync = spawn_cache_resync(
            Arc::new(ResourceCache::default()),
            Arc::new(runtime),
            Duration::from_millis(10),
            shutdown.clone(),
        );
        let retention = spawn_flow_retention(
            Arc::new(InMemoryFlowRepository::new()),
            chrono::Duration::hours(1),
            Duration::from_millis(10),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), async {
            resync.await.unwrap();
            retention.await.unwrap();
        })
        .await
        .unwrap();
    }
}
