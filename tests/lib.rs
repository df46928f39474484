//! Shared helpers of the Harbor integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use harbor_core::{CoreError, TaskManager};

/// Generous upper bound for anything a scenario waits on
pub const WAIT: Duration = Duration::from_secs(5);

/// Run a flow in the background
pub fn spawn_run(manager: Arc<TaskManager>) -> JoinHandle<Result<(), CoreError>> {
    tokio::spawn(async move { manager.run().await })
}

/// HTTP endpoint answering `200` to its first `healthy` requests, then `503`
///
/// Returns the bound port on 127.0.0.1 and the number of requests served.
pub async fn spawn_health_endpoint(healthy: usize) -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let served = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&served);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let status = if counter.fetch_add(1, Ordering::SeqCst) < healthy {
                "200 OK"
            } else {
                "503 Service Unavailable"
            };
            let response =
                format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (port, served)
}
