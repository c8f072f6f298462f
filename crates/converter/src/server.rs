use std::net::SocketAddr;
use std::time::Duration;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use log::info;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use crate::broker::ProgressHandle;
use crate::error::ConvertError;

/// Router answering every request with the current progress snapshot
pub fn create_router(progress: ProgressHandle) -> Router {
    Router::new()
        .route("/", get(progress_handler))
        .fallback(progress_handler)
        .with_state(progress)
}

async fn progress_handler(State(progress): State<ProgressHandle>) -> Response {
    let snapshot = progress.snapshot().await;
    match serde_json::to_vec(&snapshot) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// HTTP server exposing conversion progress
pub struct StatusServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<std::io::Result<()>>,
}

impl StatusServer {
    /// Bind `addr` and start serving in the background
    pub async fn start(addr: SocketAddr, progress: ProgressHandle) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind progress server to {}", addr))?;
        let local_addr = listener.local_addr().context("Failed to read bound address")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = create_router(progress);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!("Progress server listening on {}", local_addr);
        Ok(Self { local_addr, shutdown: Some(shutdown_tx), handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shut down gracefully, giving up after `timeout`
    pub async fn stop(mut self, timeout: Duration) -> Result<(), ConvertError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(Ok(Ok(()))) => {
                info!("Progress server stopped");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(ConvertError::TransportShutdown(e.to_string())),
            Ok(Err(e)) => Err(ConvertError::TransportShutdown(format!("server task failed: {}", e))),
            Err(_) => {
                self.handle.abort();
                Err(ConvertError::TransportShutdown(format!(
                    "graceful shutdown did not finish within {:?}",
                    timeout
                )))
            }
        }
    }
}
