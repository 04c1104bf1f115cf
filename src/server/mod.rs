//! HTTP surface: observer websockets plus health and metrics
//!
//! Both route sets share one listener.

pub mod health;
pub mod observer;

use crate::broadcast::BroadcastRegistry;
use crate::ingestion::IngestionState;
use crate::observability::metrics::PipelineMetrics;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};
use warp::Filter;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind observer server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: warp::Error,
    },
}

/// Shared handles every route needs
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<BroadcastRegistry>,
    pub metrics: Arc<PipelineMetrics>,
    pub ingestion: watch::Receiver<IngestionState>,
}

impl AppState {
    pub fn new(
        registry: Arc<BroadcastRegistry>,
        metrics: Arc<PipelineMetrics>,
        ingestion: watch::Receiver<IngestionState>,
    ) -> Self {
        Self {
            registry,
            metrics,
            ingestion,
        }
    }
}

pub(crate) fn with_state(
    state: AppState,
) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

pub fn routes(
    state: AppState,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    observer::routes(state.clone())
        .or(health::routes(state))
        .with(warp::cors().allow_any_origin())
}

/// A running HTTP server
pub struct HttpServer {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl HttpServer {
    /// Bind and start serving. Port 0 picks a free port; see [`HttpServer::local_addr`].
    pub fn bind(addr: SocketAddr, state: AppState) -> Result<Self, ServerError> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (local_addr, server) = warp::serve(routes(state))
            .try_bind_with_graceful_shutdown(addr, async move {
                let _ = shutdown_rx.await;
            })
            .map_err(|source| ServerError::Bind { addr, source })?;

        info!(%local_addr, "Observer server listening");
        let task = tokio::spawn(server);

        Ok(Self {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for in-flight requests
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            error!(error = %e, "Observer server task failed");
        }
        info!("Observer server stopped");
    }
}
