//! Composition root
//!
//! Builds one registry, one ingestion loop, one liveness monitor and the HTTP
//! server from a [`PipelineConfig`], and tears them down in order.

use crate::broadcast::BroadcastRegistry;
use crate::config::{ConfigError, PipelineConfig};
use crate::ingestion::{IngestionHandle, IngestionLoop, IngestionState};
use crate::liveness::{LivenessHandle, LivenessMonitor};
use crate::observability::metrics::PipelineMetrics;
use crate::processing::{EntityResolver, IngestProcessor};
use crate::server::{AppState, HttpServer, ServerError};
use crate::store::{EntityStore, TelemetryStore};
use crate::transport::MessageTransport;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Server(#[from] ServerError),
}

pub struct Pipeline {
    metrics: Arc<PipelineMetrics>,
    registry: Arc<BroadcastRegistry>,
    ingestion: IngestionHandle,
    liveness: Option<LivenessHandle>,
    server: Option<HttpServer>,
}

impl Pipeline {
    /// Start every component. Nothing is spawned if configuration or binding fails.
    pub fn start<T: MessageTransport>(
        config: &PipelineConfig,
        transport: T,
        entities: Arc<dyn EntityStore>,
        store: Arc<dyn TelemetryStore>,
    ) -> Result<Self, StartupError> {
        let filters = config.mqtt.topics.filters().map_err(ConfigError::from)?;
        let metrics = Arc::new(PipelineMetrics::new());
        let registry = Arc::new(BroadcastRegistry::new(
            config.observers.channel_capacity,
            metrics.clone(),
        ));

        let resolver = EntityResolver::with_cache(entities, config.resolver.cache_capacity);
        let processor = IngestProcessor::new(
            filters.namespace(),
            resolver,
            store.clone(),
            registry.clone(),
            metrics.clone(),
        )
        .with_touch_on_ingest(config.liveness.touch_on_ingest);

        let ingestion_loop = IngestionLoop::new(
            transport,
            processor,
            &filters,
            config.reconnect.to_reconnect_config(),
            metrics.clone(),
        );

        let server = if config.observers.enabled {
            let state = AppState::new(
                registry.clone(),
                metrics.clone(),
                ingestion_loop.subscribe_state(),
            );
            Some(HttpServer::bind(config.observers.bind_addr()?, state)?)
        } else {
            None
        };

        let ingestion = ingestion_loop.spawn();

        let liveness = config.liveness.enabled.then(|| {
            LivenessMonitor::new(
                store,
                registry.clone(),
                metrics.clone(),
                config.liveness.interval(),
                config.liveness.timeout(),
            )
            .spawn()
        });

        info!(
            namespace = filters.namespace(),
            observers = config.observers.enabled,
            liveness = config.liveness.enabled,
            "Pipeline started"
        );

        Ok(Self {
            metrics,
            registry,
            ingestion,
            liveness,
            server,
        })
    }

    pub fn registry(&self) -> Arc<BroadcastRegistry> {
        self.registry.clone()
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    pub fn ingestion(&self) -> &IngestionHandle {
        &self.ingestion
    }

    pub fn ingestion_state(&self) -> IngestionState {
        self.ingestion.state()
    }

    /// Address the HTTP server is bound to, if it is enabled
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(HttpServer::local_addr)
    }

    /// Stop both loops, waiting for any in-flight message or tick, then close
    /// observers and the HTTP server. No storage or broadcast call happens
    /// after this returns.
    pub async fn shutdown(self) {
        info!("Shutting down pipeline");

        let stop_liveness = async {
            if let Some(liveness) = &self.liveness {
                liveness.stop().await;
            }
        };
        tokio::join!(self.ingestion.stop(), stop_liveness);

        self.registry.close_all();
        if let Some(server) = self.server {
            server.shutdown().await;
        }

        info!("Pipeline stopped");
    }
}
