//! Per-message processing: decode, resolve, persist, broadcast
//!
//! [`IngestProcessor::handle`] is the single message boundary. Every
//! message-level error is converted to one log record and a drop counter
//! there; nothing it does can end the consume loop.

use super::decoder::{decode, DecodedBody, DecodedMessage};
use super::resolver::EntityResolver;
use crate::broadcast::BroadcastRegistry;
use crate::error::{payload_excerpt, PipelineError, PipelineResult};
use crate::observability::metrics::PipelineMetrics;
use crate::protocol::{MessageClass, ObserverMessage, RawLogEnvelope, VehicleId};
use crate::store::{
    RawLogRecord, SensorLogRecord, StorageError, TelemetryRecord, TelemetryStore,
};
use crate::transport::InboundMessage;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info_span, warn, Instrument};

/// Summary of a successfully processed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub vehicle_id: VehicleId,
    pub class: MessageClass,
    pub links_touched: u64,
    pub observers_reached: usize,
}

pub struct IngestProcessor {
    namespace: String,
    resolver: EntityResolver,
    store: Arc<dyn TelemetryStore>,
    registry: Arc<BroadcastRegistry>,
    metrics: Arc<PipelineMetrics>,
    touch_on_ingest: bool,
}

impl IngestProcessor {
    pub fn new(
        namespace: impl Into<String>,
        resolver: EntityResolver,
        store: Arc<dyn TelemetryStore>,
        registry: Arc<BroadcastRegistry>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            resolver,
            store,
            registry,
            metrics,
            touch_on_ingest: true,
        }
    }

    /// Whether sensor_log and vehicle_log messages bump link freshness
    pub fn with_touch_on_ingest(mut self, enabled: bool) -> Self {
        self.touch_on_ingest = enabled;
        self
    }

    /// Process one message, logging and counting any failure. Never fails.
    pub async fn handle(&self, message: InboundMessage) {
        let span = info_span!("ingest_message", topic = %message.topic, retain = message.retain);
        async {
            self.metrics.message_received();
            let started = Instant::now();

            match self.process(&message).await {
                Ok(report) => {
                    self.metrics.message_stored(started.elapsed());
                    debug!(
                        vehicle_id = report.vehicle_id,
                        class = %report.class,
                        links_touched = report.links_touched,
                        observers = report.observers_reached,
                        "Message ingested"
                    );
                }
                Err(e) => {
                    self.metrics.message_dropped(e.kind());
                    let excerpt = payload_excerpt(&message.payload);
                    match &e {
                        PipelineError::Storage(_) => error!(
                            error = %e,
                            kind = e.kind(),
                            payload = %excerpt,
                            "Dropping message after storage failure"
                        ),
                        _ => warn!(
                            error = %e,
                            kind = e.kind(),
                            payload = %excerpt,
                            "Dropping message"
                        ),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Run one message through the pipeline. Broadcast happens only after commit.
    pub async fn process(&self, message: &InboundMessage) -> PipelineResult<IngestReport> {
        let received_at = Utc::now();
        let decoded = decode(&message.topic, &message.payload, &self.namespace)?;
        let vehicle_id = self.resolver.resolve(&decoded.vehicle_code).await?;

        let class = decoded.class;
        let (event, links_touched) = self.persist(vehicle_id, decoded, received_at).await?;
        let report = self.registry.broadcast_all(&event);

        Ok(IngestReport {
            vehicle_id,
            class,
            links_touched,
            observers_reached: report.delivered,
        })
    }

    /// Write the message inside one unit of work. Any error drops the unit,
    /// which discards its writes and its session.
    async fn persist(
        &self,
        vehicle_id: VehicleId,
        decoded: DecodedMessage,
        received_at: DateTime<Utc>,
    ) -> PipelineResult<(ObserverMessage, u64)> {
        let mut uow = self.store.begin().await?;
        let mut links_touched = 0;

        let event = match decoded.body {
            DecodedBody::RawLog(text) => {
                let envelope = RawLogEnvelope {
                    entity_id: vehicle_id,
                    entity_code: decoded.vehicle_code.clone(),
                    message: text.clone(),
                    timestamp: received_at,
                };
                let logs = envelope
                    .to_json_string()
                    .map_err(|e| StorageError::backend(format!("raw log envelope: {e}")))?;
                uow.append_raw_log(RawLogRecord {
                    vehicle_id,
                    logs,
                    received_at,
                })
                .await?;

                ObserverMessage::RawLog {
                    vehicle_id,
                    vehicle_code: decoded.vehicle_code,
                    data: text,
                    timestamp: received_at,
                }
            }
            DecodedBody::SensorLog(payload) => {
                uow.append_sensor_log(SensorLogRecord {
                    vehicle_id,
                    sensor_id: payload.sensor_id,
                    data: payload.data.clone(),
                    received_at,
                })
                .await?;
                if self.touch_on_ingest {
                    links_touched = uow
                        .touch_last_seen(vehicle_id, Some(payload.sensor_id), received_at)
                        .await?;
                }

                ObserverMessage::SensorLog {
                    vehicle_id,
                    vehicle_code: decoded.vehicle_code,
                    sensor_id: payload.sensor_id,
                    data: payload.data,
                    timestamp: received_at,
                }
            }
            DecodedBody::VehicleLog(telemetry) => {
                uow.append_telemetry(TelemetryRecord {
                    vehicle_id,
                    telemetry: telemetry.clone(),
                    received_at,
                })
                .await?;
                if self.touch_on_ingest {
                    links_touched = uow.touch_last_seen(vehicle_id, None, received_at).await?;
                }

                ObserverMessage::VehicleLog {
                    vehicle_id,
                    vehicle_code: decoded.vehicle_code,
                    data: telemetry,
                    timestamp: received_at,
                }
            }
        };

        uow.commit().await?;
        Ok((event, links_touched))
    }
}
