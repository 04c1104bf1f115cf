//! Ingestion loop: owns the transport session lifecycle
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> SUBSCRIBED -> CONSUMING -> DISCONNECTED ...
//!        \_____________\______________\____________\_____-> STOPPED
//! ```
//!
//! Only transport errors leave CONSUMING. Message-level failures are absorbed
//! by [`IngestProcessor::handle`].

pub mod reconnect;

pub use reconnect::{ReconnectConfig, ReconnectionDecision};

use crate::error::PipelineError;
use crate::observability::metrics::PipelineMetrics;
use crate::processing::IngestProcessor;
use crate::protocol::TopicFilters;
use crate::task::{interruptible_sleep, wait_for_shutdown, TaskControl};
use crate::transport::{MessageTransport, TransportError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, info_span, warn, Instrument};

const TRANSITION_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionState {
    Disconnected,
    Connecting,
    Subscribed,
    Consuming,
    Stopped,
}

enum ConsumeExit {
    Stopped,
    Lost(PipelineError),
}

pub struct IngestionLoop<T: MessageTransport> {
    transport: T,
    processor: IngestProcessor,
    filters: Vec<String>,
    reconnect: ReconnectConfig,
    metrics: Arc<PipelineMetrics>,
    state_tx: watch::Sender<IngestionState>,
    transitions: broadcast::Sender<IngestionState>,
}

impl<T: MessageTransport> IngestionLoop<T> {
    pub fn new(
        transport: T,
        processor: IngestProcessor,
        filters: &TopicFilters,
        reconnect: ReconnectConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let (state_tx, _) = watch::channel(IngestionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        Self {
            transport,
            processor,
            filters: filters.all(),
            reconnect,
            metrics,
            state_tx,
            transitions,
        }
    }

    /// Observe every state change, including ones made before `spawn` returns
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<IngestionState> {
        self.transitions.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<IngestionState> {
        self.state_tx.subscribe()
    }

    pub fn spawn(self) -> IngestionHandle {
        let state_rx = self.state_tx.subscribe();
        let transitions = self.transitions.clone();
        let control = TaskControl::spawn("ingestion", move |shutdown| {
            self.run(shutdown).instrument(info_span!("ingestion_loop"))
        });
        IngestionHandle {
            control,
            state_rx,
            transitions,
        }
    }

    fn set_state(&self, state: IngestionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            let _ = self.transitions.send(state);
            info!(from = ?previous, to = ?state, "Ingestion state changed");
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut failed_attempts: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(IngestionState::Connecting);
            self.metrics.mqtt_connection_attempt();

            let opened = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                result = self.open_session() => result,
            };

            match opened {
                Ok(()) => {
                    failed_attempts = 0;
                    self.metrics.mqtt_connection_established();
                    self.set_state(IngestionState::Consuming);

                    match self.consume(&mut shutdown).await {
                        ConsumeExit::Stopped => break,
                        ConsumeExit::Lost(e) => {
                            self.metrics.mqtt_connection_lost();
                            warn!(error = %e, kind = e.kind(), "Transport connection lost");
                        }
                    }
                }
                Err(e) => {
                    failed_attempts = failed_attempts.saturating_add(1);
                    self.metrics.mqtt_connection_failed();
                    error!(error = %e, failed_attempts, "Failed to establish transport session");
                }
            }

            self.transport.disconnect().await;
            self.set_state(IngestionState::Disconnected);

            // Copy the flag out so the watch guard is released before sleeping
            let stop_requested = *shutdown.borrow();
            match self.reconnect.decide(failed_attempts, stop_requested) {
                ReconnectionDecision::Proceed { attempt, delay_ms } => {
                    info!(attempt, delay_ms, "Reconnecting after delay");
                    if !interruptible_sleep(&mut shutdown, Duration::from_millis(delay_ms)).await {
                        break;
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => break,
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    error!(failed_attempts, "Giving up after maximum reconnection attempts");
                    break;
                }
            }
        }

        self.transport.disconnect().await;
        self.metrics.mqtt_disconnected();
        self.set_state(IngestionState::Stopped);
        info!("Ingestion loop stopped");
    }

    async fn open_session(&mut self) -> Result<(), TransportError> {
        self.transport.connect().await?;
        self.transport.subscribe(&self.filters).await?;
        self.set_state(IngestionState::Subscribed);
        Ok(())
    }

    /// Receive and process messages until the transport fails or stop is requested.
    /// The stop flag is only checked between messages.
    async fn consume(&mut self, shutdown: &mut watch::Receiver<bool>) -> ConsumeExit {
        loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => return ConsumeExit::Stopped,
                next = self.transport.next_message() => next,
            };

            match next {
                Ok(message) => self.processor.handle(message).await,
                Err(e) => return ConsumeExit::Lost(e.into()),
            }
        }
    }
}

/// Control handle for a running ingestion loop
pub struct IngestionHandle {
    control: TaskControl,
    state_rx: watch::Receiver<IngestionState>,
    transitions: broadcast::Sender<IngestionState>,
}

impl IngestionHandle {
    pub fn state(&self) -> IngestionState {
        *self.state_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        !self.control.is_stop_requested() && self.state() != IngestionState::Stopped
    }

    pub fn subscribe_state(&self) -> watch::Receiver<IngestionState> {
        self.state_rx.clone()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<IngestionState> {
        self.transitions.subscribe()
    }

    /// Wait until the loop reaches `target`
    pub async fn wait_for_state(&self, target: IngestionState) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Stop the loop. Returns after any in-flight message has been fully
    /// processed; no storage or broadcast call happens after this returns.
    pub async fn stop(&self) {
        self.control.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastRegistry;
    use crate::processing::EntityResolver;
    use crate::store::InMemoryStore;
    use crate::testing::mocks::ScriptedTransport;
    use crate::transport::InboundMessage;

    fn build(transport: ScriptedTransport, store: &InMemoryStore) -> IngestionLoop<ScriptedTransport> {
        let metrics = Arc::new(PipelineMetrics::new());
        let registry = Arc::new(BroadcastRegistry::new(16, metrics.clone()));
        let processor = IngestProcessor::new(
            "seano",
            EntityResolver::new(Arc::new(store.clone())),
            Arc::new(store.clone()),
            registry,
            metrics.clone(),
        );
        IngestionLoop::new(
            transport,
            processor,
            &TopicFilters::for_namespace("seano").unwrap(),
            ReconnectConfig::fixed(Duration::from_millis(10)),
            metrics,
        )
    }

    #[tokio::test]
    async fn test_subscribes_to_all_three_filters() {
        let store = InMemoryStore::new();
        let transport = ScriptedTransport::new();
        let probe = transport.probe();
        let handle = build(transport, &store).spawn();

        handle.wait_for_state(IngestionState::Consuming).await;
        assert_eq!(
            probe.subscriptions(),
            vec![vec![
                "seano/+/raw_log".to_string(),
                "seano/+/sensor_log".to_string(),
                "seano/+/vehicle_log".to_string(),
            ]]
        );
        handle.stop().await;
        assert_eq!(handle.state(), IngestionState::Stopped);
    }

    #[tokio::test]
    async fn test_connect_failures_are_retried() {
        let store = InMemoryStore::new();
        let transport = ScriptedTransport::new().fail_connects(2);
        let probe = transport.probe();
        let handle = build(transport, &store).spawn();

        handle.wait_for_state(IngestionState::Consuming).await;
        assert_eq!(probe.connect_attempts(), 3);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_subscribe_failure_takes_reconnect_path() {
        let store = InMemoryStore::new();
        let transport = ScriptedTransport::new().fail_subscribes(1);
        let probe = transport.probe();
        let lp = build(transport, &store);
        let mut transitions = lp.subscribe_transitions();
        let handle = lp.spawn();

        handle.wait_for_state(IngestionState::Consuming).await;
        handle.stop().await;

        let mut seen = Vec::new();
        while let Ok(state) = transitions.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                IngestionState::Connecting,
                IngestionState::Disconnected,
                IngestionState::Connecting,
                IngestionState::Subscribed,
                IngestionState::Consuming,
                IngestionState::Stopped,
            ]
        );
        assert_eq!(probe.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_stop_while_backing_off_is_prompt() {
        let store = InMemoryStore::new();
        let transport = ScriptedTransport::new().fail_connects(u32::MAX);
        let metrics = Arc::new(PipelineMetrics::new());
        let registry = Arc::new(BroadcastRegistry::new(16, metrics.clone()));
        let processor = IngestProcessor::new(
            "seano",
            EntityResolver::new(Arc::new(store.clone())),
            Arc::new(store.clone()),
            registry,
            metrics.clone(),
        );
        let handle = IngestionLoop::new(
            transport,
            processor,
            &TopicFilters::for_namespace("seano").unwrap(),
            ReconnectConfig::fixed(Duration::from_secs(3600)),
            metrics,
        )
        .spawn();

        handle.wait_for_state(IngestionState::Disconnected).await;
        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("stop should interrupt the backoff sleep");
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_messages_flow_through_processor() {
        let store = InMemoryStore::new();
        store.add_vehicle(1, "USV-01");
        let transport = ScriptedTransport::new().with_session(vec![
            InboundMessage::new("seano/USV-01/vehicle_log", r#"{"speed": 1}"#).into(),
        ]);
        let probe = transport.probe();
        let handle = build(transport, &store).spawn();

        probe.wait_until_drained().await;
        handle.stop().await;
        assert_eq!(store.telemetry().len(), 1);
    }
}
