//! MQTT implementation of [`MessageTransport`]
//!
//! Each `connect` builds a fresh `AsyncClient`/`EventLoop` pair and drives the
//! event loop until ConnAck. `subscribe` then drives it until every SubAck has
//! arrived. After that the ingestion loop pulls publishes one at a time, so
//! broker backpressure is whatever the event loop's channel provides.

use super::connection::configure_mqtt_options;
use super::events::{route_event, EventRoute};
use crate::config::MqttSection;
use crate::transport::{InboundMessage, MessageTransport, TransportError};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

struct Session {
    client: AsyncClient,
    event_loop: EventLoop,
    /// Publishes that arrived while still waiting for SubAcks
    pending: VecDeque<InboundMessage>,
}

pub struct MqttSubscriber {
    config: MqttSection,
    session: Option<Session>,
}

impl MqttSubscriber {
    pub fn new(config: MqttSection) -> Self {
        Self {
            config,
            session: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn session_mut(&mut self) -> Result<&mut Session, TransportError> {
        self.session.as_mut().ok_or(TransportError::NotConnected)
    }

    async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), TransportError> {
        loop {
            let event = event_loop
                .poll()
                .await
                .map_err(|e| TransportError::ConnectionFailed(Box::new(e)))?;

            match route_event(&event) {
                EventRoute::ConnectionAcknowledged { refused: None } => return Ok(()),
                EventRoute::ConnectionAcknowledged {
                    refused: Some(reason),
                } => return Err(TransportError::Refused(reason)),
                EventRoute::Disconnected => {
                    return Err(TransportError::Disconnected(
                        "broker closed the session during connect".to_string(),
                    ))
                }
                _ => continue,
            }
        }
    }
}

#[async_trait]
impl MessageTransport for MqttSubscriber {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if let Some(old) = self.session.take() {
            let _ = old.client.try_disconnect();
        }

        let options = configure_mqtt_options(&self.config)?;
        let (client, mut event_loop) = AsyncClient::new(options, self.config.channel_capacity);

        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        match tokio::time::timeout(timeout, Self::wait_for_connack(&mut event_loop)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TransportError::ConnectionFailed(
                    format!("no ConnAck within {}s", timeout.as_secs()).into(),
                ))
            }
        }

        info!(broker = %self.config.broker_url, "Connected to MQTT broker");
        self.session = Some(Session {
            client,
            event_loop,
            pending: VecDeque::new(),
        });
        Ok(())
    }

    async fn subscribe(&mut self, filters: &[String]) -> Result<(), TransportError> {
        let session = self.session_mut()?;

        for filter in filters {
            session
                .client
                .subscribe(filter.as_str(), QoS::AtLeastOnce)
                .await
                .map_err(|e| TransportError::SubscriptionFailed(Box::new(e)))?;
        }

        let mut confirmed = 0;
        while confirmed < filters.len() {
            let event = session
                .event_loop
                .poll()
                .await
                .map_err(|e| TransportError::SubscriptionFailed(Box::new(e)))?;

            match route_event(&event) {
                EventRoute::SubscriptionConfirmed { rejected: 0, .. } => confirmed += 1,
                EventRoute::SubscriptionConfirmed { .. } => {
                    return Err(TransportError::SubscriptionRejected {
                        filter: filters.get(confirmed).cloned().unwrap_or_default(),
                    })
                }
                EventRoute::MessageReceived(message) => session.pending.push_back(message),
                EventRoute::Disconnected => {
                    return Err(TransportError::Disconnected(
                        "broker closed the session during subscribe".to_string(),
                    ))
                }
                _ => continue,
            }
        }

        info!(filters = ?filters, "Subscribed to telemetry topics");
        Ok(())
    }

    async fn next_message(&mut self) -> Result<InboundMessage, TransportError> {
        let session = self.session_mut()?;
        if let Some(message) = session.pending.pop_front() {
            return Ok(message);
        }

        loop {
            let event = session
                .event_loop
                .poll()
                .await
                .map_err(|e| TransportError::Disconnected(e.to_string()))?;

            match route_event(&event) {
                EventRoute::MessageReceived(message) => {
                    debug!(topic = %message.topic, bytes = message.payload.len(), "MQTT message received");
                    return Ok(message);
                }
                EventRoute::Disconnected => {
                    return Err(TransportError::Disconnected(
                        "broker sent DISCONNECT".to_string(),
                    ))
                }
                _ => continue,
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.client.try_disconnect() {
                warn!(error = %e, "Failed to queue MQTT disconnect");
            }
            debug!("MQTT session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> MqttSection {
        MqttSection {
            broker_url: "mqtt://127.0.0.1:1".to_string(),
            connect_timeout_secs: 2,
            ..MqttSection::default()
        }
    }

    #[tokio::test]
    async fn test_operations_require_session() {
        let mut subscriber = MqttSubscriber::new(unreachable_config());
        assert!(!subscriber.is_connected());
        assert!(matches!(
            subscriber.subscribe(&["seano/+/raw_log".to_string()]).await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            subscriber.next_message().await,
            Err(TransportError::NotConnected)
        ));
        subscriber.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker_fails() {
        let mut subscriber = MqttSubscriber::new(unreachable_config());
        assert!(subscriber.connect().await.is_err());
        assert!(!subscriber.is_connected());
    }

    #[tokio::test]
    async fn test_invalid_url_fails_before_network() {
        let mut subscriber = MqttSubscriber::new(MqttSection {
            broker_url: "not a url".to_string(),
            ..MqttSection::default()
        });
        assert!(matches!(
            subscriber.connect().await,
            Err(TransportError::InvalidBrokerUrl(_))
        ));
    }
}
