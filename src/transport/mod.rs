//! Inbound message transport
//!
//! The ingestion loop drives a [`MessageTransport`] through connect, subscribe
//! and receive. Every error returned here is connection-level and leads to a
//! reconnect with backoff.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod mqtt;

pub use mqtt::MqttSubscriber;

/// A message as delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

impl InboundMessage {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }
}

/// Connection-level transport failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("broker refused connection: {0}")]
    Refused(String),

    #[error("subscription failed: {0}")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("broker rejected subscription to '{filter}'")]
    SubscriptionRejected { filter: String },

    #[error("invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("connection lost: {0}")]
    Disconnected(String),

    #[error("not connected")]
    NotConnected,
}

/// Transport abstraction so the ingestion loop can run against a real broker
/// or a scripted double
#[async_trait]
pub trait MessageTransport: Send + 'static {
    /// Open a fresh session. Any previous session is discarded.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Subscribe to every filter and wait until the broker acknowledges all of them
    async fn subscribe(&mut self, filters: &[String]) -> Result<(), TransportError>;

    /// Wait for the next inbound message
    async fn next_message(&mut self) -> Result<InboundMessage, TransportError>;

    /// Close the session if one is open
    async fn disconnect(&mut self);
}
