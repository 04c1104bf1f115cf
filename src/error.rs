//! Error taxonomy for the telemetry ingestion pipeline
//!
//! Every failure in the pipeline falls into one of two groups:
//!
//! - **transport-level** ([`PipelineError::Transport`]) - the broker connection or
//!   subscription failed; the ingestion loop reconnects with backoff.
//! - **message-level** (everything else) - one message is dropped and logged; the
//!   ingestion loop keeps consuming.

use crate::broadcast::ConnectionId;
use crate::processing::decoder::DecodeError;
use crate::protocol::topics::TopicError;
use crate::store::StorageError;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Maximum length of a payload excerpt written to the logs
pub const PAYLOAD_EXCERPT_LIMIT: usize = 256;

/// Main error type for pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Malformed topic: {0}")]
    MalformedTopic(TopicError),

    #[error("Unknown message class '{class}' on topic '{topic}'")]
    UnknownClass { topic: String, class: String },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("No vehicle registered with code '{vehicle_code}'")]
    ResolutionNotFound { vehicle_code: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Broadcast delivery to observer {connection_id} failed: {reason}")]
    BroadcastDelivery {
        connection_id: ConnectionId,
        reason: String,
    },
}

impl From<TopicError> for PipelineError {
    fn from(err: TopicError) -> Self {
        match err {
            TopicError::UnknownClass { topic, class } => Self::UnknownClass { topic, class },
            other => Self::MalformedTopic(other),
        }
    }
}

impl PipelineError {
    /// Stable label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::MalformedTopic(_) => "malformed_topic",
            Self::UnknownClass { .. } => "unknown_class",
            Self::Decode(_) => "decode_error",
            Self::ResolutionNotFound { .. } => "resolution_not_found",
            Self::Storage(_) => "storage_error",
            Self::BroadcastDelivery { .. } => "broadcast_delivery",
        }
    }

    /// Whether the error only affects a single message (never a reconnect trigger)
    pub fn is_message_level(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }

    pub fn resolution_not_found<S: Into<String>>(vehicle_code: S) -> Self {
        Self::ResolutionNotFound {
            vehicle_code: vehicle_code.into(),
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)"?(password|token|key|secret)"?\s*[=:]\s*"?[^\s",}]+"?"#)
        .expect("secret pattern is a valid regex")
});

/// Build a log-safe excerpt of a message payload for manual replay.
///
/// Non-UTF-8 bytes are replaced, credentials are redacted and the result is
/// capped at [`PAYLOAD_EXCERPT_LIMIT`] bytes.
pub fn payload_excerpt(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    let mut sanitized = SECRET_PATTERN.replace_all(&text, "${1}=***").to_string();

    if sanitized.len() > PAYLOAD_EXCERPT_LIMIT {
        let suffix = "...[truncated]";
        let mut cut = PAYLOAD_EXCERPT_LIMIT - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(suffix);
    }

    sanitized
}
