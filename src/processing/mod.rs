//! Message processing stages
//!
//! - [`decoder`] - topic classification and payload decoding
//! - [`resolver`] - vehicle code to id lookup
//! - [`ingest`] - the per-message boundary tying the stages to storage and fan-out

pub mod decoder;
pub mod ingest;
pub mod resolver;

pub use decoder::{decode, DecodeError, DecodedBody, DecodedMessage};
pub use ingest::{IngestProcessor, IngestReport};
pub use resolver::EntityResolver;
