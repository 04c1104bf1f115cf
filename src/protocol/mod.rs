//! Wire formats: inbound topics and payloads, outbound observer messages

pub mod messages;
pub mod observer;
pub mod topics;

pub use messages::*;
pub use observer::*;
pub use topics::*;
