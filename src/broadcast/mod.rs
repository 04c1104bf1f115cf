//! Fan-out of pipeline events to live observers

pub mod registry;

pub use registry::{
    BroadcastRegistry, BroadcastReport, ConnectionId, ConnectionInfo, Delivery,
    ObserverConnection, RegistryStats, DEFAULT_CHANNEL_CAPACITY,
};
