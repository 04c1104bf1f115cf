//! Test doubles for the transport and storage seams
//!
//! [`ScriptedTransport`] replays scripted broker sessions. [`GatedStore`]
//! holds every unit of work at `begin` until the test opens the gate.

use crate::protocol::VehicleId;
use crate::store::{
    EntityStore, InMemoryStore, InstalledLink, StorageError, TelemetryStore, UnitOfWork,
};
use crate::transport::{InboundMessage, MessageTransport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify, Semaphore};

/// One step of a scripted broker session
#[derive(Debug, Clone)]
pub enum ScriptedEvent {
    Message(InboundMessage),
    /// The connection drops with this reason
    Drop(String),
}

impl From<InboundMessage> for ScriptedEvent {
    fn from(message: InboundMessage) -> Self {
        ScriptedEvent::Message(message)
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    connect_attempts: AtomicU32,
    disconnects: AtomicU32,
    delivered: AtomicU32,
    subscriptions: Mutex<Vec<Vec<String>>>,
    /// Injected events not yet handed to the consumer
    queued: AtomicU32,
    /// The consumer is blocked waiting for an injected event
    waiting: AtomicBool,
    waiting_changed: Notify,
}

impl ProbeState {
    fn is_drained(&self) -> bool {
        self.waiting.load(Ordering::SeqCst) && self.queued.load(Ordering::SeqCst) == 0
    }
}

/// Shared view into a [`ScriptedTransport`] after it has been moved into a loop
#[derive(Clone)]
pub struct TransportProbe {
    state: Arc<ProbeState>,
    injector: mpsc::UnboundedSender<ScriptedEvent>,
}

impl TransportProbe {
    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> u32 {
        self.state.delivered.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.state
            .subscriptions
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Deliver a message on the current session as if the broker pushed it
    pub fn inject<E: Into<ScriptedEvent>>(&self, event: E) {
        self.state.queued.fetch_add(1, Ordering::SeqCst);
        let _ = self.injector.send(event.into());
    }

    /// Wait until the consumer has asked for a message with nothing queued.
    /// Every earlier message has then been fully processed.
    pub async fn wait_until_drained(&self) {
        loop {
            let changed = self.state.waiting_changed.notified();
            if self.state.is_drained() {
                return;
            }
            changed.await;
        }
    }
}

/// Transport double that replays one scripted session per successful connect
pub struct ScriptedTransport {
    sessions: VecDeque<VecDeque<ScriptedEvent>>,
    current: VecDeque<ScriptedEvent>,
    injected: mpsc::UnboundedReceiver<ScriptedEvent>,
    connect_failures: u32,
    subscribe_failures: u32,
    connected: bool,
    probe: TransportProbe,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        let (injector, injected) = mpsc::unbounded_channel();
        Self {
            sessions: VecDeque::new(),
            current: VecDeque::new(),
            injected,
            connect_failures: 0,
            subscribe_failures: 0,
            connected: false,
            probe: TransportProbe {
                state: Arc::new(ProbeState::default()),
                injector,
            },
        }
    }

    /// Queue the events of the next broker session
    pub fn with_session(mut self, events: Vec<ScriptedEvent>) -> Self {
        self.sessions.push_back(events.into());
        self
    }

    pub fn fail_connects(mut self, count: u32) -> Self {
        self.connect_failures = count;
        self
    }

    pub fn fail_subscribes(mut self, count: u32) -> Self {
        self.subscribe_failures = count;
        self
    }

    pub fn probe(&self) -> TransportProbe {
        self.probe.clone()
    }

    fn set_waiting(&self, waiting: bool) {
        self.probe.state.waiting.store(waiting, Ordering::SeqCst);
        if waiting {
            self.probe.state.waiting_changed.notify_waiters();
        }
    }

    fn take_injected(&mut self, event: ScriptedEvent) -> Result<InboundMessage, TransportError> {
        self.set_waiting(false);
        self.probe.state.queued.fetch_sub(1, Ordering::SeqCst);
        self.deliver(event)
    }

    fn deliver(&mut self, event: ScriptedEvent) -> Result<InboundMessage, TransportError> {
        match event {
            ScriptedEvent::Message(message) => {
                self.probe.state.delivered.fetch_add(1, Ordering::SeqCst);
                Ok(message)
            }
            ScriptedEvent::Drop(reason) => {
                self.connected = false;
                Err(TransportError::Disconnected(reason))
            }
        }
    }
}

#[async_trait]
impl MessageTransport for ScriptedTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.probe
            .state
            .connect_attempts
            .fetch_add(1, Ordering::SeqCst);

        if self.connect_failures > 0 {
            self.connect_failures -= 1;
            return Err(TransportError::ConnectionFailed(
                "scripted connect failure".into(),
            ));
        }

        self.connected = true;
        self.current = self.sessions.pop_front().unwrap_or_default();
        Ok(())
    }

    async fn subscribe(&mut self, filters: &[String]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if let Ok(mut subscriptions) = self.probe.state.subscriptions.lock() {
            subscriptions.push(filters.to_vec());
        }

        if self.subscribe_failures > 0 {
            self.subscribe_failures -= 1;
            return Err(TransportError::SubscriptionRejected {
                filter: filters.first().cloned().unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn next_message(&mut self) -> Result<InboundMessage, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        if let Some(event) = self.current.pop_front() {
            return self.deliver(event);
        }
        if let Ok(event) = self.injected.try_recv() {
            return self.take_injected(event);
        }

        self.set_waiting(true);
        match self.injected.recv().await {
            Some(event) => self.take_injected(event),
            None => std::future::pending().await,
        }
    }

    async fn disconnect(&mut self) {
        if self.connected {
            self.probe.state.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        self.connected = false;
    }
}

/// Store wrapper that parks every `begin` and `list_installed_links` until
/// [`GatedStore::release`] is called
#[derive(Clone)]
pub struct GatedStore {
    inner: InMemoryStore,
    gate: Arc<Semaphore>,
    waiting: Arc<AtomicU32>,
    arrived: Arc<Notify>,
}

impl GatedStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            gate: Arc::new(Semaphore::new(0)),
            waiting: Arc::new(AtomicU32::new(0)),
            arrived: Arc::new(Notify::new()),
        }
    }

    /// Let `count` parked or future units proceed
    pub fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }

    /// Wait until some call is parked at the gate
    pub async fn wait_for_waiter(&self) {
        loop {
            let arrived = self.arrived.notified();
            if self.waiting.load(Ordering::SeqCst) > 0 {
                return;
            }
            arrived.await;
        }
    }

    async fn pass_gate(&self) -> Result<(), StorageError> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        self.arrived.notify_waiters();
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| StorageError::backend("gate closed"))?;
        permit.forget();
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl EntityStore for GatedStore {
    async fn find_vehicle_id(&self, vehicle_code: &str) -> Result<Option<VehicleId>, StorageError> {
        self.inner.find_vehicle_id(vehicle_code).await
    }
}

#[async_trait]
impl TelemetryStore for GatedStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
        self.pass_gate().await?;
        self.inner.begin().await
    }

    async fn list_installed_links(&self) -> Result<Vec<InstalledLink>, StorageError> {
        self.pass_gate().await?;
        self.inner.list_installed_links().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_session_replays_then_drops() {
        let mut transport = ScriptedTransport::new().with_session(vec![
            InboundMessage::new("seano/A/raw_log", "hello").into(),
            ScriptedEvent::Drop("gone".to_string()),
        ]);
        transport.connect().await.unwrap();

        let first = transport.next_message().await.unwrap();
        assert_eq!(first.topic, "seano/A/raw_log");
        assert!(matches!(
            transport.next_message().await,
            Err(TransportError::Disconnected(_))
        ));
        assert!(matches!(
            transport.next_message().await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_failures_count_down() {
        let mut transport = ScriptedTransport::new().fail_connects(1);
        let probe = transport.probe();
        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_ok());
        assert_eq!(probe.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_injected_messages_are_delivered() {
        let mut transport = ScriptedTransport::new();
        let probe = transport.probe();
        transport.connect().await.unwrap();
        probe.inject(InboundMessage::new("seano/A/raw_log", "x"));
        assert_eq!(transport.next_message().await.unwrap().payload.as_ref(), b"x");
        assert_eq!(probe.delivered(), 1);
    }

    #[tokio::test]
    async fn test_gated_store_parks_begin() {
        let store = GatedStore::new(InMemoryStore::new());
        let parked = store.clone();
        let task = tokio::spawn(async move { parked.begin().await.is_ok() });

        store.wait_for_waiter().await;
        assert!(!task.is_finished());
        store.release(1);
        assert!(task.await.unwrap());
    }
}
