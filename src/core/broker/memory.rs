//! In-process broker
//!
//! Delivers published and injected messages through unbounded channels.
//! Used by tests and by the simulation mode of the binary.

use super::{BrokerConnection, BrokerError, BrokerTransport, ConnectionStatus, InboundStream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

struct Subscriber {
    connection: u64,
    subject: String,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[derive(Default)]
struct BrokerState {
    refuse: Option<String>,
    next_connection: u64,
    connections: Vec<(u64, Arc<watch::Sender<ConnectionStatus>>)>,
    subscribers: Vec<Subscriber>,
    published: HashMap<String, Vec<Bytes>>,
}

/// In-memory broker acting as both transport and server
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connection attempts fail with `reason`; `None` accepts again
    pub fn refuse_connections(&self, reason: Option<&str>) {
        self.state.lock().refuse = reason.map(String::from);
    }

    /// Deliver a message to every live subscription on `subject`.
    ///
    /// Returns the number of subscriptions reached.
    pub fn deliver(&self, subject: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let mut state = self.state.lock();
        let mut delivered = 0;
        state.subscribers.retain(|s| {
            if s.subject != subject {
                return true;
            }
            let alive = s.tx.unbounded_send(payload.clone()).is_ok();
            if alive {
                delivered += 1;
            }
            alive
        });
        trace!(subject, delivered, "memory broker delivery");
        delivered
    }

    /// Every payload published on `subject`, oldest first
    pub fn published(&self, subject: &str) -> Vec<Bytes> {
        self.state
            .lock()
            .published
            .get(subject)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.state
            .lock()
            .connections
            .iter()
            .filter(|(_, status)| status.borrow().is_connected())
            .count()
    }

    /// Simulate link loss: every connection turns `Failed` and its
    /// subscriptions end.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        for (_, status) in state.connections.drain(..) {
            status.send_replace(ConnectionStatus::Failed);
        }
        state.subscribers.clear();
    }

    /// Simulate a transient outage: every connection reports `Connecting`
    /// while its subscriptions stay open.
    pub fn suspend_connections(&self) {
        self.set_live_status(ConnectionStatus::Connecting);
    }

    /// End an outage started by [`suspend_connections`](Self::suspend_connections)
    pub fn resume_connections(&self) {
        self.set_live_status(ConnectionStatus::Connected);
    }

    fn set_live_status(&self, to: ConnectionStatus) {
        for (_, status) in &self.state.lock().connections {
            status.send_replace(to);
        }
    }

    fn forget(&self, connection: u64) {
        let mut state = self.state.lock();
        state.connections.retain(|(id, _)| *id != connection);
        state.subscribers.retain(|s| s.connection != connection);
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.refuse {
            return Err(BrokerError::ConnectFailed(reason.clone()));
        }
        state.next_connection += 1;
        let id = state.next_connection;
        let (status, _) = watch::channel(ConnectionStatus::Connected);
        let status = Arc::new(status);
        state.connections.push((id, status.clone()));

        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.clone(),
            status,
        }))
    }

    fn endpoint(&self) -> String {
        "memory://local".to_string()
    }
}

struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    status: Arc<watch::Sender<ConnectionStatus>>,
}

impl MemoryConnection {
    fn require_connected(&self) -> Result<(), BrokerError> {
        let status = *self.status.borrow();
        if status.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::NotConnected(status))
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.require_connected()?;
        self.broker
            .state
            .lock()
            .published
            .entry(subject.to_string())
            .or_default()
            .push(payload);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<InboundStream, BrokerError> {
        self.require_connected()
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded();
        self.broker.state.lock().subscribers.push(Subscriber {
            connection: self.id,
            subject: subject.to_string(),
            tx,
        });
        Ok(rx.boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.status.send_replace(ConnectionStatus::Disconnected);
        self.broker.forget(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_receives_delivery() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let mut inbound = conn.subscribe("in").await.unwrap();

        assert_eq!(broker.deliver("in", vec![0xAA]), 1);
        assert_eq!(broker.deliver("other", vec![0xBB]), 0);
        assert_eq!(inbound.next().await.unwrap().as_ref(), &[0xAA]);
    }

    #[tokio::test]
    async fn test_publish_recorded() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        conn.publish("out", Bytes::from_static(b"hi")).await.unwrap();
        conn.publish("out", Bytes::new()).await.unwrap();
        assert_eq!(broker.published("out"), vec![Bytes::from_static(b"hi"), Bytes::new()]);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(Some("authorization violation"));
        assert!(matches!(broker.connect().await, Err(BrokerError::ConnectFailed(_))));

        broker.refuse_connections(None);
        assert!(broker.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_connections_fails_links() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let mut inbound = conn.subscribe("in").await.unwrap();

        broker.drop_connections();
        assert_eq!(conn.status(), ConnectionStatus::Failed);
        assert!(inbound.next().await.is_none());
        assert_eq!(
            conn.publish("out", Bytes::new()).await,
            Err(BrokerError::NotConnected(ConnectionStatus::Failed))
        );
    }

    #[tokio::test]
    async fn test_suspend_keeps_subscriptions() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let mut changes = conn.status_changes();
        let mut inbound = conn.subscribe("in").await.unwrap();

        broker.suspend_connections();
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), ConnectionStatus::Connecting);
        assert_eq!(
            conn.publish("out", Bytes::new()).await,
            Err(BrokerError::NotConnected(ConnectionStatus::Connecting))
        );
        assert_eq!(broker.deliver("in", vec![0x10]), 1);
        assert_eq!(inbound.next().await.unwrap().as_ref(), &[0x10]);

        broker.resume_connections();
        assert_eq!(*changes.borrow_and_update(), ConnectionStatus::Connected);
        conn.publish("out", Bytes::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let _inbound = conn.subscribe("in").await.unwrap();
        assert_eq!(broker.connection_count(), 1);

        conn.close().await.unwrap();
        assert_eq!(broker.connection_count(), 0);
        assert_eq!(broker.deliver("in", vec![1]), 0);
    }
}
