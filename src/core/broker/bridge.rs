//! Broker bridge
//!
//! Owns the single broker connection: connects, subscribes the inbound
//! subject, runs the dispatch task and publishes to the outbound subject.

use super::{
    BrokerConnection, BrokerError, BrokerListener, BrokerSession, BrokerTransport,
    ConnectionStatus, InboundStream, StatusTransition, Subjects,
};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

struct Shared {
    session: Mutex<BrokerSession>,
    status_tx: watch::Sender<ConnectionStatus>,
    listener: Mutex<Option<Arc<dyn BrokerListener>>>,
}

impl Shared {
    fn set_status(&self, to: ConnectionStatus, reason: Option<&str>) {
        let mut session = self.session.lock();
        match session.transition(to, reason) {
            Ok(()) => {
                self.status_tx.send_replace(to);
            }
            Err(e) => warn!(error = %e, "ignoring broker status change"),
        }
    }

    /// Adopt a status reported by the transport
    fn observe(&self, status: ConnectionStatus) {
        let mut session = self.session.lock();
        if status != session.status() {
            debug!(from = %session.status(), to = %status, "transport status changed");
            session.observe(status);
            self.status_tx.send_replace(status);
        }
    }
}

struct Dispatch {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Single-link broker client
pub struct BrokerBridge {
    transport: Arc<dyn BrokerTransport>,
    subjects: Subjects,
    shared: Arc<Shared>,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    dispatch: tokio::sync::Mutex<Option<Dispatch>>,
}

impl BrokerBridge {
    /// Create a disconnected bridge
    pub fn new(transport: Arc<dyn BrokerTransport>, subjects: Subjects) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            transport,
            subjects,
            shared: Arc::new(Shared {
                session: Mutex::new(BrokerSession::new()),
                status_tx,
                listener: Mutex::new(None),
            }),
            connection: Mutex::new(None),
            dispatch: tokio::sync::Mutex::new(None),
        }
    }

    /// Subjects this bridge publishes to and listens on
    pub fn subjects(&self) -> &Subjects {
        &self.subjects
    }

    /// Connect, subscribe the inbound subject and route its messages to
    /// `listener`.
    ///
    /// An existing connection is torn down first.
    pub async fn connect(&self, listener: Arc<dyn BrokerListener>) -> Result<(), BrokerError> {
        let mut dispatch = self.dispatch.lock().await;
        let had_connection = self.connection.lock().is_some();
        if had_connection {
            self.teardown(&mut dispatch).await;
        }

        info!(endpoint = %self.transport.endpoint(), "connecting to broker");
        self.shared.set_status(ConnectionStatus::Connecting, Some("connect requested"));

        let connection = match self.transport.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, "broker connect failed");
                self.shared.set_status(ConnectionStatus::Failed, Some(&e.to_string()));
                return Err(e);
            }
        };

        *self.shared.listener.lock() = Some(listener);
        let inbound = match connection.subscribe(&self.subjects.subscribe).await {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, subject = %self.subjects.subscribe, "broker subscribe failed");
                *self.shared.listener.lock() = None;
                if let Err(close) = connection.close().await {
                    debug!(error = %close, "closing half-open broker connection");
                }
                let err = BrokerError::ConnectFailed(e.to_string());
                self.shared.set_status(ConnectionStatus::Failed, Some(&err.to_string()));
                return Err(err);
            }
        };

        let link = connection.status_changes();
        *self.connection.lock() = Some(connection);
        self.shared.set_status(ConnectionStatus::Connected, None);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_dispatch(
            inbound,
            link,
            self.shared.clone(),
            cancel.clone(),
            self.subjects.subscribe.clone(),
        ));
        *dispatch = Some(Dispatch { cancel, handle });
        info!(subject = %self.subjects.subscribe, "broker connected and subscribed");
        Ok(())
    }

    /// Drop the listener, stop dispatch and close the connection.
    ///
    /// Safe to call at any time, including when never connected.
    pub async fn disconnect(&self) {
        let mut dispatch = self.dispatch.lock().await;
        self.teardown(&mut dispatch).await;
    }

    /// Publish `payload` to the outbound subject without waiting for an ack
    pub async fn publish(&self, payload: Bytes) -> Result<(), BrokerError> {
        let status = self.status();
        let connection = self.connection.lock().clone();
        match connection {
            Some(connection) if status.is_connected() => {
                let len = payload.len();
                connection
                    .publish(&self.subjects.publish, payload)
                    .await
                    .map_err(|e| {
                        warn!(error = %e, "broker publish failed");
                        e
                    })?;
                debug!(subject = %self.subjects.publish, bytes = len, "published");
                Ok(())
            }
            _ => Err(BrokerError::NotConnected(status)),
        }
    }

    /// Current status; the live transport status wins over the recorded one
    pub fn status(&self) -> ConnectionStatus {
        let observed = self.connection.lock().as_ref().map(|c| c.status());
        if let Some(status) = observed {
            self.shared.observe(status);
        }
        self.shared.session.lock().status()
    }

    /// Error recorded by the last failed connect
    pub fn last_error(&self) -> Option<String> {
        self.shared.session.lock().last_error().map(String::from)
    }

    /// Status transition history
    pub fn history(&self) -> Vec<StatusTransition> {
        self.shared.session.lock().history().to_vec()
    }

    /// Watch status changes
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    async fn teardown(&self, dispatch: &mut Option<Dispatch>) {
        // No callback may run once the listener is gone.
        *self.shared.listener.lock() = None;

        if let Some(Dispatch { cancel, handle }) = dispatch.take() {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "broker dispatch task failed");
            }
        }

        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "error closing broker connection");
            }
            info!("broker disconnected");
        }

        self.shared
            .set_status(ConnectionStatus::Disconnected, Some("disconnect requested"));
    }
}

async fn run_dispatch(
    mut inbound: InboundStream,
    mut link: watch::Receiver<ConnectionStatus>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    subject: String,
) {
    // A change that raced the subscription is picked up on the first pass.
    link.mark_changed();
    let mut link_open = true;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = link.changed(), if link_open => match changed {
                Ok(()) => {
                    let status = *link.borrow_and_update();
                    shared.observe(status);
                }
                Err(_) => link_open = false,
            },
            next = inbound.next() => match next {
                Some(payload) => {
                    trace!(%subject, bytes = payload.len(), "inbound message");
                    let listener = shared.listener.lock().clone();
                    if let Some(listener) = listener {
                        listener.on_data(payload);
                    }
                }
                None => {
                    warn!(%subject, "inbound subscription ended");
                    shared.set_status(ConnectionStatus::Failed, Some("inbound subscription ended"));
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::broker::MemoryBroker;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn bridge(broker: &MemoryBroker) -> BrokerBridge {
        BrokerBridge::new(Arc::new(broker.clone()), Subjects::default())
    }

    fn collector() -> (Arc<dyn BrokerListener>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: Arc<dyn BrokerListener> = Arc::new(move |payload: Bytes| {
            let _ = tx.send(payload);
        });
        (listener, rx)
    }

    #[tokio::test]
    async fn test_publish_before_connect() {
        let broker = MemoryBroker::new();
        let bridge = bridge(&broker);
        assert_eq!(
            bridge.publish(Bytes::from_static(b"x")).await,
            Err(BrokerError::NotConnected(ConnectionStatus::Disconnected))
        );
    }

    #[tokio::test]
    async fn test_connect_failure_sets_failed() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(Some("bad credentials"));
        let bridge = bridge(&broker);
        let (listener, _rx) = collector();

        let err = bridge.connect(listener).await.unwrap_err();
        assert!(matches!(err, BrokerError::ConnectFailed(_)));
        assert_eq!(bridge.status(), ConnectionStatus::Failed);
        assert_eq!(bridge.last_error().as_deref(), Some(err.to_string().as_str()));
    }

    #[tokio::test]
    async fn test_inbound_dispatch_stops_after_disconnect() {
        let broker = MemoryBroker::new();
        let bridge = bridge(&broker);
        let (listener, mut rx) = collector();
        bridge.connect(listener).await.unwrap();

        broker.deliver("serial.inbound", vec![0xAA]);
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_ref(), &[0xAA]);

        bridge.disconnect().await;
        assert_eq!(broker.deliver("serial.inbound", vec![0xBB]), 0);
        assert!(rx.recv().await.is_none());
        assert_eq!(bridge.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let broker = MemoryBroker::new();
        let bridge = bridge(&broker);
        bridge.disconnect().await;
        bridge.disconnect().await;
        assert_eq!(bridge.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_connection() {
        let broker = MemoryBroker::new();
        let bridge = bridge(&broker);
        let (first, _rx1) = collector();
        let (second, _rx2) = collector();

        bridge.connect(first).await.unwrap();
        bridge.connect(second).await.unwrap();
        assert_eq!(broker.connection_count(), 1);
        assert_eq!(bridge.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_publish_empty_payload() {
        let broker = MemoryBroker::new();
        let bridge = bridge(&broker);
        let (listener, _rx) = collector();
        bridge.connect(listener).await.unwrap();

        bridge.publish(Bytes::new()).await.unwrap();
        assert_eq!(broker.published("serial.outbound"), vec![Bytes::new()]);
    }

    #[tokio::test]
    async fn test_link_loss_reported() {
        let broker = MemoryBroker::new();
        let bridge = bridge(&broker);
        let mut status = bridge.subscribe_status();
        let (listener, _rx) = collector();
        bridge.connect(listener).await.unwrap();

        broker.drop_connections();
        tokio::time::timeout(
            Duration::from_secs(1),
            status.wait_for(|s| *s == ConnectionStatus::Failed),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(
            bridge.publish(Bytes::new()).await,
            Err(BrokerError::NotConnected(ConnectionStatus::Failed))
        );
    }

    #[tokio::test]
    async fn test_transport_outage_followed_without_polling() {
        let broker = MemoryBroker::new();
        let bridge = bridge(&broker);
        let mut status = bridge.subscribe_status();
        let (listener, mut rx) = collector();
        bridge.connect(listener).await.unwrap();

        broker.suspend_connections();
        tokio::time::timeout(
            Duration::from_secs(1),
            status.wait_for(|s| *s == ConnectionStatus::Connecting),
        )
        .await
        .unwrap()
        .unwrap();

        // The subscription survives the outage.
        assert_eq!(broker.deliver("serial.inbound", vec![0x5A]), 1);
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_ref(), &[0x5A]);

        broker.resume_connections();
        tokio::time::timeout(
            Duration::from_secs(1),
            status.wait_for(|s| *s == ConnectionStatus::Connected),
        )
        .await
        .unwrap()
        .unwrap();
        let path: Vec<_> = bridge.history().iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
            ]
        );
    }
}
