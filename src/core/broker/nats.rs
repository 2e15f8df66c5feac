//! NATS transport over TLS
//!
//! Trust roots are parsed once from PEM bytes when the transport is built,
//! before any connection exists.

use super::{
    BrokerConnection, BrokerError, BrokerTransport, ConnectionStatus, InboundStream,
    ReconnectPolicy,
};
use async_nats::connection::State;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rustls::{ClientConfig, RootCertStore};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Connection settings for a NATS server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsOptions {
    /// Server URL, e.g. `tls://broker.example.com:4222`
    pub url: String,
    /// User name
    pub username: String,
    /// Password
    #[serde(skip_serializing)]
    pub password: String,
    /// Reconnect and timeout policy
    pub policy: ReconnectPolicy,
    /// Refuse plaintext connections
    pub require_tls: bool,
}

impl NatsOptions {
    /// Options with the default reconnect policy and TLS required
    pub fn new(url: &str, username: &str, password: &str) -> Self {
        Self {
            url: url.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            policy: ReconnectPolicy::default(),
            require_tls: true,
        }
    }
}

/// Build a rustls client config trusting exactly the certificates in `pem`
pub fn client_config(pem: &[u8]) -> Result<ClientConfig, BrokerError> {
    let mut roots = RootCertStore::empty();
    let mut reader = pem;
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| BrokerError::Certificate(e.to_string()))?;
        roots
            .add(cert)
            .map_err(|e| BrokerError::Certificate(e.to_string()))?;
    }
    if roots.is_empty() {
        return Err(BrokerError::Certificate(
            "no certificates found in trust material".to_string(),
        ));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| BrokerError::Certificate(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

/// Broker transport backed by `async-nats`
pub struct NatsTransport {
    options: NatsOptions,
    tls: Option<ClientConfig>,
}

impl NatsTransport {
    /// Create a transport; `trust_pem` may be empty only when TLS is not required
    pub fn new(options: NatsOptions, trust_pem: &[u8]) -> Result<Self, BrokerError> {
        let tls = if trust_pem.is_empty() && !options.require_tls {
            None
        } else {
            Some(client_config(trust_pem)?)
        };
        Ok(Self { options, tls })
    }
}

#[async_trait]
impl BrokerTransport for NatsTransport {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let (status_tx, _) = watch::channel(ConnectionStatus::Connecting);
        let status_tx = Arc::new(status_tx);
        let events = status_tx.clone();

        let mut connect = async_nats::ConnectOptions::with_user_and_password(
            self.options.username.clone(),
            self.options.password.clone(),
        )
        .connection_timeout(self.options.policy.connection_timeout)
        .max_reconnects(self.options.policy.max_reconnects)
        .require_tls(self.options.require_tls)
        .event_callback(move |event| {
            let events = events.clone();
            async move {
                debug!(%event, "broker event");
                if let Some(status) = event_status(&event) {
                    events.send_replace(status);
                }
            }
        });
        if let Some(tls) = &self.tls {
            connect = connect.tls_client_config(tls.clone());
        }

        let client = connect
            .connect(self.options.url.as_str())
            .await
            .map_err(|e| BrokerError::ConnectFailed(e.to_string()))?;
        info!(url = %self.options.url, user = %self.options.username, "connected to NATS");
        status_tx.send_replace(ConnectionStatus::Connected);

        Ok(Arc::new(NatsConnection {
            client,
            status_tx,
            closed: AtomicBool::new(false),
        }))
    }

    fn endpoint(&self) -> String {
        self.options.url.clone()
    }
}

/// Status implied by a client event; `None` when the link state is unchanged
fn event_status(event: &async_nats::Event) -> Option<ConnectionStatus> {
    match event {
        async_nats::Event::Connected => Some(ConnectionStatus::Connected),
        // The client keeps reconnecting until the policy runs out.
        async_nats::Event::Disconnected => Some(ConnectionStatus::Connecting),
        async_nats::Event::ClientError(async_nats::ClientError::MaxReconnects) => {
            Some(ConnectionStatus::Failed)
        }
        async_nats::Event::Closed => Some(ConnectionStatus::Disconnected),
        _ => None,
    }
}

struct NatsConnection {
    client: async_nats::Client,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for NatsConnection {
    fn status(&self) -> ConnectionStatus {
        if self.closed.load(Ordering::SeqCst) {
            return ConnectionStatus::Disconnected;
        }
        match self.client.connection_state() {
            State::Connected => ConnectionStatus::Connected,
            State::Pending => ConnectionStatus::Connecting,
            State::Disconnected => ConnectionStatus::Failed,
        }
    }

    fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        let status = self.status();
        if !status.is_connected() {
            return Err(BrokerError::NotConnected(status));
        }
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }

    async fn subscribe(&self, subject: &str) -> Result<InboundStream, BrokerError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
        Ok(subscriber.map(|message| message.payload).boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.status_tx.send_replace(ConnectionStatus::Disconnected);
        // The socket closes once the last client handle is dropped.
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "unflushed messages dropped on close");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_trust_material_rejected() {
        assert!(matches!(client_config(b""), Err(BrokerError::Certificate(_))));
        assert!(matches!(
            client_config(b"not a certificate"),
            Err(BrokerError::Certificate(_))
        ));
    }

    #[test]
    fn test_plaintext_allowed_without_tls() {
        let mut options = NatsOptions::new("nats://127.0.0.1:4222", "user", "pass");
        options.require_tls = false;
        let transport = NatsTransport::new(options, b"").unwrap();
        assert!(transport.tls.is_none());
        assert_eq!(transport.endpoint(), "nats://127.0.0.1:4222");
    }

    #[test]
    fn test_event_status() {
        assert_eq!(
            event_status(&async_nats::Event::Disconnected),
            Some(ConnectionStatus::Connecting)
        );
        assert_eq!(
            event_status(&async_nats::Event::Connected),
            Some(ConnectionStatus::Connected)
        );
        assert_eq!(
            event_status(&async_nats::Event::ClientError(
                async_nats::ClientError::MaxReconnects
            )),
            Some(ConnectionStatus::Failed)
        );
        assert_eq!(event_status(&async_nats::Event::LameDuckMode), None);
    }

    #[test]
    fn test_tls_required_needs_trust_material() {
        let options = NatsOptions::new("tls://127.0.0.1:4222", "user", "pass");
        assert!(NatsTransport::new(options, b"").is_err());
    }
}
