//! Message broker layer
//!
//! One outbound connection per process: opaque payloads are published to a
//! fixed outbound subject and messages on a fixed inbound subject are handed
//! to a registered [`BrokerListener`].

mod bridge;
mod memory;
mod nats;
mod session;

pub use bridge::BrokerBridge;
pub use memory::MemoryBroker;
pub use nats::{NatsOptions, NatsTransport};
pub use session::{BrokerSession, InvalidTransition, ReconnectPolicy, StatusTransition};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Status of the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// No connection
    #[default]
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Connected and subscribed
    Connected,
    /// Last connection attempt failed, or the link dropped
    Failed,
}

impl ConnectionStatus {
    /// Whether publishing is allowed
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Broker error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Operation needs a live connection
    #[error("Broker not connected. Current status is {0}. You need to open the connection first.")]
    NotConnected(ConnectionStatus),

    /// Transport or authentication failure while connecting
    #[error("Broker connection failed: {0}")]
    ConnectFailed(String),

    /// Trust material could not be used
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Publish was rejected by the transport
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Subscription could not be created
    #[error("Subscribe failed: {0}")]
    Subscribe(String),
}

/// Receiver of inbound broker payloads
pub trait BrokerListener: Send + Sync {
    /// Called once per inbound message, off the caller's task
    fn on_data(&self, payload: Bytes);
}

impl<F> BrokerListener for F
where
    F: Fn(Bytes) + Send + Sync,
{
    fn on_data(&self, payload: Bytes) {
        self(payload)
    }
}

/// Payloads arriving on a subscription
pub type InboundStream = BoxStream<'static, Bytes>;

/// Fixed subjects of a single-link bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subjects {
    /// Subject device payloads are published to
    pub publish: String,
    /// Subject whose messages are dispatched to the listener
    pub subscribe: String,
}

impl Default for Subjects {
    fn default() -> Self {
        Self {
            publish: "serial.outbound".to_string(),
            subscribe: "serial.inbound".to_string(),
        }
    }
}

/// Factory for broker connections
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open a connection to the configured endpoint
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;

    /// Endpoint description for logs
    fn endpoint(&self) -> String;
}

/// One live broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Current transport status
    fn status(&self) -> ConnectionStatus;

    /// Transport status as it changes, including while the connection
    /// recovers on its own
    fn status_changes(&self) -> watch::Receiver<ConnectionStatus>;

    /// Send without waiting for acknowledgement
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Subscribe to a subject
    async fn subscribe(&self, subject: &str) -> Result<InboundStream, BrokerError>;

    /// Close the connection
    async fn close(&self) -> Result<(), BrokerError>;
}
