//! # Serial NATS Bridge Core Library
//!
//! Bridges USB-UART serial adapters to a NATS message broker:
//! - USB serial device enumeration (CDC-ACM, FTDI, CH34x, CP21xx, Prolific)
//! - Permission-gated open/close with a cached port per device
//! - TLS broker link with a fixed publish and subscribe subject
//! - An orchestrator exposing one observable state snapshot
//!
//! ## Example
//!
//! ```rust,no_run
//! use serial_bridge_core::{BrokerBridge, DeviceRegistry, MemoryBroker, Orchestrator, SystemUsbHost};
//! use serial_bridge_core::core::broker::Subjects;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(DeviceRegistry::new(Arc::new(SystemUsbHost::new(115_200))));
//!     let bridge = Arc::new(BrokerBridge::new(Arc::new(MemoryBroker::new()), Subjects::default()));
//!     let orchestrator = Orchestrator::new(registry, bridge);
//!
//!     orchestrator.load().await;
//!     orchestrator.connect_device().await;
//!     let state = orchestrator.read_from_device().await;
//!     if let Some(read) = &state.last_bytes_read {
//!         println!("read {} bytes: {}", read.len, read.preview);
//!     }
//!     orchestrator.publish_last_read_to_broker().await;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;
pub mod utils;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OutputFormat};
pub use crate::config::{BridgeConfig, ConfigError};
pub use crate::core::broker::{BrokerBridge, BrokerError, ConnectionStatus, MemoryBroker, NatsTransport};
pub use crate::core::device::{DeviceError, DeviceId, DeviceRegistry, LoopbackHost, SystemUsbHost};
pub use crate::core::orchestrator::{OrchestrationState, Orchestrator};
pub use crate::utils::pump::{BridgePump, PumpStats};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
