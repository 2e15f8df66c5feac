//! Core module containing the bridge functionality
//!
//! This module provides:
//! - USB-UART device enumeration, permission gating and port I/O
//! - The broker link: TLS NATS transport, connection state machine, inbound dispatch
//! - The orchestrator folding both into one observable snapshot

pub mod broker;
pub mod device;
pub mod orchestrator;
