//! Orchestration snapshot and its store

use crate::core::broker::ConnectionStatus;
use crate::core::device::{ChipFamily, Device, DeviceId};
use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Bytes of a payload kept in its hex preview
pub const PREVIEW_LIMIT: usize = 64;

/// Display data of an enumerated device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Device id
    pub id: DeviceId,
    /// Descriptor name
    pub name: String,
    /// Bound driver family
    pub chip: ChipFamily,
    /// Whether the port was open when the device was last seen
    pub connected: bool,
}

impl From<&Device> for DeviceInfo {
    fn from(device: &Device) -> Self {
        Self {
            id: device.id.clone(),
            name: device.name.clone(),
            chip: device.chip,
            connected: device.is_connected(),
        }
    }
}

/// Summary of one I/O payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayloadSummary {
    /// Payload length in bytes
    pub len: usize,
    /// Hex of the first [`PREVIEW_LIMIT`] bytes
    pub preview: String,
    /// When the payload was recorded
    pub at: DateTime<Local>,
    /// Full payload
    #[serde(skip)]
    pub data: Bytes,
}

impl PayloadSummary {
    /// Summarise `data`
    pub fn new(data: Bytes) -> Self {
        let shown = data.len().min(PREVIEW_LIMIT);
        Self {
            len: data.len(),
            preview: hex::encode(&data[..shown]),
            at: Local::now(),
            data,
        }
    }

    /// Whether the preview covers only part of the payload
    pub fn is_truncated(&self) -> bool {
        self.len > PREVIEW_LIMIT
    }
}

/// Everything known about devices and broker at one instant
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationState {
    /// An operation is in flight
    pub loading: bool,
    /// Devices from the last enumeration, in enumeration order
    pub devices: Vec<DeviceInfo>,
    /// Device targeted by device operations (the first enumerated one)
    pub selected_device: Option<DeviceId>,
    /// Selected device's port is open
    pub device_connected: bool,
    /// Last device operation was refused for lack of OS permission
    pub device_requires_permission: bool,
    /// Last permission request was granted
    pub device_permission_granted: bool,
    /// Error of the last failed device operation
    pub last_error: Option<String>,
    /// Last payload read from the device
    pub last_bytes_read: Option<PayloadSummary>,
    /// Last payload written to the device
    pub last_bytes_written: Option<PayloadSummary>,
    /// Last payload published to the broker
    pub last_bytes_published: Option<PayloadSummary>,
    /// Last payload received from the broker
    pub last_bytes_received: Option<PayloadSummary>,
    /// Broker connection status
    pub broker_status: ConnectionStatus,
    /// Error of the last failed broker operation
    pub broker_last_error: Option<String>,
    /// Incremented on every replacement
    pub revision: u64,
    /// Time of the last replacement
    pub updated_at: DateTime<Local>,
}

impl Default for OrchestrationState {
    fn default() -> Self {
        Self {
            loading: false,
            devices: Vec::new(),
            selected_device: None,
            device_connected: false,
            device_requires_permission: false,
            device_permission_granted: false,
            last_error: None,
            last_bytes_read: None,
            last_bytes_written: None,
            last_bytes_published: None,
            last_bytes_received: None,
            broker_status: ConnectionStatus::Disconnected,
            broker_last_error: None,
            revision: 0,
            updated_at: Local::now(),
        }
    }
}

/// Current snapshot plus change notification.
///
/// Snapshots are immutable; every update publishes a whole new one.
#[derive(Clone)]
pub struct StateStore {
    tx: Arc<watch::Sender<Arc<OrchestrationState>>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    /// Create a store holding the initial snapshot
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(OrchestrationState::default()));
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<OrchestrationState> {
        self.tx.borrow().clone()
    }

    /// Receive every new snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<OrchestrationState>> {
        self.tx.subscribe()
    }

    /// Derive the next snapshot from the current one and publish it
    pub fn update(&self, f: impl FnOnce(&mut OrchestrationState)) -> Arc<OrchestrationState> {
        let mut published = Arc::default();
        self.tx.send_modify(|current| {
            let mut next = OrchestrationState::clone(current);
            f(&mut next);
            next.revision = current.revision + 1;
            next.updated_at = Local::now();
            *current = Arc::new(next);
            published = current.clone();
        });
        published
    }
}
