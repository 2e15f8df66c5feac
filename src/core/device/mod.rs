//! USB serial device layer
//!
//! Supports:
//! - Enumeration of attached USB-UART adapters
//! - Chip-driver probing (CDC-ACM, FTDI, CH34x, CP21xx, Prolific)
//! - Permission-gated open/close with a cached port handle per device port
//! - Timeout-bound byte I/O
//!
//! The byte-level chip protocols live behind [`UsbHost`] and [`UsbSerialPort`];
//! this layer only decides which driver to bind and keeps port handles alive
//! across re-enumeration.

mod loopback;
mod prober;
mod registry;
mod system;

pub use loopback::{LoopbackDevice, LoopbackHost};
pub use prober::{ChipFamily, ProbeTable, SerialDriver};
pub use registry::DeviceRegistry;
pub use system::SystemUsbHost;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Timeout applied to every port read and write
pub const IO_TIMEOUT: Duration = Duration::from_millis(2000);

/// Size of the buffer a single read fills at most
pub const READ_BUFFER_SIZE: usize = 8192;

/// Stable identifier of one serial endpoint: `"{raw device id}-{port number}"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Compose the id of one port of a raw USB device
    pub fn new(raw_device_id: u32, port_number: u8) -> Self {
        Self(format!("{raw_device_id}-{port_number}"))
    }

    /// Borrow as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A USB device as reported by the host, before any driver is bound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDevice {
    /// Host-assigned device id, stable for the lifetime of the host
    pub device_id: u32,
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Human-readable name from the descriptor
    pub name: String,
    /// Manufacturer string, if any
    pub manufacturer: Option<String>,
    /// Serial number string, if any
    pub serial_number: Option<String>,
    /// OS-level endpoints, one per serial port the device exposes
    pub interfaces: Vec<String>,
}

/// An OS-level connection to a raw USB device that ports are opened against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbConnection {
    device_id: u32,
    interfaces: Vec<String>,
}

impl UsbConnection {
    /// Create a connection handle for a device
    pub fn new(device: &RawDevice) -> Self {
        Self {
            device_id: device.device_id,
            interfaces: device.interfaces.clone(),
        }
    }

    /// Raw id of the device this connection belongs to
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// OS endpoint of the given port, if the device has one
    pub fn interface(&self, port_number: u8) -> Option<&str> {
        self.interfaces
            .get(usize::from(port_number))
            .map(String::as_str)
    }
}

/// Errors raised by the hardware capability
#[derive(Error, Debug)]
pub enum HardwareError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Port was used before it was opened
    #[error("Port is not open")]
    NotOpen,

    /// Device went away
    #[error("Device disconnected")]
    Disconnected,

    /// Capability does not support the request
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Device registry error types
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No enumerated device carries this id
    #[error("Device: {0} not found.")]
    NotFound(DeviceId),

    /// The OS has not granted access to the device
    #[error("Device: {0} permission denied")]
    PermissionDenied(DeviceId),

    /// Read or write on a port that is not open
    #[error("Device: {0} connection is closed. You need to open the connection on port.")]
    ConnectionClosed(DeviceId),

    /// The capability failed while acting on a device
    #[error("Device: {id} hardware error: {source}")]
    Hardware {
        /// Device the operation targeted
        id: DeviceId,
        /// Underlying failure
        #[source]
        source: HardwareError,
    },

    /// Listing attached devices failed
    #[error("Device enumeration failed: {0}")]
    Enumeration(#[source] HardwareError),

    /// The blocking worker running the operation died
    #[error("Device worker failed: {0}")]
    Worker(String),
}

impl DeviceError {
    /// Device the error refers to, if any
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            Self::NotFound(id)
            | Self::PermissionDenied(id)
            | Self::ConnectionClosed(id)
            | Self::Hardware { id, .. } => Some(id),
            Self::Enumeration(_) | Self::Worker(_) => None,
        }
    }

    /// Whether the caller should request OS permission before retrying
    pub fn requires_permission(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }
}

/// Callback invoked with the outcome of a permission request
pub type PermissionCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Host-side USB capability: enumeration, driver binding and permissions
#[cfg_attr(test, mockall::automock)]
pub trait UsbHost: Send + Sync {
    /// List every USB device currently attached
    fn enumerate(&self) -> Result<Vec<RawDevice>, HardwareError>;

    /// Bind the driver of `family` to `device` and return one fresh, closed
    /// port per serial endpoint. An empty list means the driver does not
    /// accept the device.
    fn create_ports(
        &self,
        device: &RawDevice,
        family: ChipFamily,
    ) -> Result<Vec<Box<dyn UsbSerialPort>>, HardwareError>;

    /// Whether the OS has granted access to the device
    fn has_permission(&self, device: &RawDevice) -> bool;

    /// Ask the OS for access; `callback` receives the outcome
    fn request_permission(&self, device: &RawDevice, callback: PermissionCallback);

    /// Open an OS-level connection to the device
    fn open_device(&self, device: &RawDevice) -> Result<UsbConnection, HardwareError>;
}

/// Driver-level handle to one serial endpoint
pub trait UsbSerialPort: Send {
    /// Index of this port on its device
    fn port_number(&self) -> u8;

    /// Whether the port is currently open
    fn is_open(&self) -> bool;

    /// Open the port against an OS connection
    fn open(&mut self, connection: UsbConnection) -> Result<(), HardwareError>;

    /// Close the port
    fn close(&mut self) -> Result<(), HardwareError>;

    /// Read into `buf`, waiting at most `timeout`; returns bytes read (possibly 0)
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, HardwareError>;

    /// Write all of `data`, waiting at most `timeout`
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), HardwareError>;
}

/// Port handle shared between the registry cache and the devices it hands out
pub type SharedPort = Arc<Mutex<Box<dyn UsbSerialPort>>>;

/// One enumerable serial endpoint
#[derive(Clone)]
pub struct Device {
    /// Stable identifier
    pub id: DeviceId,
    /// Label from the hardware descriptor
    pub name: String,
    /// Driver family bound to the device
    pub chip: ChipFamily,
    /// Port index on the raw device
    pub port_number: u8,
    /// The raw USB device
    pub raw: RawDevice,
    port: SharedPort,
}

impl Device {
    /// Cached port handle (a reference, not a copy)
    pub fn port(&self) -> &SharedPort {
        &self.port
    }

    /// Whether the underlying port is open
    pub fn is_connected(&self) -> bool {
        self.port.lock().is_open()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("chip", &self.chip)
            .field("port_number", &self.port_number)
            .finish_non_exhaustive()
    }
}
