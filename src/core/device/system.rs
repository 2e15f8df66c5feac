//! OS-backed USB host built on `serialport`
//!
//! The OS serial stack already binds chip drivers, so every tty of a USB
//! adapter is exposed as one port. Ttys are grouped into raw devices by
//! vendor id, product id and serial number.

use super::{
    ChipFamily, HardwareError, PermissionCallback, RawDevice, UsbConnection, UsbHost,
    UsbSerialPort, IO_TIMEOUT,
};
use parking_lot::Mutex;
use serialport::{SerialPort, SerialPortType};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

/// One tty as reported by `serialport`
#[derive(Debug, Clone, PartialEq, Eq)]
struct UsbTty {
    path: String,
    vendor_id: u16,
    product_id: u16,
    serial_number: Option<String>,
    manufacturer: Option<String>,
    product: Option<String>,
}

impl UsbTty {
    fn group_key(&self) -> String {
        format!(
            "{:04x}:{:04x}:{}",
            self.vendor_id,
            self.product_id,
            self.serial_number.as_deref().unwrap_or(&self.path)
        )
    }
}

#[derive(Debug, Default)]
struct IdTable {
    ids: HashMap<String, u32>,
    next: u32,
}

impl IdTable {
    fn id_for(&mut self, key: &str) -> u32 {
        if let Some(&id) = self.ids.get(key) {
            return id;
        }
        self.next += 1;
        self.ids.insert(key.to_string(), self.next);
        self.next
    }
}

/// USB host over the operating system's serial ports
pub struct SystemUsbHost {
    baud_rate: u32,
    ids: Mutex<IdTable>,
}

impl SystemUsbHost {
    /// Create a host whose ports open at `baud_rate`
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ids: Mutex::new(IdTable::default()),
        }
    }

    fn group(&self, ttys: Vec<UsbTty>) -> Vec<RawDevice> {
        let mut groups: BTreeMap<String, Vec<UsbTty>> = BTreeMap::new();
        for tty in ttys {
            groups.entry(tty.group_key()).or_default().push(tty);
        }

        let mut ids = self.ids.lock();
        groups
            .into_iter()
            .filter_map(|(key, mut ttys)| {
                ttys.sort_by(|a, b| a.path.cmp(&b.path));
                let first = ttys.first()?.clone();
                Some(RawDevice {
                    device_id: ids.id_for(&key),
                    vendor_id: first.vendor_id,
                    product_id: first.product_id,
                    name: first.product.clone().unwrap_or_else(|| {
                        format!("USB {:04x}:{:04x}", first.vendor_id, first.product_id)
                    }),
                    manufacturer: first.manufacturer,
                    serial_number: first.serial_number,
                    interfaces: ttys.into_iter().map(|t| t.path).collect(),
                })
            })
            .collect()
    }
}

impl UsbHost for SystemUsbHost {
    fn enumerate(&self) -> Result<Vec<RawDevice>, HardwareError> {
        let ttys = serialport::available_ports()?
            .into_iter()
            .filter_map(|info| match info.port_type {
                SerialPortType::UsbPort(usb) => Some(UsbTty {
                    path: info.port_name,
                    vendor_id: usb.vid,
                    product_id: usb.pid,
                    serial_number: usb.serial_number,
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                }),
                _ => None,
            })
            .collect();
        Ok(self.group(ttys))
    }

    fn create_ports(
        &self,
        device: &RawDevice,
        family: ChipFamily,
    ) -> Result<Vec<Box<dyn UsbSerialPort>>, HardwareError> {
        debug!(device = device.device_id, %family, ports = device.interfaces.len(), "binding OS ports");
        Ok((0u8..)
            .zip(device.interfaces.iter())
            .map(|(port_number, _)| {
                Box::new(SystemPort {
                    port_number,
                    baud_rate: self.baud_rate,
                    inner: None,
                }) as Box<dyn UsbSerialPort>
            })
            .collect())
    }

    fn has_permission(&self, device: &RawDevice) -> bool {
        device.interfaces.iter().all(|path| path_accessible(path))
    }

    fn request_permission(&self, device: &RawDevice, callback: PermissionCallback) {
        let granted = self.has_permission(device);
        if !granted {
            warn!(
                device = device.device_id,
                ports = ?device.interfaces,
                "no read/write access to serial ports; add the user to the dialout group or install a udev rule"
            );
        }
        callback(granted);
    }

    fn open_device(&self, device: &RawDevice) -> Result<UsbConnection, HardwareError> {
        if device.interfaces.is_empty() {
            return Err(HardwareError::Disconnected);
        }
        Ok(UsbConnection::new(device))
    }
}

#[cfg(unix)]
fn path_accessible(path: &str) -> bool {
    use nix::unistd::{access, AccessFlags};
    access(path, AccessFlags::R_OK | AccessFlags::W_OK).is_ok()
}

#[cfg(not(unix))]
fn path_accessible(_path: &str) -> bool {
    true
}

struct SystemPort {
    port_number: u8,
    baud_rate: u32,
    inner: Option<Box<dyn SerialPort>>,
}

impl SystemPort {
    fn inner(&mut self, timeout: Duration) -> Result<&mut Box<dyn SerialPort>, HardwareError> {
        let port = self.inner.as_mut().ok_or(HardwareError::NotOpen)?;
        port.set_timeout(timeout)?;
        Ok(port)
    }
}

impl UsbSerialPort for SystemPort {
    fn port_number(&self) -> u8 {
        self.port_number
    }

    fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    fn open(&mut self, connection: UsbConnection) -> Result<(), HardwareError> {
        let path = connection
            .interface(self.port_number)
            .ok_or(HardwareError::Disconnected)?;
        let port = serialport::new(path, self.baud_rate)
            .timeout(IO_TIMEOUT)
            .open()?;
        debug!(path, baud = self.baud_rate, "serial port opened");
        self.inner = Some(port);
        Ok(())
    }

    fn close(&mut self) -> Result<(), HardwareError> {
        self.inner = None;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, HardwareError> {
        match self.inner(timeout)?.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(HardwareError::Io(e)),
        }
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), HardwareError> {
        let port = self.inner(timeout)?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }
}
