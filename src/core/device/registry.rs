//! Device registry and connection manager

use super::{
    Device, DeviceError, DeviceId, PermissionCallback, ProbeTable, RawDevice, SerialDriver,
    SharedPort, UsbHost, IO_TIMEOUT, READ_BUFFER_SIZE,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PortKey {
    raw_device_id: u32,
    port_number: u8,
}

/// Enumerates devices, caches their port handles and serves port I/O.
///
/// Enumeration runs again on every call because attachment state is
/// volatile; only port handles are cached, keyed by
/// `(raw device id, port number)`. A cached handle is never replaced by a
/// freshly probed one, so an open port survives re-enumeration.
///
/// Every blocking method here may wait up to the I/O timeout.
pub struct DeviceRegistry {
    host: Arc<dyn UsbHost>,
    default_prober: ProbeTable,
    io_timeout: Duration,
    read_buffer_size: usize,
    ports: Mutex<HashMap<PortKey, SharedPort>>,
}

impl DeviceRegistry {
    /// Create a registry over a hardware capability
    pub fn new(host: Arc<dyn UsbHost>) -> Self {
        Self {
            host,
            default_prober: ProbeTable::default_table(),
            io_timeout: IO_TIMEOUT,
            read_buffer_size: READ_BUFFER_SIZE,
            ports: Mutex::new(HashMap::new()),
        }
    }

    /// Set the port I/O timeout
    #[must_use]
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Set the read buffer size
    #[must_use]
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Enumerate attached devices, one [`Device`] per serial port.
    ///
    /// Devices no driver accepts are skipped. Zero devices is not an error.
    pub fn list_devices(&self) -> Result<Vec<Device>, DeviceError> {
        let raws = self.host.enumerate().map_err(DeviceError::Enumeration)?;
        let mut cache = self.ports.lock();
        let mut devices = Vec::new();

        for raw in raws {
            let Some(driver) = self.resolve_driver(&raw) else {
                warn!(
                    device = raw.device_id,
                    vendor_id = format_args!("{:04x}", raw.vendor_id),
                    product_id = format_args!("{:04x}", raw.product_id),
                    "no driver accepts device, skipping"
                );
                continue;
            };

            for fresh in driver.ports {
                let port_number = fresh.port_number();
                let key = PortKey {
                    raw_device_id: raw.device_id,
                    port_number,
                };
                let port = cache
                    .entry(key)
                    .or_insert_with(|| Arc::new(Mutex::new(fresh)))
                    .clone();
                devices.push(Device {
                    id: DeviceId::new(raw.device_id, port_number),
                    name: raw.name.clone(),
                    chip: driver.family,
                    port_number,
                    raw: raw.clone(),
                    port,
                });
            }
        }

        debug!(count = devices.len(), cached = cache.len(), "enumerated devices");
        Ok(devices)
    }

    /// Look a device up by id
    pub fn get_device(&self, id: &DeviceId) -> Result<Device, DeviceError> {
        self.list_devices()?
            .into_iter()
            .find(|d| &d.id == id)
            .ok_or_else(|| DeviceError::NotFound(id.clone()))
    }

    /// Whether the OS has granted access to the device
    pub fn has_permission(&self, id: &DeviceId) -> Result<bool, DeviceError> {
        let device = self.get_device(id)?;
        Ok(self.host.has_permission(&device.raw))
    }

    /// Ask the OS for access to the device.
    ///
    /// `callback` is called with `true` right away when access is already
    /// granted; otherwise the host decides when to call it.
    pub fn request_permission(
        &self,
        id: &DeviceId,
        callback: PermissionCallback,
    ) -> Result<Device, DeviceError> {
        let device = self.get_device(id)?;
        if self.host.has_permission(&device.raw) {
            callback(true);
        } else {
            info!(device = %id, "requesting device permission");
            self.host.request_permission(&device.raw, callback);
        }
        Ok(device)
    }

    /// Open the device's port against a fresh OS connection.
    ///
    /// An already-open port is returned as is.
    pub fn open_connection(&self, id: &DeviceId) -> Result<Device, DeviceError> {
        let device = self.get_device(id)?;
        self.require_permission(&device)?;

        let mut port = device.port.lock();
        if port.is_open() {
            debug!(device = %id, "port already open");
        } else {
            let connection = self
                .host
                .open_device(&device.raw)
                .map_err(|source| DeviceError::Hardware { id: id.clone(), source })?;
            port.open(connection)
                .map_err(|source| DeviceError::Hardware { id: id.clone(), source })?;
            info!(device = %id, name = %device.name, chip = %device.chip, "port opened");
        }
        drop(port);

        Ok(device)
    }

    /// Close the device's port; closing a closed port succeeds.
    pub fn close_connection(&self, id: &DeviceId) -> Result<Device, DeviceError> {
        let device = self.get_device(id)?;
        self.require_permission(&device)?;

        let mut port = device.port.lock();
        if port.is_open() {
            port.close()
                .map_err(|source| DeviceError::Hardware { id: id.clone(), source })?;
            info!(device = %id, "port closed");
        }
        drop(port);

        Ok(device)
    }

    /// Read whatever the device has available, up to the buffer size
    pub fn read(&self, id: &DeviceId) -> Result<Bytes, DeviceError> {
        let device = self.get_device(id)?;
        let mut port = device.port.lock();
        if !port.is_open() {
            return Err(DeviceError::ConnectionClosed(id.clone()));
        }

        let mut buffer = vec![0u8; self.read_buffer_size];
        let n = port
            .read(&mut buffer, self.io_timeout)
            .map_err(|source| DeviceError::Hardware { id: id.clone(), source })?;
        buffer.truncate(n);
        debug!(device = %id, bytes = n, "read from port");

        Ok(Bytes::from(buffer))
    }

    /// Write the whole payload to the device
    pub fn write(&self, id: &DeviceId, data: &[u8]) -> Result<(), DeviceError> {
        let device = self.get_device(id)?;
        let mut port = device.port.lock();
        if !port.is_open() {
            return Err(DeviceError::ConnectionClosed(id.clone()));
        }

        port.write(data, self.io_timeout)
            .map_err(|source| DeviceError::Hardware { id: id.clone(), source })?;
        debug!(device = %id, bytes = data.len(), "wrote to port");

        Ok(())
    }

    fn resolve_driver(&self, raw: &RawDevice) -> Option<SerialDriver> {
        let host = self.host.as_ref();
        self.default_prober.probe(host, raw).or_else(|| {
            debug!(device = raw.device_id, "default prober found nothing, trying device-scoped prober");
            ProbeTable::for_device(raw).probe(host, raw)
        })
    }

    fn require_permission(&self, device: &Device) -> Result<(), DeviceError> {
        if self.host.has_permission(&device.raw) {
            Ok(())
        } else {
            warn!(device = %device.id, "permission denied");
            Err(DeviceError::PermissionDenied(device.id.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::{
        ChipFamily, HardwareError, LoopbackDevice, LoopbackHost, MockUsbHost,
    };

    fn registry_with(host: &LoopbackHost) -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(host.clone()))
    }

    #[test]
    fn test_multi_port_ids() {
        let host = LoopbackHost::new();
        host.attach(LoopbackDevice::new("FT4232H").device_id(12).ports(4));
        let ids: Vec<String> = registry_with(&host)
            .list_devices()
            .unwrap()
            .into_iter()
            .map(|d| d.id.to_string())
            .collect();
        assert_eq!(ids, vec!["12-0", "12-1", "12-2", "12-3"]);
    }

    #[test]
    fn test_fallback_prober_binds_unknown_product() {
        let host = LoopbackHost::new();
        host.attach(
            LoopbackDevice::new("custom")
                .device_id(5)
                .usb_id(0x1234, 0x5678)
                .chip(ChipFamily::Prolific),
        );
        let devices = registry_with(&host).list_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].chip, ChipFamily::Prolific);
    }

    #[test]
    fn test_unbindable_device_skipped() {
        let mut host = MockUsbHost::new();
        host.expect_enumerate().returning(|| {
            Ok(vec![RawDevice {
                device_id: 1,
                vendor_id: 0xffff,
                product_id: 0xffff,
                name: "hub".to_string(),
                manufacturer: None,
                serial_number: None,
                interfaces: Vec::new(),
            }])
        });
        host.expect_create_ports().returning(|_, _| Ok(Vec::new()));

        let registry = DeviceRegistry::new(Arc::new(host));
        assert!(registry.list_devices().unwrap().is_empty());
    }

    #[test]
    fn test_enumeration_failure_surfaces() {
        let mut host = MockUsbHost::new();
        host.expect_enumerate()
            .returning(|| Err(HardwareError::Unsupported("no usb".to_string())));
        let registry = DeviceRegistry::new(Arc::new(host));
        assert!(matches!(registry.list_devices(), Err(DeviceError::Enumeration(_))));
    }

    #[test]
    fn test_permission_denied_never_opens_device() {
        let loopback = LoopbackHost::new();
        loopback.attach(LoopbackDevice::new("locked").device_id(2));
        let raws = loopback.enumerate().unwrap();

        let mut host = MockUsbHost::new();
        let probe_host = loopback.clone();
        host.expect_enumerate().returning(move || Ok(raws.clone()));
        host.expect_create_ports()
            .returning(move |raw, family| probe_host.create_ports(raw, family));
        host.expect_has_permission().return_const(false);
        host.expect_open_device().never();

        let registry = DeviceRegistry::new(Arc::new(host));
        let id = DeviceId::new(2, 0);
        assert!(matches!(
            registry.open_connection(&id),
            Err(DeviceError::PermissionDenied(_))
        ));
        assert!(!registry.get_device(&id).unwrap().is_connected());
    }

    #[test]
    fn test_request_permission_short_circuits_when_granted() {
        let host = LoopbackHost::new();
        host.attach(LoopbackDevice::new("open").device_id(3));
        let registry = registry_with(&host);

        let (tx, rx) = std::sync::mpsc::channel();
        registry
            .request_permission(&DeviceId::new(3, 0), Box::new(move |granted: bool| tx.send(granted).unwrap()))
            .unwrap();
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn test_duplicate_open_reuses_port() {
        let host = LoopbackHost::new();
        host.attach(LoopbackDevice::new("dup").device_id(4));
        let registry = registry_with(&host);
        let id = DeviceId::new(4, 0);

        registry.open_connection(&id).unwrap();
        let again = registry.open_connection(&id).unwrap();
        assert!(again.is_connected());
        assert_eq!(host.open_count(4), 1);
    }

    #[test]
    fn test_read_trims_to_available_bytes() {
        let host = LoopbackHost::new();
        host.attach(LoopbackDevice::new("rx").device_id(6));
        let registry = registry_with(&host).read_buffer_size(4);
        let id = DeviceId::new(6, 0);
        registry.open_connection(&id).unwrap();

        host.inject_rx(6, 0, b"abcdef");
        assert_eq!(registry.read(&id).unwrap().as_ref(), b"abcd");
        assert_eq!(registry.read(&id).unwrap().as_ref(), b"ef");
        assert!(registry.read(&id).unwrap().is_empty());
    }

    #[test]
    fn test_detached_device_hardware_error() {
        let host = LoopbackHost::new();
        host.attach(LoopbackDevice::new("gone").device_id(8));
        let registry = registry_with(&host);
        let id = DeviceId::new(8, 0);
        registry.open_connection(&id).unwrap();

        host.detach(8);
        assert!(matches!(registry.read(&id), Err(DeviceError::NotFound(_))));
    }
}
