//! Loopback USB host
//!
//! An in-memory [`UsbHost`] with scripted devices. Data written to a port is
//! recorded (and optionally echoed back); data "sent by the device" is
//! injected with [`LoopbackHost::inject_rx`]. Reads never block.

use super::{
    ChipFamily, HardwareError, PermissionCallback, RawDevice, UsbConnection, UsbHost,
    UsbSerialPort,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Description of a simulated device
#[derive(Debug, Clone)]
pub struct LoopbackDevice {
    device_id: Option<u32>,
    name: String,
    vendor_id: u16,
    product_id: u16,
    chip: ChipFamily,
    ports: u8,
    permission: bool,
    grant_on_request: bool,
    echo: bool,
}

impl LoopbackDevice {
    /// A single-port FTDI FT232R with permission granted
    pub fn new(name: &str) -> Self {
        Self {
            device_id: None,
            name: name.to_string(),
            vendor_id: 0x0403,
            product_id: 0x6001,
            chip: ChipFamily::Ftdi,
            ports: 1,
            permission: true,
            grant_on_request: true,
            echo: false,
        }
    }

    /// Pin the raw device id
    #[must_use]
    pub fn device_id(mut self, id: u32) -> Self {
        self.device_id = Some(id);
        self
    }

    /// Set vendor/product id
    #[must_use]
    pub fn usb_id(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = vendor_id;
        self.product_id = product_id;
        self
    }

    /// Set the only chip family whose driver accepts the device
    #[must_use]
    pub fn chip(mut self, chip: ChipFamily) -> Self {
        self.chip = chip;
        self
    }

    /// Set number of serial ports
    #[must_use]
    pub fn ports(mut self, ports: u8) -> Self {
        self.ports = ports;
        self
    }

    /// Set whether OS permission is already granted
    #[must_use]
    pub fn permission(mut self, granted: bool) -> Self {
        self.permission = granted;
        self
    }

    /// Set the answer given when permission is requested
    #[must_use]
    pub fn grant_on_request(mut self, grant: bool) -> Self {
        self.grant_on_request = grant;
        self
    }

    /// Echo written bytes back into the receive buffer
    #[must_use]
    pub fn echo(mut self, enable: bool) -> Self {
        self.echo = enable;
        self
    }
}

#[derive(Debug, Default)]
struct Channel {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

struct Attached {
    raw: RawDevice,
    spec: LoopbackDevice,
    channels: Vec<Arc<Mutex<Channel>>>,
    present: Arc<AtomicBool>,
    opens: Arc<AtomicUsize>,
}

#[derive(Default)]
struct HostState {
    devices: Vec<Attached>,
    next_id: u32,
}

/// In-memory USB host
#[derive(Clone, Default)]
pub struct LoopbackHost {
    state: Arc<Mutex<HostState>>,
}

impl LoopbackHost {
    /// Create a host with no devices attached
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device; returns its raw device id
    pub fn attach(&self, spec: LoopbackDevice) -> u32 {
        let mut state = self.state.lock();
        let device_id = spec.device_id.unwrap_or_else(|| {
            state.next_id += 1;
            1000 + state.next_id
        });
        let raw = RawDevice {
            device_id,
            vendor_id: spec.vendor_id,
            product_id: spec.product_id,
            name: spec.name.clone(),
            manufacturer: Some("Loopback".to_string()),
            serial_number: Some(format!("LB{device_id:06}")),
            interfaces: (0..spec.ports).map(|p| format!("loop{device_id}.{p}")).collect(),
        };
        let channels = (0..spec.ports)
            .map(|_| Arc::new(Mutex::new(Channel::default())))
            .collect();
        state.devices.retain(|d| d.raw.device_id != device_id);
        state.devices.push(Attached {
            raw,
            spec,
            channels,
            present: Arc::new(AtomicBool::new(true)),
            opens: Arc::new(AtomicUsize::new(0)),
        });
        device_id
    }

    /// Detach a device; its ports report `Disconnected` afterwards
    pub fn detach(&self, device_id: u32) {
        let mut state = self.state.lock();
        if let Some(pos) = state.devices.iter().position(|d| d.raw.device_id == device_id) {
            let device = state.devices.remove(pos);
            device.present.store(false, Ordering::SeqCst);
        }
    }

    /// Grant or revoke OS permission
    pub fn set_permission(&self, device_id: u32, granted: bool) {
        self.with_device(device_id, |d| d.spec.permission = granted);
    }

    /// Queue bytes the device will deliver on the next reads
    pub fn inject_rx(&self, device_id: u32, port_number: u8, data: &[u8]) {
        if let Some(channel) = self.channel(device_id, port_number) {
            channel.lock().rx.extend(data);
        }
    }

    /// Take every byte written to the port so far
    pub fn take_tx(&self, device_id: u32, port_number: u8) -> Vec<u8> {
        self.channel(device_id, port_number)
            .map(|c| std::mem::take(&mut c.lock().tx))
            .unwrap_or_default()
    }

    /// How many times a port of this device was opened
    pub fn open_count(&self, device_id: u32) -> usize {
        let state = self.state.lock();
        state
            .devices
            .iter()
            .find(|d| d.raw.device_id == device_id)
            .map_or(0, |d| d.opens.load(Ordering::SeqCst))
    }

    fn with_device(&self, device_id: u32, f: impl FnOnce(&mut Attached)) {
        let mut state = self.state.lock();
        if let Some(device) = state.devices.iter_mut().find(|d| d.raw.device_id == device_id) {
            f(device);
        }
    }

    fn channel(&self, device_id: u32, port_number: u8) -> Option<Arc<Mutex<Channel>>> {
        let state = self.state.lock();
        state
            .devices
            .iter()
            .find(|d| d.raw.device_id == device_id)
            .and_then(|d| d.channels.get(usize::from(port_number)).cloned())
    }
}

impl UsbHost for LoopbackHost {
    fn enumerate(&self) -> Result<Vec<RawDevice>, HardwareError> {
        Ok(self.state.lock().devices.iter().map(|d| d.raw.clone()).collect())
    }

    fn create_ports(
        &self,
        device: &RawDevice,
        family: ChipFamily,
    ) -> Result<Vec<Box<dyn UsbSerialPort>>, HardwareError> {
        let state = self.state.lock();
        let attached = state
            .devices
            .iter()
            .find(|d| d.raw.device_id == device.device_id)
            .ok_or(HardwareError::Disconnected)?;
        if attached.spec.chip != family {
            return Ok(Vec::new());
        }
        Ok((0u8..)
            .zip(attached.channels.iter())
            .map(|(port_number, channel)| {
                Box::new(LoopbackPort {
                    device_id: device.device_id,
                    port_number,
                    open: false,
                    echo: attached.spec.echo,
                    channel: channel.clone(),
                    present: attached.present.clone(),
                    opens: attached.opens.clone(),
                }) as Box<dyn UsbSerialPort>
            })
            .collect())
    }

    fn has_permission(&self, device: &RawDevice) -> bool {
        let state = self.state.lock();
        state
            .devices
            .iter()
            .find(|d| d.raw.device_id == device.device_id)
            .is_some_and(|d| d.spec.permission)
    }

    fn request_permission(&self, device: &RawDevice, callback: PermissionCallback) {
        let granted = {
            let mut state = self.state.lock();
            match state.devices.iter_mut().find(|d| d.raw.device_id == device.device_id) {
                Some(d) => {
                    if d.spec.grant_on_request {
                        d.spec.permission = true;
                    }
                    d.spec.permission
                }
                None => false,
            }
        };
        callback(granted);
    }

    fn open_device(&self, device: &RawDevice) -> Result<UsbConnection, HardwareError> {
        let state = self.state.lock();
        if state.devices.iter().any(|d| d.raw.device_id == device.device_id) {
            Ok(UsbConnection::new(device))
        } else {
            Err(HardwareError::Disconnected)
        }
    }
}

struct LoopbackPort {
    device_id: u32,
    port_number: u8,
    open: bool,
    echo: bool,
    channel: Arc<Mutex<Channel>>,
    present: Arc<AtomicBool>,
    opens: Arc<AtomicUsize>,
}

impl LoopbackPort {
    fn ensure_usable(&self) -> Result<(), HardwareError> {
        if !self.present.load(Ordering::SeqCst) {
            return Err(HardwareError::Disconnected);
        }
        if !self.open {
            return Err(HardwareError::NotOpen);
        }
        Ok(())
    }
}

impl UsbSerialPort for LoopbackPort {
    fn port_number(&self) -> u8 {
        self.port_number
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn open(&mut self, connection: UsbConnection) -> Result<(), HardwareError> {
        if connection.device_id() != self.device_id {
            return Err(HardwareError::Unsupported(format!(
                "connection belongs to device {}",
                connection.device_id()
            )));
        }
        if !self.present.load(Ordering::SeqCst) {
            return Err(HardwareError::Disconnected);
        }
        self.open = true;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<(), HardwareError> {
        self.open = false;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, HardwareError> {
        self.ensure_usable()?;
        let mut channel = self.channel.lock();
        let n = buf.len().min(channel.rx.len());
        for (slot, byte) in buf.iter_mut().zip(channel.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<(), HardwareError> {
        self.ensure_usable()?;
        let mut channel = self.channel.lock();
        channel.tx.extend_from_slice(data);
        if self.echo {
            channel.rx.extend(data);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_and_enumerate() {
        let host = LoopbackHost::new();
        let id = host.attach(LoopbackDevice::new("FT2232").ports(2));
        let raws = host.enumerate().unwrap();
        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0].device_id, id);
        assert_eq!(raws[0].interfaces.len(), 2);

        host.detach(id);
        assert!(host.enumerate().unwrap().is_empty());
    }

    #[test]
    fn test_only_matching_family_binds() {
        let host = LoopbackHost::new();
        host.attach(LoopbackDevice::new("CP2102").device_id(4).chip(ChipFamily::Cp21xx));
        let raw = host.enumerate().unwrap().remove(0);
        assert!(host.create_ports(&raw, ChipFamily::Ftdi).unwrap().is_empty());
        assert_eq!(host.create_ports(&raw, ChipFamily::Cp21xx).unwrap().len(), 1);
    }

    #[test]
    fn test_echo_port_io() {
        let host = LoopbackHost::new();
        let id = host.attach(LoopbackDevice::new("echo").echo(true));
        let raw = host.enumerate().unwrap().remove(0);
        let mut port = host.create_ports(&raw, ChipFamily::Ftdi).unwrap().remove(0);

        let mut buf = [0u8; 8];
        assert!(matches!(port.read(&mut buf, Duration::ZERO), Err(HardwareError::NotOpen)));

        port.open(host.open_device(&raw).unwrap()).unwrap();
        port.write(b"ping", Duration::ZERO).unwrap();
        assert_eq!(port.read(&mut buf, Duration::ZERO).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(host.take_tx(id, 0), b"ping");
        assert_eq!(host.open_count(id), 1);
    }

    #[test]
    fn test_permission_request() {
        let host = LoopbackHost::new();
        host.attach(LoopbackDevice::new("locked").device_id(9).permission(false));
        let raw = host.enumerate().unwrap().remove(0);
        assert!(!host.has_permission(&raw));

        let (tx, rx) = std::sync::mpsc::channel();
        host.request_permission(&raw, Box::new(move |granted| tx.send(granted).unwrap()));
        assert!(rx.recv().unwrap());
        assert!(host.has_permission(&raw));
    }
}
