//! Chip-driver probing
//!
//! The supported driver set is closed: one [`ChipFamily`] per chip family.
//! A [`ProbeTable`] maps vendor/product ids to families and asks the host to
//! bind them in insertion order.

use super::{RawDevice, UsbHost, UsbSerialPort};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Supported USB-UART chip families, in probing priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChipFamily {
    /// USB CDC ACM class devices (Arduino, STM32 VCP, RP2040, ...)
    CdcAcm,
    /// FTDI FT232/FT2232/FT4232/FT-X
    Ftdi,
    /// WCH CH340/CH341/CH9102
    Ch34x,
    /// Silicon Labs CP210x
    Cp21xx,
    /// Prolific PL2303
    Prolific,
}

impl ChipFamily {
    /// Every family, in probing priority order
    pub const ALL: [ChipFamily; 5] = [
        ChipFamily::CdcAcm,
        ChipFamily::Ftdi,
        ChipFamily::Ch34x,
        ChipFamily::Cp21xx,
        ChipFamily::Prolific,
    ];

    /// Vendor/product ids the default prober recognises for this family
    pub fn known_products(self) -> &'static [(u16, u16)] {
        match self {
            Self::CdcAcm => &[
                (0x2341, 0x0001), // Arduino Uno (rev 1)
                (0x2341, 0x0010), // Arduino Mega 2560
                (0x2341, 0x0043), // Arduino Uno R3
                (0x0483, 0x5740), // STM32 virtual COM port
                (0x2e8a, 0x000a), // Raspberry Pi Pico SDK CDC
            ],
            Self::Ftdi => &[
                (0x0403, 0x6001), // FT232R
                (0x0403, 0x6010), // FT2232H
                (0x0403, 0x6011), // FT4232H
                (0x0403, 0x6014), // FT232H
                (0x0403, 0x6015), // FT231X
            ],
            Self::Ch34x => &[
                (0x1a86, 0x5523),
                (0x1a86, 0x7522),
                (0x1a86, 0x7523),
                (0x1a86, 0x55d4), // CH9102
            ],
            Self::Cp21xx => &[
                (0x10c4, 0xea60), // CP2102/CP2104
                (0x10c4, 0xea70), // CP2105
                (0x10c4, 0xea71), // CP2108
                (0x10c4, 0xea80), // CP2110
            ],
            Self::Prolific => &[
                (0x067b, 0x2303),
                (0x067b, 0x23a3),
                (0x067b, 0x23b3),
                (0x067b, 0x23c3),
                (0x067b, 0x23d3),
                (0x067b, 0x23e3),
                (0x067b, 0x23f3),
            ],
        }
    }
}

impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CdcAcm => write!(f, "CDC-ACM"),
            Self::Ftdi => write!(f, "FTDI"),
            Self::Ch34x => write!(f, "CH34x"),
            Self::Cp21xx => write!(f, "CP21xx"),
            Self::Prolific => write!(f, "Prolific"),
        }
    }
}

/// A driver bound to a device, with one port per serial endpoint
pub struct SerialDriver {
    /// Family of the bound driver
    pub family: ChipFamily,
    /// Fresh, closed ports
    pub ports: Vec<Box<dyn UsbSerialPort>>,
}

impl fmt::Debug for SerialDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialDriver")
            .field("family", &self.family)
            .field("ports", &self.ports.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProbeEntry {
    vendor_id: u16,
    product_id: u16,
    family: ChipFamily,
}

/// Vendor/product id → driver family lookup
#[derive(Debug, Clone, Default)]
pub struct ProbeTable {
    entries: Vec<ProbeEntry>,
}

impl ProbeTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Broad prober covering every known product of every family
    pub fn default_table() -> Self {
        let mut table = Self::new();
        for family in ChipFamily::ALL {
            for &(vendor_id, product_id) in family.known_products() {
                table.add_product(vendor_id, product_id, family);
            }
        }
        table
    }

    /// Narrow prober scoped to one device: every family is registered for
    /// exactly that vendor/product id, in priority order.
    pub fn for_device(device: &RawDevice) -> Self {
        let mut table = Self::new();
        for family in ChipFamily::ALL {
            table.add_product(device.vendor_id, device.product_id, family);
        }
        table
    }

    /// Register a product for a family
    pub fn add_product(&mut self, vendor_id: u16, product_id: u16, family: ChipFamily) -> &mut Self {
        let entry = ProbeEntry {
            vendor_id,
            product_id,
            family,
        };
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
        self
    }

    /// Families registered for a vendor/product id, in insertion order
    pub fn families_for(&self, vendor_id: u16, product_id: u16) -> impl Iterator<Item = ChipFamily> + '_ {
        self.entries
            .iter()
            .filter(move |e| e.vendor_id == vendor_id && e.product_id == product_id)
            .map(|e| e.family)
    }

    /// Number of registered entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bind the first family whose driver accepts the device.
    ///
    /// Binding failures are skipped, not raised.
    pub fn probe(&self, host: &dyn UsbHost, device: &RawDevice) -> Option<SerialDriver> {
        for family in self.families_for(device.vendor_id, device.product_id) {
            match host.create_ports(device, family) {
                Ok(ports) if !ports.is_empty() => {
                    return Some(SerialDriver { family, ports });
                }
                Ok(_) => {
                    debug!(device = device.device_id, %family, "driver rejected device");
                }
                Err(e) => {
                    debug!(device = device.device_id, %family, error = %e, "driver binding failed");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::{HardwareError, MockUsbHost, UsbConnection};
    use std::time::Duration;

    struct NullPort;

    impl UsbSerialPort for NullPort {
        fn port_number(&self) -> u8 {
            0
        }
        fn is_open(&self) -> bool {
            false
        }
        fn open(&mut self, _connection: UsbConnection) -> Result<(), HardwareError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), HardwareError> {
            Ok(())
        }
        fn read(&mut self, _buf: &mut [u8], _timeout: Duration) -> Result<usize, HardwareError> {
            Ok(0)
        }
        fn write(&mut self, _data: &[u8], _timeout: Duration) -> Result<(), HardwareError> {
            Ok(())
        }
    }

    fn raw(vendor_id: u16, product_id: u16) -> RawDevice {
        RawDevice {
            device_id: 1,
            vendor_id,
            product_id,
            name: "test".to_string(),
            manufacturer: None,
            serial_number: None,
            interfaces: vec!["loop0".to_string()],
        }
    }

    #[test]
    fn test_default_table_lookup() {
        let table = ProbeTable::default_table();
        assert_eq!(
            table.families_for(0x0403, 0x6001).collect::<Vec<_>>(),
            vec![ChipFamily::Ftdi]
        );
        assert_eq!(table.families_for(0xdead, 0xbeef).count(), 0);
    }

    #[test]
    fn test_narrow_table_priority() {
        let table = ProbeTable::for_device(&raw(0xdead, 0xbeef));
        assert_eq!(table.len(), ChipFamily::ALL.len());
        assert_eq!(
            table.families_for(0xdead, 0xbeef).collect::<Vec<_>>(),
            ChipFamily::ALL.to_vec()
        );
    }

    #[test]
    fn test_duplicate_entries_ignored() {
        let mut table = ProbeTable::new();
        table
            .add_product(1, 2, ChipFamily::Ftdi)
            .add_product(1, 2, ChipFamily::Ftdi);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_probe_skips_rejecting_and_failing_drivers() {
        let mut host = MockUsbHost::new();
        host.expect_create_ports().returning(|_, family| match family {
            ChipFamily::CdcAcm => Ok(Vec::new()),
            ChipFamily::Ftdi => Err(HardwareError::Unsupported("no ftdi".to_string())),
            _ => Ok(vec![Box::new(NullPort) as Box<dyn UsbSerialPort>]),
        });

        let device = raw(0xdead, 0xbeef);
        let driver = ProbeTable::for_device(&device)
            .probe(&host, &device)
            .expect("narrow prober binds CH34x");
        assert_eq!(driver.family, ChipFamily::Ch34x);
        assert_eq!(driver.ports.len(), 1);

        assert!(ProbeTable::default_table().probe(&host, &device).is_none());
    }
}
