//! Device identity and raw device handles.
//!
//! A `DeviceIdentity` is the USB vendor/product pair used to pick a driver.
//! The `DeviceId` derived from it is the key under which connections and
//! open ports are tracked, and the string sandboxed callers use to address
//! a device.

use serde::{Deserialize, Serialize};
use std::fmt;

/// USB vendor and product IDs for device identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// The deterministic identifier for this identity.
    pub fn device_id(&self) -> DeviceId {
        DeviceId(format!("usb-{:04x}-{:04x}", self.vendor_id, self.product_id))
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Identifier of a connection, `usb-{vid:04x}-{pid:04x}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
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
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Location of a device on the USB bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbAddress {
    pub bus_id: String,
    pub device_address: u8,
}

/// An authorized device handle, as produced by a `DeviceEnumerator`.
///
/// A device may be reachable as an OS serial port, directly on the USB
/// bus, or both. Drivers pick whichever access path they need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDevice {
    pub identity: DeviceIdentity,
    pub serial_number: Option<String>,
    pub product: Option<String>,
    /// Serial port path (e.g., /dev/ttyACM0)
    pub port_path: Option<String>,
    pub usb: Option<UsbAddress>,
}

impl RawDevice {
    /// A device reachable only through a serial port path.
    pub fn serial(identity: DeviceIdentity, port_path: impl Into<String>) -> Self {
        Self {
            identity,
            serial_number: None,
            product: None,
            port_path: Some(port_path.into()),
            usb: None,
        }
    }

    /// A device with no physical access path, for mock drivers.
    pub fn virtual_device(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            serial_number: None,
            product: None,
            port_path: None,
            usb: None,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.identity.device_id()
    }
}
