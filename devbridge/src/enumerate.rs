//! Enumeration of authorized devices.
//!
//! The connection manager never touches the OS device lists itself; it asks
//! a `DeviceEnumerator` for the devices the user has authorized and picks
//! one by identity.

use async_trait::async_trait;
use tokio_serial::SerialPortType;

use crate::config::Config;
use crate::device::{DeviceIdentity, RawDevice, UsbAddress};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Source of authorized raw devices.
#[async_trait]
pub trait DeviceEnumerator: Send + Sync {
    async fn authorized_devices(&self) -> Result<Vec<RawDevice>>;

    /// First authorized device with this identity.
    async fn find(&self, identity: DeviceIdentity) -> Result<RawDevice> {
        self.authorized_devices()
            .await?
            .into_iter()
            .find(|d| d.identity == identity)
            .ok_or(Error::DeviceNotFound(identity))
    }
}

/// Fixed list of devices, for tests and mock-only runs.
#[derive(Debug, Clone, Default)]
pub struct StaticEnumerator {
    devices: Vec<RawDevice>,
}

impl StaticEnumerator {
    pub fn new(devices: Vec<RawDevice>) -> Self {
        Self { devices }
    }

    /// Virtual devices for each (vendor, product) pair.
    pub fn virtual_devices(ids: &[(u16, u16)]) -> Self {
        Self::new(
            ids.iter()
                .map(|&(vid, pid)| RawDevice::virtual_device(DeviceIdentity::new(vid, pid)))
                .collect(),
        )
    }
}

#[async_trait]
impl DeviceEnumerator for StaticEnumerator {
    async fn authorized_devices(&self) -> Result<Vec<RawDevice>> {
        Ok(self.devices.clone())
    }
}

/// Devices present on this machine, filtered by the configured allow-list.
///
/// USB devices found by nusb are merged with the USB serial ports reported
/// by the OS, so a device carries both access paths when it has them.
pub struct SystemEnumerator {
    config: Config,
}

impl SystemEnumerator {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

/// A serial port backed by a USB device.
#[derive(Debug, Clone)]
struct UsbPort {
    identity: DeviceIdentity,
    serial_number: Option<String>,
    product: Option<String>,
    path: String,
}

fn usb_serial_ports() -> Vec<UsbPort> {
    let ports = match tokio_serial::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!(error = %e, "Failed to list serial ports");
            return Vec::new();
        }
    };
    ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) => Some(UsbPort {
                identity: DeviceIdentity::new(usb.vid, usb.pid),
                serial_number: usb.serial_number,
                product: usb.product,
                path: port.port_name,
            }),
            _ => None,
        })
        .collect()
}

/// Attach serial port paths to USB devices with the same identity and
/// serial number. Ports with no USB match are kept as port-only devices.
fn merge(mut devices: Vec<RawDevice>, ports: Vec<UsbPort>) -> Vec<RawDevice> {
    for port in ports {
        let existing = devices.iter_mut().find(|d| {
            d.port_path.is_none()
                && d.identity == port.identity
                && (d.serial_number.is_none() || d.serial_number == port.serial_number)
        });
        match existing {
            Some(device) => device.port_path = Some(port.path),
            None => devices.push(RawDevice {
                identity: port.identity,
                serial_number: port.serial_number,
                product: port.product,
                port_path: Some(port.path),
                usb: None,
            }),
        }
    }
    devices
}

#[async_trait]
impl DeviceEnumerator for SystemEnumerator {
    async fn authorized_devices(&self) -> Result<Vec<RawDevice>> {
        let usb_devices: Vec<RawDevice> = match nusb::list_devices().await {
            Ok(devices) => devices
                .map(|d| RawDevice {
                    identity: DeviceIdentity::new(d.vendor_id(), d.product_id()),
                    serial_number: d.serial_number().map(str::to_string),
                    product: d.product_string().map(str::to_string),
                    port_path: None,
                    usb: Some(UsbAddress {
                        bus_id: d.bus_id().to_string(),
                        device_address: d.device_address(),
                    }),
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list USB devices");
                Vec::new()
            }
        };

        let ports = tokio::task::spawn_blocking(usb_serial_ports)
            .await
            .map_err(|e| Error::Enumeration(e.to_string()))?;

        let devices: Vec<RawDevice> = merge(usb_devices, ports)
            .into_iter()
            .filter(|d| self.config.is_authorized(&d.identity))
            .collect();
        trace!(count = devices.len(), "Enumerated authorized devices");
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb_device(vid: u16, pid: u16, serial: Option<&str>, address: u8) -> RawDevice {
        RawDevice {
            identity: DeviceIdentity::new(vid, pid),
            serial_number: serial.map(str::to_string),
            product: None,
            port_path: None,
            usb: Some(UsbAddress {
                bus_id: "1".into(),
                device_address: address,
            }),
        }
    }

    fn port(vid: u16, pid: u16, serial: Option<&str>, path: &str) -> UsbPort {
        UsbPort {
            identity: DeviceIdentity::new(vid, pid),
            serial_number: serial.map(str::to_string),
            product: None,
            path: path.into(),
        }
    }

    #[test]
    fn test_merge_attaches_port_by_serial() {
        let merged = merge(
            vec![
                usb_device(0x0403, 0x6001, Some("A"), 4),
                usb_device(0x0403, 0x6001, Some("B"), 5),
            ],
            vec![port(0x0403, 0x6001, Some("B"), "/dev/ttyUSB1")],
        );

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].port_path, None);
        assert_eq!(merged[1].port_path.as_deref(), Some("/dev/ttyUSB1"));
    }

    #[test]
    fn test_merge_keeps_unmatched_ports() {
        let merged = merge(vec![], vec![port(0x10c4, 0xea60, None, "/dev/ttyUSB0")]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].usb.is_none());
    }

    #[tokio::test]
    async fn test_static_find() {
        let enumerator = StaticEnumerator::virtual_devices(&[(0x0403, 0x6001)]);

        let found = enumerator.find(DeviceIdentity::new(0x0403, 0x6001)).await.unwrap();
        assert_eq!(found.device_id().as_str(), "usb-0403-6001");

        let err = enumerator.find(DeviceIdentity::new(0x0403, 0x6015)).await.unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
    }
}
