//! Device drivers and the registry that selects them.
//!
//! A driver claims devices by vendor/product ID and knows how to turn an
//! authorized raw device into a live `Transport`. The registry is an ordered
//! list: the first driver whose predicate matches wins, so more specific
//! drivers must be registered before catch-all ones.

pub mod mock;
pub mod native;
pub mod usb_serial;

pub use mock::MockDriver;
pub use native::NativeSerialDriver;
pub use usb_serial::UsbSerialDriver;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::config::Config;
use crate::device::{DeviceIdentity, RawDevice};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::transport::{OpenOptions, PortTable, Transport};

/// A driver for a class of devices.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this driver can service the given identity.
    fn matches(&self, vendor_id: u16, product_id: u16) -> bool;

    /// Open the raw device into a live transport.
    async fn open(&self, device: RawDevice, options: &OpenOptions) -> Result<Box<dyn Transport>>;
}

/// Ordered collection of drivers.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<Vec<Arc<dyn Driver>>>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the drivers this build supports.
    ///
    /// The USB-serial driver goes first so configured devices are driven
    /// over raw USB even though the native driver would accept them too.
    /// Both drivers share one open-ports table.
    pub fn with_default_drivers(config: &Config) -> Self {
        let registry = Self::new();
        let ports = PortTable::new();
        if !config.usb_serial.is_empty() {
            registry.register(Arc::new(UsbSerialDriver::new(
                config.usb_serial.clone(),
                config.serial.default_baud_rate,
                ports.clone(),
            )));
        }
        registry.register(Arc::new(NativeSerialDriver::new(
            config.serial.default_baud_rate,
            ports,
        )));
        registry
    }

    /// Create a registry holding only a match-all mock driver.
    pub fn with_test_registry() -> (Self, MockDriver) {
        let registry = Self::new();
        let mock = registry.enable_test_mode();
        (registry, mock)
    }

    /// Append a driver. Earlier registrations take precedence.
    pub fn register(&self, driver: Arc<dyn Driver>) {
        debug!(driver = driver.name(), "Registering driver");
        self.drivers.write().push(driver);
    }

    /// Remove a previously registered driver. Returns whether it was found.
    pub fn unregister(&self, driver: &Arc<dyn Driver>) -> bool {
        let mut drivers = self.drivers.write();
        let before = drivers.len();
        drivers.retain(|d| !Arc::ptr_eq(d, driver));
        drivers.len() != before
    }

    /// Remove every driver.
    pub fn reset(&self) {
        self.drivers.write().clear();
    }

    /// Replace all drivers with a single match-all mock driver.
    pub fn enable_test_mode(&self) -> MockDriver {
        let mock = MockDriver::new();
        self.reset();
        self.register(Arc::new(mock.clone()));
        mock
    }

    /// Find the first driver claiming this identity.
    pub fn resolve(&self, vendor_id: u16, product_id: u16) -> Result<Arc<dyn Driver>> {
        self.drivers
            .read()
            .iter()
            .find(|d| d.matches(vendor_id, product_id))
            .cloned()
            .ok_or(Error::DriverNotFound(DeviceIdentity::new(vendor_id, product_id)))
    }

    /// Names of the registered drivers, in precedence order.
    pub fn drivers(&self) -> Vec<String> {
        self.drivers.read().iter().map(|d| d.name().to_string()).collect()
    }
}
