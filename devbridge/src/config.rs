//! Configuration management for devbridge.
//!
//! Configuration is read from a TOML file named by `DEVBRIDGE_CONFIG`, with
//! every section optional. A few settings may be overridden from the
//! environment.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::device::DeviceIdentity;
use crate::error::{Error, Result};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "DEVBRIDGE_CONFIG";

/// Environment variable overriding `io.timeout_ms`.
pub const IO_TIMEOUT_ENV: &str = "DEVBRIDGE_IO_TIMEOUT_MS";

/// Main configuration structure for the bridge.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Message channel configuration
    pub channel: ChannelConfig,

    /// Device I/O configuration
    pub io: IoConfig,

    /// Native serial port defaults
    pub serial: SerialConfig,

    /// Devices the sandbox may open; empty allows every device present
    pub authorized_devices: Vec<DeviceIdentity>,

    /// Devices to drive as CDC-ACM over raw USB instead of an OS port
    pub usb_serial: Vec<UsbSerialDeviceConfig>,
}

/// Message channel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Logical channel name
    pub name: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: crate::channel::DEFAULT_CHANNEL_NAME.to_string(),
        }
    }
}

/// Device I/O configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IoConfig {
    /// Upper bound on a single read, read_line or write; none waits forever
    pub timeout_ms: Option<u64>,
}

impl IoConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Native serial port defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Baud rate used when an open request does not name one
    pub default_baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            default_baud_rate: crate::transport::DEFAULT_BAUD_RATE,
        }
    }
}

/// A device driven as CDC-ACM over raw USB bulk endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UsbSerialDeviceConfig {
    pub vendor_id: u16,
    pub product_id: u16,

    /// Interface receiving CDC class requests
    #[serde(default)]
    pub control_interface: u8,

    /// Interface owning the bulk endpoints
    #[serde(default = "default_data_interface")]
    pub data_interface: u8,

    #[serde(default = "default_endpoint_in")]
    pub endpoint_in: u8,

    #[serde(default = "default_endpoint_out")]
    pub endpoint_out: u8,
}

fn default_data_interface() -> u8 {
    1
}

fn default_endpoint_in() -> u8 {
    0x82
}

fn default_endpoint_out() -> u8 {
    0x02
}

impl UsbSerialDeviceConfig {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.vendor_id, self.product_id)
    }
}

impl Config {
    /// Load configuration from the file named by `DEVBRIDGE_CONFIG`, or
    /// defaults if unset, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::load_from(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    /// Parse configuration from TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var(IO_TIMEOUT_ENV) {
            let ms = value.parse::<u64>().map_err(|_| {
                Error::Config(format!("{} must be an integer, got {:?}", IO_TIMEOUT_ENV, value))
            })?;
            self.io.timeout_ms = Some(ms);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel.name.is_empty() {
            return Err(Error::Config("channel.name must not be empty".into()));
        }
        if self.serial.default_baud_rate == 0 {
            return Err(Error::Config("serial.default_baud_rate must be non-zero".into()));
        }
        Ok(())
    }

    /// Whether the sandbox may open this device.
    pub fn is_authorized(&self, identity: &DeviceIdentity) -> bool {
        self.authorized_devices.is_empty() || self.authorized_devices.contains(identity)
    }
}
