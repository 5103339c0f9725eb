//! Byte transports to open devices.
//!
//! A `Transport` is an exclusive, byte-oriented channel to one device. The
//! transports shipped with this crate keep their streams in a `PortTable`
//! and address them by device ID; `PortTransport` is the handle a
//! connection holds onto one of those entries.

pub mod port_table;

pub use port_table::{ByteReader, ByteWriter, PortIo, PortLink, PortTable};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::error::Result;

/// Baud rate used when neither the request nor the config names one.
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// An open, exclusive channel to one device.
#[async_trait]
pub trait Transport: Send {
    fn device_id(&self) -> &DeviceId;

    /// Write all of `data`, returning once the device side accepted it.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read up to `size` bytes. Returns fewer only if the stream ended.
    async fn read(&mut self, size: usize) -> Result<Vec<u8>>;

    /// Read through the next `\n` inclusive, or until the stream ends.
    async fn read_line(&mut self) -> Result<Vec<u8>>;

    /// Release the device. The transport is unusable afterwards.
    async fn close(&mut self) -> Result<()>;
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Hardware,
    Software,
}

/// Line settings supplied with an open request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOptions {
    /// Falls back to the driver's configured default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baud_rate: Option<u32>,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub flow_control: FlowControl,
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            baud_rate: None,
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

impl OpenOptions {
    pub fn with_baud_rate(baud_rate: u32) -> Self {
        Self {
            baud_rate: Some(baud_rate),
            ..Self::default()
        }
    }

    pub fn baud_rate_or(&self, default: u32) -> u32 {
        self.baud_rate.unwrap_or(default)
    }
}

/// Transport backed by an entry in a `PortTable`.
pub struct PortTransport {
    device_id: DeviceId,
    ports: PortTable,
}

impl PortTransport {
    pub fn new(device_id: DeviceId, ports: PortTable) -> Self {
        Self { device_id, ports }
    }
}

#[async_trait]
impl Transport for PortTransport {
    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ports.write(&self.device_id, data).await
    }

    async fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        self.ports.read(&self.device_id, size).await
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        self.ports.read_line(&self.device_id).await
    }

    async fn close(&mut self) -> Result<()> {
        self.ports.close(&self.device_id).await
    }
}
