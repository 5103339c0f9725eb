//! Native serial-port driver.
//!
//! Opens the OS serial port of an authorized device through tokio-serial and
//! registers its split halves, framed as raw byte chunks, in the shared
//! open-ports table.

use async_trait::async_trait;
use bytes::BytesMut;
use futures::TryStreamExt;
use std::io;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};

use super::Driver;
use crate::device::RawDevice;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::transport::{
    FlowControl, OpenOptions, Parity, PortIo, PortLink, PortTable, PortTransport, Transport,
};

/// Driver for devices exposed as OS serial ports.
pub struct NativeSerialDriver {
    default_baud_rate: u32,
    ports: PortTable,
}

impl NativeSerialDriver {
    pub fn new(default_baud_rate: u32, ports: PortTable) -> Self {
        Self {
            default_baud_rate,
            ports,
        }
    }
}

fn data_bits(bits: u8) -> Result<tokio_serial::DataBits> {
    match bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(Error::TransportOpen(format!("unsupported data bits: {}", other))),
    }
}

fn stop_bits(bits: u8) -> Result<tokio_serial::StopBits> {
    match bits {
        1 => Ok(tokio_serial::StopBits::One),
        2 => Ok(tokio_serial::StopBits::Two),
        other => Err(Error::TransportOpen(format!("unsupported stop bits: {}", other))),
    }
}

fn parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    }
}

fn flow_control(flow: FlowControl) -> tokio_serial::FlowControl {
    match flow {
        FlowControl::None => tokio_serial::FlowControl::None,
        FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        FlowControl::Software => tokio_serial::FlowControl::Software,
    }
}

// The split halves own the file descriptor; it closes once both are gone.
struct SerialLink {
    path: String,
}

#[async_trait]
impl PortLink for SerialLink {
    fn describe(&self) -> String {
        self.path.clone()
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Driver for NativeSerialDriver {
    fn name(&self) -> &str {
        "native-serial"
    }

    fn matches(&self, _vendor_id: u16, _product_id: u16) -> bool {
        true
    }

    async fn open(&self, device: RawDevice, options: &OpenOptions) -> Result<Box<dyn Transport>> {
        let device_id = device.device_id();
        let Some(path) = device.port_path else {
            return Err(Error::TransportOpen(format!(
                "device {} has no serial port",
                device_id
            )));
        };
        if self.ports.is_open(&device_id) {
            return Err(Error::AlreadyOpen(device_id));
        }

        let baud_rate = options.baud_rate_or(self.default_baud_rate);
        let stream = tokio_serial::new(&path, baud_rate)
            .data_bits(data_bits(options.data_bits)?)
            .stop_bits(stop_bits(options.stop_bits)?)
            .parity(parity(options.parity))
            .flow_control(flow_control(options.flow_control))
            .open_native_async()
            .map_err(|e| Error::TransportOpen(format!("{}: {}", path, e)))?;

        let (reader, writer) = tokio::io::split(stream);
        let io = PortIo {
            link: Box::new(SerialLink { path: path.clone() }),
            reader: Box::pin(FramedRead::new(reader, BytesCodec::new()).map_ok(BytesMut::freeze)),
            writer: Box::pin(FramedWrite::new(writer, BytesCodec::new())),
        };
        self.ports.open(device_id.clone(), io)?;

        info!(device = %device_id, port = %path, baud_rate, "Serial port opened");
        Ok(Box::new(PortTransport::new(device_id, self.ports.clone())))
    }
}
