//! Serial-over-USB driver for devices without a usable OS serial port.
//!
//! Some CDC-ACM devices have no kernel driver bound (or one the user cannot
//! access), so they never show up as a serial port. This driver claims their
//! interfaces directly through nusb, programs the line with the CDC class
//! requests, and exposes the bulk endpoints as a byte-chunk stream and sink.
//!
//! Only devices listed in the `usb_serial` config section are claimed; the
//! endpoint layout varies between devices and is taken from that entry.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{ready, Sink, Stream};
use nusb::transfer::{Bulk, ControlOut, ControlType, In, Out, Recipient, TransferError};
use nusb::{Endpoint, Interface};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use super::Driver;
use crate::config::UsbSerialDeviceConfig;
use crate::device::RawDevice;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::transport::{OpenOptions, Parity, PortIo, PortLink, PortTable, PortTransport, Transport};

/// Timeout for USB control transfers
const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Bytes requested per bulk IN transfer; a multiple of every max packet size
const READ_TRANSFER_SIZE: usize = 4096;

/// Bulk IN transfers kept in flight
const READ_TRANSFERS: usize = 4;

// CDC PSTN subclass requests
const SET_LINE_CODING: u8 = 0x20;
const SET_CONTROL_LINE_STATE: u8 = 0x22;
const LINE_STATE_DTR: u16 = 0x01;
const LINE_STATE_RTS: u16 = 0x02;

/// Driver for configured CDC-ACM devices accessed over raw USB.
pub struct UsbSerialDriver {
    devices: Vec<UsbSerialDeviceConfig>,
    default_baud_rate: u32,
    ports: PortTable,
}

impl UsbSerialDriver {
    pub fn new(
        devices: Vec<UsbSerialDeviceConfig>,
        default_baud_rate: u32,
        ports: PortTable,
    ) -> Self {
        Self {
            devices,
            default_baud_rate,
            ports,
        }
    }

    fn device_config(&self, vendor_id: u16, product_id: u16) -> Option<&UsbSerialDeviceConfig> {
        self.devices
            .iter()
            .find(|d| d.vendor_id == vendor_id && d.product_id == product_id)
    }
}

/// Encode a CDC line coding structure (dwDTERate, bCharFormat, bParityType,
/// bDataBits).
fn line_coding(baud_rate: u32, options: &OpenOptions) -> Result<[u8; 7]> {
    let char_format = match options.stop_bits {
        1 => 0,
        2 => 2,
        other => return Err(Error::TransportOpen(format!("unsupported stop bits: {}", other))),
    };
    let parity = match options.parity {
        Parity::None => 0,
        Parity::Odd => 1,
        Parity::Even => 2,
    };
    if !(5..=8).contains(&options.data_bits) {
        return Err(Error::TransportOpen(format!(
            "unsupported data bits: {}",
            options.data_bits
        )));
    }

    let mut coding = [0u8; 7];
    coding[..4].copy_from_slice(&baud_rate.to_le_bytes());
    coding[4] = char_format;
    coding[5] = parity;
    coding[6] = options.data_bits;
    Ok(coding)
}

async fn set_control_line_state(interface: &Interface, index: u8, state: u16) -> io::Result<()> {
    interface
        .control_out(
            ControlOut {
                control_type: ControlType::Class,
                recipient: Recipient::Interface,
                request: SET_CONTROL_LINE_STATE,
                value: state,
                index: index as u16,
                data: &[],
            },
            CONTROL_TIMEOUT,
        )
        .await
        .map_err(|e| io::Error::other(format!("SET_CONTROL_LINE_STATE failed: {}", e)))
}

fn transfer_error(e: TransferError) -> io::Error {
    match e {
        TransferError::Disconnected => io::Error::new(io::ErrorKind::NotConnected, e.to_string()),
        other => io::Error::other(other.to_string()),
    }
}

// Stream of bulk IN payloads. Ends when the device goes away.
struct BulkReader {
    endpoint: Endpoint<Bulk, In>,
    ended: bool,
}

impl Stream for BulkReader {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.ended {
            return Poll::Ready(None);
        }
        loop {
            while this.endpoint.pending() < READ_TRANSFERS {
                let buffer = this.endpoint.allocate(READ_TRANSFER_SIZE);
                this.endpoint.submit(buffer);
            }

            let completion = ready!(this.endpoint.poll_next_complete(cx));
            match completion.status {
                Ok(()) if completion.actual_len == 0 => continue,
                Ok(()) => {
                    let data = &completion.buffer[..completion.actual_len];
                    return Poll::Ready(Some(Ok(Bytes::copy_from_slice(data))));
                }
                Err(TransferError::Disconnected) | Err(TransferError::Cancelled) => {
                    this.ended = true;
                    return Poll::Ready(None);
                }
                Err(e) => return Poll::Ready(Some(Err(transfer_error(e)))),
            }
        }
    }
}

// Sink submitting one bulk OUT transfer per chunk; flush waits for all.
struct BulkWriter {
    endpoint: Endpoint<Bulk, Out>,
}

impl Sink<Bytes> for BulkWriter {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }

    fn start_send(self: Pin<&mut Self>, data: Bytes) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let this = self.get_mut();
        let mut buffer = this.endpoint.allocate(data.len());
        buffer.extend_from_slice(&data);
        this.endpoint.submit(buffer);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.endpoint.pending() > 0 {
            let completion = ready!(this.endpoint.poll_next_complete(cx));
            completion.status.map_err(transfer_error)?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

struct UsbLink {
    location: String,
    control: Interface,
    control_number: u8,
    // Held only to keep the claim; None when it equals the control interface
    _data: Option<Interface>,
}

#[async_trait]
impl PortLink for UsbLink {
    fn describe(&self) -> String {
        self.location.clone()
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        // Drop DTR/RTS so the device sees the host go away
        set_control_line_state(&self.control, self.control_number, 0).await
    }
}

#[async_trait]
impl Driver for UsbSerialDriver {
    fn name(&self) -> &str {
        "usb-serial"
    }

    fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.device_config(vendor_id, product_id).is_some()
    }

    async fn open(&self, device: RawDevice, options: &OpenOptions) -> Result<Box<dyn Transport>> {
        let device_id = device.device_id();
        let identity = device.identity;
        let config = self
            .device_config(identity.vendor_id, identity.product_id)
            .ok_or_else(|| {
                Error::TransportOpen(format!("{} is not a configured usb-serial device", identity))
            })?;
        let Some(address) = device.usb else {
            return Err(Error::TransportOpen(format!(
                "device {} is not on the USB bus",
                device_id
            )));
        };
        if self.ports.is_open(&device_id) {
            return Err(Error::AlreadyOpen(device_id));
        }
        let baud_rate = options.baud_rate_or(self.default_baud_rate);
        let coding = line_coding(baud_rate, options)?;

        let info = nusb::list_devices()
            .await
            .map_err(|e| Error::TransportOpen(format!("failed to list USB devices: {}", e)))?
            .find(|d| {
                d.bus_id() == address.bus_id && d.device_address() == address.device_address
            })
            .ok_or_else(|| {
                Error::TransportOpen(format!("device {} is no longer present", device_id))
            })?;

        let usb_device = info
            .open()
            .await
            .map_err(|e| Error::TransportOpen(format!("failed to open device: {}", e)))?;
        let control = usb_device
            .claim_interface(config.control_interface)
            .await
            .map_err(|e| Error::TransportOpen(format!("failed to claim interface: {}", e)))?;
        let data = if config.data_interface == config.control_interface {
            None
        } else {
            Some(
                usb_device
                    .claim_interface(config.data_interface)
                    .await
                    .map_err(|e| {
                        Error::TransportOpen(format!("failed to claim interface: {}", e))
                    })?,
            )
        };
        let data_interface = data.as_ref().unwrap_or(&control);

        control
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: SET_LINE_CODING,
                    value: 0,
                    index: config.control_interface as u16,
                    data: &coding,
                },
                CONTROL_TIMEOUT,
            )
            .await
            .map_err(|e| Error::TransportOpen(format!("SET_LINE_CODING failed: {}", e)))?;
        set_control_line_state(&control, config.control_interface, LINE_STATE_DTR | LINE_STATE_RTS)
            .await
            .map_err(|e| Error::TransportOpen(e.to_string()))?;

        let bulk_in = data_interface
            .endpoint::<Bulk, In>(config.endpoint_in)
            .map_err(|e| Error::TransportOpen(format!("failed to open bulk IN endpoint: {}", e)))?;
        let bulk_out = data_interface
            .endpoint::<Bulk, Out>(config.endpoint_out)
            .map_err(|e| Error::TransportOpen(format!("failed to open bulk OUT endpoint: {}", e)))?;

        let location = format!("usb:{}:{}", address.bus_id, address.device_address);
        let io = PortIo {
            link: Box::new(UsbLink {
                location: location.clone(),
                control,
                control_number: config.control_interface,
                _data: data,
            }),
            reader: Box::pin(BulkReader {
                endpoint: bulk_in,
                ended: false,
            }),
            writer: Box::pin(BulkWriter { endpoint: bulk_out }),
        };
        self.ports.open(device_id.clone(), io)?;

        info!(device = %device_id, port = %location, baud_rate, "USB serial device opened");
        Ok(Box::new(PortTransport::new(device_id, self.ports.clone())))
    }
}
