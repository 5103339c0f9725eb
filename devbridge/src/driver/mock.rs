//! Mock driver for tests and hardware-free runs.
//!
//! Opened mock devices go through the same `PortTable` as real ports, so
//! reads see the real framing behavior. The driver handle is cloneable;
//! every clone controls the same devices: queue read chunks, inject errors,
//! end the stream, and inspect what was written.

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::Sink;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use super::Driver;
use crate::device::{DeviceId, DeviceIdentity, RawDevice};
use crate::error::{Error, Result};
use crate::transport::{OpenOptions, PortIo, PortLink, PortTable, PortTransport, Transport};

type Chunk = io::Result<Bytes>;

#[derive(Default)]
struct MockDevice {
    chunk_tx: Option<mpsc::UnboundedSender<Chunk>>,
    chunk_rx: Option<mpsc::UnboundedReceiver<Chunk>>,
    written: Vec<Vec<u8>>,
    write_error: Option<String>,
    close_delay: Option<Duration>,
    close_count: usize,
}

impl MockDevice {
    fn sender(&mut self) -> Option<&mpsc::UnboundedSender<Chunk>> {
        if self.chunk_tx.is_none() && self.chunk_rx.is_none() {
            let (tx, rx) = mpsc::unbounded();
            self.chunk_tx = Some(tx);
            self.chunk_rx = Some(rx);
        }
        self.chunk_tx.as_ref()
    }

    // Receiver for a new open; chunks queued before the open are kept.
    fn take_receiver(&mut self) -> mpsc::UnboundedReceiver<Chunk> {
        match self.chunk_rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded();
                self.chunk_tx = Some(tx);
                rx
            }
        }
    }
}

#[derive(Default)]
struct MockState {
    open_calls: usize,
    fail_next_open: Option<String>,
    devices: HashMap<DeviceId, MockDevice>,
}

/// Driver that opens in-memory devices.
#[derive(Clone)]
pub struct MockDriver {
    name: String,
    filter: Option<Vec<DeviceIdentity>>,
    state: Arc<Mutex<MockState>>,
    ports: PortTable,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// A mock driver matching every identity.
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            filter: None,
            state: Arc::new(Mutex::new(MockState::default())),
            ports: PortTable::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Restrict the driver to the given (vendor, product) pairs.
    pub fn matching(mut self, ids: &[(u16, u16)]) -> Self {
        self.filter = Some(
            ids.iter()
                .map(|&(vid, pid)| DeviceIdentity::new(vid, pid))
                .collect(),
        );
        self
    }

    /// Number of times `open` was called, successful or not.
    pub fn open_count(&self) -> usize {
        self.state.lock().open_calls
    }

    /// Make the next `open` fail with this message.
    pub fn fail_next_open(&self, message: impl Into<String>) {
        self.state.lock().fail_next_open = Some(message.into());
    }

    /// Queue a chunk to be returned by the device's reader.
    pub fn push_read(&self, device_id: &DeviceId, data: &[u8]) {
        self.push_chunk(device_id, Ok(Bytes::copy_from_slice(data)));
    }

    /// Queue a read failure.
    pub fn push_read_error(&self, device_id: &DeviceId, message: impl Into<String>) {
        self.push_chunk(device_id, Err(io::Error::other(message.into())));
    }

    fn push_chunk(&self, device_id: &DeviceId, chunk: Chunk) {
        let mut state = self.state.lock();
        let device = state.devices.entry(device_id.clone()).or_default();
        if let Some(tx) = device.sender() {
            // A closed receiver means the device was closed; drop the chunk
            let _ = tx.unbounded_send(chunk);
        }
    }

    /// End the device's read stream after the chunks already queued.
    pub fn end_stream(&self, device_id: &DeviceId) {
        let mut state = self.state.lock();
        let device = state.devices.entry(device_id.clone()).or_default();
        device.sender();
        device.chunk_tx = None;
    }

    /// Make the next write to the device fail with this message.
    pub fn fail_next_write(&self, device_id: &DeviceId, message: impl Into<String>) {
        let mut state = self.state.lock();
        state.devices.entry(device_id.clone()).or_default().write_error = Some(message.into());
    }

    /// Every write the device received, in order.
    pub fn written(&self, device_id: &DeviceId) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .devices
            .get(device_id)
            .map(|d| d.written.clone())
            .unwrap_or_default()
    }

    /// Make the next shutdown of the device's port take `delay`.
    pub fn delay_close(&self, device_id: &DeviceId, delay: Duration) {
        let mut state = self.state.lock();
        state.devices.entry(device_id.clone()).or_default().close_delay = Some(delay);
    }

    /// Number of times the device's port was shut down.
    pub fn close_count(&self, device_id: &DeviceId) -> usize {
        self.state
            .lock()
            .devices
            .get(device_id)
            .map(|d| d.close_count)
            .unwrap_or(0)
    }

    fn port_io(&self, device_id: &DeviceId) -> PortIo {
        let reader = self
            .state
            .lock()
            .devices
            .entry(device_id.clone())
            .or_default()
            .take_receiver();

        PortIo {
            link: Box::new(MockLink {
                device_id: device_id.clone(),
                state: self.state.clone(),
            }),
            reader: Box::pin(reader),
            writer: Box::pin(MockWriter {
                device_id: device_id.clone(),
                state: self.state.clone(),
            }),
        }
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        match &self.filter {
            Some(ids) => ids.contains(&DeviceIdentity::new(vendor_id, product_id)),
            None => true,
        }
    }

    async fn open(&self, device: RawDevice, _options: &OpenOptions) -> Result<Box<dyn Transport>> {
        let device_id = device.device_id();
        {
            let mut state = self.state.lock();
            state.open_calls += 1;
            if let Some(message) = state.fail_next_open.take() {
                return Err(Error::TransportOpen(message));
            }
        }
        if self.ports.is_open(&device_id) {
            return Err(Error::AlreadyOpen(device_id));
        }

        self.ports.open(device_id.clone(), self.port_io(&device_id))?;
        Ok(Box::new(PortTransport::new(device_id, self.ports.clone())))
    }
}

// Records each chunk, or fails it if an error was injected.
struct MockWriter {
    device_id: DeviceId,
    state: Arc<Mutex<MockState>>,
}

impl Sink<Bytes> for MockWriter {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, data: Bytes) -> io::Result<()> {
        let mut state = self.state.lock();
        let device = state.devices.entry(self.device_id.clone()).or_default();
        if let Some(message) = device.write_error.take() {
            return Err(io::Error::other(message));
        }
        device.written.push(data.to_vec());
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct MockLink {
    device_id: DeviceId,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl PortLink for MockLink {
    fn describe(&self) -> String {
        format!("mock:{}", self.device_id)
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        let delay = {
            let mut state = self.state.lock();
            let device = state.devices.entry(self.device_id.clone()).or_default();
            device.close_delay.take()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let device = state.devices.entry(self.device_id.clone()).or_default();
        device.close_count += 1;
        // Chunks pushed after the close must not leak into the next open
        device.chunk_tx = None;
        device.chunk_rx = None;
        Ok(())
    }
}
