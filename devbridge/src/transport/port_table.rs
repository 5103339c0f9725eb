//! Table of open ports, keyed by device ID.
//!
//! Each entry owns an exclusive reader (a stream of byte chunks), an
//! exclusive writer (a sink of byte chunks), and the link to the underlying
//! port. Entries sit behind their own async mutex so the table lock is never
//! held across device I/O.
//!
//! Bytes pulled from the reader but not yet returned to a caller stay in a
//! per-port pending buffer. A fixed-length read that receives a larger chunk,
//! or a line read that finds bytes past the newline, leaves the surplus for
//! the next call. A read dropped mid-way (timeout, cancellation) loses
//! nothing for the same reason.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Exclusive read side of a port; `None` from the stream means it ended.
pub type ByteReader = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Exclusive write side of a port.
pub type ByteWriter = Pin<Box<dyn Sink<Bytes, Error = io::Error> + Send>>;

/// The port underneath a reader/writer pair.
#[async_trait]
pub trait PortLink: Send {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Close the port. Called after the reader and writer were released.
    async fn shutdown(&mut self) -> io::Result<()>;
}

/// Everything a driver hands over when registering an opened port.
pub struct PortIo {
    pub link: Box<dyn PortLink>,
    pub reader: ByteReader,
    pub writer: ByteWriter,
}

struct OpenPort {
    link: Option<Box<dyn PortLink>>,
    reader: Option<ByteReader>,
    writer: Option<ByteWriter>,
    pending: BytesMut,
    ended: bool,
}

impl OpenPort {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.ended {
            return Ok(None);
        }
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "reader released"))?;
        match reader.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(e.into()),
            None => {
                self.ended = true;
                Ok(None)
            }
        }
    }

    async fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        while self.pending.len() < size {
            match self.next_chunk().await? {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None => break,
            }
        }
        let n = size.min(self.pending.len());
        Ok(self.pending.split_to(n).to_vec())
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.pending[scanned..].iter().position(|&b| b == b'\n') {
                return Ok(self.pending.split_to(scanned + pos + 1).to_vec());
            }
            scanned = self.pending.len();
            match self.next_chunk().await? {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None => return Ok(self.pending.split().to_vec()),
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "writer released"))?;
        writer.send(Bytes::copy_from_slice(data)).await?;
        Ok(())
    }
}

/// Shared table of open ports. Clones refer to the same table.
#[derive(Clone, Default)]
pub struct PortTable {
    ports: Arc<Mutex<HashMap<DeviceId, Arc<AsyncMutex<OpenPort>>>>>,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an opened port under `device_id`.
    ///
    /// Fails without touching the table if the ID is already present; the
    /// rejected `io` is dropped, which releases whatever it holds.
    pub fn open(&self, device_id: DeviceId, io: PortIo) -> Result<()> {
        let mut ports = self.ports.lock();
        if ports.contains_key(&device_id) {
            return Err(Error::AlreadyOpen(device_id));
        }
        debug!(device = %device_id, port = %io.link.describe(), "Port opened");
        ports.insert(
            device_id,
            Arc::new(AsyncMutex::new(OpenPort {
                link: Some(io.link),
                reader: Some(io.reader),
                writer: Some(io.writer),
                pending: BytesMut::new(),
                ended: false,
            })),
        );
        Ok(())
    }

    pub fn is_open(&self, device_id: &DeviceId) -> bool {
        self.ports.lock().contains_key(device_id)
    }

    fn entry(&self, device_id: &DeviceId) -> Result<Arc<AsyncMutex<OpenPort>>> {
        self.ports
            .lock()
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::NotConnected(device_id.clone()))
    }

    pub async fn write(&self, device_id: &DeviceId, data: &[u8]) -> Result<()> {
        let entry = self.entry(device_id)?;
        let mut port = entry.lock().await;
        port.write(data).await
    }

    pub async fn read(&self, device_id: &DeviceId, size: usize) -> Result<Vec<u8>> {
        let entry = self.entry(device_id)?;
        let mut port = entry.lock().await;
        port.read(size).await
    }

    pub async fn read_line(&self, device_id: &DeviceId) -> Result<Vec<u8>> {
        let entry = self.entry(device_id)?;
        let mut port = entry.lock().await;
        port.read_line().await
    }

    /// Close a port: release the reader, then the writer, then the port.
    ///
    /// The entry leaves the table before any step runs, so it is gone even
    /// if a step fails. Every step is attempted; the first failure is
    /// returned. Waits for an operation already holding the port to finish.
    /// Closing an ID that is not open is a no-op.
    pub async fn close(&self, device_id: &DeviceId) -> Result<()> {
        let Some(entry) = self.ports.lock().remove(device_id) else {
            trace!(device = %device_id, "Close of port that is not open");
            return Ok(());
        };
        let mut port = entry.lock().await;
        let mut first_error: Option<io::Error> = None;

        drop(port.reader.take());

        if let Some(mut writer) = port.writer.take() {
            if let Err(e) = writer.close().await {
                warn!(device = %device_id, error = %e, "Failed to release writer");
                first_error.get_or_insert(e);
            }
        }

        if let Some(mut link) = port.link.take() {
            let location = link.describe();
            match link.shutdown().await {
                Ok(()) => debug!(device = %device_id, port = %location, "Port closed"),
                Err(e) => {
                    warn!(
                        device = %device_id,
                        port = %location,
                        error = %e,
                        "Failed to close port"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        port.pending.clear();

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
