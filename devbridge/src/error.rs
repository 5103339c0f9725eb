//! Common error types for devbridge.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.
//! Only the `Display` text of an error crosses the message bridge; callers
//! on the far side see `Error::Remote` carrying that text.

use thiserror::Error;

use crate::device::{DeviceId, DeviceIdentity};

/// Main error type for devbridge operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No registered driver claims this vendor/product identity
    #[error("no driver registered for {0}")]
    DriverNotFound(DeviceIdentity),

    /// No authorized raw device matches this identity
    #[error("no authorized device found for {0}")]
    DeviceNotFound(DeviceIdentity),

    /// Operation on a device that has no live connection
    #[error("device {0} not connected")]
    NotConnected(DeviceId),

    /// Device is already present in an open-ports table
    #[error("device {0} is already open")]
    AlreadyOpen(DeviceId),

    /// The driver failed to open the device
    #[error("failed to open transport: {0}")]
    TransportOpen(String),

    /// A read or write failed mid-operation
    #[error("transport I/O error: {0}")]
    TransportIo(#[from] std::io::Error),

    /// The connection was closed while an operation was pending
    #[error("connection {0} closed")]
    ConnectionClosed(DeviceId),

    /// An operation did not finish in time
    #[error("{0} timed out")]
    Timeout(String),

    /// Listing the host's devices failed
    #[error("device enumeration failed: {0}")]
    Enumeration(String),

    /// Malformed or unexpected protocol envelope
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failure reported by the other side of the message bridge
    #[error("{0}")]
    Remote(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
