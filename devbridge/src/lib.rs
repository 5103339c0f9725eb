//! Serial and USB device I/O for callers that cannot touch hardware
//! themselves.
//!
//! Drivers open authorized devices into byte transports, the
//! `ConnectionManager` owns those transports, and the `MessageBridge` exposes
//! the manager as JSON requests and responses on a `MessageChannel`.

pub mod bridge;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod device;
pub mod driver;
pub mod enumerate;
pub mod error;
pub mod protocol;
pub mod stdio;
pub mod tracing;
pub mod transport;

pub use bridge::MessageBridge;
pub use channel::MessageChannel;
pub use client::BridgeClient;
pub use config::Config;
pub use connection::{ConnectionInfo, ConnectionManager, ConnectionStatus, StatusEvent};
pub use device::{DeviceId, DeviceIdentity, RawDevice};
pub use driver::{Driver, DriverRegistry};
pub use error::{Error, Result};
pub use transport::{OpenOptions, Transport};
