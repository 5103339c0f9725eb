//! Connection lifecycle and device I/O.
//!
//! The `ConnectionManager` owns every open transport, keyed by device ID.
//! It resolves drivers on connect, forwards reads and writes to the right
//! transport, and publishes a status event for each lifecycle transition.
//!
//! Each connection's transport sits behind a fair async mutex, so overlapping
//! operations on one device run one at a time in arrival order. Operations on
//! different devices are independent. A disconnect cancels whatever is
//! queued or in flight on that device; those calls fail with
//! `Error::ConnectionClosed`.
//!
//! A failed read or write is reported to its caller only. The connection
//! keeps its status until it is explicitly disconnected.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::device::{DeviceId, DeviceIdentity};
use crate::driver::DriverRegistry;
use crate::enumerate::DeviceEnumerator;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::transport::{OpenOptions, Transport};

/// Status events buffered per subscriber before it lags.
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// A lifecycle notification for one device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub device_id: DeviceId,
    pub status: ConnectionStatus,
    /// Milliseconds since the UNIX epoch
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub device_id: DeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub status: ConnectionStatus,
}

type SharedTransport = Arc<AsyncMutex<Box<dyn Transport>>>;

struct Connection {
    identity: DeviceIdentity,
    status: ConnectionStatus,
    transport: SharedTransport,
    /// Fired on disconnect to abort queued and in-flight I/O
    cancel: CancellationToken,
}

fn now_millis() -> u64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64
}

/// Owner of all open device connections.
pub struct ConnectionManager {
    registry: Arc<DriverRegistry>,
    enumerator: Arc<dyn DeviceEnumerator>,
    connections: Mutex<HashMap<DeviceId, Connection>>,
    /// Per-device lock held while a device is opened or closed
    lifecycle: Mutex<HashMap<DeviceId, Arc<AsyncMutex<()>>>>,
    status_tx: broadcast::Sender<StatusEvent>,
    io_timeout: Option<Duration>,
}

impl ConnectionManager {
    pub fn new(registry: Arc<DriverRegistry>, enumerator: Arc<dyn DeviceEnumerator>) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            registry,
            enumerator,
            connections: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(HashMap::new()),
            status_tx,
            io_timeout: None,
        }
    }

    /// Bound every read, read_line and write by `timeout`, including time
    /// spent queued behind other operations on the same device.
    pub fn with_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    // Lock serializing connect and disconnect of one device. Different
    // devices never wait on each other. Entries are kept for the life of
    // the manager; there is one per identity ever connected.
    fn lifecycle_lock(&self, device_id: &DeviceId) -> Arc<AsyncMutex<()>> {
        self.lifecycle
            .lock()
            .entry(device_id.clone())
            .or_default()
            .clone()
    }

    /// Open a connection to the device, or return the existing one.
    ///
    /// A device that is already connected is not reopened; its ID is
    /// returned as is. A connect racing a disconnect of the same device
    /// waits for the close to finish. Failures are returned and also
    /// published as an `error` status event.
    pub async fn connect(
        &self,
        vendor_id: u16,
        product_id: u16,
        options: &OpenOptions,
    ) -> Result<DeviceId> {
        let identity = DeviceIdentity::new(vendor_id, product_id);
        let device_id = identity.device_id();

        let lock = self.lifecycle_lock(&device_id);
        let _guard = lock.lock().await;
        if self.connections.lock().contains_key(&device_id) {
            debug!(device = %device_id, "Already connected");
            return Ok(device_id);
        }

        self.emit(&device_id, ConnectionStatus::Connecting, None);
        match self.open(identity, options).await {
            Ok(transport) => {
                self.connections.lock().insert(
                    device_id.clone(),
                    Connection {
                        identity,
                        status: ConnectionStatus::Connected,
                        transport: Arc::new(AsyncMutex::new(transport)),
                        cancel: CancellationToken::new(),
                    },
                );
                info!(device = %device_id, "Device connected");
                self.emit(&device_id, ConnectionStatus::Connected, None);
                Ok(device_id)
            }
            Err(e) => {
                warn!(device = %device_id, error = %e, "Failed to connect device");
                self.emit(&device_id, ConnectionStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn open(
        &self,
        identity: DeviceIdentity,
        options: &OpenOptions,
    ) -> Result<Box<dyn Transport>> {
        let device = self.enumerator.find(identity).await?;
        let driver = self.registry.resolve(identity.vendor_id, identity.product_id)?;
        debug!(device = %identity, driver = driver.name(), "Opening device");

        driver.open(device, options).await.map_err(|e| match e {
            Error::TransportOpen(_) | Error::AlreadyOpen(_) => e,
            other => Error::TransportOpen(other.to_string()),
        })
    }

    /// Close the connection. Unknown or already closed devices are a no-op.
    ///
    /// The connection is removed and `disconnected` published even if the
    /// transport fails to close.
    pub async fn disconnect(&self, device_id: &DeviceId) -> Result<()> {
        if !self.connections.lock().contains_key(device_id) {
            debug!(device = %device_id, "Disconnect of unknown device");
            return Ok(());
        }

        let lock = self.lifecycle_lock(device_id);
        let _guard = lock.lock().await;
        let Some(connection) = self.connections.lock().remove(device_id) else {
            // Closed by a concurrent disconnect
            return Ok(());
        };

        connection.cancel.cancel();
        let mut transport = connection.transport.lock().await;
        if let Err(e) = transport.close().await {
            warn!(device = %device_id, error = %e, "Error while closing transport");
        }

        info!(device = %device_id, "Device disconnected");
        self.emit(device_id, ConnectionStatus::Disconnected, None);
        Ok(())
    }

    /// Disconnect every device.
    pub async fn shutdown(&self) {
        let device_ids: Vec<DeviceId> = self.connections.lock().keys().cloned().collect();
        for device_id in device_ids {
            // disconnect never fails
            let _ = self.disconnect(&device_id).await;
        }
    }

    pub async fn write(&self, device_id: &DeviceId, data: &[u8]) -> Result<()> {
        let (transport, cancel) = self.live(device_id)?;
        self.run_io(device_id, "write", &cancel, async {
            transport.lock().await.write(data).await
        })
        .await
    }

    pub async fn read(&self, device_id: &DeviceId, length: usize) -> Result<Vec<u8>> {
        let (transport, cancel) = self.live(device_id)?;
        self.run_io(device_id, "read", &cancel, async {
            transport.lock().await.read(length).await
        })
        .await
    }

    pub async fn read_line(&self, device_id: &DeviceId) -> Result<Vec<u8>> {
        let (transport, cancel) = self.live(device_id)?;
        self.run_io(device_id, "read_line", &cancel, async {
            transport.lock().await.read_line().await
        })
        .await
    }

    pub fn is_connected(&self, device_id: &DeviceId) -> bool {
        self.connections
            .lock()
            .get(device_id)
            .is_some_and(|c| c.status == ConnectionStatus::Connected)
    }

    pub fn active_connections(&self) -> Vec<ConnectionInfo> {
        let mut active: Vec<ConnectionInfo> = self
            .connections
            .lock()
            .iter()
            .map(|(device_id, c)| ConnectionInfo {
                device_id: device_id.clone(),
                vendor_id: c.identity.vendor_id,
                product_id: c.identity.product_id,
                status: c.status,
            })
            .collect();
        active.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        active
    }

    /// Receive status events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    /// Status events published from now on, as a stream. Events missed by a
    /// lagging consumer are skipped.
    pub fn status_events(&self) -> impl Stream<Item = StatusEvent> {
        BroadcastStream::new(self.status_tx.subscribe()).filter_map(|event| event.ok())
    }

    fn live(&self, device_id: &DeviceId) -> Result<(SharedTransport, CancellationToken)> {
        match self.connections.lock().get(device_id) {
            Some(c) if c.status == ConnectionStatus::Connected => {
                Ok((c.transport.clone(), c.cancel.clone()))
            }
            _ => Err(Error::NotConnected(device_id.clone())),
        }
    }

    async fn run_io<T>(
        &self,
        device_id: &DeviceId,
        operation: &str,
        cancel: &CancellationToken,
        io: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let bounded = async {
            match self.io_timeout {
                Some(limit) => tokio::time::timeout(limit, io)
                    .await
                    .map_err(|_| Error::Timeout(format!("{} on {}", operation, device_id)))?,
                None => io.await,
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::ConnectionClosed(device_id.clone())),
            result = bounded => result,
        };
        if let Err(e) = &result {
            debug!(device = %device_id, operation, error = %e, "Device I/O failed");
        }
        result
    }

    fn emit(&self, device_id: &DeviceId, status: ConnectionStatus, error_message: Option<String>) {
        let event = StatusEvent {
            device_id: device_id.clone(),
            status,
            timestamp: now_millis(),
            error_message,
        };
        // No subscribers is fine
        let _ = self.status_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crate::enumerate::StaticEnumerator;
    use test_case::test_case;

    fn manager_for(ids: &[(u16, u16)]) -> (Arc<ConnectionManager>, MockDriver) {
        let (registry, mock) = DriverRegistry::with_test_registry();
        let manager = ConnectionManager::new(
            Arc::new(registry),
            Arc::new(StaticEnumerator::virtual_devices(ids)),
        );
        (Arc::new(manager), mock)
    }

    fn drain(rx: &mut broadcast::Receiver<StatusEvent>) -> Vec<(String, ConnectionStatus)> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push((event.device_id.to_string(), event.status));
        }
        events
    }

    #[test_case(0x0000, 0x0001, "usb-0000-0001" ; "low")]
    #[test_case(0x0403, 0x6001, "usb-0403-6001" ; "ftdi")]
    #[test_case(0xABCD, 0x00EF, "usb-abcd-00ef" ; "mixed")]
    #[test_case(0xFFFF, 0xFFFF, "usb-ffff-ffff" ; "max")]
    #[tokio::test]
    async fn test_connect_device_id(vid: u16, pid: u16, expected: &str) {
        let (manager, _mock) = manager_for(&[(vid, pid)]);
        let id = manager.connect(vid, pid, &OpenOptions::default()).await.unwrap();
        assert_eq!(id.as_str(), expected);
        assert!(manager.is_connected(&id));
    }

    #[tokio::test]
    async fn test_connect_twice_opens_once() {
        let (manager, mock) = manager_for(&[(0x0403, 0x6001)]);

        let first = manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap();
        let second = manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(mock.open_count(), 1);
        assert_eq!(manager.active_connections().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_unknown_is_ok() {
        let (manager, _mock) = manager_for(&[]);
        manager.disconnect(&DeviceId::from("usb-dead-beef")).await.unwrap();
    }

    #[tokio::test]
    async fn test_io_on_unknown_device() {
        let (manager, _mock) = manager_for(&[]);
        let id = DeviceId::from("usb-0403-6001");

        let err = manager.write(&id, &[1]).await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
        let err = manager.read(&id, 1).await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
        let err = manager.read_line(&id).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_status_events_on_connect() {
        let (manager, _mock) = manager_for(&[(0xFFFF, 0xFFFF)]);
        let mut rx = manager.subscribe();

        manager.connect(0xFFFF, 0xFFFF, &OpenOptions::default()).await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                ("usb-ffff-ffff".to_string(), ConnectionStatus::Connecting),
                ("usb-ffff-ffff".to_string(), ConnectionStatus::Connected),
            ]
        );
    }

    #[tokio::test]
    async fn test_status_stream() {
        let (manager, _mock) = manager_for(&[(0x0403, 0x6001)]);
        let events = manager.status_events();
        tokio::pin!(events);

        let id = manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap();
        manager.disconnect(&id).await.unwrap();

        let statuses: Vec<ConnectionStatus> = events.take(3).map(|e| e.status).collect().await;
        assert_eq!(
            statuses,
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn test_read_short_at_stream_end() {
        let (manager, mock) = manager_for(&[(0x0403, 0x6001)]);
        let id = manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap();
        mock.push_read(&id, &[0x01, 0x02, 0x03]);
        mock.end_stream(&id);

        assert_eq!(manager.read(&id, 10).await.unwrap(), vec![0x01, 0x02, 0x03]);
    }

    #[tokio::test]
    async fn test_read_line_and_write() {
        let (manager, mock) = manager_for(&[(0x0403, 0x6001)]);
        let id = manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap();

        manager.write(&id, b"PING\n").await.unwrap();
        mock.push_read(&id, b"PONG\nNEXT");
        assert_eq!(manager.read_line(&id).await.unwrap(), b"PONG\n");
        assert_eq!(mock.written(&id), vec![b"PING\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_active_connections_count() {
        let (manager, _mock) = manager_for(&[(0x0403, 0x6001), (0x10c4, 0xea60)]);
        manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap();
        assert_eq!(manager.active_connections().len(), 1);

        let id = manager.connect(0x10c4, 0xea60, &OpenOptions::default()).await.unwrap();
        assert_eq!(manager.active_connections().len(), 2);
        assert_eq!(
            manager.active_connections()[1],
            ConnectionInfo {
                device_id: id.clone(),
                vendor_id: 0x10c4,
                product_id: 0xea60,
                status: ConnectionStatus::Connected,
            }
        );

        manager.disconnect(&id).await.unwrap();
        assert_eq!(manager.active_connections().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_open() {
        let (manager, mock) = manager_for(&[(0x0403, 0x6001)]);
        let mut rx = manager.subscribe();
        mock.fail_next_open("resource busy");

        let err = manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::TransportOpen(_)));
        assert!(manager.active_connections().is_empty());

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.status, ConnectionStatus::Connecting);
        assert_eq!(second.status, ConnectionStatus::Error);
        assert_eq!(
            second.error_message.as_deref(),
            Some("failed to open transport: resource busy")
        );

        // The identity can be retried
        manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap();
        assert_eq!(mock.open_count(), 2);
    }

    #[tokio::test]
    async fn test_device_not_found() {
        let (manager, mock) = manager_for(&[]);
        let mut rx = manager.subscribe();

        let err = manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
        assert_eq!(mock.open_count(), 0);
        assert_eq!(
            drain(&mut rx).into_iter().map(|(_, s)| s).collect::<Vec<_>>(),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Error]
        );
    }

    #[tokio::test]
    async fn test_driver_not_found() {
        let (manager, _mock) = manager_for(&[(0x0403, 0x6001)]);
        manager.registry().reset();

        let err = manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::DriverNotFound(_)));
    }

    #[tokio::test]
    async fn test_io_failure_keeps_connection() {
        let (manager, mock) = manager_for(&[(0x0403, 0x6001)]);
        let id = manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap();

        mock.fail_next_write(&id, "EIO");
        assert!(matches!(manager.write(&id, &[1]).await, Err(Error::TransportIo(_))));
        mock.push_read_error(&id, "framing error");
        assert!(matches!(manager.read(&id, 1).await, Err(Error::TransportIo(_))));

        assert!(manager.is_connected(&id));
        manager.write(&id, &[2]).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_closes_transport() {
        let (manager, mock) = manager_for(&[(0x0403, 0x6001)]);
        let id = manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap();
        let mut rx = manager.subscribe();

        manager.disconnect(&id).await.unwrap();

        assert_eq!(mock.close_count(&id), 1);
        assert!(!manager.is_connected(&id));
        assert_eq!(rx.try_recv().unwrap().status, ConnectionStatus::Disconnected);
        let err = manager.write(&id, &[1]).await.unwrap_err();
        assert!(err.to_string().contains("not connected"));

        // Disconnected IDs may connect again
        manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap();
        assert_eq!(mock.open_count(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_read() {
        let (manager, _mock) = manager_for(&[(0x0403, 0x6001)]);
        let id = manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap();

        let pending = tokio::spawn({
            let manager = manager.clone();
            let id = id.clone();
            async move { manager.read_line(&id).await }
        });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        manager.disconnect(&id).await.unwrap();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_io_on_one_device_is_serialized() {
        let (manager, mock) = manager_for(&[(0x0403, 0x6001)]);
        let id = manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap();

        let reader = tokio::spawn({
            let manager = manager.clone();
            let id = id.clone();
            async move { manager.read_line(&id).await }
        });
        tokio::task::yield_now().await;
        let writer = tokio::spawn({
            let manager = manager.clone();
            let id = id.clone();
            async move { manager.write(&id, b"queued").await }
        });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        // The write waits behind the pending line read
        assert!(mock.written(&id).is_empty());

        mock.push_read(&id, b"done\n");
        assert_eq!(reader.await.unwrap().unwrap(), b"done\n");
        writer.await.unwrap().unwrap();
        assert_eq!(mock.written(&id), vec![b"queued".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_io_timeout() {
        let (registry, _mock) = DriverRegistry::with_test_registry();
        let manager = ConnectionManager::new(
            Arc::new(registry),
            Arc::new(StaticEnumerator::virtual_devices(&[(0x0403, 0x6001)])),
        )
        .with_io_timeout(Some(Duration::from_millis(200)));
        let id = manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap();

        let err = manager.read(&id, 4).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(manager.is_connected(&id));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_all() {
        let (manager, _mock) = manager_for(&[(0x0403, 0x6001), (0x10c4, 0xea60)]);
        manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap();
        manager.connect(0x10c4, 0xea60, &OpenOptions::default()).await.unwrap();

        manager.shutdown().await;
        assert!(manager.active_connections().is_empty());
    }

    struct HangingDriver;

    #[async_trait::async_trait]
    impl crate::driver::Driver for HangingDriver {
        fn name(&self) -> &str {
            "hanging"
        }

        fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
            (vendor_id, product_id) == (0x1111, 0x0001)
        }

        async fn open(
            &self,
            _device: crate::device::RawDevice,
            _options: &OpenOptions,
        ) -> Result<Box<dyn Transport>> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_hung_open_does_not_block_other_devices() {
        let registry = DriverRegistry::new();
        registry.register(Arc::new(HangingDriver));
        registry.register(Arc::new(MockDriver::new()));
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(registry),
            Arc::new(StaticEnumerator::virtual_devices(&[
                (0x1111, 0x0001),
                (0x0403, 0x6001),
            ])),
        ));

        let hung = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect(0x1111, 0x0001, &OpenOptions::default()).await }
        });
        tokio::task::yield_now().await;

        let options = OpenOptions::default();
        let other = manager.connect(0x0403, 0x6001, &options);
        let id = tokio::time::timeout(Duration::from_secs(1), other)
            .await
            .expect("connect waited on another device")
            .unwrap();
        assert!(manager.is_connected(&id));

        // Nothing is connected yet under the hung identity
        let hung_id = DeviceId::from("usb-1111-0001");
        tokio::time::timeout(Duration::from_secs(1), manager.disconnect(&hung_id))
            .await
            .expect("disconnect waited on a pending open")
            .unwrap();
        hung.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_waits_for_close_in_progress() {
        let (manager, mock) = manager_for(&[(0x0403, 0x6001)]);
        let id = manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap();
        mock.delay_close(&id, Duration::from_millis(500));
        let mut rx = manager.subscribe();

        let closing = tokio::spawn({
            let manager = manager.clone();
            let id = id.clone();
            async move { manager.disconnect(&id).await }
        });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        manager.connect(0x0403, 0x6001, &OpenOptions::default()).await.unwrap();
        closing.await.unwrap().unwrap();

        let statuses: Vec<ConnectionStatus> = drain(&mut rx).into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            statuses,
            vec![
                ConnectionStatus::Disconnected,
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
            ]
        );
        assert_eq!(mock.close_count(&id), 1);

        // The new connection is fully usable
        mock.push_read(&id, b"ok");
        assert_eq!(manager.read(&id, 2).await.unwrap(), b"ok");
    }

    #[test]
    fn test_status_wire_format() {
        let event = StatusEvent {
            device_id: DeviceId::from("usb-0403-6001"),
            status: ConnectionStatus::Error,
            timestamp: 1_700_000_000_000,
            error_message: Some("gone".into()),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({
                "deviceId": "usb-0403-6001",
                "status": "error",
                "timestamp": 1_700_000_000_000u64,
                "errorMessage": "gone",
            })
        );
        assert_eq!(ConnectionStatus::Connecting.to_string(), "connecting");
    }
}
