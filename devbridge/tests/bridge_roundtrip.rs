//! Client → channel → bridge → manager → mock driver, end to end.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use devbridge::driver::MockDriver;
use devbridge::enumerate::StaticEnumerator;
use devbridge::{
    BridgeClient, ConnectionManager, ConnectionStatus, DeviceId, DriverRegistry, Error,
    MessageBridge, MessageChannel, OpenOptions,
};

struct Bridge {
    client: BridgeClient,
    mock: MockDriver,
    manager: Arc<ConnectionManager>,
    cancel: CancellationToken,
}

fn start(ids: &[(u16, u16)]) -> Bridge {
    let (registry, mock) = DriverRegistry::with_test_registry();
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(registry),
        Arc::new(StaticEnumerator::virtual_devices(ids)),
    ));
    let channel = MessageChannel::default();
    let cancel = CancellationToken::new();
    let bridge = MessageBridge::new(manager.clone(), channel.clone(), 115200);
    tokio::spawn(bridge.run(cancel.clone()));

    Bridge {
        client: BridgeClient::new(channel).with_timeout(Duration::from_secs(5)),
        mock,
        manager,
        cancel,
    }
}

#[tokio::test]
async fn test_full_session() {
    let bridge = start(&[(0x2e8a, 0x000a)]);
    let client = &bridge.client;

    let id = client
        .open(0x2e8a, 0x000a, Some(OpenOptions::with_baud_rate(9600)))
        .await
        .unwrap();
    assert_eq!(id.as_str(), "usb-2e8a-000a");

    client.write(&id, b"version\n").await.unwrap();
    assert_eq!(bridge.mock.written(&id), vec![b"version\n".to_vec()]);

    bridge.mock.push_read(&id, b"v1.2\nok");
    assert_eq!(client.read_line(&id).await.unwrap(), b"v1.2\n");
    bridge.mock.end_stream(&id);
    assert_eq!(client.read(&id, 8).await.unwrap(), b"ok");

    let listed = client.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].device_id, id);
    assert_eq!(listed[0].status, ConnectionStatus::Connected);

    client.close(&id).await.unwrap();
    assert!(client.list().await.unwrap().is_empty());
    assert_eq!(bridge.mock.close_count(&id), 1);

    bridge.cancel.cancel();
}

#[tokio::test]
async fn test_errors_cross_the_bridge_as_text() {
    let bridge = start(&[]);
    let id = DeviceId::from("usb-0403-6001");

    let err = bridge.client.write(&id, &[0]).await.unwrap_err();
    assert!(matches!(err, Error::Remote(ref m) if m.contains("not connected")));

    let err = bridge.client.open(0x0403, 0x6001, None).await.unwrap_err();
    assert!(matches!(err, Error::Remote(ref m) if m.contains("0403:6001")));
}

#[tokio::test]
async fn test_close_fails_pending_read() {
    let bridge = start(&[(0x0403, 0x6001)]);
    let client = &bridge.client;
    let id = client.open(0x0403, 0x6001, None).await.unwrap();

    let (read, close) = tokio::join!(client.read(&id, 4), async {
        // Let the read reach the device first
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.close(&id).await
    });

    close.unwrap();
    let err = read.unwrap_err();
    assert!(matches!(err, Error::Remote(ref m) if m.contains("closed")));
    assert!(!bridge.manager.is_connected(&id));
}

#[tokio::test]
async fn test_burst_of_requests_all_answered() {
    let bridge = start(&[(0x0403, 0x6001)]);
    let client = &bridge.client;
    let id = client.open(0x0403, 0x6001, None).await.unwrap();

    // Far more requests in flight than any fixed channel buffer would hold
    let results = join_all((0..300).map(|_| client.list())).await;

    assert_eq!(results.len(), 300);
    for listed in results {
        let listed = listed.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].device_id, id);
    }
    bridge.cancel.cancel();
}
