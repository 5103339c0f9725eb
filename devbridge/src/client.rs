//! Caller-side handle for a message bridge.
//!
//! `BridgeClient` posts requests on a channel and waits for the response
//! with the matching `requestId`. Responses to other clients' requests are
//! ignored, so any number of clients can share one channel.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::channel::{MessageChannel, Subscription};
use crate::connection::ConnectionInfo;
use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::protocol::{Request, Response};
use crate::tracing::prelude::*;
use crate::transport::OpenOptions;

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(1);

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Response>>>>;

pub struct BridgeClient {
    channel: MessageChannel,
    prefix: String,
    next_id: AtomicU64,
    pending: Pending,
    timeout: Option<Duration>,
    listener: JoinHandle<()>,
}

impl BridgeClient {
    /// Create a client on `channel`. Must be called inside a tokio runtime.
    pub fn new(channel: MessageChannel) -> Self {
        let prefix = format!("client{}", CLIENT_SEQ.fetch_add(1, Ordering::Relaxed));
        Self::with_prefix(channel, prefix)
    }

    /// Create a client whose request IDs start with `prefix`.
    pub fn with_prefix(channel: MessageChannel, prefix: impl Into<String>) -> Self {
        let pending: Pending = Arc::default();
        let listener = tokio::spawn(listen(channel.subscribe(), pending.clone()));
        Self {
            channel,
            prefix: prefix.into(),
            next_id: AtomicU64::new(1),
            pending,
            timeout: None,
            listener,
        }
    }

    /// Fail requests that get no response within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Connect to a device, returning its ID.
    pub async fn open(
        &self,
        vendor_id: u16,
        product_id: u16,
        options: Option<OpenOptions>,
    ) -> Result<DeviceId> {
        let data = self
            .call(|request_id| Request::Open {
                request_id,
                vendor_id,
                product_id,
                options,
            })
            .await?;
        decode(data)
    }

    pub async fn write(&self, device_id: &DeviceId, data: &[u8]) -> Result<()> {
        self.call(|request_id| Request::Write {
            request_id,
            device_id: device_id.clone(),
            data: data.to_vec(),
        })
        .await?;
        Ok(())
    }

    pub async fn read(&self, device_id: &DeviceId, length: usize) -> Result<Vec<u8>> {
        let data = self
            .call(|request_id| Request::Read {
                request_id,
                device_id: device_id.clone(),
                length,
            })
            .await?;
        decode(data)
    }

    pub async fn read_line(&self, device_id: &DeviceId) -> Result<Vec<u8>> {
        let data = self
            .call(|request_id| Request::ReadLine {
                request_id,
                device_id: device_id.clone(),
            })
            .await?;
        decode(data)
    }

    pub async fn close(&self, device_id: &DeviceId) -> Result<()> {
        self.call(|request_id| Request::Close {
            request_id,
            device_id: device_id.clone(),
        })
        .await?;
        Ok(())
    }

    /// Connections currently open on the bridge.
    pub async fn list(&self) -> Result<Vec<ConnectionInfo>> {
        let data = self.call(|request_id| Request::List { request_id }).await?;
        decode(data)
    }

    async fn call(&self, build: impl FnOnce(String) -> Request) -> Result<Option<Value>> {
        let request_id = format!(
            "{}-{}",
            self.prefix,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        let request = build(request_id.clone());
        trace!(request_id = %request_id, kind = request.kind(), "Posting request");
        self.channel.post(request.to_json());

        let response = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(response) => response,
                Err(_) => {
                    self.pending.lock().remove(&request_id);
                    return Err(Error::Timeout(format!("request {}", request_id)));
                }
            },
            None => rx.await,
        }
        .map_err(|_| Error::Protocol(format!("no response for {}", request_id)))?;

        if response.success {
            Ok(response.data)
        } else {
            Err(Error::Remote(
                response.error.unwrap_or_else(|| "request failed".to_string()),
            ))
        }
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(mut rx: Subscription, pending: Pending) {
    while let Some(text) = rx.recv().await {
        let Some(response) = Response::parse(&text) else {
            continue;
        };
        if let Some(tx) = pending.lock().remove(&response.request_id) {
            // The caller may have given up waiting
            let _ = tx.send(response);
        }
    }
}

fn decode<T: DeserializeOwned>(data: Option<Value>) -> Result<T> {
    serde_json::from_value(data.unwrap_or(Value::Null))
        .map_err(|e| Error::Protocol(format!("unexpected response data: {}", e)))
}
