//! Message bridge between the channel and the connection manager.
//!
//! The bridge subscribes to the channel, turns each request into a
//! connection manager call on its own task, and posts exactly one response
//! when that call settles. Requests for the same device are ordered by the
//! manager, not by the bridge.
//!
//! Handler tasks are tracked, so whoever stops the bridge can wait for every
//! accepted request to be answered.

use serde_json::Value;
use std::sync::Arc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::channel::{MessageChannel, Subscription};
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::protocol::{parse_request, Incoming, Request, Response};
use crate::tracing::prelude::*;

pub struct MessageBridge {
    manager: Arc<ConnectionManager>,
    channel: MessageChannel,
    rx: Subscription,
    default_baud_rate: u32,
    handlers: TaskTracker,
}

impl MessageBridge {
    /// Create a bridge subscribed to `channel`. Requests posted from now on
    /// are handled once `run` is called.
    pub fn new(
        manager: Arc<ConnectionManager>,
        channel: MessageChannel,
        default_baud_rate: u32,
    ) -> Self {
        let rx = channel.subscribe();
        Self {
            manager,
            channel,
            rx,
            default_baud_rate,
            handlers: TaskTracker::new(),
        }
    }

    /// Tracker of the request handlers. It is closed once `run` returns,
    /// so `wait()` then resolves when the last accepted request settles.
    pub fn handlers(&self) -> TaskTracker {
        self.handlers.clone()
    }

    /// Serve requests until cancelled or the channel closes.
    ///
    /// Requests delivered before the cancellation are still dispatched.
    /// Handlers are not awaited here; see `handlers`.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(channel = %self.channel.name(), "Message bridge started");
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = self.rx.recv() => message,
            };
            match message {
                Some(text) => self.dispatch(&text),
                None => break,
            }
        }
        while let Ok(text) = self.rx.try_recv() {
            self.dispatch(&text);
        }
        self.handlers.close();
        info!(
            channel = %self.channel.name(),
            in_flight = self.handlers.len(),
            "Message bridge stopped"
        );
    }

    fn dispatch(&self, text: &str) {
        match parse_request(text) {
            Incoming::Request(request) => {
                debug!(
                    request_id = request.request_id(),
                    kind = request.kind(),
                    "Request received"
                );
                let manager = self.manager.clone();
                let channel = self.channel.clone();
                let default_baud_rate = self.default_baud_rate;
                self.handlers.spawn(async move {
                    let response = handle(&manager, default_baud_rate, request).await;
                    channel.post(response.to_json());
                });
            }
            Incoming::Malformed { request_id, error } => {
                debug!(request_id = %request_id, error = %error, "Malformed request");
                self.channel.post(Response::failure(request_id, error).to_json());
            }
            Incoming::Ignored(reason) => {
                debug!(reason, "Ignoring channel message");
            }
        }
    }
}

/// Run one request against the manager and build its response.
pub async fn handle(
    manager: &ConnectionManager,
    default_baud_rate: u32,
    request: Request,
) -> Response {
    let request_id = request.request_id().to_string();
    let kind = request.kind();

    let result: Result<Option<Value>> = match request {
        Request::Open {
            vendor_id,
            product_id,
            options,
            ..
        } => {
            let mut options = options.unwrap_or_default();
            options.baud_rate = Some(options.baud_rate_or(default_baud_rate));
            manager
                .connect(vendor_id, product_id, &options)
                .await
                .map(|device_id| Some(Value::String(device_id.to_string())))
        }
        Request::Write {
            device_id, data, ..
        } => manager.write(&device_id, &data).await.map(|()| None),
        Request::Read {
            device_id, length, ..
        } => manager
            .read(&device_id, length)
            .await
            .map(|bytes| Some(Value::from(bytes))),
        Request::ReadLine { device_id, .. } => manager
            .read_line(&device_id)
            .await
            .map(|bytes| Some(Value::from(bytes))),
        Request::Close { device_id, .. } => {
            manager.disconnect(&device_id).await.map(|()| None)
        }
        Request::List { .. } => serde_json::to_value(manager.active_connections())
            .map(Some)
            .map_err(|e| Error::Protocol(e.to_string())),
    };

    match result {
        Ok(data) => Response::ok(request_id, data),
        Err(e) => {
            debug!(request_id = %request_id, kind, error = %e, "Request failed");
            Response::failure(request_id, e)
        }
    }
}
