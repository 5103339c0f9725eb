//! Request and response envelopes carried over the message channel.
//!
//! Messages are JSON objects. Requests are tagged by `type`; responses carry
//! the `requestId` of the request they answer plus a `success` flag.
//!
//! ```text
//! {"type":"open","requestId":"r1","vendorId":1027,"productId":24577}
//! {"requestId":"r1","success":true,"data":"usb-0403-6001"}
//! {"type":"read","requestId":"r2","deviceId":"usb-0403-6001","length":4}
//! {"requestId":"r2","success":false,"error":"device usb-0403-6001 not connected"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::device::DeviceId;
use crate::transport::OpenOptions;

/// Request `type` values this bridge understands.
pub const REQUEST_TYPES: &[&str] = &["open", "write", "read", "close", "readLine", "list"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    Open {
        request_id: String,
        vendor_id: u16,
        product_id: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<OpenOptions>,
    },
    Write {
        request_id: String,
        device_id: DeviceId,
        data: Vec<u8>,
    },
    Read {
        request_id: String,
        device_id: DeviceId,
        length: usize,
    },
    Close {
        request_id: String,
        device_id: DeviceId,
    },
    ReadLine {
        request_id: String,
        device_id: DeviceId,
    },
    List {
        request_id: String,
    },
}

impl Request {
    pub fn request_id(&self) -> &str {
        match self {
            Request::Open { request_id, .. }
            | Request::Write { request_id, .. }
            | Request::Read { request_id, .. }
            | Request::Close { request_id, .. }
            | Request::ReadLine { request_id, .. }
            | Request::List { request_id } => request_id,
        }
    }

    /// The wire `type` of this request.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Open { .. } => "open",
            Request::Write { .. } => "write",
            Request::Read { .. } => "read",
            Request::Close { .. } => "close",
            Request::ReadLine { .. } => "readLine",
            Request::List { .. } => "list",
        }
    }

    pub fn to_json(&self) -> String {
        // Plain data with string keys always serializes
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Outcome of one request.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(request_id: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            data,
            error: None,
        }
    }

    pub fn failure(request_id: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a channel message as a response. Requests and anything else
    /// that is not a response yield `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        if value.get("type").is_some() {
            return None;
        }
        serde_json::from_value(value).ok()
    }
}

/// Classification of a message seen by the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request(Request),
    /// A known request type whose fields did not parse
    Malformed { request_id: String, error: String },
    /// Not addressed to the bridge
    Ignored(&'static str),
}

/// Classify a channel message.
///
/// Unknown request types are ignored rather than rejected, so peers
/// speaking a newer protocol can share the channel.
pub fn parse_request(text: &str) -> Incoming {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return Incoming::Ignored("not JSON"),
    };
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Incoming::Ignored("no type");
    };
    if !REQUEST_TYPES.contains(&kind) {
        return Incoming::Ignored("unknown type");
    }

    let request_id = value
        .get("requestId")
        .and_then(Value::as_str)
        .map(str::to_string);
    match serde_json::from_value::<Request>(value) {
        Ok(request) => Incoming::Request(request),
        Err(e) => match request_id {
            Some(request_id) => Incoming::Malformed {
                request_id,
                error: format!("invalid request: {}", e),
            },
            None => Incoming::Ignored("malformed request without requestId"),
        },
    }
}
