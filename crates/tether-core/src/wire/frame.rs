//! Frame types exchanged on the wire.

use bytes::Bytes;

/// Message-type tag for request frames.
pub const REQUEST_TAG: u8 = 1;
/// Message-type tag for response frames.
pub const RESPONSE_TAG: u8 = 2;

/// One unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
}

impl Frame {
    /// Transaction id shared by a request and its response.
    pub fn transaction_id(&self) -> u64 {
        match self {
            Frame::Request(req) => req.transaction_id,
            Frame::Response(resp) => resp.transaction_id,
        }
    }

    pub fn message_type(&self) -> u8 {
        match self {
            Frame::Request(_) => REQUEST_TAG,
            Frame::Response(_) => RESPONSE_TAG,
        }
    }
}

/// A call to `(service_name, method_name)`.
///
/// `arguments` holds `argument_count` values concatenated by the serializer
/// named by `serializer_id`. They stay opaque until the endpoint is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub transaction_id: u64,
    pub service_name: String,
    pub method_name: String,
    pub serializer_id: u32,
    pub argument_count: u32,
    pub arguments: Bytes,
}

/// Outcome carried by a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Completed without a return value.
    Empty,
    /// The remote side failed; only the message crosses the wire.
    Exception(String),
    /// Completed with a value encoded by `serializer_id`.
    Value { serializer_id: u32, payload: Bytes },
}

/// The answer to a [`RequestFrame`], correlated by `transaction_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub transaction_id: u64,
    pub server_responded_at_millis: u64,
    pub body: ResponseBody,
}

impl ResponseFrame {
    /// Build a response stamped with the current time.
    pub fn new(transaction_id: u64, body: ResponseBody) -> Self {
        Self {
            transaction_id,
            server_responded_at_millis: now_millis(),
            body,
        }
    }

    pub fn exception(transaction_id: u64, message: impl Into<String>) -> Self {
        Self::new(transaction_id, ResponseBody::Exception(message.into()))
    }

    pub fn empty(transaction_id: u64) -> Self {
        Self::new(transaction_id, ResponseBody::Empty)
    }

    pub fn has_exception(&self) -> bool {
        matches!(self.body, ResponseBody::Exception(_))
    }

    pub fn has_return_value(&self) -> bool {
        matches!(self.body, ResponseBody::Value { .. })
    }

    pub fn exception_message(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Exception(message) => Some(message),
            _ => None,
        }
    }

    /// Serializer id of the return value, if there is one.
    pub fn serializer_id(&self) -> Option<u32> {
        match &self.body {
            ResponseBody::Value { serializer_id, .. } => Some(*serializer_id),
            _ => None,
        }
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
