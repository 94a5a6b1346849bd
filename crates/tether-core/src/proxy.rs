//! Outgoing calls: turns `(service, method, args)` into a request frame and
//! awaits the correlated response.

use crate::dispatcher::{BAD_REQUEST_PREFIX, INVOCATION_PREFIX, NOT_FOUND_PREFIX};
use crate::error::{Result, TetherError};
use crate::registry::ParamType;
use crate::serializer::SerializerRegistry;
use crate::transaction::{CallOutcome, TransactionTable};
use crate::wire::{self, Frame, RequestFrame, ResponseBody, ResponseFrame};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// An ordered argument list built value by value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    values: Vec<Value>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one argument.
    pub fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.values.push(serde_json::to_value(value)?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Vec<Value>> for Arguments {
    fn from(values: Vec<Value>) -> Self {
        Self { values }
    }
}

/// Conversion into the ordered values sent as call arguments.
pub trait IntoArguments {
    fn into_arguments(self) -> Result<Vec<Value>>;
}

impl IntoArguments for Arguments {
    fn into_arguments(self) -> Result<Vec<Value>> {
        Ok(self.values)
    }
}

impl IntoArguments for Vec<Value> {
    fn into_arguments(self) -> Result<Vec<Value>> {
        Ok(self)
    }
}

macro_rules! impl_into_arguments {
    ($($ty:ident => $idx:tt),*) => {
        impl<$($ty: Serialize,)*> IntoArguments for ($($ty,)*) {
            fn into_arguments(self) -> Result<Vec<Value>> {
                Ok(vec![$(serde_json::to_value(&self.$idx)?,)*])
            }
        }
    };
}

impl_into_arguments!();
impl_into_arguments!(A1 => 0);
impl_into_arguments!(A1 => 0, A2 => 1);
impl_into_arguments!(A1 => 0, A2 => 1, A3 => 2);
impl_into_arguments!(A1 => 0, A2 => 1, A3 => 2, A4 => 3);
impl_into_arguments!(A1 => 0, A2 => 1, A3 => 2, A4 => 3, A5 => 4);
impl_into_arguments!(A1 => 0, A2 => 1, A3 => 2, A4 => 3, A5 => 4, A6 => 5);

/// Handle for issuing calls to the peer of one channel.
///
/// Cheap to clone; clones share the connection and the contract book.
#[derive(Clone)]
pub struct ClientProxy {
    address: Arc<str>,
    transactions: Arc<TransactionTable>,
    outbound: mpsc::Sender<Bytes>,
    serializers: Arc<SerializerRegistry>,
    default_serializer: u32,
    default_timeout: Duration,
    max_frame_size: usize,
    contracts: Arc<RwLock<HashMap<(String, String), usize>>>,
}

impl ClientProxy {
    pub(crate) fn new(
        address: Arc<str>,
        transactions: Arc<TransactionTable>,
        outbound: mpsc::Sender<Bytes>,
        serializers: Arc<SerializerRegistry>,
        config: &crate::config::ChannelConfig,
    ) -> Self {
        Self {
            address,
            transactions,
            outbound,
            serializers,
            default_serializer: config.default_serializer,
            default_timeout: config.default_timeout(),
            max_frame_size: config.max_frame_size,
            contracts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn peer_address(&self) -> &str {
        &self.address
    }

    /// Record the known arity of a remote method.
    ///
    /// Calls with a different argument count then fail locally with
    /// `BadRequest` instead of being sent.
    pub fn expect_arity(&self, service: &str, method: &str, argument_count: usize) {
        self.contracts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((service.to_string(), method.to_string()), argument_count);
    }

    fn known_arity(&self, service: &str, method: &str) -> Option<usize> {
        self.contracts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(service.to_string(), method.to_string()))
            .copied()
    }

    /// Call with the channel's default timeout and serializer.
    pub async fn call_default<R: DeserializeOwned>(
        &self,
        service: &str,
        method: &str,
        args: impl IntoArguments,
    ) -> Result<R> {
        self.call(service, method, args, self.default_timeout).await
    }

    /// Call `service.method` and decode the result as `R`.
    ///
    /// `()` and `Option<T>` accept responses that carry no value.
    pub async fn call<R: DeserializeOwned>(
        &self,
        service: &str,
        method: &str,
        args: impl IntoArguments,
        timeout: Duration,
    ) -> Result<R> {
        self.call_with_serializer(service, method, args, self.default_serializer, timeout)
            .await
    }

    /// Like [`call`](Self::call), encoding the arguments with `serializer_id`.
    pub async fn call_with_serializer<R: DeserializeOwned>(
        &self,
        service: &str,
        method: &str,
        args: impl IntoArguments,
        serializer_id: u32,
        timeout: Duration,
    ) -> Result<R> {
        let args = args.into_arguments()?;
        let bad_request = |message: String| TetherError::BadRequest {
            service: service.to_string(),
            method: method.to_string(),
            message,
        };

        if let Some(expected) = self.known_arity(service, method) {
            if expected != args.len() {
                return Err(bad_request(format!(
                    "{}.{} expects {} argument(s) but was given {}",
                    service,
                    method,
                    expected,
                    args.len()
                )));
            }
        }

        let serializer = self.serializers.get(serializer_id)?;
        let arguments = serializer.serialize_all(&args)?;

        let (transaction_id, pending) = self.transactions.allocate(ParamType::of::<R>(), timeout)?;
        let encoded = wire::encode(&Frame::Request(RequestFrame {
            transaction_id,
            service_name: service.to_string(),
            method_name: method.to_string(),
            serializer_id,
            argument_count: args.len() as u32,
            arguments,
        }))?;

        if wire::body_len(&encoded) > self.max_frame_size {
            return Err(bad_request(format!(
                "request of {} bytes exceeds the {} byte frame limit",
                encoded.len(),
                self.max_frame_size
            )));
        }

        debug!(
            transaction_id,
            service,
            method,
            serializer_id,
            peer = %self.address,
            "sending request"
        );

        let timed_out = || TetherError::Timeout {
            address: self.address.to_string(),
            service: service.to_string(),
            method: method.to_string(),
            timeout_millis: timeout.as_millis() as u64,
        };

        match tokio::time::timeout(timeout, self.outbound.send(encoded)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(TetherError::ConnectionClosed {
                    address: self.address.to_string(),
                })
            }
            Err(_) => return Err(timed_out()),
        }

        match pending.wait().await {
            CallOutcome::Responded(response) => self.complete(service, method, response),
            CallOutcome::Failed(err) => Err(err),
            CallOutcome::TimedOut => Err(timed_out()),
        }
    }

    fn complete<R: DeserializeOwned>(
        &self,
        service: &str,
        method: &str,
        response: ResponseFrame,
    ) -> Result<R> {
        let value = match response.body {
            ResponseBody::Exception(message) => {
                return Err(classify_exception(
                    service,
                    method,
                    response.transaction_id,
                    &message,
                ));
            }
            body => decode_return_value(&self.serializers, body)?,
        };

        serde_json::from_value(value).map_err(|e| {
            TetherError::serialization(format!(
                "result of {}.{} is not a valid {}: {}",
                service,
                method,
                std::any::type_name::<R>(),
                e
            ))
        })
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.transactions.pending_count()
    }
}

/// Rebuild the typed error a remote exception message stands for.
fn classify_exception(
    service: &str,
    method: &str,
    transaction_id: u64,
    message: &str,
) -> TetherError {
    let invocation = |message: &str| TetherError::ServiceInvocation {
        service: service.to_string(),
        method: method.to_string(),
        transaction_id,
        message: message.to_string(),
    };

    if let Some(wrapped) = message.strip_prefix(INVOCATION_PREFIX) {
        invocation(wrapped)
    } else if message.starts_with(NOT_FOUND_PREFIX) {
        TetherError::ServiceNotFound {
            service: service.to_string(),
            method: method.to_string(),
        }
    } else if let Some(detail) = message.strip_prefix(BAD_REQUEST_PREFIX) {
        TetherError::BadRequest {
            service: service.to_string(),
            method: method.to_string(),
            message: detail.to_string(),
        }
    } else {
        invocation(message)
    }
}

/// Decode a return value, mapping an absent value to `null`.
fn decode_return_value(serializers: &SerializerRegistry, body: ResponseBody) -> Result<Value> {
    match body {
        ResponseBody::Value {
            serializer_id,
            payload,
        } => {
            let serializer = serializers.get(serializer_id)?;
            let mut values = serializer.deserialize(&payload, 1)?;
            Ok(values.pop().unwrap_or(Value::Null))
        }
        _ => Ok(Value::Null),
    }
}

impl std::fmt::Debug for ClientProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientProxy")
            .field("address", &self.address)
            .field("default_serializer", &self.default_serializer)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
