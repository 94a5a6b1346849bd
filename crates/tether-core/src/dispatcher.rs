//! Execution of inbound requests against registered endpoints.
//!
//! Every request produces exactly one response carrying its transaction id.
//! Lookup, arity and argument failures are answered with exception messages
//! prefixed by the error kind (`"ServiceNotFoundError: ..."`,
//! `"BadRequestError: ..."`) so the calling side can rebuild a typed error.
//! Endpoint error messages travel verbatim unless they begin with one of those
//! prefixes, in which case they are wrapped as `"ServiceInvocationError: ..."`.

use crate::error::TetherError;
use crate::registry::{InvokeError, ServiceRegistry};
use crate::serializer::SerializerRegistry;
use crate::wire::{RequestFrame, ResponseBody, ResponseFrame};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Exception message sent back when a handler panics.
pub const PANIC_MESSAGE: &str = "handler panicked";

/// Exception prefixes the calling side maps back to typed errors.
pub(crate) const NOT_FOUND_PREFIX: &str = "ServiceNotFoundError: ";
pub(crate) const BAD_REQUEST_PREFIX: &str = "BadRequestError: ";
pub(crate) const INVOCATION_PREFIX: &str = "ServiceInvocationError: ";

/// Wrap an endpoint's own error message if it collides with a reserved prefix.
pub(crate) fn endpoint_exception(message: String) -> String {
    let reserved = [NOT_FOUND_PREFIX, BAD_REQUEST_PREFIX, INVOCATION_PREFIX]
        .iter()
        .any(|prefix| message.starts_with(prefix));
    if reserved {
        format!("{}{}", INVOCATION_PREFIX, message)
    } else {
        message
    }
}

/// Turns an inbound request into its response.
///
/// The channel calls this from its worker pool; implementations must not
/// assume any particular task or thread.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, request: RequestFrame) -> ResponseFrame;
}

/// The standard dispatcher backed by a [`ServiceRegistry`].
#[derive(Debug, Clone)]
pub struct ServerDispatcher {
    registry: Arc<ServiceRegistry>,
    serializers: Arc<SerializerRegistry>,
}

impl ServerDispatcher {
    pub fn new(registry: Arc<ServiceRegistry>, serializers: Arc<SerializerRegistry>) -> Self {
        Self {
            registry,
            serializers,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    fn reject(transaction_id: u64, err: TetherError) -> ResponseFrame {
        let detail = match &err {
            TetherError::ServiceNotFound { service, method } => {
                format!("no endpoint registered for {}.{}", service, method)
            }
            TetherError::BadRequest { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ResponseFrame::exception(transaction_id, format!("{}: {}", err.kind(), detail))
    }

    fn bad_request(request: &RequestFrame, message: String) -> ResponseFrame {
        Self::reject(
            request.transaction_id,
            TetherError::BadRequest {
                service: request.service_name.clone(),
                method: request.method_name.clone(),
                message,
            },
        )
    }

    async fn execute(&self, request: RequestFrame) -> ResponseFrame {
        let txn = request.transaction_id;

        let Some(endpoint) = self
            .registry
            .lookup(&request.service_name, &request.method_name)
        else {
            debug!(
                transaction_id = txn,
                service = %request.service_name,
                method = %request.method_name,
                "no endpoint for request"
            );
            return Self::reject(
                txn,
                TetherError::ServiceNotFound {
                    service: request.service_name,
                    method: request.method_name,
                },
            );
        };

        let expected = endpoint.parameter_count();
        let received = request.argument_count as usize;
        if received != expected {
            return Self::bad_request(
                &request,
                format!(
                    "{} expects {} argument(s) but received {}",
                    endpoint.qualified_name(),
                    expected,
                    received
                ),
            );
        }

        let serializer = match self.serializers.get(request.serializer_id) {
            Ok(serializer) => serializer,
            Err(e) => return Self::bad_request(&request, e.to_string()),
        };

        let args = match serializer.deserialize(&request.arguments, received) {
            Ok(args) => args,
            Err(e) => {
                return Self::bad_request(
                    &request,
                    format!("{}: undecodable arguments: {}", endpoint.qualified_name(), e),
                )
            }
        };

        let target = endpoint.clone();
        let invocation = AssertUnwindSafe(async move { target.invoke(args).await })
            .catch_unwind()
            .await;
        let value = match invocation {
            Ok(Ok(value)) => value,
            Ok(Err(InvokeError::BadArgument {
                index,
                expected,
                message,
            })) => {
                return Self::bad_request(
                    &request,
                    format!(
                        "{}: argument {} is not a valid {}: {}",
                        endpoint.qualified_name(),
                        index,
                        expected,
                        message
                    ),
                );
            }
            Ok(Err(InvokeError::Failed(message))) => {
                debug!(
                    transaction_id = txn,
                    endpoint = %endpoint.qualified_name(),
                    error = %message,
                    "endpoint returned an error"
                );
                return ResponseFrame::exception(txn, endpoint_exception(message));
            }
            Err(_) => {
                error!(
                    transaction_id = txn,
                    endpoint = %endpoint.qualified_name(),
                    "endpoint panicked"
                );
                return ResponseFrame::exception(txn, PANIC_MESSAGE);
            }
        };

        if value.is_null() {
            return ResponseFrame::empty(txn);
        }

        let mut payload = bytes::BytesMut::new();
        match serializer.serialize(&value, &mut payload) {
            Ok(()) => ResponseFrame::new(
                txn,
                ResponseBody::Value {
                    serializer_id: serializer.id(),
                    payload: payload.freeze(),
                },
            ),
            Err(e) => {
                warn!(
                    transaction_id = txn,
                    endpoint = %endpoint.qualified_name(),
                    error = %e,
                    "failed to encode return value"
                );
                Self::reject(txn, e)
            }
        }
    }
}

#[async_trait]
impl Dispatch for ServerDispatcher {
    async fn dispatch(&self, request: RequestFrame) -> ResponseFrame {
        self.execute(request).await
    }
}
