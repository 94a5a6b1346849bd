//! One symmetric RPC connection.
//!
//! A [`Channel`] owns a connected byte stream and runs three kinds of tasks:
//!
//! - **Read loop**: reads one complete frame at a time. Responses go straight
//!   to the [`TransactionTable`]; requests are handed to the worker pool.
//! - **Workers**: at most `worker_threads` requests execute at once, with up to
//!   `worker_queue_capacity` more waiting. Requests beyond that are answered
//!   immediately with a `ServerBusy` exception.
//! - **Writer**: the only task touching the write half. Every outgoing frame,
//!   request or response, is queued to it already encoded.
//!
//! The connection closes exactly once, on EOF, I/O error, protocol error or
//! [`Channel::close`]. Closing fails every pending call; a closed channel is
//! never reopened.

use crate::config::ChannelConfig;
use crate::dispatcher::{Dispatch, ServerDispatcher};
use crate::error::{Result, TetherError};
use crate::proxy::ClientProxy;
use crate::registry::ServiceRegistry;
use crate::serializer::SerializerRegistry;
use crate::transaction::TransactionTable;
use crate::wire::{self, Frame, RequestFrame, ResponseFrame};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connected,
    Closed,
}

/// Everything a channel needs besides the stream.
pub struct ChannelOptions {
    address: String,
    registry: Arc<ServiceRegistry>,
    serializers: Arc<SerializerRegistry>,
    config: ChannelConfig,
    dispatcher: Option<Arc<dyn Dispatch>>,
}

impl ChannelOptions {
    /// Options for a peer labelled `address` in logs and errors.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            registry: Arc::new(ServiceRegistry::new()),
            serializers: Arc::new(SerializerRegistry::with_defaults()),
            config: ChannelConfig::default(),
            dispatcher: None,
        }
    }

    /// Services the peer may call on this side.
    pub fn registry(mut self, registry: Arc<ServiceRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn serializers(mut self, serializers: Arc<SerializerRegistry>) -> Self {
        self.serializers = serializers;
        self
    }

    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the registry-backed dispatcher for inbound requests.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatch>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }
}

struct ChannelInner {
    address: Arc<str>,
    config: ChannelConfig,
    serializers: Arc<SerializerRegistry>,
    transactions: Arc<TransactionTable>,
    outbound: mpsc::Sender<Bytes>,
    state: watch::Sender<ChannelState>,
    proxy: ClientProxy,
}

impl ChannelInner {
    /// Move to `Closed`. Only the first caller does any work.
    fn shutdown(&self, reason: &str) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == ChannelState::Closed {
                false
            } else {
                *state = ChannelState::Closed;
                true
            }
        });
        if changed {
            info!(peer = %self.address, reason, "Channel closed");
            self.transactions.close(reason);
        }
        changed
    }
}

async fn wait_closed(state: &mut watch::Receiver<ChannelState>) {
    let _ = state.wait_for(|s| *s == ChannelState::Closed).await;
}

/// Handle to a running connection. Clones share it.
///
/// The connection stays open until [`close`](Self::close) is called or the
/// peer goes away; dropping handles does not close it.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Start serving `stream`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open<T>(stream: T, options: ChannelOptions) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let ChannelOptions {
            address,
            registry,
            serializers,
            config,
            dispatcher,
        } = options;

        config.validate()?;
        if !serializers.contains(config.default_serializer) {
            return Err(TetherError::Config {
                message: format!(
                    "default serializer {} is not registered",
                    config.default_serializer
                ),
            });
        }

        let address: Arc<str> = Arc::from(address);
        let transactions = TransactionTable::new(address.to_string(), config.max_pending);
        let (outbound, queue) = mpsc::channel(config.write_queue_capacity);
        let (state, _) = watch::channel(ChannelState::Connected);
        let proxy = ClientProxy::new(
            address.clone(),
            transactions.clone(),
            outbound.clone(),
            serializers.clone(),
            &config,
        );

        let endpoints = registry.len();
        let dispatcher = dispatcher
            .unwrap_or_else(|| Arc::new(ServerDispatcher::new(registry, serializers.clone())));
        let pool = WorkerPool::new(&config);

        let inner = Arc::new(ChannelInner {
            address,
            config,
            serializers,
            transactions,
            outbound,
            state,
            proxy,
        });

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(write_loop(writer, queue, inner.clone()));
        tokio::spawn(read_loop(reader, inner.clone(), dispatcher, pool));

        info!(peer = %inner.address, endpoints, "Channel opened");
        Ok(Self { inner })
    }

    /// Connect over TCP and open a channel labelled with the peer address.
    pub async fn connect(addr: &str, options: ChannelOptions) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let label = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        let options = ChannelOptions {
            address: label,
            ..options
        };
        Self::open(stream, options)
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn peer_address(&self) -> &str {
        &self.inner.address
    }

    /// Proxy for calling services registered on the peer.
    pub fn proxy(&self) -> ClientProxy {
        self.inner.proxy.clone()
    }

    /// Number of outgoing calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.transactions.pending_count()
    }

    /// Close the connection and fail every pending call.
    pub fn close(&self) {
        self.inner.shutdown("closed locally");
    }

    /// Wait until the channel is closed, for whatever reason.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        wait_closed(&mut state).await;
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.inner.address)
            .field("state", &self.state())
            .field("pending", &self.pending_calls())
            .finish()
    }
}

/// Admission and concurrency limits for inbound requests.
#[derive(Clone)]
struct WorkerPool {
    /// Executing plus waiting requests.
    admitted: Arc<Semaphore>,
    /// Executing requests.
    running: Arc<Semaphore>,
}

impl WorkerPool {
    fn new(config: &ChannelConfig) -> Self {
        Self {
            admitted: Arc::new(Semaphore::new(
                config.worker_threads + config.worker_queue_capacity,
            )),
            running: Arc::new(Semaphore::new(config.worker_threads)),
        }
    }

    /// Hand `request` to a worker, or answer busy without waiting.
    fn submit(&self, request: RequestFrame, dispatcher: &Arc<dyn Dispatch>, inner: &Arc<ChannelInner>) {
        let transaction_id = request.transaction_id;
        let admission = match self.admitted.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    transaction_id,
                    peer = %inner.address,
                    service = %request.service_name,
                    method = %request.method_name,
                    "worker pool saturated, rejecting request"
                );
                let response = ResponseFrame::exception(
                    transaction_id,
                    "ServerBusy: worker pool saturated, request rejected",
                );
                let inner = inner.clone();
                tokio::spawn(async move { send_response(&inner, response).await });
                return;
            }
        };

        let running = self.running.clone();
        let dispatcher = dispatcher.clone();
        let inner = inner.clone();
        tokio::spawn(async move {
            let _admission = admission;
            let Ok(_worker) = running.acquire_owned().await else {
                return;
            };
            debug!(
                transaction_id,
                service = %request.service_name,
                method = %request.method_name,
                "dispatching request"
            );
            let response = dispatcher.dispatch(request).await;
            send_response(&inner, response).await;
        });
    }
}

/// Encode and enqueue a response; encoding failures degrade to an exception.
async fn send_response(inner: &ChannelInner, response: ResponseFrame) {
    let transaction_id = response.transaction_id;
    let encoded = match wire::encode(&Frame::Response(response)) {
        Ok(bytes) if wire::body_len(&bytes) <= inner.config.max_frame_size => bytes,
        Ok(bytes) => {
            warn!(transaction_id, size = bytes.len(), "response exceeds frame limit");
            match wire::encode(&Frame::Response(ResponseFrame::exception(
                transaction_id,
                format!("SerializationError: response of {} bytes exceeds the frame limit", bytes.len()),
            ))) {
                Ok(fallback) => fallback,
                Err(e) => {
                    error!(transaction_id, error = %e, "failed to encode response");
                    return;
                }
            }
        }
        Err(e) => {
            error!(transaction_id, error = %e, "failed to encode response");
            return;
        }
    };

    if inner.outbound.send(encoded).await.is_err() {
        debug!(transaction_id, "connection closed before response was written");
    }
}

async fn read_loop<R>(
    mut reader: R,
    inner: Arc<ChannelInner>,
    dispatcher: Arc<dyn Dispatch>,
    pool: WorkerPool,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut state = inner.state.subscribe();
    let max_frame_size = inner.config.max_frame_size;

    let reason = loop {
        let body = tokio::select! {
            result = wire::read_frame(&mut reader, max_frame_size) => result,
            _ = wait_closed(&mut state) => return,
        };

        let frame = match body.and_then(|bytes| bytes.map(wire::decode_body).transpose()) {
            Ok(Some(frame)) => frame,
            Ok(None) => break "peer closed the connection".to_string(),
            Err(e) => {
                error!(peer = %inner.address, error = %e, "Closing connection");
                break e.to_string();
            }
        };

        match frame {
            Frame::Response(response) => {
                if let Some(id) = response.serializer_id() {
                    if !inner.serializers.contains(id) {
                        error!(peer = %inner.address, serializer_id = id, "unknown serializer in response");
                        break format!("unknown serializer id {} in response", id);
                    }
                }
                inner.transactions.resolve(response.transaction_id, response);
            }
            Frame::Request(request) => {
                if !inner.serializers.contains(request.serializer_id) {
                    error!(
                        peer = %inner.address,
                        serializer_id = request.serializer_id,
                        "unknown serializer in request"
                    );
                    break format!("unknown serializer id {} in request", request.serializer_id);
                }
                pool.submit(request, &dispatcher, &inner);
            }
        }
    };

    inner.shutdown(&reason);
}

async fn write_loop<W>(mut writer: W, mut queue: mpsc::Receiver<Bytes>, inner: Arc<ChannelInner>)
where
    W: AsyncWrite + Unpin + Send,
{
    let mut state = inner.state.subscribe();
    loop {
        let frame = tokio::select! {
            frame = queue.recv() => frame,
            _ = wait_closed(&mut state) => break,
        };
        let Some(frame) = frame else { break };

        if let Err(e) = wire::write_frame(&mut writer, &frame).await {
            error!(peer = %inner.address, error = %e, "Write failed");
            inner.shutdown(&e.to_string());
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_open_rejects_unknown_default_serializer() {
        let (stream, _peer) = tokio::io::duplex(1024);
        let options = ChannelOptions::new("peer")
            .config(ChannelConfig::default().with_default_serializer(77));
        let err = Channel::open(stream, options).unwrap_err();
        assert!(matches!(err, TetherError::Config { .. }));
    }

    #[tokio::test]
    async fn test_peer_eof_closes_channel() {
        let (stream, peer) = tokio::io::duplex(1024);
        let channel = Channel::open(stream, ChannelOptions::new("peer")).unwrap();
        assert!(channel.is_connected());

        drop(peer);
        tokio::time::timeout(Duration::from_secs(1), channel.closed())
            .await
            .unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_garbage_closes_channel() {
        let (stream, mut peer) = tokio::io::duplex(1024);
        let channel = Channel::open(stream, ChannelOptions::new("peer")).unwrap();

        // Length 3, then an unknown message type.
        peer.write_all(&[0, 0, 0, 3, 9, 9, 9]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), channel.closed())
            .await
            .unwrap();
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (stream, _peer) = tokio::io::duplex(1024);
        let channel = Channel::open(stream, ChannelOptions::new("peer")).unwrap();
        channel.close();
        channel.close();
        channel.closed().await;

        let err = channel
            .proxy()
            .call::<()>("metrics", "count", (), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::ConnectionClosed { .. }));
    }
}
