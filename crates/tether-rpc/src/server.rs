//! TCP collector: accepts agent connections and opens a channel per agent.
//!
//! Every accepted connection gets its own [`Channel`] sharing one
//! [`ServiceRegistry`]. Right after connecting, the collector asks the agent
//! for a thread dump over the same connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    Channel, ChannelConfig, ChannelOptions, Result, SerializerRegistry, ServiceRegistry,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Settings shared by every accepted connection.
#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub max_connections: usize,
    pub channel: ChannelConfig,
    /// Timeout of the per-connection `agent.dumpThread` probe.
    pub probe_timeout: Duration,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            max_connections: 64,
            channel: ChannelConfig::default(),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// A running collector. Dropping it stops accepting and closes every channel.
pub struct CollectorHandle {
    addr: SocketAddr,
    stop: watch::Sender<bool>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl CollectorHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&mut self) {
        self.stop.send_replace(true);
    }
}

impl Drop for CollectorHandle {
    fn drop(&mut self) {
        self.shutdown();
        self.accept_task.abort();
    }
}

struct Collector {
    registry: Arc<ServiceRegistry>,
    serializers: Arc<SerializerRegistry>,
    options: CollectorOptions,
    /// One permit per agent connection.
    slots: Arc<Semaphore>,
}

pub struct CollectorServer;

impl CollectorServer {
    /// Bind `host:port` (port 0 = OS-assigned) and start accepting.
    pub async fn start(
        host: &str,
        port: u16,
        registry: Arc<ServiceRegistry>,
        options: CollectorOptions,
    ) -> Result<CollectorHandle> {
        options.channel.validate()?;

        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        info!("Collector listening on {}", addr);

        let (stop, stop_rx) = watch::channel(false);
        let collector = Arc::new(Collector {
            registry,
            serializers: Arc::new(SerializerRegistry::with_defaults()),
            slots: Arc::new(Semaphore::new(options.max_connections)),
            options,
        });
        let accept_task = tokio::spawn(collector.accept_agents(listener, stop_rx));

        Ok(CollectorHandle {
            addr,
            stop,
            accept_task,
        })
    }
}

impl Collector {
    async fn accept_agents(self: Arc<Self>, listener: TcpListener, mut stop_rx: watch::Receiver<bool>) {
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = stop_requested(&mut stop_rx) => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    }
                },
            };

            let Ok(slot) = self.slots.clone().try_acquire_owned() else {
                warn!(
                    peer = %peer_addr,
                    max_connections = self.options.max_connections,
                    "Collector full, dropping agent connection"
                );
                continue;
            };

            let collector = self.clone();
            let stop_rx = stop_rx.clone();
            tokio::spawn(async move {
                let _slot = slot;
                if let Err(e) = collector.serve_agent(stream, peer_addr, stop_rx).await {
                    debug!("Connection {} ended: {}", peer_addr, e);
                }
            });
        }
        info!("Collector stopped accepting");
    }

    async fn serve_agent(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        mut stop_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let channel = Channel::open(
            stream,
            ChannelOptions::new(peer_addr.to_string())
                .registry(self.registry.clone())
                .serializers(self.serializers.clone())
                .config(self.options.channel.clone()),
        )?;

        let probe = {
            let proxy = channel.proxy();
            let timeout = self.options.probe_timeout;
            tokio::spawn(async move {
                match proxy.call::<String>("agent", "dumpThread", (), timeout).await {
                    Ok(dump) => info!(peer = %peer_addr, "Agent thread dump:\n{}", dump.trim_end()),
                    Err(e) => warn!(peer = %peer_addr, error = %e, "Thread dump failed"),
                }
            })
        };

        tokio::select! {
            _ = channel.closed() => {}
            _ = stop_requested(&mut stop_rx) => channel.close(),
        }
        probe.abort();
        Ok(())
    }
}

async fn stop_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}
