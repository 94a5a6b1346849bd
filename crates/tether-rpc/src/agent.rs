//! Agent mode: connect to a collector, expose the `agent` service and push
//! metric batches until done or disconnected.

use crate::services::{AgentService, MetricBatch};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::{Channel, ChannelConfig, ChannelOptions, ServiceRegistry};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub addr: String,
    pub name: String,
    pub interval: Duration,
    /// Batches to push before exiting; 0 pushes until the connection closes.
    pub batches: u64,
    pub channel: ChannelConfig,
    pub settings: HashMap<String, String>,
}

/// What an agent run accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentReport {
    pub batches_pushed: u64,
    /// Points the collector reported in total, if it could still be asked.
    pub collector_points: Option<u64>,
}

pub async fn run(options: AgentOptions) -> Result<AgentReport> {
    let registry = Arc::new(ServiceRegistry::new());
    registry.register(Arc::new(AgentService::new(
        options.name.clone(),
        options.settings.clone(),
    )))?;

    let channel = Channel::connect(
        &options.addr,
        ChannelOptions::new(options.addr.clone())
            .registry(registry)
            .config(options.channel.clone()),
    )
    .await
    .with_context(|| format!("failed to connect to collector at {}", options.addr))?;
    info!("Connected to collector at {}", channel.peer_address());

    let proxy = channel.proxy();
    proxy.expect_arity("metrics", "push", 1);
    proxy.expect_arity("metrics", "count", 0);

    let started = Instant::now();
    let mut ticker = tokio::time::interval(options.interval);
    let mut pushed = 0u64;

    while options.batches == 0 || pushed < options.batches {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = channel.closed() => {
                warn!("Collector closed the connection");
                break;
            }
        }

        let batch = MetricBatch {
            source: options.name.clone(),
            name: "agent.uptime_seconds".to_string(),
            points: vec![started.elapsed().as_secs_f64(), pushed as f64],
            collected_at_millis: chrono::Utc::now().timestamp_millis(),
        };
        match proxy.call_default::<()>("metrics", "push", (batch,)).await {
            Ok(()) => pushed += 1,
            Err(e) if e.is_retryable() && channel.is_connected() => {
                warn!("Push failed, will retry on next tick: {}", e);
            }
            Err(e) => return Err(e).context("failed to push metric batch"),
        }
    }

    let collector_points = if channel.is_connected() {
        proxy.call_default::<u64>("metrics", "count", ()).await.ok()
    } else {
        None
    };
    info!(
        batches = pushed,
        collector_points = ?collector_points,
        "Agent finished"
    );

    channel.close();
    Ok(AgentReport {
        batches_pushed: pushed,
        collector_points,
    })
}
