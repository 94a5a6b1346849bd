//! Services hosted by the two ends of a connection.
//!
//! The collector hosts `metrics`; each agent hosts `agent`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_core::{MethodDescriptor, ServiceInterface};
use tracing::debug;

/// One batch of samples pushed by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricBatch {
    pub source: String,
    pub name: String,
    pub points: Vec<f64>,
    pub collected_at_millis: i64,
}

/// Collector-side sink for pushed batches.
#[derive(Debug, Default)]
pub struct MetricsService {
    batches: AtomicU64,
    points: AtomicU64,
}

impl MetricsService {
    pub fn new() -> Self {
        Self::default()
    }

    async fn push(self: Arc<Self>, batch: MetricBatch) -> Result<(), String> {
        if batch.name.is_empty() {
            return Err("metric name must not be empty".to_string());
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.points
            .fetch_add(batch.points.len() as u64, Ordering::Relaxed);
        debug!(
            source = %batch.source,
            metric = %batch.name,
            points = batch.points.len(),
            "received batch"
        );
        Ok(())
    }

    async fn count(self: Arc<Self>) -> Result<u64, String> {
        Ok(self.total_points())
    }

    pub fn total_points(&self) -> u64 {
        self.points.load(Ordering::Relaxed)
    }

    pub fn total_batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

impl ServiceInterface for MetricsService {
    const NAME: &'static str = "metrics";

    fn methods() -> Vec<MethodDescriptor<Self>> {
        vec![
            MethodDescriptor::new("push", MetricsService::push),
            MethodDescriptor::new("count", MetricsService::count),
        ]
    }
}

/// Agent-side remote commands.
#[derive(Debug)]
pub struct AgentService {
    name: String,
    settings: HashMap<String, String>,
}

impl AgentService {
    pub fn new(name: impl Into<String>, settings: HashMap<String, String>) -> Self {
        Self {
            name: name.into(),
            settings,
        }
    }

    async fn dump_thread(self: Arc<Self>) -> Result<String, String> {
        let current = std::thread::current();
        let thread = current.name().unwrap_or("unnamed");
        Ok(format!(
            "agent {} at {}\n\"{}\" RUNNABLE\n",
            self.name,
            chrono::Utc::now().to_rfc3339(),
            thread
        ))
    }

    async fn fetch_config(self: Arc<Self>, key: String) -> Result<Option<String>, String> {
        Ok(self.settings.get(&key).cloned())
    }
}

impl ServiceInterface for AgentService {
    const NAME: &'static str = "agent";

    fn methods() -> Vec<MethodDescriptor<Self>> {
        vec![
            MethodDescriptor::new("dumpThread", AgentService::dump_thread),
            MethodDescriptor::new("fetchConfig", AgentService::fetch_config),
        ]
    }
}
