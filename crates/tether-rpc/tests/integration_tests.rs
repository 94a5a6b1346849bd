//! Integration tests for the tether-rpc binary.
//!
//! These tests start `tether-rpc serve` as a child process, discover its port
//! from stdout and talk to it over real TCP, either through the library or
//! through a second `tether-rpc agent` process.

use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    Channel, ChannelOptions, MethodDescriptor, ServiceInterface, ServiceRegistry, TetherError,
};
use tokio::io::AsyncBufReadExt;

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct MetricBatch {
    source: String,
    name: String,
    points: Vec<f64>,
    collected_at_millis: i64,
}

/// Agent-side service that records thread-dump requests from the collector.
#[derive(Default)]
struct ProbeAgent {
    dumps: AtomicUsize,
    notify: tokio::sync::Notify,
}

impl ServiceInterface for ProbeAgent {
    const NAME: &'static str = "agent";

    fn methods() -> Vec<MethodDescriptor<Self>> {
        vec![
            MethodDescriptor::new("dumpThread", |agent: Arc<ProbeAgent>| async move {
                agent.dumps.fetch_add(1, Ordering::SeqCst);
                agent.notify.notify_one();
                Ok::<_, String>("\"main\" RUNNABLE".to_string())
            }),
            MethodDescriptor::new("fetchConfig", |_agent: Arc<ProbeAgent>, _key: String| async move {
                Ok::<_, String>(None::<String>)
            }),
        ]
    }
}

struct RpcServerHandle {
    child: tokio::process::Child,
    port: u16,
    stdout_drain: Option<tokio::task::JoinHandle<()>>,
}

impl RpcServerHandle {
    fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    async fn stop(mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.start_kill();
    }
}

fn binary_path() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_tether-rpc") {
        return Ok(PathBuf::from(path));
    }
    let current_exe = std::env::current_exe()
        .map_err(|e| format!("failed to resolve current_exe for fallback: {e}"))?;
    let target_debug_dir = current_exe
        .parent()
        .and_then(|p| p.parent())
        .ok_or_else(|| "failed to resolve target/debug directory for fallback".to_string())?;

    let mut fallback = target_debug_dir.join("tether-rpc");
    if cfg!(target_os = "windows") {
        fallback.set_extension("exe");
    }
    if !fallback.exists() {
        return Err(format!(
            "CARGO_BIN_EXE_tether-rpc not set and fallback binary not found at {}",
            fallback.display()
        ));
    }
    Ok(fallback)
}

/// Start `tether-rpc serve` and wait for its `RPC_PORT=` line.
async fn start_collector() -> Result<RpcServerHandle, String> {
    let binary = binary_path()?;
    let mut child = tokio::process::Command::new(&binary)
        .arg("serve")
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn tether-rpc: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let mut discovered_port: Option<u16> = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix("RPC_PORT=") {
                    let parsed = value
                        .trim()
                        .parse::<u16>()
                        .map_err(|e| format!("invalid RPC_PORT value '{value}': {e}"))?;
                    discovered_port = Some(parsed);
                    break;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read tether-rpc stdout: {err}")),
            Err(_) => continue,
        }
    }

    let port =
        discovered_port.ok_or_else(|| "RPC_PORT line not emitted by tether-rpc".to_string())?;

    let stdout_drain =
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    Ok(RpcServerHandle {
        child,
        port,
        stdout_drain: Some(stdout_drain),
    })
}

async fn connect_agent(server: &RpcServerHandle) -> (Channel, Arc<ProbeAgent>) {
    let probe = Arc::new(ProbeAgent::default());
    let registry = Arc::new(ServiceRegistry::new());
    registry.register(probe.clone()).unwrap();

    let channel = Channel::connect(&server.addr(), ChannelOptions::new("collector").registry(registry))
        .await
        .expect("failed to connect to collector");
    (channel, probe)
}

fn batch(points: Vec<f64>) -> MetricBatch {
    MetricBatch {
        source: "integration".to_string(),
        name: "heap_used".to_string(),
        points,
        collected_at_millis: 0,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_push_and_count() {
    let server = start_collector().await.expect("collector failed to start");
    let (channel, _probe) = connect_agent(&server).await;
    let proxy = channel.proxy();

    proxy
        .call::<()>("metrics", "push", (batch(vec![1.0, 2.0, 3.0]),), TIMEOUT)
        .await
        .unwrap();
    proxy
        .call::<()>("metrics", "push", (batch(vec![4.0]),), TIMEOUT)
        .await
        .unwrap();

    let count: u64 = proxy.call("metrics", "count", (), TIMEOUT).await.unwrap();
    assert_eq!(count, 4);

    channel.close();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_collector_requests_thread_dump() {
    let server = start_collector().await.expect("collector failed to start");
    let (channel, probe) = connect_agent(&server).await;

    tokio::time::timeout(TIMEOUT, probe.notify.notified())
        .await
        .expect("collector never asked for a thread dump");
    assert_eq!(probe.dumps.load(Ordering::SeqCst), 1);

    channel.close();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_errors_are_typed() {
    let server = start_collector().await.expect("collector failed to start");
    let (channel, _probe) = connect_agent(&server).await;
    let proxy = channel.proxy();

    let err = proxy
        .call::<()>("metrics", "drop", (), TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::ServiceNotFound { .. }));

    let err = proxy
        .call::<()>("metrics", "push", (), TIMEOUT)
        .await
        .unwrap_err();
    match err {
        TetherError::BadRequest { message, .. } => {
            assert_eq!(message, "metrics.push expects 1 argument(s) but received 0");
        }
        other => panic!("Expected BadRequest, got: {:?}", other),
    }

    let mut empty_name = batch(vec![1.0]);
    empty_name.name.clear();
    let err = proxy
        .call::<()>("metrics", "push", (empty_name,), TIMEOUT)
        .await
        .unwrap_err();
    match err {
        TetherError::ServiceInvocation { message, .. } => {
            assert_eq!(message, "metric name must not be empty");
        }
        other => panic!("Expected ServiceInvocation, got: {:?}", other),
    }

    channel.close();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_agent_binary_pushes_batches() {
    let server = start_collector().await.expect("collector failed to start");
    let binary = binary_path().unwrap();

    let output = tokio::time::timeout(
        Duration::from_secs(20),
        tokio::process::Command::new(&binary)
            .arg("agent")
            .arg("--addr")
            .arg(server.addr())
            .arg("--interval-ms")
            .arg("10")
            .arg("--batches")
            .arg("3")
            .stderr(Stdio::null())
            .output(),
    )
    .await
    .expect("agent did not finish")
    .expect("failed to run agent");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("BATCHES_PUSHED=3"), "stdout: {}", stdout);

    let (channel, _probe) = connect_agent(&server).await;
    let count: u64 = channel
        .proxy()
        .call("metrics", "count", (), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(count, 6);

    channel.close();
    server.stop().await;
}
