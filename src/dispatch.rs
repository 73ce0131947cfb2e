use crate::config::{Config, TimeoutConfig};
use crate::metrics::Metrics;
use crate::snapshot::{LogEntry, Payload, ProcessList, ScriptResult, ServiceStatus, Snapshot};
use crate::state::State;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::SystemExt;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

pub const QUEUE_CAPACITY: usize = 16;
const FALLBACK_IP: &str = "127.0.0.1";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid server address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),
    #[error("{call} timed out after {timeout:?}")]
    Timeout { call: &'static str, timeout: Duration },
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub host_id: String,
    pub hostname: String,
    pub ip: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub tags: BTreeMap<String, String>,
}

impl Registration {
    pub async fn detect(cfg: &Config) -> Self {
        let hostname = sysinfo::System::new()
            .host_name()
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            host_id: cfg.host_id.clone(),
            hostname,
            ip: resolve_local_ip(cfg.manual_ip.as_deref()).await,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            tags: cfg.tags.clone(),
        }
    }
}

#[async_trait]
pub trait ReportSink: Send {
    async fn register(&mut self, registration: &Registration) -> Result<Ack, DispatchError>;

    async fn report_metrics(&mut self, snapshot: &Snapshot) -> Result<Ack, DispatchError>;

    async fn heartbeat(&mut self, host_id: &str, timestamp: i64) -> Result<Ack, DispatchError>;

    async fn report_processes(
        &mut self,
        host_id: &str,
        timestamp: i64,
        processes: &ProcessList,
    ) -> Result<Ack, DispatchError>;

    async fn report_logs(
        &mut self,
        host_id: &str,
        entries: &[LogEntry],
    ) -> Result<Ack, DispatchError>;

    async fn report_script_result(
        &mut self,
        host_id: &str,
        result: &ScriptResult,
    ) -> Result<Ack, DispatchError>;

    async fn report_service_status(
        &mut self,
        host_id: &str,
        timestamp: i64,
        services: &[ServiceStatus],
    ) -> Result<Ack, DispatchError>;
}

#[derive(Debug, Clone, Copy)]
pub struct CallTimeouts {
    pub register: Duration,
    pub metrics: Duration,
    pub heartbeat: Duration,
    pub bulk: Duration,
}

impl From<&TimeoutConfig> for CallTimeouts {
    fn from(cfg: &TimeoutConfig) -> Self {
        Self {
            register: Duration::from_secs(cfg.register_secs),
            metrics: Duration::from_secs(cfg.metrics_secs),
            heartbeat: Duration::from_secs(cfg.heartbeat_secs),
            bulk: Duration::from_secs(cfg.bulk_secs),
        }
    }
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

#[derive(Debug)]
pub enum DispatchCommand {
    Cycle(Snapshot),
    Heartbeat { timestamp: i64 },
}

impl DispatchCommand {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchCommand::Cycle(_) => "cycle",
            DispatchCommand::Heartbeat { .. } => "heartbeat",
        }
    }
}

pub struct Dispatcher {
    sink: Box<dyn ReportSink>,
    host_id: String,
    registered: bool,
    timeouts: CallTimeouts,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(
        sink: Box<dyn ReportSink>,
        host_id: impl Into<String>,
        timeouts: CallTimeouts,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sink,
            host_id: host_id.into(),
            registered: false,
            timeouts,
            metrics,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub async fn register(&mut self, registration: &Registration) -> Result<bool, DispatchError> {
        let ack = call(
            "register",
            self.timeouts.register,
            self.sink.register(registration),
        )
        .await?;

        if ack.success {
            info!(
                host_id = %registration.host_id,
                ip = %registration.ip,
                message = %ack.message,
                "agent registered"
            );
            self.registered = true;
        } else {
            warn!(message = %ack.message, "registration rejected, reports disabled");
        }
        self.metrics.set_registered(self.registered);
        Ok(self.registered)
    }

    pub fn skip_registration(&mut self) {
        self.registered = true;
    }

    pub async fn heartbeat(&mut self, timestamp: i64) -> bool {
        if !self.registered {
            return false;
        }
        let outcome = call(
            "heartbeat",
            self.timeouts.heartbeat,
            self.sink.heartbeat(&self.host_id, timestamp),
        )
        .await;
        let ok = self.record("heartbeat", outcome);
        if ok {
            self.metrics.inc_heartbeat();
        }
        ok
    }

    pub async fn push_metrics(&mut self, snapshot: &Snapshot) -> bool {
        let outcome = call(
            "metrics",
            self.timeouts.metrics,
            self.sink.report_metrics(snapshot),
        )
        .await;
        self.record("metrics", outcome)
    }

    pub async fn dispatch_cycle(&mut self, snapshot: &Snapshot) {
        if !self.registered {
            debug!("not registered, dropping cycle");
            return;
        }

        if snapshot.has_primary_metrics() {
            self.push_metrics(snapshot).await;
        }

        let bulk = self.timeouts.bulk;
        let ts = snapshot.timestamp;
        for (collector, payload) in snapshot.payloads() {
            match payload {
                Payload::Cpu(_) | Payload::Memory(_) | Payload::Disk(_) | Payload::Network(_) => {}
                Payload::Processes(list) => {
                    if list.processes.is_empty() {
                        debug!(collector, "no processes sampled, skipping report");
                        continue;
                    }
                    let outcome = call(
                        "processes",
                        bulk,
                        self.sink.report_processes(&self.host_id, ts, list),
                    )
                    .await;
                    self.record("processes", outcome);
                }
                Payload::Logs(entries) => {
                    let outcome =
                        call("logs", bulk, self.sink.report_logs(&self.host_id, entries)).await;
                    self.record("logs", outcome);
                }
                Payload::Scripts(results) => {
                    for result in results {
                        let outcome = call(
                            "script",
                            bulk,
                            self.sink.report_script_result(&self.host_id, result),
                        )
                        .await;
                        self.record("script", outcome);
                    }
                }
                Payload::Services(services) => {
                    let outcome = call(
                        "services",
                        bulk,
                        self.sink.report_service_status(&self.host_id, ts, services),
                    )
                    .await;
                    self.record("services", outcome);
                }
            }
        }
    }

    fn record(&self, kind: &'static str, outcome: Result<Ack, DispatchError>) -> bool {
        let ok = match outcome {
            Ok(ack) if ack.success => true,
            Ok(ack) => {
                warn!(kind, message = %ack.message, "report rejected by server");
                false
            }
            Err(err) => {
                warn!(kind, error = %err, "report failed");
                false
            }
        };
        self.metrics.record_push(kind, ok);
        ok
    }
}

async fn call<F>(name: &'static str, timeout: Duration, fut: F) -> Result<Ack, DispatchError>
where
    F: Future<Output = Result<Ack, DispatchError>>,
{
    match time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_elapsed) => Err(DispatchError::Timeout {
            call: name,
            timeout,
        }),
    }
}

pub fn enqueue(tx: &mpsc::Sender<DispatchCommand>, cmd: DispatchCommand, metrics: &Metrics) -> bool {
    let label = cmd.label();
    match tx.try_send(cmd) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(command = label, "dispatch queue full, dropping");
            metrics.inc_dropped(label);
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(command = label, "dispatch worker gone");
            false
        }
    }
}

pub fn spawn_worker(
    mut dispatcher: Dispatcher,
    mut rx: mpsc::Receiver<DispatchCommand>,
    state: Arc<RwLock<State>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("stopping dispatch worker");
                    break;
                }
                cmd = rx.recv() => match cmd {
                    Some(DispatchCommand::Cycle(snapshot)) => {
                        dispatcher.dispatch_cycle(&snapshot).await;
                    }
                    Some(DispatchCommand::Heartbeat { timestamp }) => {
                        if dispatcher.heartbeat(timestamp).await {
                            state.write().await.last_heartbeat_timestamp_seconds = timestamp;
                        }
                    }
                    None => break,
                },
            }
        }
    })
}

pub struct ConsoleSink;

impl ConsoleSink {
    fn print<T: Serialize + ?Sized>(kind: &str, value: &T) -> Result<Ack, DispatchError> {
        let body = serde_json::to_string_pretty(value)?;
        println!("=== {kind} ===\n{body}");
        Ok(Ack::ok())
    }
}

#[async_trait]
impl ReportSink for ConsoleSink {
    async fn register(&mut self, registration: &Registration) -> Result<Ack, DispatchError> {
        Self::print("register", registration)
    }

    async fn report_metrics(&mut self, snapshot: &Snapshot) -> Result<Ack, DispatchError> {
        Self::print("metrics", snapshot)
    }

    async fn heartbeat(&mut self, host_id: &str, timestamp: i64) -> Result<Ack, DispatchError> {
        Self::print(
            "heartbeat",
            &serde_json::json!({ "host_id": host_id, "timestamp": timestamp }),
        )
    }

    async fn report_processes(
        &mut self,
        _host_id: &str,
        _timestamp: i64,
        processes: &ProcessList,
    ) -> Result<Ack, DispatchError> {
        Self::print("processes", processes)
    }

    async fn report_logs(
        &mut self,
        _host_id: &str,
        entries: &[LogEntry],
    ) -> Result<Ack, DispatchError> {
        Self::print("logs", entries)
    }

    async fn report_script_result(
        &mut self,
        _host_id: &str,
        result: &ScriptResult,
    ) -> Result<Ack, DispatchError> {
        Self::print("script", result)
    }

    async fn report_service_status(
        &mut self,
        _host_id: &str,
        _timestamp: i64,
        services: &[ServiceStatus],
    ) -> Result<Ack, DispatchError> {
        Self::print("services", services)
    }
}

pub async fn resolve_local_ip(manual_ip: Option<&str>) -> String {
    if let Some(ip) = manual_ip.map(str::trim).filter(|ip| !ip.is_empty()) {
        return ip.to_string();
    }
    match outbound_ip().await {
        Ok(ip) => ip.to_string(),
        Err(err) => {
            warn!(error = %err, fallback = FALLBACK_IP, "local ip detection failed");
            FALLBACK_IP.to_string()
        }
    }
}

async fn outbound_ip() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:80").await?;
    Ok(socket.local_addr()?.ip())
}
