// Messages are declared by hand against `proto/collector.proto` so the
// build needs no protoc; field tags must stay in sync with that file.

use crate::dispatch::{Ack, DispatchError, Registration, ReportSink};
use crate::snapshot::{self, ProcessList, ScriptResult, ServiceStatus, Snapshot};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommonResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterRequest {
    #[prost(string, tag = "1")]
    pub host_id: String,
    #[prost(string, tag = "2")]
    pub hostname: String,
    #[prost(string, tag = "3")]
    pub ip: String,
    #[prost(string, tag = "4")]
    pub os: String,
    #[prost(string, tag = "5")]
    pub arch: String,
    #[prost(map = "string, string", tag = "6")]
    pub tags: HashMap<String, String>,
    #[prost(string, tag = "7")]
    pub version: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetricsRequest {
    #[prost(string, tag = "1")]
    pub host_id: String,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
    #[prost(message, optional, tag = "3")]
    pub cpu: Option<CpuMetrics>,
    #[prost(message, optional, tag = "4")]
    pub memory: Option<MemoryMetrics>,
    #[prost(message, optional, tag = "5")]
    pub disk: Option<DiskMetrics>,
    #[prost(message, optional, tag = "6")]
    pub network: Option<NetworkMetrics>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CpuMetrics {
    #[prost(double, tag = "1")]
    pub usage_percent: f64,
    #[prost(double, tag = "2")]
    pub load_avg_1: f64,
    #[prost(double, tag = "3")]
    pub load_avg_5: f64,
    #[prost(double, tag = "4")]
    pub load_avg_15: f64,
    #[prost(int32, tag = "5")]
    pub core_count: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemoryMetrics {
    #[prost(uint64, tag = "1")]
    pub total: u64,
    #[prost(uint64, tag = "2")]
    pub used: u64,
    #[prost(uint64, tag = "3")]
    pub free: u64,
    #[prost(double, tag = "4")]
    pub used_percent: f64,
    #[prost(uint64, tag = "5")]
    pub available: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DiskMetrics {
    #[prost(message, repeated, tag = "1")]
    pub partitions: Vec<PartitionMetrics>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PartitionMetrics {
    #[prost(string, tag = "1")]
    pub device: String,
    #[prost(string, tag = "2")]
    pub mountpoint: String,
    #[prost(string, tag = "3")]
    pub fstype: String,
    #[prost(uint64, tag = "4")]
    pub total: u64,
    #[prost(uint64, tag = "5")]
    pub used: u64,
    #[prost(uint64, tag = "6")]
    pub free: u64,
    #[prost(double, tag = "7")]
    pub used_percent: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NetworkMetrics {
    #[prost(message, repeated, tag = "1")]
    pub interfaces: Vec<InterfaceMetrics>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InterfaceMetrics {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint64, tag = "2")]
    pub bytes_sent: u64,
    #[prost(uint64, tag = "3")]
    pub bytes_recv: u64,
    #[prost(uint64, tag = "4")]
    pub packets_sent: u64,
    #[prost(uint64, tag = "5")]
    pub packets_recv: u64,
    #[prost(uint64, tag = "6")]
    pub errin: u64,
    #[prost(uint64, tag = "7")]
    pub errout: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatRequest {
    #[prost(string, tag = "1")]
    pub host_id: String,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProcessReportRequest {
    #[prost(string, tag = "1")]
    pub host_id: String,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
    #[prost(message, repeated, tag = "3")]
    pub processes: Vec<ProcessInfo>,
    #[prost(int32, tag = "4")]
    pub total: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProcessInfo {
    #[prost(uint32, tag = "1")]
    pub pid: u32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub user: String,
    #[prost(double, tag = "4")]
    pub cpu_percent: f64,
    #[prost(double, tag = "5")]
    pub memory_percent: f64,
    #[prost(uint64, tag = "6")]
    pub memory_bytes: u64,
    #[prost(int64, tag = "7")]
    pub create_time: i64,
    #[prost(string, tag = "8")]
    pub status: String,
    #[prost(string, tag = "9")]
    pub command: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogReportRequest {
    #[prost(string, tag = "1")]
    pub host_id: String,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
    #[prost(message, repeated, tag = "3")]
    pub logs: Vec<LogEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEntry {
    #[prost(string, tag = "1")]
    pub source: String,
    #[prost(string, tag = "2")]
    pub level: String,
    #[prost(string, tag = "3")]
    pub message: String,
    #[prost(int64, tag = "4")]
    pub timestamp: i64,
    #[prost(map = "string, string", tag = "5")]
    pub tags: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScriptResultRequest {
    #[prost(string, tag = "1")]
    pub host_id: String,
    #[prost(string, tag = "2")]
    pub script_id: String,
    #[prost(string, tag = "3")]
    pub script_name: String,
    #[prost(int64, tag = "4")]
    pub timestamp: i64,
    #[prost(bool, tag = "5")]
    pub success: bool,
    #[prost(string, tag = "6")]
    pub output: String,
    #[prost(string, tag = "7")]
    pub error: String,
    #[prost(int32, tag = "8")]
    pub exit_code: i32,
    #[prost(int64, tag = "9")]
    pub duration_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceStatusRequest {
    #[prost(string, tag = "1")]
    pub host_id: String,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
    #[prost(message, repeated, tag = "3")]
    pub services: Vec<ServiceInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub status: String,
    #[prost(bool, tag = "3")]
    pub enabled: bool,
    #[prost(string, tag = "4")]
    pub description: String,
    #[prost(int64, tag = "5")]
    pub uptime_seconds: i64,
    #[prost(uint32, tag = "6")]
    pub port: u32,
    #[prost(bool, tag = "7")]
    pub port_accessible: bool,
}

impl From<CommonResponse> for Ack {
    fn from(resp: CommonResponse) -> Self {
        Self {
            success: resp.success,
            message: resp.message,
        }
    }
}

impl From<&Registration> for RegisterRequest {
    fn from(r: &Registration) -> Self {
        Self {
            host_id: r.host_id.clone(),
            hostname: r.hostname.clone(),
            ip: r.ip.clone(),
            os: r.os.clone(),
            arch: r.arch.clone(),
            tags: r.tags.clone().into_iter().collect(),
            version: r.version.clone(),
        }
    }
}

impl From<&Snapshot> for MetricsRequest {
    fn from(s: &Snapshot) -> Self {
        Self {
            host_id: s.host_id.clone(),
            timestamp: s.timestamp,
            cpu: s.cpu().map(|c| CpuMetrics {
                usage_percent: c.usage_percent,
                load_avg_1: c.load_avg_1,
                load_avg_5: c.load_avg_5,
                load_avg_15: c.load_avg_15,
                core_count: c.core_count as i32,
            }),
            memory: s.memory().map(|m| MemoryMetrics {
                total: m.total,
                used: m.used,
                free: m.free,
                used_percent: m.used_percent,
                available: m.available,
            }),
            disk: s.disk().map(|d| DiskMetrics {
                partitions: d
                    .partitions
                    .iter()
                    .map(|p| PartitionMetrics {
                        device: p.device.clone(),
                        mountpoint: p.mountpoint.clone(),
                        fstype: p.fstype.clone(),
                        total: p.total,
                        used: p.used,
                        free: p.free,
                        used_percent: p.used_percent,
                    })
                    .collect(),
            }),
            network: s.network().map(|n| NetworkMetrics {
                interfaces: n
                    .interfaces
                    .iter()
                    .map(|i| InterfaceMetrics {
                        name: i.name.clone(),
                        bytes_sent: i.bytes_sent,
                        bytes_recv: i.bytes_recv,
                        packets_sent: i.packets_sent,
                        packets_recv: i.packets_recv,
                        errin: i.errin,
                        errout: i.errout,
                    })
                    .collect(),
            }),
        }
    }
}

impl From<&snapshot::ProcessRecord> for ProcessInfo {
    fn from(p: &snapshot::ProcessRecord) -> Self {
        Self {
            pid: p.pid,
            name: p.name.clone(),
            user: p.user.clone(),
            cpu_percent: p.cpu_percent,
            memory_percent: p.memory_percent,
            memory_bytes: p.memory_bytes,
            create_time: p.create_time,
            status: p.status.clone(),
            command: p.command.clone(),
        }
    }
}

impl From<&snapshot::LogEntry> for LogEntry {
    fn from(e: &snapshot::LogEntry) -> Self {
        Self {
            source: e.source.clone(),
            level: e.level.clone(),
            message: e.message.clone(),
            timestamp: e.timestamp,
            tags: e.tags.clone(),
        }
    }
}

impl From<&ServiceStatus> for ServiceInfo {
    fn from(s: &ServiceStatus) -> Self {
        Self {
            name: s.name.clone(),
            status: s.status.to_string(),
            enabled: s.enabled,
            description: s.description.clone(),
            uptime_seconds: s.uptime_seconds,
            port: s.port.map(u32::from).unwrap_or(0),
            port_accessible: s.port_accessible,
        }
    }
}

fn script_request(host_id: &str, r: &ScriptResult) -> ScriptResultRequest {
    ScriptResultRequest {
        host_id: host_id.to_string(),
        script_id: r.script_id.clone(),
        script_name: r.name.clone(),
        timestamp: r.timestamp,
        success: r.success,
        output: r.output.clone(),
        error: r.error.clone(),
        exit_code: r.exit_code,
        duration_ms: r.duration_ms,
    }
}

pub struct GrpcSink {
    grpc: tonic::client::Grpc<Channel>,
}

impl GrpcSink {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, DispatchError> {
        let uri = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|err| DispatchError::InvalidAddress {
                addr: addr.to_string(),
                reason: err.to_string(),
            })?
            .connect_timeout(timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|source| DispatchError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            grpc: tonic::client::Grpc::new(channel),
        })
    }

    async fn unary<M>(&mut self, path: &'static str, msg: M) -> Result<Ack, DispatchError>
    where
        M: prost::Message + Send + Sync + 'static,
    {
        self.grpc
            .ready()
            .await
            .map_err(|err| Status::unknown(format!("service was not ready: {err}")))?;
        let codec = tonic::codec::ProstCodec::<M, CommonResponse>::default();
        let resp = self
            .grpc
            .unary(Request::new(msg), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(resp.into_inner().into())
    }
}

#[async_trait]
impl ReportSink for GrpcSink {
    async fn register(&mut self, registration: &Registration) -> Result<Ack, DispatchError> {
        self.unary(
            "/monitor.Collector/RegisterAgent",
            RegisterRequest::from(registration),
        )
        .await
    }

    async fn report_metrics(&mut self, snapshot: &Snapshot) -> Result<Ack, DispatchError> {
        self.unary(
            "/monitor.Collector/ReportMetrics",
            MetricsRequest::from(snapshot),
        )
        .await
    }

    async fn heartbeat(&mut self, host_id: &str, timestamp: i64) -> Result<Ack, DispatchError> {
        let req = HeartbeatRequest {
            host_id: host_id.to_string(),
            timestamp,
        };
        self.unary("/monitor.Collector/Heartbeat", req).await
    }

    async fn report_processes(
        &mut self,
        host_id: &str,
        timestamp: i64,
        processes: &ProcessList,
    ) -> Result<Ack, DispatchError> {
        let req = ProcessReportRequest {
            host_id: host_id.to_string(),
            timestamp,
            processes: processes.processes.iter().map(ProcessInfo::from).collect(),
            total: i32::try_from(processes.total).unwrap_or(i32::MAX),
        };
        self.unary("/monitor.Collector/ReportProcesses", req).await
    }

    async fn report_logs(
        &mut self,
        host_id: &str,
        entries: &[snapshot::LogEntry],
    ) -> Result<Ack, DispatchError> {
        let req = LogReportRequest {
            host_id: host_id.to_string(),
            timestamp: snapshot::now_unix(),
            logs: entries.iter().map(LogEntry::from).collect(),
        };
        self.unary("/monitor.Collector/ReportLogs", req).await
    }

    async fn report_script_result(
        &mut self,
        host_id: &str,
        result: &ScriptResult,
    ) -> Result<Ack, DispatchError> {
        self.unary(
            "/monitor.Collector/ReportScriptResult",
            script_request(host_id, result),
        )
        .await
    }

    async fn report_service_status(
        &mut self,
        host_id: &str,
        timestamp: i64,
        services: &[ServiceStatus],
    ) -> Result<Ack, DispatchError> {
        let req = ServiceStatusRequest {
            host_id: host_id.to_string(),
            timestamp,
            services: services.iter().map(ServiceInfo::from).collect(),
        };
        self.unary("/monitor.Collector/ReportServiceStatus", req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{CpuStat, InterfaceStat, NetStat, Payload, ServiceState};
    use prost::Message;

    #[test]
    fn metrics_request_carries_only_collected_kinds() {
        let snapshot = Snapshot::new("host-1", 77)
            .with_payload(
                "cpu",
                Payload::Cpu(CpuStat {
                    usage_percent: 42.0,
                    core_count: 8,
                    ..CpuStat::default()
                }),
            )
            .with_payload(
                "network",
                Payload::Network(NetStat {
                    interfaces: vec![InterfaceStat {
                        name: "eth0".into(),
                        bytes_sent: 1,
                        bytes_recv: 2,
                        packets_sent: 3,
                        packets_recv: 4,
                        errin: 0,
                        errout: 0,
                    }],
                }),
            );

        let req = MetricsRequest::from(&snapshot);
        assert_eq!(req.host_id, "host-1");
        assert_eq!(req.timestamp, 77);
        assert_eq!(req.cpu.as_ref().map(|c| c.core_count), Some(8));
        assert!(req.memory.is_none());
        assert!(req.disk.is_none());
        assert_eq!(req.network.map(|n| n.interfaces[0].bytes_recv), Some(2));
    }

    #[test]
    fn service_info_flattens_optional_port() {
        let mut status = ServiceStatus {
            name: "nginx".into(),
            status: ServiceState::Failed,
            enabled: true,
            description: "web".into(),
            uptime_seconds: 0,
            port: Some(8080),
            port_accessible: false,
        };
        let info = ServiceInfo::from(&status);
        assert_eq!(info.status, "failed");
        assert_eq!(info.port, 8080);

        status.port = None;
        assert_eq!(ServiceInfo::from(&status).port, 0);
    }

    #[test]
    fn register_request_encodes_tags_map() {
        let reg = Registration {
            host_id: "h".into(),
            hostname: "box".into(),
            ip: "10.1.2.3".into(),
            os: "linux".into(),
            arch: "aarch64".into(),
            version: "0.1.0".into(),
            tags: [("env".to_string(), "staging".to_string())].into(),
        };
        let bytes = RegisterRequest::from(&reg).encode_to_vec();
        let decoded = RegisterRequest::decode(bytes.as_slice()).expect("decode");
        assert_eq!(decoded.tags.get("env").map(String::as_str), Some("staging"));
        assert_eq!(decoded.ip, "10.1.2.3");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let err = GrpcSink::connect(&addr.to_string(), Duration::from_secs(1))
            .await
            .err()
            .expect("connect should fail");
        assert!(matches!(err, DispatchError::Connect { .. }));
    }

    #[tokio::test]
    async fn malformed_address_is_rejected() {
        let err = GrpcSink::connect("bad host:50051", Duration::from_secs(1))
            .await
            .err()
            .expect("address should be invalid");
        assert!(matches!(err, DispatchError::InvalidAddress { .. }));
    }
}
