use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub host_id: String,
    pub timestamp: i64,
    payloads: BTreeMap<String, Payload>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Cpu(CpuStat),
    Memory(MemoryStat),
    Disk(DiskStat),
    Network(NetStat),
    Processes(ProcessList),
    Logs(Vec<LogEntry>),
    Scripts(Vec<ScriptResult>),
    Services(Vec<ServiceStatus>),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CpuStat {
    pub usage_percent: f64,
    pub load_avg_1: f64,
    pub load_avg_5: f64,
    pub load_avg_15: f64,
    pub core_count: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStat {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub available: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiskStat {
    pub partitions: Vec<PartitionStat>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionStat {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetStat {
    pub interfaces: Vec<InterfaceStat>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceStat {
    pub name: String,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errin: u64,
    pub errout: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessList {
    pub processes: Vec<ProcessRecord>,
    pub total: usize,
    pub collected: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    pub user: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_bytes: u64,
    pub create_time: i64,
    pub status: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub source: String,
    pub level: String,
    pub message: String,
    pub timestamp: i64,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptResult {
    pub script_id: String,
    pub name: String,
    pub timestamp: i64,
    pub success: bool,
    pub output: String,
    pub error: String,
    pub exit_code: i32,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Running,
    Stopped,
    Failed,
    Unknown,
}

impl ServiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
            ServiceState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub status: ServiceState,
    pub enabled: bool,
    pub description: String,
    pub uptime_seconds: i64,
    pub port: Option<u16>,
    pub port_accessible: bool,
}

impl Snapshot {
    pub fn new(host_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            host_id: host_id.into(),
            timestamp,
            payloads: BTreeMap::new(),
        }
    }

    pub fn with_payload(mut self, collector: impl Into<String>, payload: Payload) -> Self {
        self.payloads.insert(collector.into(), payload);
        self
    }

    pub fn get(&self, collector: &str) -> Option<&Payload> {
        self.payloads.get(collector)
    }

    pub fn collectors(&self) -> impl Iterator<Item = &str> {
        self.payloads.keys().map(String::as_str)
    }

    pub fn payloads(&self) -> impl Iterator<Item = (&str, &Payload)> {
        self.payloads.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn cpu(&self) -> Option<&CpuStat> {
        self.payloads.values().find_map(|p| match p {
            Payload::Cpu(v) => Some(v),
            _ => None,
        })
    }

    pub fn memory(&self) -> Option<&MemoryStat> {
        self.payloads.values().find_map(|p| match p {
            Payload::Memory(v) => Some(v),
            _ => None,
        })
    }

    pub fn disk(&self) -> Option<&DiskStat> {
        self.payloads.values().find_map(|p| match p {
            Payload::Disk(v) => Some(v),
            _ => None,
        })
    }

    pub fn network(&self) -> Option<&NetStat> {
        self.payloads.values().find_map(|p| match p {
            Payload::Network(v) => Some(v),
            _ => None,
        })
    }

    pub fn processes(&self) -> Option<&ProcessList> {
        self.payloads.values().find_map(|p| match p {
            Payload::Processes(v) => Some(v),
            _ => None,
        })
    }

    pub fn logs(&self) -> Option<&[LogEntry]> {
        self.payloads.values().find_map(|p| match p {
            Payload::Logs(v) => Some(v.as_slice()),
            _ => None,
        })
    }

    pub fn scripts(&self) -> Option<&[ScriptResult]> {
        self.payloads.values().find_map(|p| match p {
            Payload::Scripts(v) => Some(v.as_slice()),
            _ => None,
        })
    }

    pub fn services(&self) -> Option<&[ServiceStatus]> {
        self.payloads.values().find_map(|p| match p {
            Payload::Services(v) => Some(v.as_slice()),
            _ => None,
        })
    }

    pub fn has_primary_metrics(&self) -> bool {
        self.cpu().is_some()
            || self.memory().is_some()
            || self.disk().is_some()
            || self.network().is_some()
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
