use crate::collectors::{CollectError, Collector};
use crate::snapshot::{
    CpuStat, DiskStat, InterfaceStat, MemoryStat, NetStat, PartitionStat, Payload,
};
use async_trait::async_trait;
use sysinfo::{
    CpuExt, CpuRefreshKind, DiskExt, NetworkExt, NetworksExt, RefreshKind, System, SystemExt,
};

pub struct CpuProvider {
    system: System,
}

pub struct MemoryProvider {
    system: System,
}

pub struct DiskProvider {
    system: System,
}

pub struct NetworkProvider {
    system: System,
}

impl CpuProvider {
    pub fn new() -> Self {
        // The first refresh is the baseline; usage is a delta between refreshes,
        // so every collect reports usage over the previous collection interval.
        let system = System::new_with_specifics(
            RefreshKind::new().with_cpu(CpuRefreshKind::new().with_cpu_usage()),
        );
        Self { system }
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl DiskProvider {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl NetworkProvider {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

fn ensure_supported(what: &'static str) -> Result<(), CollectError> {
    if System::IS_SUPPORTED {
        Ok(())
    } else {
        Err(CollectError::Unsupported(what))
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total > 0 {
        (part as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}

#[async_trait]
impl Collector for CpuProvider {
    fn name(&self) -> &str {
        "cpu"
    }

    async fn collect(&mut self) -> Result<Payload, CollectError> {
        ensure_supported("cpu metrics")?;
        self.system
            .refresh_cpu_specifics(CpuRefreshKind::new().with_cpu_usage());
        let load = self.system.load_average();
        Ok(Payload::Cpu(CpuStat {
            usage_percent: self.system.global_cpu_info().cpu_usage() as f64,
            load_avg_1: load.one,
            load_avg_5: load.five,
            load_avg_15: load.fifteen,
            core_count: self.system.cpus().len() as u32,
        }))
    }
}

#[async_trait]
impl Collector for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn collect(&mut self) -> Result<Payload, CollectError> {
        ensure_supported("memory metrics")?;
        self.system.refresh_memory();
        let total = self.system.total_memory();
        let used = self.system.used_memory();
        Ok(Payload::Memory(MemoryStat {
            total,
            used,
            free: self.system.free_memory(),
            available: self.system.available_memory(),
            used_percent: percent(used, total),
        }))
    }
}

#[async_trait]
impl Collector for DiskProvider {
    fn name(&self) -> &str {
        "disk"
    }

    async fn collect(&mut self) -> Result<Payload, CollectError> {
        ensure_supported("disk metrics")?;
        self.system.refresh_disks_list();
        self.system.refresh_disks();
        let partitions = self
            .system
            .disks()
            .iter()
            .map(|d| {
                let total = d.total_space();
                let free = d.available_space();
                let used = total.saturating_sub(free);
                PartitionStat {
                    device: d.name().to_string_lossy().to_string(),
                    mountpoint: d.mount_point().to_string_lossy().to_string(),
                    fstype: String::from_utf8_lossy(d.file_system()).to_string(),
                    total,
                    used,
                    free,
                    used_percent: percent(used, total),
                }
            })
            .collect();
        Ok(Payload::Disk(DiskStat { partitions }))
    }
}

#[async_trait]
impl Collector for NetworkProvider {
    fn name(&self) -> &str {
        "network"
    }

    async fn collect(&mut self) -> Result<Payload, CollectError> {
        ensure_supported("network metrics")?;
        self.system.refresh_networks_list();
        self.system.refresh_networks();
        let mut interfaces: Vec<InterfaceStat> = self
            .system
            .networks()
            .iter()
            .map(|(name, data)| InterfaceStat {
                name: name.clone(),
                bytes_sent: data.total_transmitted(),
                bytes_recv: data.total_received(),
                packets_sent: data.total_packets_transmitted(),
                packets_recv: data.total_packets_received(),
                errin: data.total_errors_on_received(),
                errout: data.total_errors_on_transmitted(),
            })
            .collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Payload::Network(NetStat { interfaces }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_zero_total() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(25, 100), 25.0);
    }

    #[tokio::test]
    async fn memory_provider_reports_consistent_totals() {
        if !System::IS_SUPPORTED {
            return;
        }
        let mut provider = MemoryProvider::new();
        match provider.collect().await.expect("memory collect") {
            Payload::Memory(m) => {
                assert!(m.total >= m.used);
                assert!((0.0..=100.0).contains(&m.used_percent));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
