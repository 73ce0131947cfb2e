
use crate::collectors::{CollectError, Collector};
use crate::snapshot::{Payload, ProcessList, ProcessRecord};
use async_trait::async_trait;
use std::time::Duration;
use sysinfo::{Pid, PidExt, ProcessExt, ProcessRefreshKind, System, SystemExt, UserExt};
use tracing::{debug, info, warn};

pub const DEFAULT_SCAN_LIMIT: usize = 2000;
pub const SAMPLE_WINDOW: Duration = Duration::from_secs(1);
const COMMAND_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, Default)]
pub struct ProcessDetails {
    pub name: String,
    pub user: String,
    pub memory_bytes: Option<u64>,
    pub memory_percent: Option<f64>,
    pub create_time: i64,
    pub status: String,
    pub command: String,
}

// Both CPU passes are batched: a per-process refresh would re-read the
// global CPU counters each time and shrink the window to almost nothing.
pub trait ProcessSource: Send {
    fn pids(&mut self) -> Result<Vec<u32>, CollectError>;

    fn prime(&mut self, pids: &[u32]) -> usize;

    fn measure(&mut self, pids: &[u32]) -> Vec<ProcessSample>;

    fn details(&mut self, pid: u32) -> Option<ProcessDetails>;

    fn total_memory(&mut self) -> Option<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSample {
    pub pid: u32,
    pub cpu_percent: f64,
}

pub struct ProcessSampler<S> {
    source: S,
    top_n: usize,
    scan_limit: usize,
    window: Duration,
}

impl<S: ProcessSource> ProcessSampler<S> {
    pub fn new(source: S, top_n: usize, scan_limit: usize) -> Self {
        Self {
            source,
            top_n: if top_n == 0 { 50 } else { top_n },
            scan_limit: if scan_limit == 0 {
                DEFAULT_SCAN_LIMIT
            } else {
                scan_limit
            },
            window: SAMPLE_WINDOW,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub async fn sample(&mut self) -> Result<ProcessList, CollectError> {
        let pids = self.source.pids()?;
        let total = pids.len();
        let scanned = &pids[..total.min(self.scan_limit)];
        if scanned.is_empty() {
            return Ok(ProcessList::default());
        }

        let total_memory = self.source.total_memory().filter(|m| *m > 0);

        let primed = self.source.prime(scanned);
        debug!(primed, scanned = scanned.len(), total, "cpu baseline taken");

        tokio::time::sleep(self.window).await;

        let mut candidates = self.source.measure(scanned);
        let measured = candidates.len();

        rank(&mut candidates);
        candidates.truncate(self.top_n);

        let mut processes = Vec::with_capacity(candidates.len());
        for sample in &candidates {
            match self.source.details(sample.pid) {
                Some(details) => processes.push(build_record(sample, details, total_memory)),
                None => debug!(pid = sample.pid, "process vanished before enrichment"),
            }
        }

        if let Some(top) = processes.first() {
            debug!(pid = top.pid, name = %top.name, cpu = top.cpu_percent, "top process");
        }
        info!(
            total,
            measured,
            collected = processes.len(),
            "process sample complete"
        );

        Ok(ProcessList {
            collected: processes.len(),
            processes,
            total,
        })
    }
}

fn rank(candidates: &mut [ProcessSample]) {
    candidates.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent));
}

fn build_record(
    sample: &ProcessSample,
    details: ProcessDetails,
    total_memory: Option<u64>,
) -> ProcessRecord {
    let memory_bytes = details.memory_bytes.unwrap_or(0);
    let memory_percent = match (details.memory_bytes, total_memory) {
        (Some(rss), Some(total)) => rss as f64 / total as f64 * 100.0,
        _ => details.memory_percent.unwrap_or(0.0),
    };
    ProcessRecord {
        pid: sample.pid,
        name: details.name,
        user: details.user,
        cpu_percent: sample.cpu_percent,
        memory_percent,
        memory_bytes,
        create_time: details.create_time,
        status: details.status,
        command: truncate_command(&details.command),
    }
}

pub fn truncate_command(command: &str) -> String {
    match command.char_indices().nth(COMMAND_MAX_CHARS) {
        Some((idx, _)) => format!("{}...", &command[..idx]),
        None => command.to_string(),
    }
}

#[async_trait]
impl<S: ProcessSource> Collector for ProcessSampler<S> {
    fn name(&self) -> &str {
        "process"
    }

    async fn collect(&mut self) -> Result<Payload, CollectError> {
        self.sample().await.map(Payload::Processes)
    }
}

pub struct SysinfoProcessSource {
    system: System,
}

impl SysinfoProcessSource {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_users_list();
        Self { system }
    }
}

impl ProcessSource for SysinfoProcessSource {
    fn pids(&mut self) -> Result<Vec<u32>, CollectError> {
        if !System::IS_SUPPORTED {
            return Err(CollectError::Unsupported("process listing"));
        }
        self.system
            .refresh_processes_specifics(ProcessRefreshKind::new());
        let mut pids: Vec<u32> = self.system.processes().keys().map(|p| p.as_u32()).collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn prime(&mut self, pids: &[u32]) -> usize {
        self.system
            .refresh_processes_specifics(ProcessRefreshKind::new().with_cpu());
        pids.iter()
            .filter(|pid| self.system.process(Pid::from_u32(**pid)).is_some())
            .count()
    }

    fn measure(&mut self, pids: &[u32]) -> Vec<ProcessSample> {
        self.system
            .refresh_processes_specifics(ProcessRefreshKind::new().with_cpu());
        pids.iter()
            .filter_map(|pid| {
                self.system
                    .process(Pid::from_u32(*pid))
                    .map(|p| ProcessSample {
                        pid: *pid,
                        cpu_percent: p.cpu_usage() as f64,
                    })
            })
            .collect()
    }

    fn details(&mut self, pid: u32) -> Option<ProcessDetails> {
        let pid = Pid::from_u32(pid);
        // Memory and user only; cpu was measured over the window already.
        if !self.system.refresh_process_specifics(
            pid,
            ProcessRefreshKind::new().with_user(),
        ) {
            return None;
        }
        let process = self.system.process(pid)?;
        let user = process
            .user_id()
            .and_then(|uid| self.system.get_user_by_id(uid))
            .map(|u| u.name().to_string())
            .unwrap_or_default();
        Some(ProcessDetails {
            name: process.name().to_string(),
            user,
            memory_bytes: Some(process.memory()),
            memory_percent: None,
            create_time: process.start_time() as i64,
            status: process.status().to_string(),
            command: process.cmd().join(" "),
        })
    }

    fn total_memory(&mut self) -> Option<u64> {
        self.system.refresh_memory();
        match self.system.total_memory() {
            0 => {
                warn!("total memory unavailable, falling back to per-process percentages");
                None
            }
            total => Some(total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeSource {
        order: Vec<u32>,
        cpu: HashMap<u32, f64>,
        failing_measure: Vec<u32>,
        total_memory: Option<u64>,
        rss: HashMap<u32, u64>,
        command: HashMap<u32, String>,
        primed: Vec<u32>,
        measured: Vec<u32>,
        enriched: Vec<u32>,
    }

    impl FakeSource {
        fn with_cpu(values: &[(u32, f64)]) -> Self {
            Self {
                order: values.iter().map(|(pid, _)| *pid).collect(),
                cpu: values.iter().copied().collect(),
                total_memory: Some(1000),
                ..Self::default()
            }
        }
    }

    impl ProcessSource for FakeSource {
        fn pids(&mut self) -> Result<Vec<u32>, CollectError> {
            Ok(self.order.clone())
        }

        fn prime(&mut self, pids: &[u32]) -> usize {
            self.primed.extend_from_slice(pids);
            pids.len()
        }

        fn measure(&mut self, pids: &[u32]) -> Vec<ProcessSample> {
            self.measured.extend_from_slice(pids);
            pids.iter()
                .filter(|pid| !self.failing_measure.contains(pid))
                .filter_map(|pid| {
                    self.cpu.get(pid).map(|cpu_percent| ProcessSample {
                        pid: *pid,
                        cpu_percent: *cpu_percent,
                    })
                })
                .collect()
        }

        fn details(&mut self, pid: u32) -> Option<ProcessDetails> {
            self.enriched.push(pid);
            Some(ProcessDetails {
                name: format!("proc-{pid}"),
                user: "root".to_string(),
                memory_bytes: self.rss.get(&pid).copied(),
                memory_percent: Some(1.5),
                create_time: 1_700_000_000,
                status: "Run".to_string(),
                command: self.command.get(&pid).cloned().unwrap_or_default(),
            })
        }

        fn total_memory(&mut self) -> Option<u64> {
            self.total_memory
        }
    }

    fn sampler(source: FakeSource, top_n: usize) -> ProcessSampler<FakeSource> {
        ProcessSampler::new(source, top_n, DEFAULT_SCAN_LIMIT).with_window(Duration::ZERO)
    }

    #[tokio::test]
    async fn picks_top_two_in_descending_order() {
        let source = FakeSource::with_cpu(&[(1, 5.0), (2, 40.0), (3, 12.0)]);
        let mut s = sampler(source, 2);
        let list = s.sample().await.expect("sample");

        let cpus: Vec<f64> = list.processes.iter().map(|p| p.cpu_percent).collect();
        assert_eq!(cpus, vec![40.0, 12.0]);
        let pids: Vec<u32> = list.processes.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![2, 3]);
        assert_eq!(list.total, 3);
        assert_eq!(list.collected, 2);
    }

    #[tokio::test]
    async fn enrichment_only_touches_selected_processes() {
        let values: Vec<(u32, f64)> = (1..=40).map(|pid| (pid, pid as f64 / 2.0)).collect();
        let mut s = sampler(FakeSource::with_cpu(&values), 5);
        let list = s.sample().await.expect("sample");

        assert_eq!(list.processes.len(), 5);
        assert_eq!(s.source.primed.len(), 40);
        assert_eq!(s.source.measured.len(), 40);
        assert_eq!(s.source.enriched.len(), list.processes.len());
        assert_eq!(s.source.enriched, vec![40, 39, 38, 37, 36]);
    }

    #[tokio::test]
    async fn failed_measurements_are_not_candidates() {
        let mut source = FakeSource::with_cpu(&[(1, 0.0), (2, 3.0), (3, 9.0)]);
        source.failing_measure = vec![3];
        let mut s = sampler(source, 10);
        let list = s.sample().await.expect("sample");

        let pids: Vec<u32> = list.processes.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![2, 1]);
    }

    #[tokio::test]
    async fn ties_keep_encounter_order() {
        let source = FakeSource::with_cpu(&[(7, 1.0), (3, 2.0), (9, 1.0), (4, 1.0)]);
        let mut s = sampler(source, 10);
        let list = s.sample().await.expect("sample");
        let pids: Vec<u32> = list.processes.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![3, 7, 9, 4]);
    }

    #[tokio::test]
    async fn scan_limit_bounds_both_passes() {
        let values: Vec<(u32, f64)> = (1..=10).map(|pid| (pid, pid as f64)).collect();
        let mut s = ProcessSampler::new(FakeSource::with_cpu(&values), 3, 4)
            .with_window(Duration::ZERO);
        let list = s.sample().await.expect("sample");

        assert_eq!(s.source.primed, vec![1, 2, 3, 4]);
        assert_eq!(s.source.measured, vec![1, 2, 3, 4]);
        let pids: Vec<u32> = list.processes.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![4, 3, 2]);
        assert_eq!(list.total, 10);
    }

    #[tokio::test]
    async fn empty_process_table_is_not_an_error() {
        let mut s = sampler(FakeSource::default(), 50);
        let list = s.sample().await.expect("sample");
        assert!(list.processes.is_empty());
        assert_eq!(list.total, 0);
        assert!(s.source.primed.is_empty());
    }

    #[tokio::test]
    async fn memory_percent_prefers_rss_over_total() {
        let mut source = FakeSource::with_cpu(&[(1, 1.0), (2, 2.0)]);
        source.rss.insert(1, 250);
        let mut s = sampler(source, 10);
        let list = s.sample().await.expect("sample");

        let by_pid: HashMap<u32, &ProcessRecord> =
            list.processes.iter().map(|p| (p.pid, p)).collect();
        assert_eq!(by_pid[&1].memory_percent, 25.0);
        assert_eq!(by_pid[&1].memory_bytes, 250);
        // no rss reported: fall back to the provider's percentage
        assert_eq!(by_pid[&2].memory_percent, 1.5);
    }

    #[tokio::test]
    async fn unknown_total_memory_uses_fallback() {
        let mut source = FakeSource::with_cpu(&[(1, 1.0)]);
        source.total_memory = None;
        source.rss.insert(1, 250);
        let mut s = sampler(source, 10);
        let list = s.sample().await.expect("sample");
        assert_eq!(list.processes[0].memory_percent, 1.5);
    }

    #[tokio::test]
    async fn long_command_lines_are_truncated() {
        let mut source = FakeSource::with_cpu(&[(1, 1.0)]);
        source.command.insert(1, "x".repeat(250));
        let mut s = sampler(source, 10);
        let list = s.sample().await.expect("sample");
        let command = &list.processes[0].command;
        assert_eq!(command.len(), 203);
        assert!(command.ends_with("..."));
    }

    #[test]
    fn truncate_command_is_char_safe() {
        let short = "ls -la";
        assert_eq!(truncate_command(short), short);
        let exact = "é".repeat(200);
        assert_eq!(truncate_command(&exact), exact);
        let long = "é".repeat(201);
        let truncated = truncate_command(&long);
        assert_eq!(truncated.chars().count(), 203);
    }
}
