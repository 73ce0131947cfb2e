use crate::collectors::{CollectError, Collector};
use crate::config::ServiceTarget;
use crate::snapshot::{Payload, ServiceState, ServiceStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_HOST: &str = "localhost";

#[derive(Debug, Clone, PartialEq)]
pub struct ManagerReport {
    pub state: ServiceState,
    pub enabled: bool,
    pub description: String,
    pub uptime_seconds: Option<i64>,
}

impl ManagerReport {
    pub fn unknown() -> Self {
        Self {
            state: ServiceState::Unknown,
            enabled: false,
            description: String::new(),
            uptime_seconds: None,
        }
    }
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn query(&self, name: &str) -> ManagerReport;
}

pub fn reconcile(manager: ServiceState, port_accessible: Option<bool>) -> ServiceState {
    match (manager, port_accessible) {
        (state, None) => state,
        (_, Some(true)) => ServiceState::Running,
        (ServiceState::Running, Some(false)) => ServiceState::Failed,
        (state, Some(false)) => state,
    }
}

pub async fn probe_port(host: &str, port: u16, timeout: Duration) -> bool {
    let addr = format!("{host}:{port}");
    match time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(err)) => {
            debug!(address = %addr, error = %err, "port probe refused");
            false
        }
        Err(_elapsed) => {
            debug!(address = %addr, "port probe timeout");
            false
        }
    }
}

pub struct ServiceProber<M> {
    targets: Vec<ServiceTarget>,
    manager: M,
    probe_timeout: Duration,
}

impl<M: ServiceManager> ServiceProber<M> {
    pub fn new(targets: Vec<ServiceTarget>, manager: M) -> Self {
        Self {
            targets,
            manager,
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub async fn check(&self, target: &ServiceTarget) -> ServiceStatus {
        let report = self.manager.query(&target.name).await;

        let port_accessible = match target.port {
            Some(port) => {
                let host = target.host.as_deref().unwrap_or(DEFAULT_HOST);
                Some(probe_port(host, port, self.probe_timeout).await)
            }
            None => None,
        };

        let status = reconcile(report.state, port_accessible);
        if status != report.state {
            debug!(
                service = %target.name,
                manager = %report.state,
                reported = %status,
                "port probe overrides manager state"
            );
        }

        let description = match &target.description {
            Some(desc) if !desc.is_empty() => desc.clone(),
            _ => report.description,
        };
        let uptime_seconds = match status {
            ServiceState::Running => report.uptime_seconds.unwrap_or(0),
            _ => 0,
        };

        ServiceStatus {
            name: target.name.clone(),
            status,
            enabled: report.enabled,
            description,
            uptime_seconds,
            port: target.port,
            port_accessible: port_accessible.unwrap_or(false),
        }
    }
}

#[async_trait]
impl<M: ServiceManager> Collector for ServiceProber<M> {
    fn name(&self) -> &str {
        "service"
    }

    async fn collect(&mut self) -> Result<Payload, CollectError> {
        let mut statuses = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            statuses.push(self.check(target).await);
        }
        Ok(Payload::Services(statuses))
    }
}

pub struct SystemServiceManager {
    timeout: Duration,
}

impl SystemServiceManager {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Option<String> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).kill_on_drop(true);
        match time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
            Ok(Err(err)) => {
                debug!(program, error = %err, "service manager unavailable");
                None
            }
            Err(_elapsed) => {
                warn!(program, "service manager query timeout");
                None
            }
        }
    }
}

#[async_trait]
impl ServiceManager for SystemServiceManager {
    #[cfg(target_os = "linux")]
    async fn query(&self, name: &str) -> ManagerReport {
        let property = "--property=LoadState,ActiveState,UnitFileState,Description,ActiveEnterTimestampMonotonic";
        match self.run("systemctl", &["show", name, property]).await {
            Some(out) => {
                use sysinfo::SystemExt;
                let system_uptime = sysinfo::System::new().uptime();
                parse_systemctl_show(&out, system_uptime)
            }
            None => ManagerReport::unknown(),
        }
    }

    #[cfg(windows)]
    async fn query(&self, name: &str) -> ManagerReport {
        let Some(query) = self.run("sc", &["query", name]).await else {
            return ManagerReport::unknown();
        };
        let config = self.run("sc", &["qc", name]).await.unwrap_or_default();
        parse_sc_output(&query, &config)
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    async fn query(&self, _name: &str) -> ManagerReport {
        ManagerReport::unknown()
    }
}

pub fn parse_systemctl_show(output: &str, system_uptime: u64) -> ManagerReport {
    let props: HashMap<&str, &str> = output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();

    if props.get("LoadState").copied() == Some("not-found") {
        return ManagerReport::unknown();
    }

    let state = match props.get("ActiveState").copied().unwrap_or("") {
        "active" | "reloading" => ServiceState::Running,
        "inactive" | "deactivating" => ServiceState::Stopped,
        "failed" => ServiceState::Failed,
        _ => ServiceState::Unknown,
    };

    let enabled = props
        .get("UnitFileState")
        .is_some_and(|s| s.starts_with("enabled"));

    let uptime_seconds = match state {
        ServiceState::Running => props
            .get("ActiveEnterTimestampMonotonic")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&micros| micros > 0)
            .map(|micros| system_uptime.saturating_sub(micros / 1_000_000) as i64),
        _ => None,
    };

    ManagerReport {
        state,
        enabled,
        description: props.get("Description").unwrap_or(&"").to_string(),
        uptime_seconds,
    }
}

#[cfg_attr(not(windows), allow(dead_code))]
fn parse_sc_output(query: &str, config: &str) -> ManagerReport {
    let state = if query.contains("RUNNING") {
        ServiceState::Running
    } else if query.contains("STOPPED") {
        ServiceState::Stopped
    } else {
        ServiceState::Unknown
    };
    ManagerReport {
        state,
        enabled: config.contains("AUTO_START"),
        description: String::new(),
        uptime_seconds: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    struct FixedManager(ServiceState);

    #[async_trait]
    impl ServiceManager for FixedManager {
        async fn query(&self, _name: &str) -> ManagerReport {
            ManagerReport {
                state: self.0,
                enabled: true,
                description: "from manager".to_string(),
                uptime_seconds: Some(120),
            }
        }
    }

    fn target(name: &str, port: Option<u16>) -> ServiceTarget {
        ServiceTarget {
            name: name.to_string(),
            port,
            host: Some("127.0.0.1".to_string()),
            description: None,
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        port
    }

    #[test]
    fn reconciliation_table() {
        use ServiceState::*;
        let cases = [
            (Running, true, Running),
            (Running, false, Failed),
            (Stopped, true, Running),
            (Stopped, false, Stopped),
            (Unknown, true, Running),
            (Unknown, false, Unknown),
            (Failed, true, Running),
            (Failed, false, Failed),
        ];
        for (manager, port_ok, expected) in cases {
            assert_eq!(
                reconcile(manager, Some(port_ok)),
                expected,
                "manager={manager} port_ok={port_ok}"
            );
        }
    }

    #[test]
    fn without_port_manager_state_is_reported() {
        for state in [
            ServiceState::Running,
            ServiceState::Stopped,
            ServiceState::Failed,
            ServiceState::Unknown,
        ] {
            assert_eq!(reconcile(state, None), state);
        }
    }

    #[tokio::test]
    async fn stopped_unit_with_listening_port_is_running() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let prober = ServiceProber::new(vec![], FixedManager(ServiceState::Stopped));
        let status = prober.check(&target("nginx", Some(port))).await;

        assert_eq!(status.status, ServiceState::Running);
        assert!(status.port_accessible);
        assert_eq!(status.port, Some(port));
        assert_eq!(status.uptime_seconds, 120);
    }

    #[tokio::test]
    async fn running_unit_with_closed_port_is_failed() {
        let port = closed_port().await;
        let prober = ServiceProber::new(vec![], FixedManager(ServiceState::Running))
            .with_probe_timeout(Duration::from_millis(500));
        let status = prober.check(&target("postgresql", Some(port))).await;

        assert_eq!(status.status, ServiceState::Failed);
        assert!(!status.port_accessible);
        assert_eq!(status.uptime_seconds, 0);
    }

    #[tokio::test]
    async fn collect_reports_every_target() {
        let mut with_desc = target("sshd", None);
        with_desc.description = Some("OpenSSH".to_string());
        let mut prober = ServiceProber::new(
            vec![with_desc, target("docker", None)],
            FixedManager(ServiceState::Stopped),
        );

        let statuses = match prober.collect().await.expect("collect") {
            Payload::Services(s) => s,
            other => panic!("unexpected payload {other:?}"),
        };
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].description, "OpenSSH");
        assert_eq!(statuses[1].description, "from manager");
        assert!(statuses.iter().all(|s| s.status == ServiceState::Stopped));
        assert!(statuses.iter().all(|s| !s.port_accessible && s.port.is_none()));
    }

    #[test]
    fn parses_active_unit_with_uptime() {
        let out = "LoadState=loaded\n\
                   ActiveState=active\n\
                   UnitFileState=enabled\n\
                   Description=A high performance web server\n\
                   ActiveEnterTimestampMonotonic=5000000\n";
        let report = parse_systemctl_show(out, 65);
        assert_eq!(report.state, ServiceState::Running);
        assert!(report.enabled);
        assert_eq!(report.description, "A high performance web server");
        assert_eq!(report.uptime_seconds, Some(60));
    }

    #[test]
    fn parses_inactive_failed_and_missing_units() {
        let inactive = parse_systemctl_show(
            "LoadState=loaded\nActiveState=inactive\nUnitFileState=disabled\nActiveEnterTimestampMonotonic=0\n",
            100,
        );
        assert_eq!(inactive.state, ServiceState::Stopped);
        assert!(!inactive.enabled);
        assert_eq!(inactive.uptime_seconds, None);

        let failed = parse_systemctl_show("LoadState=loaded\nActiveState=failed\n", 100);
        assert_eq!(failed.state, ServiceState::Failed);

        let missing = parse_systemctl_show(
            "LoadState=not-found\nActiveState=inactive\nDescription=nginx.service\n",
            100,
        );
        assert_eq!(missing, ManagerReport::unknown());
    }

    #[test]
    fn parses_windows_service_control_output() {
        let report = parse_sc_output("STATE : 4  RUNNING", "START_TYPE : 2   AUTO_START");
        assert_eq!(report.state, ServiceState::Running);
        assert!(report.enabled);
        assert_eq!(parse_sc_output("STATE : 1  STOPPED", "").state, ServiceState::Stopped);
    }
}
