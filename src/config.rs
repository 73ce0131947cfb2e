use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    #[serde(default = "default_host_id")]
    pub host_id: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub manual_ip: Option<String>,
    #[serde(default = "default_tags")]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub logs: LogConfig,
    #[serde(default)]
    pub scripts: Vec<ScriptJob>,
    #[serde(default)]
    pub services: Vec<ServiceTargetConfig>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessConfig {
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_log_paths")]
    pub paths: Vec<String>,
    #[serde(default = "default_log_max_lines")]
    pub max_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScriptJob {
    pub id: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_script_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub interval_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ServiceTargetConfig {
    Name(String),
    Target(ServiceTarget),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServiceTarget {
    pub name: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_register_secs")]
    pub register_secs: u64,
    #[serde(default = "default_metrics_secs")]
    pub metrics_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_bulk_secs")]
    pub bulk_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            host_id: default_host_id(),
            interval_secs: default_interval_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            debug: false,
            manual_ip: None,
            tags: default_tags(),
            listen: None,
            process: ProcessConfig::default(),
            logs: LogConfig::default(),
            scripts: Vec::new(),
            services: Vec::new(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
            scan_limit: default_scan_limit(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            paths: default_log_paths(),
            max_lines: default_log_max_lines(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            register_secs: default_register_secs(),
            metrics_secs: default_metrics_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            bulk_secs: default_bulk_secs(),
        }
    }
}

impl ServiceTargetConfig {
    pub fn into_target(self) -> ServiceTarget {
        match self {
            ServiceTargetConfig::Name(name) => ServiceTarget {
                name,
                port: None,
                host: None,
                description: None,
            },
            ServiceTargetConfig::Target(target) => target,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ServiceTargetConfig::Name(name) => name,
            ServiceTargetConfig::Target(target) => &target.name,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg = Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Result<(Self, bool), ConfigError> {
        match Self::load_from_file(path) {
            Ok(cfg) => Ok((cfg, true)),
            Err(ConfigError::Read { source, .. }) if source.kind() == ErrorKind::NotFound => {
                Ok((Self::default(), false))
            }
            Err(err) => Err(err),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "host_id must not be empty".to_string(),
            ));
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs must be >= 1".to_string(),
            ));
        }
        if self.heartbeat_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "heartbeat_interval_secs must be >= 1".to_string(),
            ));
        }
        if let Some(listen) = &self.listen {
            if SocketAddr::from_str(listen).is_err() {
                return Err(ConfigError::Validation(
                    "listen must be a valid host:port address".to_string(),
                ));
            }
        }
        if self.process.top_n == 0 {
            return Err(ConfigError::Validation(
                "process.top_n must be >= 1".to_string(),
            ));
        }
        if self.process.scan_limit == 0 {
            return Err(ConfigError::Validation(
                "process.scan_limit must be >= 1".to_string(),
            ));
        }
        if self.logs.max_lines == 0 {
            return Err(ConfigError::Validation(
                "logs.max_lines must be >= 1".to_string(),
            ));
        }

        validate_scripts(&self.scripts)?;
        validate_services(&self.services)?;
        validate_timeouts(&self.timeouts)?;

        Ok(())
    }

    pub fn is_debug(&self) -> bool {
        self.debug || self.server_addr.trim().is_empty()
    }

    pub fn service_targets(&self) -> Vec<ServiceTarget> {
        if self.services.is_empty() {
            return default_services()
                .into_iter()
                .map(|name| ServiceTargetConfig::Name(name).into_target())
                .collect();
        }
        self.services
            .iter()
            .cloned()
            .map(ServiceTargetConfig::into_target)
            .collect()
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../agent-config.yaml.example")
    }
}

fn validate_scripts(scripts: &[ScriptJob]) -> Result<(), ConfigError> {
    let mut ids = HashSet::new();
    for job in scripts {
        if job.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "scripts[*].id must not be empty".to_string(),
            ));
        }
        if !ids.insert(job.id.clone()) {
            return Err(ConfigError::Validation(format!(
                "script id '{}' must be unique",
                job.id
            )));
        }
        if job.command.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "script '{}' command must not be empty",
                job.id
            )));
        }
    }
    Ok(())
}

fn validate_services(services: &[ServiceTargetConfig]) -> Result<(), ConfigError> {
    for service in services {
        if service.name().trim().is_empty() {
            return Err(ConfigError::Validation(
                "services[*].name must not be empty".to_string(),
            ));
        }
        if let ServiceTargetConfig::Target(target) = service {
            if target.port == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "service '{}' port must be in range 1..65535",
                    target.name
                )));
            }
            if matches!(&target.host, Some(host) if host.trim().is_empty()) {
                return Err(ConfigError::Validation(format!(
                    "service '{}' host must not be empty when set",
                    target.name
                )));
            }
        }
    }
    Ok(())
}

fn validate_timeouts(cfg: &TimeoutConfig) -> Result<(), ConfigError> {
    let fields = [
        ("connect_secs", cfg.connect_secs),
        ("register_secs", cfg.register_secs),
        ("metrics_secs", cfg.metrics_secs),
        ("heartbeat_secs", cfg.heartbeat_secs),
        ("bulk_secs", cfg.bulk_secs),
    ];
    for (name, value) in fields {
        if value == 0 {
            return Err(ConfigError::Validation(format!(
                "timeouts.{name} must be > 0"
            )));
        }
    }
    Ok(())
}

fn default_server_addr() -> String {
    "localhost:50051".to_string()
}

fn default_host_id() -> String {
    "host-001".to_string()
}

const fn default_interval_secs() -> u64 {
    10
}

const fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_tags() -> BTreeMap<String, String> {
    BTreeMap::from([("env".to_string(), "production".to_string())])
}

const fn default_top_n() -> usize {
    50
}

const fn default_scan_limit() -> usize {
    2000
}

fn default_log_paths() -> Vec<String> {
    [
        "/var/log/syslog",
        "/var/log/messages",
        "/var/log/nginx/access.log",
        "/var/log/nginx/error.log",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

const fn default_log_max_lines() -> usize {
    100
}

const fn default_script_timeout_secs() -> u64 {
    30
}

fn default_services() -> Vec<String> {
    ["sshd", "docker", "nginx"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

const fn default_connect_secs() -> u64 {
    5
}

const fn default_register_secs() -> u64 {
    5
}

const fn default_metrics_secs() -> u64 {
    5
}

const fn default_heartbeat_secs() -> u64 {
    3
}

const fn default_bulk_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = Config::from_yaml("{}").expect("empty mapping parses");
        cfg.validate().expect("defaults are valid");
        assert_eq!(cfg.interval_secs, 10);
        assert_eq!(cfg.heartbeat_interval_secs, 30);
        assert_eq!(cfg.process.top_n, 50);
        assert_eq!(cfg.process.scan_limit, 2000);
        assert_eq!(cfg.logs.max_lines, 100);
        assert_eq!(cfg.timeouts.bulk_secs, 10);
        assert_eq!(cfg.tags.get("env").map(String::as_str), Some("production"));
    }

    #[test]
    fn services_accept_bare_names_and_targets() {
        let cfg = Config::from_yaml(
            r#"
services:
  - sshd
  - name: nginx
    port: 80
    host: localhost
    description: web frontend
"#,
        )
        .expect("services parse");
        cfg.validate().expect("valid");

        let targets = cfg.service_targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].name, "sshd");
        assert_eq!(targets[0].port, None);
        assert_eq!(targets[1].port, Some(80));
        assert_eq!(targets[1].description.as_deref(), Some("web frontend"));
    }

    #[test]
    fn missing_services_fall_back_to_defaults() {
        let cfg = Config::default();
        let names: Vec<String> = cfg.service_targets().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["sshd", "docker", "nginx"]);
    }

    #[test]
    fn script_defaults_and_duplicate_ids() {
        let cfg = Config::from_yaml(
            r#"
scripts:
  - id: disk
    name: disk check
    command: df
    args: ["-h"]
"#,
        )
        .expect("scripts parse");
        assert_eq!(cfg.scripts[0].timeout_secs, 30);
        assert_eq!(cfg.scripts[0].interval_secs, 0);

        let mut dup = cfg.clone();
        dup.scripts.push(dup.scripts[0].clone());
        assert!(matches!(dup.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_bad_listen_and_zero_port() {
        let mut cfg = Config::default();
        cfg.listen = Some("not-an-addr".to_string());
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.services = vec![ServiceTargetConfig::Target(ServiceTarget {
            name: "db".to_string(),
            port: Some(0),
            host: None,
            description: None,
        })];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn debug_is_implied_without_server() {
        let mut cfg = Config::default();
        assert!(!cfg.is_debug());
        cfg.server_addr = "  ".to_string();
        assert!(cfg.is_debug());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (cfg, loaded) =
            Config::load_or_default(dir.path().join("absent.yaml")).expect("defaults");
        assert!(!loaded);
        assert_eq!(cfg.host_id, "host-001");
    }

    #[test]
    fn bundled_example_is_valid() {
        let cfg = Config::from_yaml(Config::example_yaml()).expect("example parses");
        cfg.validate().expect("example is valid");
    }
}
