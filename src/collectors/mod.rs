pub mod log;
pub mod process;
pub mod script;
pub mod service;
pub mod system;

use crate::config::Config;
use crate::snapshot::Payload;
use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait Collector: Send {
    fn name(&self) -> &str;

    async fn collect(&mut self) -> Result<Payload, CollectError>;
}

pub fn build_collectors(cfg: &Config) -> Vec<Box<dyn Collector>> {
    let mut collectors: Vec<Box<dyn Collector>> = vec![
        Box::new(system::CpuProvider::new()),
        Box::new(system::MemoryProvider::new()),
        Box::new(system::DiskProvider::new()),
        Box::new(system::NetworkProvider::new()),
        Box::new(process::ProcessSampler::new(
            process::SysinfoProcessSource::new(),
            cfg.process.top_n,
            cfg.process.scan_limit,
        )),
        Box::new(log::LogTailer::new(
            cfg.logs.paths.clone(),
            cfg.logs.max_lines,
        )),
    ];

    if cfg.scripts.is_empty() {
        info!("no scripts configured");
    } else {
        info!(count = cfg.scripts.len(), "scripts loaded from config");
        collectors.push(Box::new(script::ScriptExecutor::new(cfg.scripts.clone())));
    }

    let targets = cfg.service_targets();
    info!(
        count = targets.len(),
        defaults = cfg.services.is_empty(),
        "service targets loaded"
    );
    collectors.push(Box::new(service::ServiceProber::new(
        targets,
        service::SystemServiceManager::new(),
    )));

    collectors
}
