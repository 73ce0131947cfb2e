use crate::collectors::Collector;
use crate::dispatch::{enqueue, DispatchCommand};
use crate::metrics::Metrics;
use crate::snapshot::{now_unix, Snapshot};
use crate::state::State;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct Agent {
    host_id: String,
    collectors: Vec<Box<dyn Collector>>,
    metrics: Arc<Metrics>,
    state: Arc<RwLock<State>>,
    tx: mpsc::Sender<DispatchCommand>,
}

impl Agent {
    pub fn new(
        host_id: impl Into<String>,
        collectors: Vec<Box<dyn Collector>>,
        metrics: Arc<Metrics>,
        state: Arc<RwLock<State>>,
        tx: mpsc::Sender<DispatchCommand>,
    ) -> Self {
        Self {
            host_id: host_id.into(),
            collectors,
            metrics,
            state,
            tx,
        }
    }

    pub async fn collect_snapshot(&mut self) -> (Snapshot, BTreeMap<String, String>) {
        let mut snapshot = Snapshot::new(self.host_id.clone(), now_unix());
        let mut errors = BTreeMap::new();

        for collector in &mut self.collectors {
            let name = collector.name().to_string();
            let started = Instant::now();
            match collector.collect().await {
                Ok(payload) => {
                    debug!(
                        collector = %name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "collected"
                    );
                    snapshot = snapshot.with_payload(name, payload);
                }
                Err(err) => {
                    warn!(collector = %name, error = %err, "collector failed");
                    self.metrics.inc_collect_error(&name);
                    errors.insert(name, err.to_string());
                }
            }
        }

        (snapshot, errors)
    }

    pub async fn run_cycle(&mut self) {
        let started = Instant::now();
        let (snapshot, errors) = self.collect_snapshot().await;
        let cycle_ms = started.elapsed().as_millis() as u64;

        info!(
            payloads = snapshot.len(),
            errors = errors.len(),
            cycle_ms,
            "collection cycle finished"
        );

        let current = {
            let mut guard = self.state.write().await;
            guard.update_collected(snapshot.clone(), errors, cycle_ms);
            guard.clone()
        };
        self.metrics.inc_cycle();
        self.metrics.update_from_state(&current, now_unix());

        enqueue(&self.tx, DispatchCommand::Cycle(snapshot), &self.metrics);
    }

    pub async fn run_collection(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval = %humantime::format_duration(interval),
            collectors = self.collectors.len(),
            "collection loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("stopping collection loop");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }
    }
}

pub async fn run_heartbeat(
    interval: Duration,
    tx: mpsc::Sender<DispatchCommand>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("stopping heartbeat loop");
                break;
            }
            _ = ticker.tick() => {
                enqueue(&tx, DispatchCommand::Heartbeat { timestamp: now_unix() }, &metrics);
            }
        }
    }
}
