use crate::state::State;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub agent_uptime_seconds: Gauge,
    pub agent_scrape_count_total: Counter,
    pub agent_collection_cycles_total: Counter,
    pub agent_last_collect_timestamp_seconds: Gauge,
    pub agent_collect_duration_seconds: Gauge,
    pub agent_snapshot_payloads: Gauge,
    pub agent_collect_errors_total: CounterVec,
    pub agent_pushes_total: CounterVec,
    pub agent_push_failures_total: CounterVec,
    pub agent_heartbeats_total: Counter,
    pub agent_registered: Gauge,
    pub agent_dispatch_dropped_total: CounterVec,
    pub agent_services_by_status: GaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let agent_uptime_seconds =
            Gauge::with_opts(opts!("agent_uptime_seconds", "Agent uptime in seconds"))?;
        let agent_scrape_count_total = Counter::with_opts(opts!(
            "agent_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let agent_collection_cycles_total = Counter::with_opts(opts!(
            "agent_collection_cycles_total",
            "Completed collection cycles"
        ))?;
        let agent_last_collect_timestamp_seconds = Gauge::with_opts(opts!(
            "agent_last_collect_timestamp_seconds",
            "Unix timestamp of the last collection"
        ))?;
        let agent_collect_duration_seconds = Gauge::with_opts(opts!(
            "agent_collect_duration_seconds",
            "Wall time of the last collection cycle"
        ))?;
        let agent_snapshot_payloads = Gauge::with_opts(opts!(
            "agent_snapshot_payloads",
            "Collectors present in the last snapshot"
        ))?;
        let agent_collect_errors_total = CounterVec::new(
            opts!(
                "agent_collect_errors_total",
                "Collector errors total by collector"
            ),
            &["collector"],
        )?;
        let agent_pushes_total = CounterVec::new(
            opts!("agent_pushes_total", "Successful report calls by kind"),
            &["kind"],
        )?;
        let agent_push_failures_total = CounterVec::new(
            opts!("agent_push_failures_total", "Failed report calls by kind"),
            &["kind"],
        )?;
        let agent_heartbeats_total =
            Counter::with_opts(opts!("agent_heartbeats_total", "Acknowledged heartbeats"))?;
        let agent_registered = Gauge::with_opts(opts!(
            "agent_registered",
            "1 when the collection server accepted registration"
        ))?;
        let agent_dispatch_dropped_total = CounterVec::new(
            opts!(
                "agent_dispatch_dropped_total",
                "Dispatch commands dropped on a full queue"
            ),
            &["command"],
        )?;
        let agent_services_by_status = GaugeVec::new(
            opts!(
                "agent_services_by_status",
                "Probed services in the last cycle by status"
            ),
            &["status"],
        )?;

        register(&registry, &agent_uptime_seconds)?;
        register(&registry, &agent_scrape_count_total)?;
        register(&registry, &agent_collection_cycles_total)?;
        register(&registry, &agent_last_collect_timestamp_seconds)?;
        register(&registry, &agent_collect_duration_seconds)?;
        register(&registry, &agent_snapshot_payloads)?;
        register(&registry, &agent_collect_errors_total)?;
        register(&registry, &agent_pushes_total)?;
        register(&registry, &agent_push_failures_total)?;
        register(&registry, &agent_heartbeats_total)?;
        register(&registry, &agent_registered)?;
        register(&registry, &agent_dispatch_dropped_total)?;
        register(&registry, &agent_services_by_status)?;

        Ok(Arc::new(Self {
            registry,
            agent_uptime_seconds,
            agent_scrape_count_total,
            agent_collection_cycles_total,
            agent_last_collect_timestamp_seconds,
            agent_collect_duration_seconds,
            agent_snapshot_payloads,
            agent_collect_errors_total,
            agent_pushes_total,
            agent_push_failures_total,
            agent_heartbeats_total,
            agent_registered,
            agent_dispatch_dropped_total,
            agent_services_by_status,
        }))
    }

    pub fn update_from_state(&self, state: &State, now_unix: i64) {
        self.agent_last_collect_timestamp_seconds
            .set(state.last_collect_timestamp_seconds as f64);
        self.agent_collect_duration_seconds
            .set(state.last_cycle_ms as f64 / 1000.0);
        self.agent_registered
            .set(if state.registered { 1.0 } else { 0.0 });

        self.agent_services_by_status.reset();
        if let Some(snapshot) = &state.last_snapshot {
            self.agent_snapshot_payloads.set(snapshot.len() as f64);
            for service in snapshot.services().unwrap_or_default() {
                self.agent_services_by_status
                    .with_label_values(&[service.status.as_str()])
                    .inc();
            }
        }

        let uptime = now_unix.saturating_sub(state.started_at_unix) as f64;
        self.agent_uptime_seconds.set(uptime);
    }

    pub fn inc_scrape_count(&self) {
        self.agent_scrape_count_total.inc();
    }

    pub fn inc_cycle(&self) {
        self.agent_collection_cycles_total.inc();
    }

    pub fn inc_collect_error(&self, collector: &str) {
        self.agent_collect_errors_total
            .with_label_values(&[collector])
            .inc();
    }

    pub fn record_push(&self, kind: &str, ok: bool) {
        let counter = if ok {
            &self.agent_pushes_total
        } else {
            &self.agent_push_failures_total
        };
        counter.with_label_values(&[kind]).inc();
    }

    pub fn inc_heartbeat(&self) {
        self.agent_heartbeats_total.inc();
    }

    pub fn set_registered(&self, registered: bool) {
        self.agent_registered
            .set(if registered { 1.0 } else { 0.0 });
    }

    pub fn inc_dropped(&self, command: &str) {
        self.agent_dispatch_dropped_total
            .with_label_values(&[command])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{Payload, ServiceState, ServiceStatus, Snapshot};

    fn service(name: &str, status: ServiceState) -> ServiceStatus {
        ServiceStatus {
            name: name.to_string(),
            status,
            enabled: true,
            description: String::new(),
            uptime_seconds: 0,
            port: None,
            port_accessible: false,
        }
    }

    #[test]
    fn state_drives_gauges() {
        let metrics = Metrics::new().expect("metrics");
        let mut state = State::new("h", 100);
        state.last_collect_timestamp_seconds = 150;
        state.last_cycle_ms = 1500;
        state.registered = true;
        state.last_snapshot = Some(Snapshot::new("h", 150).with_payload(
            "service",
            Payload::Services(vec![
                service("a", ServiceState::Running),
                service("b", ServiceState::Running),
                service("c", ServiceState::Failed),
            ]),
        ));

        metrics.update_from_state(&state, 160);

        assert_eq!(metrics.agent_uptime_seconds.get(), 60.0);
        assert_eq!(metrics.agent_collect_duration_seconds.get(), 1.5);
        assert_eq!(metrics.agent_registered.get(), 1.0);
        assert_eq!(metrics.agent_snapshot_payloads.get(), 1.0);
        assert_eq!(
            metrics
                .agent_services_by_status
                .with_label_values(&["running"])
                .get(),
            2.0
        );
    }

    #[test]
    fn push_outcomes_are_split_by_result() {
        let metrics = Metrics::new().expect("metrics");
        metrics.record_push("logs", true);
        metrics.record_push("logs", false);
        metrics.record_push("logs", false);
        assert_eq!(
            metrics.agent_pushes_total.with_label_values(&["logs"]).get(),
            1.0
        );
        assert_eq!(
            metrics
                .agent_push_failures_total
                .with_label_values(&["logs"])
                .get(),
            2.0
        );
    }
}
