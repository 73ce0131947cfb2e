use crate::snapshot::Snapshot;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct State {
    pub host_id: String,
    pub started_at_unix: i64,
    pub last_collect_timestamp_seconds: i64,
    pub last_heartbeat_timestamp_seconds: i64,
    pub last_cycle_ms: u64,
    pub cycles: u64,
    pub registered: bool,
    pub last_errors: BTreeMap<String, String>,
    pub last_snapshot: Option<Snapshot>,
}

impl State {
    pub fn new(host_id: impl Into<String>, now_unix: i64) -> Self {
        Self {
            host_id: host_id.into(),
            started_at_unix: now_unix,
            ..Self::default()
        }
    }

    pub fn update_collected(
        &mut self,
        snapshot: Snapshot,
        errors: BTreeMap<String, String>,
        cycle_ms: u64,
    ) {
        self.last_collect_timestamp_seconds = snapshot.timestamp;
        self.last_cycle_ms = cycle_ms;
        self.cycles += 1;
        self.last_errors = errors;
        self.last_snapshot = Some(snapshot);
    }
}
