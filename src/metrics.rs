//! Counters for diagnosing the monitor loop.
//!
//! Every failure the loop swallows is counted here by kind, so the periodic
//! summary in the log shows what went wrong without any error channel.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use crate::scheduler::ReadReason;

/// Snapshot of the counters, logged as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_sec: u64,
    pub ticks: u64,
    pub probes_attempted: u64,
    pub probes_succeeded: u64,
    /// Probe attempts by scheduling reason
    pub probes_by_reason: BTreeMap<String, u64>,
    /// Probe failures by error kind
    pub probe_failures: BTreeMap<String, u64>,
    pub sink_writes: u64,
    /// Publishes skipped because the stored value already matched
    pub sink_skips: u64,
    pub sink_failures: u64,
    pub tick_panics: u64,
}

/// Metrics collector shared between the tick body and the outer loop.
pub struct MonitorMetrics {
    start_time: Instant,
    ticks: AtomicU64,
    probes_attempted: AtomicU64,
    probes_succeeded: AtomicU64,
    sink_writes: AtomicU64,
    sink_skips: AtomicU64,
    sink_failures: AtomicU64,
    tick_panics: AtomicU64,
    probes_by_reason: RwLock<BTreeMap<&'static str, u64>>,
    probe_failures: RwLock<BTreeMap<&'static str, u64>>,
}

impl MonitorMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            ticks: AtomicU64::new(0),
            probes_attempted: AtomicU64::new(0),
            probes_succeeded: AtomicU64::new(0),
            sink_writes: AtomicU64::new(0),
            sink_skips: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            tick_panics: AtomicU64::new(0),
            probes_by_reason: RwLock::new(BTreeMap::new()),
            probe_failures: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_probe(&self, reason: ReadReason) {
        self.probes_attempted.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut by_reason) = self.probes_by_reason.write() {
            *by_reason.entry(reason.as_str()).or_insert(0) += 1;
        }
    }

    pub fn record_probe_success(&self) {
        self.probes_succeeded.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_probe_failure(&self, kind: &'static str) {
        if let Ok(mut failures) = self.probe_failures.write() {
            *failures.entry(kind).or_insert(0) += 1;
        }
    }

    pub fn record_sink_write(&self) {
        self.sink_writes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_sink_skip(&self) {
        self.sink_skips.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_sink_failure(&self) {
        self.sink_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_tick_panic(&self) {
        self.tick_panics.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let to_owned = |map: &RwLock<BTreeMap<&'static str, u64>>| {
            map.read()
                .map(|m| m.iter().map(|(k, v)| (k.to_string(), *v)).collect())
                .unwrap_or_default()
        };

        MetricsSnapshot {
            uptime_sec: self.start_time.elapsed().as_secs(),
            ticks: self.ticks.load(Ordering::SeqCst),
            probes_attempted: self.probes_attempted.load(Ordering::SeqCst),
            probes_succeeded: self.probes_succeeded.load(Ordering::SeqCst),
            probes_by_reason: to_owned(&self.probes_by_reason),
            probe_failures: to_owned(&self.probe_failures),
            sink_writes: self.sink_writes.load(Ordering::SeqCst),
            sink_skips: self.sink_skips.load(Ordering::SeqCst),
            sink_failures: self.sink_failures.load(Ordering::SeqCst),
            tick_panics: self.tick_panics.load(Ordering::SeqCst),
        }
    }
}

impl Default for MonitorMetrics {
    fn default() -> Self {
        Self::new()
    }
}
