//! One tick of the battery monitor.
//!
//! Ties the pieces together: poll activity, let the scheduler decide,
//! probe if asked to, smooth the result and publish it.

use crate::activity::ActivitySource;
use crate::metrics::MonitorMetrics;
use crate::probe::BatteryProbe;
use crate::scheduler::{ReadReason, ReadScheduler};
use crate::sink::{PublishOutcome, StatusSink};
use crate::smoothing::{BatteryState, DisplayedValue};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Fixed tick period of the monitor loop.
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// What happened during one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Set when the tick probed the device
    pub reason: Option<ReadReason>,
    /// Raw reading, `None` when no probe ran or it failed
    pub reading: Option<u8>,
    pub displayed: DisplayedValue,
    pub publish: PublishOutcome,
}

pub struct BatteryMonitor<A, P, S> {
    activity: A,
    probe: P,
    sink: S,
    scheduler: ReadScheduler,
    state: BatteryState,
    metrics: Arc<MonitorMetrics>,
}

impl<A, P, S> BatteryMonitor<A, P, S>
where
    A: ActivitySource,
    P: BatteryProbe,
    S: StatusSink,
{
    /// Build a monitor, seeding the history from the sink's last record.
    pub fn new(activity: A, probe: P, sink: S, metrics: Arc<MonitorMetrics>, now: Instant) -> Self {
        let state = match sink.load_seed() {
            Some(pct) => {
                info!("Seeding battery history with last published value {}%", pct);
                BatteryState::seeded(pct)
            }
            None => BatteryState::new(),
        };

        Self {
            activity,
            probe,
            sink,
            scheduler: ReadScheduler::new(now),
            state,
            metrics,
        }
    }

    /// Publish the initial (possibly seeded) value before the first probe.
    pub fn start(&mut self) -> PublishOutcome {
        self.publish()
    }

    pub fn tick(&mut self, now: Instant) -> TickReport {
        self.metrics.record_tick();

        let poll = self.activity.poll_activity();
        let reason = self.scheduler.on_tick(now, &poll);

        let mut reading = None;
        if let Some(reason) = reason {
            reading = self.run_probe(reason, now);
            let before = self.state.displayed();
            let displayed = self.state.ingest(reading);
            if displayed != before {
                info!("Battery status {} -> {}", before.token(), displayed.token());
            }
        }

        let publish = self.publish();
        TickReport {
            reason,
            reading,
            displayed: self.state.displayed(),
            publish,
        }
    }

    fn run_probe(&mut self, reason: ReadReason, now: Instant) -> Option<u8> {
        debug!("Probing battery ({})", reason.as_str());
        self.metrics.record_probe(reason);

        let result = self.probe.probe();
        self.scheduler.record_attempt(now);

        match result {
            Ok(pct) => {
                self.metrics.record_probe_success();
                debug!("Battery probe returned {}%", pct);
                Some(pct)
            }
            Err(e) => {
                self.metrics.record_probe_failure(e.kind());
                debug!(
                    "Battery probe failed ({} consecutive before this): {}",
                    self.state.consecutive_failures(),
                    e
                );
                None
            }
        }
    }

    fn publish(&mut self) -> PublishOutcome {
        let outcome = self.sink.publish(self.state.displayed());
        match outcome {
            PublishOutcome::Written => self.metrics.record_sink_write(),
            PublishOutcome::Failed => self.metrics.record_sink_failure(),
            PublishOutcome::Unchanged => self.metrics.record_sink_skip(),
        }
        outcome
    }

    pub fn displayed(&self) -> DisplayedValue {
        self.state.displayed()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityPoll, DeviceIdentity};
    use crate::error::ProbeError;
    use crate::sink::FileStatusSink;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Activity source replaying a script; repeats the last entry when done.
    struct ScriptedActivity {
        script: VecDeque<ActivityPoll>,
        last: ActivityPoll,
    }

    impl ScriptedActivity {
        fn connected(identity: &str) -> Self {
            Self {
                script: VecDeque::new(),
                last: ActivityPoll {
                    has_activity: false,
                    reachable: true,
                    identity: Some(DeviceIdentity::new(identity)),
                },
            }
        }

        fn then(mut self, poll: ActivityPoll) -> Self {
            self.script.push_back(poll);
            self
        }
    }

    impl ActivitySource for ScriptedActivity {
        fn poll_activity(&mut self) -> ActivityPoll {
            if let Some(next) = self.script.pop_front() {
                self.last = next;
            }
            self.last.clone()
        }
    }

    /// Probe returning scripted readings and counting calls.
    struct ScriptedProbe {
        readings: VecDeque<Option<u8>>,
        calls: u32,
    }

    impl ScriptedProbe {
        fn new(readings: Vec<Option<u8>>) -> Self {
            Self {
                readings: readings.into(),
                calls: 0,
            }
        }
    }

    impl BatteryProbe for ScriptedProbe {
        fn probe(&mut self) -> Result<u8, ProbeError> {
            self.calls += 1;
            match self.readings.pop_front().flatten() {
                Some(pct) => Ok(pct),
                None => Err(ProbeError::Timeout),
            }
        }
    }

    /// Sink recording every value it was asked to persist.
    #[derive(Default)]
    struct RecordingSink {
        seed: Option<u8>,
        persisted: Option<DisplayedValue>,
        writes: Vec<DisplayedValue>,
    }

    impl StatusSink for RecordingSink {
        fn publish(&mut self, value: DisplayedValue) -> PublishOutcome {
            if self.persisted == Some(value) {
                return PublishOutcome::Unchanged;
            }
            self.persisted = Some(value);
            self.writes.push(value);
            PublishOutcome::Written
        }

        fn load_seed(&self) -> Option<u8> {
            self.seed
        }
    }

    fn poll(activity: bool, identity: Option<&str>) -> ActivityPoll {
        ActivityPoll {
            has_activity: activity,
            reachable: identity.is_some(),
            identity: identity.map(DeviceIdentity::new),
        }
    }

    fn monitor_with(
        activity: ScriptedActivity,
        readings: Vec<Option<u8>>,
        sink: RecordingSink,
        start: Instant,
    ) -> BatteryMonitor<ScriptedActivity, ScriptedProbe, RecordingSink> {
        BatteryMonitor::new(
            activity,
            ScriptedProbe::new(readings),
            sink,
            Arc::new(MonitorMetrics::new()),
            start,
        )
    }

    #[test]
    fn test_first_tick_is_cold_start_read() {
        let start = Instant::now();
        let mut monitor = monitor_with(
            ScriptedActivity::connected("A"),
            vec![Some(70)],
            RecordingSink::default(),
            start,
        );

        let report = monitor.tick(start);
        assert_eq!(report.reason, Some(ReadReason::ColdStart));
        assert_eq!(report.reading, Some(70));
        assert_eq!(report.displayed, DisplayedValue::Present(70));
        assert_eq!(report.publish, PublishOutcome::Written);

        // Nothing is due until the minimum read interval has passed
        for secs in 1..60 {
            let report = monitor.tick(start + Duration::from_secs(secs));
            assert_eq!(report.reason, None);
            assert_eq!(report.publish, PublishOutcome::Unchanged);
        }
        assert_eq!(monitor.probe.calls, 1);
    }

    #[test]
    fn test_light_sleep_read_after_min_interval() {
        let start = Instant::now();
        let mut activity = ScriptedActivity::connected("A");
        // Active for the first 300 ticks, idle afterwards
        for _ in 0..300 {
            activity = activity.then(poll(true, Some("A")));
        }
        activity = activity.then(poll(false, Some("A")));
        let mut monitor = monitor_with(
            activity,
            vec![Some(70), Some(68)],
            RecordingSink::default(),
            start,
        );

        let mut reads = Vec::new();
        for secs in 0..400 {
            let report = monitor.tick(start + Duration::from_secs(secs));
            if let Some(reason) = report.reason {
                reads.push((secs, reason));
            }
        }

        // Last activity at t=299, light sleep from t=330, min interval passes at t=301
        assert_eq!(
            reads,
            vec![(0, ReadReason::ColdStart), (330, ReadReason::LightSleep)]
        );
        assert_eq!(monitor.displayed(), DisplayedValue::Present(69));
    }

    #[test]
    fn test_identity_change_forces_read() {
        let start = Instant::now();
        let activity = ScriptedActivity::connected("A")
            .then(poll(false, Some("A")))
            .then(poll(false, Some("A")))
            .then(poll(false, Some("B")));
        let mut monitor = monitor_with(
            activity,
            vec![Some(40), Some(90)],
            RecordingSink::default(),
            start,
        );

        assert_eq!(monitor.tick(start).reason, Some(ReadReason::ColdStart));
        assert_eq!(monitor.tick(start + Duration::from_secs(1)).reason, None);
        let report = monitor.tick(start + Duration::from_secs(2));
        assert_eq!(report.reason, Some(ReadReason::NewConnection));
        assert_eq!(report.displayed, DisplayedValue::Present(65));
    }

    #[test]
    fn test_driver_rebind_gap_does_not_trigger_rereads() {
        let start = Instant::now();
        // Claiming the interface drops the input node for a tick; it comes
        // back under the same connection identity.
        let activity = ScriptedActivity::connected("usb:1-2@dev7")
            .then(poll(false, Some("usb:1-2@dev7")))
            .then(poll(false, None))
            .then(poll(false, Some("usb:1-2@dev7")));
        let mut monitor = monitor_with(
            activity,
            vec![Some(70), Some(70), Some(70)],
            RecordingSink::default(),
            start,
        );

        let mut reads = Vec::new();
        for secs in 0..200 {
            if let Some(reason) = monitor.tick(start + Duration::from_secs(secs)).reason {
                reads.push((secs, reason));
            }
        }

        assert_eq!(reads, vec![(0, ReadReason::ColdStart)]);
        assert_eq!(monitor.probe.calls, 1);
    }

    #[test]
    fn test_unplugged_device_debounces_to_absent() {
        let start = Instant::now();
        let activity = ScriptedActivity::connected("A")
            .then(poll(false, Some("A")))
            .then(poll(false, None));
        let mut monitor = monitor_with(
            activity,
            vec![Some(50)],
            RecordingSink::default(),
            start,
        );

        monitor.tick(start);
        let mut presence_checks = Vec::new();
        for secs in 1..=40 {
            let report = monitor.tick(start + Duration::from_secs(secs));
            if report.reason.is_some() {
                assert_eq!(report.reason, Some(ReadReason::PresenceCheck));
                presence_checks.push((secs, report.displayed));
            }
        }

        assert_eq!(
            presence_checks,
            vec![
                (11, DisplayedValue::Present(50)),
                (22, DisplayedValue::Present(50)),
                (33, DisplayedValue::Absent),
            ]
        );
        assert_eq!(
            monitor.sink().writes,
            vec![DisplayedValue::Present(50), DisplayedValue::Absent]
        );
    }

    #[test]
    fn test_isolated_failure_does_not_flicker() {
        let start = Instant::now();
        let activity = ScriptedActivity::connected("A")
            .then(poll(false, Some("B")))
            .then(poll(false, Some("C")));
        let mut monitor = monitor_with(
            activity,
            vec![Some(40), None, Some(42)],
            RecordingSink::default(),
            start,
        );

        assert_eq!(monitor.tick(start).displayed, DisplayedValue::Present(40));
        let failed = monitor.tick(start + Duration::from_secs(1));
        assert_eq!(failed.reading, None);
        assert_eq!(failed.displayed, DisplayedValue::Present(40));
        assert_eq!(failed.publish, PublishOutcome::Unchanged);
        assert_eq!(
            monitor.tick(start + Duration::from_secs(2)).displayed,
            DisplayedValue::Present(41)
        );
    }

    #[test]
    fn test_seeded_value_published_before_first_probe() {
        let start = Instant::now();
        let sink = RecordingSink {
            seed: Some(55),
            ..Default::default()
        };
        let mut monitor = monitor_with(ScriptedActivity::connected("A"), vec![], sink, start);

        assert_eq!(monitor.displayed(), DisplayedValue::Present(55));
        assert_eq!(monitor.start(), PublishOutcome::Written);
        assert_eq!(monitor.sink().writes, vec![DisplayedValue::Present(55)]);
    }

    #[test]
    fn test_seed_from_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("battery.json");
        let text_path = dir.path().join("battery");
        std::fs::write(&json_path, r#"{"percentage": 55, "is_present": true}"#).unwrap();

        let start = Instant::now();
        let mut monitor = BatteryMonitor::new(
            ScriptedActivity::connected("A"),
            ScriptedProbe::new(vec![]),
            FileStatusSink::new(&text_path, &json_path),
            Arc::new(MonitorMetrics::new()),
            start,
        );

        assert_eq!(monitor.displayed(), DisplayedValue::Present(55));
        monitor.start();
        assert_eq!(std::fs::read_to_string(&text_path).unwrap(), "55%");

        // A failed cold-start probe keeps the seeded value on display
        let report = monitor.tick(start);
        assert_eq!(report.reason, Some(ReadReason::ColdStart));
        assert_eq!(report.displayed, DisplayedValue::Present(55));
        assert_eq!(monitor.sink().writes(), 1);
    }

    #[test]
    fn test_metrics_track_failures_by_kind() {
        let start = Instant::now();
        let metrics = Arc::new(MonitorMetrics::new());
        let mut monitor = BatteryMonitor::new(
            ScriptedActivity::connected("A"),
            ScriptedProbe::new(vec![None]),
            RecordingSink::default(),
            Arc::clone(&metrics),
            start,
        );

        monitor.tick(start);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.ticks, 1);
        assert_eq!(snapshot.probes_attempted, 1);
        assert_eq!(snapshot.probe_failures.get("timeout"), Some(&1));
        assert_eq!(snapshot.sink_writes, 1);
    }
}
