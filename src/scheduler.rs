//! Adaptive read scheduler.
//!
//! Battery probes are expensive and unreliable while the peripheral is busy
//! or power-suspended. Once per tick the scheduler looks at how long the
//! device has been idle and how long ago the last probe was attempted, and
//! decides whether this tick should probe.

use std::time::{Duration, Instant};

use crate::activity::{ActivityPoll, DeviceIdentity};

/// Lower bound (exclusive) of the light-sleep window.
pub const LIGHT_SLEEP_MIN_IDLE: Duration = Duration::from_secs(30);
/// Idle time at which the device is assumed to be in deep sleep.
pub const DEEP_SLEEP_IDLE: Duration = Duration::from_secs(150);
/// Idle time below which the device counts as actively used.
pub const ACTIVE_MAX_IDLE: Duration = Duration::from_secs(1);
/// Minimum spacing of opportunistic light-sleep reads.
pub const MIN_READ_INTERVAL: Duration = Duration::from_secs(300);
/// Maximum age of a reading while the device is never idle.
pub const FORCE_READ_INTERVAL: Duration = Duration::from_secs(900);
/// Spacing of presence checks while the device cannot be located.
pub const PRESENCE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Why a tick decided to probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadReason {
    /// No probe has been attempted since startup
    ColdStart,
    /// The device identity changed (replug or first sighting)
    NewConnection,
    /// Device not located; checking whether it is really gone
    PresenceCheck,
    /// Briefly idle, the firmware answers reliably here
    LightSleep,
    /// Never idle long enough, read anyway
    ForcedWhileActive,
}

impl ReadReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadReason::ColdStart => "cold_start",
            ReadReason::NewConnection => "new_connection",
            ReadReason::PresenceCheck => "presence_check",
            ReadReason::LightSleep => "light_sleep",
            ReadReason::ForcedWhileActive => "forced_while_active",
        }
    }
}

/// Inputs to a single scheduling decision.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleInput {
    pub now: Instant,
    pub last_activity: Instant,
    /// `None` when no probe has been attempted yet
    pub last_read: Option<Instant>,
    pub identity_changed: bool,
    pub device_located: bool,
}

impl ScheduleInput {
    fn idle(&self) -> Duration {
        self.now.saturating_duration_since(self.last_activity)
    }
}

/// Decide whether to probe this tick. Rules are checked in priority order.
pub fn decide(input: &ScheduleInput) -> Option<ReadReason> {
    let since_read = match input.last_read {
        None => return Some(ReadReason::ColdStart),
        Some(last) => input.now.saturating_duration_since(last),
    };

    if input.identity_changed {
        return Some(ReadReason::NewConnection);
    }

    if !input.device_located {
        return (since_read > PRESENCE_CHECK_INTERVAL).then_some(ReadReason::PresenceCheck);
    }

    let idle = input.idle();

    if idle >= DEEP_SLEEP_IDLE {
        return None;
    }

    if idle > LIGHT_SLEEP_MIN_IDLE && since_read > MIN_READ_INTERVAL {
        return Some(ReadReason::LightSleep);
    }

    if idle < ACTIVE_MAX_IDLE && since_read >= FORCE_READ_INTERVAL {
        return Some(ReadReason::ForcedWhileActive);
    }

    None
}

/// Activity, read timing and connection state carried between ticks.
#[derive(Debug)]
pub struct ReadScheduler {
    /// Last observed input event (optimistically "now" at start)
    last_activity: Instant,
    /// Last attempted probe, successful or not
    last_read: Option<Instant>,
    /// Last identity the device was seen with; kept across unreachable ticks
    last_identity: Option<DeviceIdentity>,
    ticks: u64,
}

impl ReadScheduler {
    pub fn new(now: Instant) -> Self {
        Self {
            last_activity: now,
            last_read: None,
            last_identity: None,
            ticks: 0,
        }
    }

    /// Fold one activity poll into the state and decide whether to probe.
    pub fn on_tick(&mut self, now: Instant, poll: &ActivityPoll) -> Option<ReadReason> {
        self.ticks += 1;

        // An unreachable device is treated as freshly active so a ghost
        // node does not trip the idle-based rules.
        if poll.has_activity || !poll.reachable {
            self.last_activity = now;
        }

        // A gap in reachability alone is not a new connection: the node
        // briefly vanishes whenever the interface driver is rebound.
        let identity_changed = match &poll.identity {
            Some(identity) if self.last_identity.as_ref() != Some(identity) => {
                self.last_identity = Some(identity.clone());
                true
            }
            _ => false,
        };

        decide(&ScheduleInput {
            now,
            last_activity: self.last_activity,
            last_read: self.last_read,
            identity_changed,
            device_located: poll.reachable,
        })
    }

    /// Record a probe attempt. Never moves backwards.
    pub fn record_attempt(&mut self, at: Instant) {
        match self.last_read {
            Some(previous) if previous >= at => {}
            _ => self.last_read = Some(at),
        }
    }

    pub fn last_read(&self) -> Option<Instant> {
        self.last_read
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}
