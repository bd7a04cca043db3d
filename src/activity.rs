//! Activity monitor backed by the device's evdev node.
//!
//! Any input event from the receiver means the peripheral is awake. The
//! monitor drains pending events without blocking and reports whether the
//! device is reachable and which connection session it belongs to.

use crate::discovery::{DiscoveryCache, SysfsPaths, UsbId};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::path::Path;
use tracing::{debug, info, warn};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

/// Upper bound on reads per tick so an event flood cannot stall the loop.
const MAX_READS_PER_POLL: usize = 64;

/// Read buffer size; a multiple of the 24-byte `input_event` on 64-bit.
const EVENT_BUFFER_SIZE: usize = 24 * 64;

/// Signature of one physical connection session.
///
/// Built from the evdev node name and its resolved sysfs path, so it changes
/// when the receiver is unplugged and plugged back in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(signature: impl Into<String>) -> Self {
        Self(signature.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of one activity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityPoll {
    /// At least one event arrived since the previous poll
    pub has_activity: bool,
    /// The event stream is open and readable
    pub reachable: bool,
    pub identity: Option<DeviceIdentity>,
}

impl ActivityPoll {
    pub fn unreachable() -> Self {
        Self {
            has_activity: false,
            reachable: false,
            identity: None,
        }
    }
}

/// Source of device activity, polled once per tick.
pub trait ActivitySource {
    /// Never blocks and never fails; problems surface as `reachable = false`.
    fn poll_activity(&mut self) -> ActivityPoll;
}

/// What a non-blocking drain of the event stream saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The stream is alive; `bytes` of events were consumed
    Drained { bytes: usize },
    /// End of stream, the device went away
    Closed,
}

/// Consume everything currently pending on a non-blocking reader.
pub fn drain_events<R: Read>(reader: &mut R) -> io::Result<DrainOutcome> {
    let mut buf = [0u8; EVENT_BUFFER_SIZE];
    let mut total = 0usize;

    for _ in 0..MAX_READS_PER_POLL {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(DrainOutcome::Closed),
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(DrainOutcome::Drained { bytes: total })
}

/// Open event stream and the session it belongs to.
struct EventStream {
    file: File,
    identity: DeviceIdentity,
}

/// Watches the receiver's evdev node for input events.
pub struct EvdevActivityMonitor {
    cache: DiscoveryCache,
    /// Opened lazily; dropped on any error
    stream: Option<EventStream>,
}

impl EvdevActivityMonitor {
    pub fn new(paths: SysfsPaths, id: UsbId) -> Self {
        Self {
            cache: DiscoveryCache::new(paths, id),
            stream: None,
        }
    }

    fn open_stream(&mut self) -> io::Result<EventStream> {
        let node = self
            .cache
            .lookup_or_scan()
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?;
        let file = open_nonblocking(&node.dev_path)?;
        info!("Opened event stream {:?}", node.dev_path);
        Ok(EventStream {
            file,
            identity: node.identity(),
        })
    }

    /// Drop the handle and forget the cached node so the next poll rescans.
    fn reset(&mut self) {
        self.stream = None;
        self.cache.invalidate();
    }
}

impl ActivitySource for EvdevActivityMonitor {
    fn poll_activity(&mut self) -> ActivityPoll {
        if self.stream.is_none() {
            match self.open_stream() {
                Ok(stream) => self.stream = Some(stream),
                Err(e) => {
                    debug!("Event stream unavailable: {}", e);
                    self.reset();
                    return ActivityPoll::unreachable();
                }
            }
        }

        let Some(stream) = self.stream.as_mut() else {
            return ActivityPoll::unreachable();
        };

        match drain_events(&mut stream.file) {
            Ok(DrainOutcome::Drained { bytes }) => ActivityPoll {
                has_activity: bytes > 0,
                reachable: true,
                identity: Some(stream.identity.clone()),
            },
            Ok(DrainOutcome::Closed) => {
                info!("Event stream for {} closed", stream.identity);
                self.reset();
                ActivityPoll::unreachable()
            }
            Err(e) => {
                warn!("Event stream for {} failed: {}", stream.identity, e);
                self.reset();
                ActivityPoll::unreachable()
            }
        }
    }
}

#[cfg(unix)]
fn open_nonblocking(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

#[cfg(not(unix))]
fn open_nonblocking(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).open(path)
}
