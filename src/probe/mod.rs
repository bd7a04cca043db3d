//! Battery probe for the wireless receiver.
//!
//! A probe writes a fixed vendor command to the receiver's interrupt OUT
//! endpoint and then polls the IN endpoint until a battery report shows up
//! or the retry budget runs out.

mod usbfs;

use crate::discovery::{self, SysfsPaths, UsbId};
use crate::error::ProbeError;
use std::time::Duration;
use tracing::{debug, trace};

use usbfs::UsbDevice;

/// Vendor command requesting a battery report (32-byte interrupt report).
pub const BATTERY_COMMAND: [u8; 32] = {
    let mut command = [0u8; 32];
    command[0] = 0x05;
    command[1] = 0x24;
    command[2] = 0xfa;
    command[3] = 0x48;
    command
};

/// First byte of every battery report.
pub const REPORT_MARKER: u8 = 0x05;

/// Offset of the raw battery byte inside a report.
const RAW_BATTERY_OFFSET: usize = 4;

/// Interrupt OUT endpoint the command is written to.
pub const ENDPOINT_OUT: u8 = 0x05;

/// Interrupt IN endpoint reports are read from.
pub const ENDPOINT_IN: u8 = 0x84;

/// Interface carrying both endpoints.
pub const INTERFACE: u32 = 0;

/// Maximum report size read from the IN endpoint.
pub const REPORT_LEN: usize = 64;

/// Timeout for writing the command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/// Anything that can produce one battery reading.
pub trait BatteryProbe {
    fn probe(&mut self) -> Result<u8, ProbeError>;
}

/// Raw endpoint access used by a probe exchange.
pub trait ProbeTransport {
    fn send_command(&mut self, command: &[u8], timeout: Duration) -> Result<(), ProbeError>;

    /// Read one report into `buf`, returning the number of bytes received.
    fn read_report(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ProbeError>;
}

/// Bounded retry schedule for waiting on a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            attempt_timeout: Duration::from_millis(100),
            delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Upper bound on time spent in [`RetryPolicy::run`].
    pub fn worst_case(&self) -> Duration {
        self.attempt_timeout * self.max_attempts
            + self.delay * self.max_attempts.saturating_sub(1)
    }

    /// Call `attempt` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is exhausted.
    ///
    /// `attempt` receives the 1-based attempt number and the per-attempt
    /// timeout.
    pub fn run<T, F>(&self, mut attempt: F) -> Result<T, ProbeError>
    where
        F: FnMut(u32, Duration) -> Result<T, ProbeError>,
    {
        for n in 1..=self.max_attempts {
            match attempt(n, self.attempt_timeout) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    trace!("Attempt {}/{} failed: {}", n, self.max_attempts, e);
                }
                Err(e) => return Err(e),
            }

            if n < self.max_attempts && !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
        }

        Err(ProbeError::NoResponse {
            attempts: self.max_attempts,
        })
    }
}

/// Convert the raw battery byte to a percentage.
///
/// The firmware encodes `percentage * 2 + 50`. Bytes that do not decode to
/// 0-100 are rejected instead of clamped.
pub fn raw_to_percentage(raw: u8) -> Result<u8, ProbeError> {
    raw.checked_sub(50)
        .map(|offset| offset / 2)
        .filter(|pct| *pct <= 100)
        .ok_or(ProbeError::OutOfRange { raw })
}

/// Validate a report frame and extract the battery percentage.
pub fn decode_report(report: &[u8]) -> Result<u8, ProbeError> {
    if report.len() <= RAW_BATTERY_OFFSET {
        return Err(ProbeError::MalformedFrame(format!(
            "{} byte report is too short",
            report.len()
        )));
    }
    if report[0] != REPORT_MARKER {
        return Err(ProbeError::MalformedFrame(format!(
            "unexpected marker {:#04x}",
            report[0]
        )));
    }
    raw_to_percentage(report[RAW_BATTERY_OFFSET])
}

/// Run one command/response exchange over `transport`.
pub fn exchange<T: ProbeTransport>(
    transport: &mut T,
    policy: &RetryPolicy,
) -> Result<u8, ProbeError> {
    transport.send_command(&BATTERY_COMMAND, COMMAND_TIMEOUT)?;

    let mut buf = [0u8; REPORT_LEN];
    policy.run(|_, timeout| {
        let len = transport.read_report(&mut buf, timeout)?;
        decode_report(&buf[..len])
    })
}

/// Battery probe talking to the receiver through usbfs.
pub struct UsbBatteryProbe {
    paths: SysfsPaths,
    id: UsbId,
    policy: RetryPolicy,
}

impl UsbBatteryProbe {
    pub fn new(paths: SysfsPaths, id: UsbId, policy: RetryPolicy) -> Self {
        Self { paths, id, policy }
    }
}

impl BatteryProbe for UsbBatteryProbe {
    fn probe(&mut self) -> Result<u8, ProbeError> {
        // Rescan each time: usbfs addresses change on every replug.
        let node = discovery::scan_usb_device(&self.paths, self.id)?;
        debug!("Probing {:?}", node.dev_path);

        let device = UsbDevice::open(&node.dev_path)?;
        let mut claim = device.claim_interface(INTERFACE)?;
        exchange(&mut claim, &self.policy)
    }
}
