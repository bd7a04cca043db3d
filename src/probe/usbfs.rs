//! usbfs transport for the battery probe.
//!
//! Talks to `/dev/bus/usb/BBB/DDD` through the usbdevfs ioctls. The
//! interface claim is a guard: dropping it releases the interface and
//! reattaches the kernel driver if one was detached to claim it.

use super::{ProbeTransport, ENDPOINT_IN, ENDPOINT_OUT};
use crate::error::ProbeError;
use std::path::Path;
use std::time::Duration;

#[cfg(target_os = "linux")]
mod sys {
    //! usbdevfs ioctl numbers and argument layouts from `linux/usbdevice_fs.h`.

    use libc::{c_char, c_int, c_uint, c_void};
    use std::mem::size_of;

    const IOC_NONE: u32 = 0;
    const IOC_WRITE: u32 = 1;
    const IOC_READ: u32 = 2;

    const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
        (dir << 30) | ((size as u32) << 16) | ((b'U' as u32) << 8) | nr
    }

    #[repr(C)]
    pub struct BulkTransfer {
        pub ep: c_uint,
        pub len: c_uint,
        pub timeout: c_uint,
        pub data: *mut c_void,
    }

    #[repr(C)]
    pub struct GetDriver {
        pub interface: c_uint,
        pub driver: [c_char; 256],
    }

    #[repr(C)]
    pub struct IoctlRequest {
        pub ifno: c_int,
        pub ioctl_code: c_int,
        pub data: *mut c_void,
    }

    pub const USBDEVFS_BULK: u32 = ioc(IOC_READ | IOC_WRITE, 2, size_of::<BulkTransfer>());
    pub const USBDEVFS_GETDRIVER: u32 = ioc(IOC_WRITE, 8, size_of::<GetDriver>());
    pub const USBDEVFS_CLAIMINTERFACE: u32 = ioc(IOC_READ, 15, size_of::<c_uint>());
    pub const USBDEVFS_RELEASEINTERFACE: u32 = ioc(IOC_READ, 16, size_of::<c_uint>());
    pub const USBDEVFS_IOCTL: u32 = ioc(IOC_READ | IOC_WRITE, 18, size_of::<IoctlRequest>());
    pub const USBDEVFS_DISCONNECT: u32 = ioc(IOC_NONE, 22, 0);
    pub const USBDEVFS_CONNECT: u32 = ioc(IOC_NONE, 23, 0);
}

/// Driver name usbfs reports when another process already claimed the interface.
#[cfg(target_os = "linux")]
const USBFS_DRIVER: &str = "usbfs";

#[cfg(target_os = "linux")]
fn errno_to_probe_error(operation: &'static str, err: std::io::Error) -> ProbeError {
    match err.raw_os_error() {
        Some(libc::ETIMEDOUT) => ProbeError::Timeout,
        Some(libc::ENODEV) | Some(libc::ESHUTDOWN) => ProbeError::DeviceGone { operation },
        _ => ProbeError::Transport {
            operation,
            source: err,
        },
    }
}

/// An open usbfs device node. Closing the node disposes every resource the
/// kernel tracked for this handle.
#[cfg(target_os = "linux")]
pub struct UsbDevice {
    file: std::fs::File,
}

#[cfg(target_os = "linux")]
impl UsbDevice {
    pub fn open(path: &Path) -> Result<Self, ProbeError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| ProbeError::OpenFailed {
                path: path.display().to_string(),
                source: e,
            })?;
        Ok(Self { file })
    }

    /// Issue an ioctl on the device node.
    ///
    /// # Safety
    /// `arg` must point to the argument type `request` expects, or be null
    /// for requests without an argument.
    unsafe fn ioctl<T>(
        &self,
        request: u32,
        arg: *mut T,
        operation: &'static str,
    ) -> Result<libc::c_int, ProbeError> {
        use std::os::unix::io::AsRawFd;

        let ret = libc::ioctl(self.file.as_raw_fd(), request as _, arg);
        if ret < 0 {
            Err(errno_to_probe_error(
                operation,
                std::io::Error::last_os_error(),
            ))
        } else {
            Ok(ret)
        }
    }

    /// Name of the kernel driver bound to `interface`, if any.
    fn bound_driver(&self, interface: u32) -> Result<Option<String>, ProbeError> {
        let mut request = sys::GetDriver {
            interface,
            driver: [0; 256],
        };
        let result = unsafe {
            self.ioctl(
                sys::USBDEVFS_GETDRIVER,
                std::ptr::addr_of_mut!(request),
                "query driver",
            )
        };
        match result {
            Ok(_) => {
                let bytes: Vec<u8> = request
                    .driver
                    .iter()
                    .take_while(|&&c| c != 0)
                    .map(|&c| c as u8)
                    .collect();
                Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
            }
            Err(ProbeError::Transport { source, .. })
                if source.raw_os_error() == Some(libc::ENODATA) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn driver_ioctl(
        &self,
        interface: u32,
        code: u32,
        operation: &'static str,
    ) -> Result<(), ProbeError> {
        let mut request = sys::IoctlRequest {
            ifno: interface as libc::c_int,
            ioctl_code: code as libc::c_int,
            data: std::ptr::null_mut(),
        };
        unsafe { self.ioctl(sys::USBDEVFS_IOCTL, std::ptr::addr_of_mut!(request), operation)? };
        Ok(())
    }

    /// Detach any kernel driver and claim `interface`.
    pub fn claim_interface(&self, interface: u32) -> Result<InterfaceClaim<'_>, ProbeError> {
        let mut reattach_driver = false;
        if let Some(driver) = self.bound_driver(interface)? {
            if driver != USBFS_DRIVER {
                match self.driver_ioctl(interface, sys::USBDEVFS_DISCONNECT, "detach driver") {
                    Ok(()) => {
                        tracing::debug!(
                            "Detached kernel driver {} from interface {}",
                            driver,
                            interface
                        );
                        reattach_driver = true;
                    }
                    Err(e) => tracing::debug!("Could not detach {}: {}", driver, e),
                }
            }
        }

        // Built before claiming so a failed claim still reattaches the driver.
        let mut claim = InterfaceClaim {
            device: self,
            interface,
            claimed: false,
            reattach_driver,
        };

        let mut number: libc::c_uint = interface;
        unsafe {
            self.ioctl(
                sys::USBDEVFS_CLAIMINTERFACE,
                std::ptr::addr_of_mut!(number),
                "claim interface",
            )
        }?;
        claim.claimed = true;
        Ok(claim)
    }

    fn transfer(
        &self,
        endpoint: u8,
        buf: *mut libc::c_void,
        len: usize,
        timeout: Duration,
        operation: &'static str,
    ) -> Result<usize, ProbeError> {
        let mut request = sys::BulkTransfer {
            ep: endpoint as libc::c_uint,
            len: len as libc::c_uint,
            timeout: timeout.as_millis().min(u32::MAX as u128) as libc::c_uint,
            data: buf,
        };
        let transferred =
            unsafe { self.ioctl(sys::USBDEVFS_BULK, std::ptr::addr_of_mut!(request), operation)? };
        Ok(transferred as usize)
    }
}

/// A claimed interface. Released (and the original driver reattached) on drop.
#[cfg(target_os = "linux")]
pub struct InterfaceClaim<'a> {
    device: &'a UsbDevice,
    interface: u32,
    claimed: bool,
    reattach_driver: bool,
}

#[cfg(target_os = "linux")]
impl ProbeTransport for InterfaceClaim<'_> {
    fn send_command(&mut self, command: &[u8], timeout: Duration) -> Result<(), ProbeError> {
        // usbfs never writes through the pointer for OUT endpoints.
        let written = self.device.transfer(
            ENDPOINT_OUT,
            command.as_ptr() as *mut libc::c_void,
            command.len(),
            timeout,
            "write",
        )?;
        if written != command.len() {
            return Err(ProbeError::MalformedFrame(format!(
                "short write: {} of {} bytes",
                written,
                command.len()
            )));
        }
        Ok(())
    }

    fn read_report(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ProbeError> {
        self.device.transfer(
            ENDPOINT_IN,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            timeout,
            "read",
        )
    }
}

#[cfg(target_os = "linux")]
impl Drop for InterfaceClaim<'_> {
    fn drop(&mut self) {
        if self.claimed {
            let mut number: libc::c_uint = self.interface;
            if let Err(e) = unsafe {
                self.device.ioctl(
                    sys::USBDEVFS_RELEASEINTERFACE,
                    std::ptr::addr_of_mut!(number),
                    "release interface",
                )
            } {
                tracing::debug!("Releasing interface {} failed: {}", self.interface, e);
            }
        }

        if self.reattach_driver {
            if let Err(e) =
                self.device
                    .driver_ioctl(self.interface, sys::USBDEVFS_CONNECT, "reattach driver")
            {
                tracing::debug!("Reattaching kernel driver failed: {}", e);
            }
        }
    }
}

/// Stub for non-Linux platforms; usbfs only exists on Linux.
#[cfg(not(target_os = "linux"))]
pub struct UsbDevice;

#[cfg(not(target_os = "linux"))]
impl UsbDevice {
    pub fn open(_path: &Path) -> Result<Self, ProbeError> {
        Err(ProbeError::Unsupported)
    }

    pub fn claim_interface(&self, _interface: u32) -> Result<InterfaceClaim<'_>, ProbeError> {
        Err(ProbeError::Unsupported)
    }
}

/// Stub for non-Linux platforms.
#[cfg(not(target_os = "linux"))]
pub struct InterfaceClaim<'a> {
    _device: &'a UsbDevice,
}

#[cfg(not(target_os = "linux"))]
impl ProbeTransport for InterfaceClaim<'_> {
    fn send_command(&mut self, _command: &[u8], _timeout: Duration) -> Result<(), ProbeError> {
        Err(ProbeError::Unsupported)
    }

    fn read_report(&mut self, _buf: &mut [u8], _timeout: Duration) -> Result<usize, ProbeError> {
        Err(ProbeError::Unsupported)
    }
}
