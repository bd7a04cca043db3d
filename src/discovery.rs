//! Sysfs discovery for the battery receiver.
//!
//! Two views of the same physical device are needed: the evdev node that
//! carries its input events, and the usbfs node used for battery probes.
//! Both are found by matching the vendor/product pair exposed in sysfs.

use crate::activity::DeviceIdentity;
use crate::error::DiscoveryError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// USB vendor/product identifier pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

impl std::fmt::Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

/// The wireless receiver this daemon talks to.
pub const FUHLEN_RECEIVER: UsbId = UsbId {
    vendor: 0x248a,
    product: 0xfa02,
};

/// Root directories scanned during discovery.
///
/// Overridable so tests can point discovery at a fake tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysfsPaths {
    /// `/sys/class/input`
    pub input_class: PathBuf,
    /// `/dev/input`
    pub dev_input: PathBuf,
    /// `/sys/bus/usb/devices`
    pub usb_devices: PathBuf,
    /// `/dev/bus/usb`
    pub dev_bus_usb: PathBuf,
}

impl Default for SysfsPaths {
    fn default() -> Self {
        Self {
            input_class: PathBuf::from("/sys/class/input"),
            dev_input: PathBuf::from("/dev/input"),
            usb_devices: PathBuf::from("/sys/bus/usb/devices"),
            dev_bus_usb: PathBuf::from("/dev/bus/usb"),
        }
    }
}

/// An evdev node belonging to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputNode {
    /// Node name, e.g. `event7`
    pub name: String,
    /// Character device to read events from
    pub dev_path: PathBuf,
    /// Resolved sysfs path; encodes the physical bus position
    pub sysfs_path: PathBuf,
    /// Connection session, resolved when the node was found
    pub identity: DeviceIdentity,
}

impl InputNode {
    pub fn identity(&self) -> DeviceIdentity {
        self.identity.clone()
    }

    /// Whether both the device node and its sysfs entry still exist.
    pub fn exists(&self) -> bool {
        self.dev_path.exists() && self.sysfs_path.exists()
    }
}

/// A usbfs node belonging to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbNode {
    pub bus: u16,
    pub address: u16,
    pub dev_path: PathBuf,
}

/// Read a sysfs attribute holding a hexadecimal id such as `248a`.
fn read_hex_attr(path: &Path) -> Result<u16, DiscoveryError> {
    let contents = fs::read_to_string(path).map_err(|e| DiscoveryError::ScanFailed {
        path: path.display().to_string(),
        source: e,
    })?;
    u16::from_str_radix(contents.trim(), 16).map_err(|_| DiscoveryError::MalformedAttribute {
        path: path.display().to_string(),
        value: contents.trim().to_string(),
    })
}

/// Read a sysfs attribute holding a decimal number such as `003`.
fn read_dec_attr(path: &Path) -> Result<u16, DiscoveryError> {
    let contents = fs::read_to_string(path).map_err(|e| DiscoveryError::ScanFailed {
        path: path.display().to_string(),
        source: e,
    })?;
    contents
        .trim()
        .parse::<u16>()
        .map_err(|_| DiscoveryError::MalformedAttribute {
            path: path.display().to_string(),
            value: contents.trim().to_string(),
        })
}

/// The USB device directory above an input node, e.g. `/sys/devices/.../usb1/1-2`.
///
/// Identified by its `busnum` and `devnum` attributes; interface and HID
/// directories in between carry neither.
fn usb_device_dir(sysfs_path: &Path) -> Option<&Path> {
    sysfs_path
        .ancestors()
        .skip(1)
        .find(|dir| dir.join("busnum").is_file() && dir.join("devnum").is_file())
}

/// Identity of the connection an input node belongs to.
///
/// Port path plus device number: the kernel assigns a fresh `devnum` on every
/// enumeration, while rebinding a driver to the interface only recreates the
/// HID and input devices below it. Falls back to the node's own sysfs path
/// when no USB parent is visible.
fn connection_identity(name: &str, sysfs_path: &Path) -> DeviceIdentity {
    let usb = usb_device_dir(sysfs_path).and_then(|dir| {
        let port = dir.file_name()?.to_string_lossy().into_owned();
        let devnum = read_dec_attr(&dir.join("devnum")).ok()?;
        Some((port, devnum))
    });

    match usb {
        Some((port, devnum)) => DeviceIdentity::new(format!("usb:{}@dev{}", port, devnum)),
        None => DeviceIdentity::new(format!("{}@{}", name, sysfs_path.display())),
    }
}

/// Directory entries sorted by name so "first match" is stable.
fn sorted_entries(dir: &Path) -> Result<Vec<(String, PathBuf)>, DiscoveryError> {
    let entries = fs::read_dir(dir).map_err(|e| DiscoveryError::ScanFailed {
        path: dir.display().to_string(),
        source: e,
    })?;

    let mut named: Vec<(String, PathBuf)> = entries
        .flatten()
        .map(|entry| (entry.file_name().to_string_lossy().to_string(), entry.path()))
        .collect();
    named.sort();
    Ok(named)
}

/// Find the first evdev node whose parent device matches `id`.
pub fn scan_input_nodes(paths: &SysfsPaths, id: UsbId) -> Result<InputNode, DiscoveryError> {
    for (name, entry) in sorted_entries(&paths.input_class)? {
        if !name.starts_with("event") {
            continue;
        }

        let id_dir = entry.join("device").join("id");
        let (Ok(vendor), Ok(product)) = (
            read_hex_attr(&id_dir.join("vendor")),
            read_hex_attr(&id_dir.join("product")),
        ) else {
            continue;
        };

        if vendor == id.vendor && product == id.product {
            let sysfs_path = fs::canonicalize(&entry).unwrap_or(entry);
            let node = InputNode {
                dev_path: paths.dev_input.join(&name),
                identity: connection_identity(&name, &sysfs_path),
                name,
                sysfs_path,
            };
            debug!("Matched input node {:?}", node.dev_path);
            return Ok(node);
        }
    }

    Err(DiscoveryError::NotFound {
        vendor: id.vendor,
        product: id.product,
        root: paths.input_class.display().to_string(),
    })
}

/// Find the usbfs node of the first USB device matching `id`.
pub fn scan_usb_device(paths: &SysfsPaths, id: UsbId) -> Result<UsbNode, DiscoveryError> {
    for (_, entry) in sorted_entries(&paths.usb_devices)? {
        // Interface directories (e.g. `1-2:1.0`) carry no idVendor.
        let (Ok(vendor), Ok(product)) = (
            read_hex_attr(&entry.join("idVendor")),
            read_hex_attr(&entry.join("idProduct")),
        ) else {
            continue;
        };

        if vendor != id.vendor || product != id.product {
            continue;
        }

        let bus = read_dec_attr(&entry.join("busnum"))?;
        let address = read_dec_attr(&entry.join("devnum"))?;
        return Ok(UsbNode {
            bus,
            address,
            dev_path: paths
                .dev_bus_usb
                .join(format!("{:03}", bus))
                .join(format!("{:03}", address)),
        });
    }

    Err(DiscoveryError::NotFound {
        vendor: id.vendor,
        product: id.product,
        root: paths.usb_devices.display().to_string(),
    })
}

/// Memoized input-node lookup.
///
/// Rescanning sysfs every tick is wasteful, so the first match is kept until
/// it disappears or the owner invalidates it after an I/O error.
#[derive(Debug)]
pub struct DiscoveryCache {
    paths: SysfsPaths,
    id: UsbId,
    cached: Option<InputNode>,
}

impl DiscoveryCache {
    pub fn new(paths: SysfsPaths, id: UsbId) -> Self {
        Self {
            paths,
            id,
            cached: None,
        }
    }

    /// Return the cached node if it still exists, otherwise rescan.
    pub fn lookup_or_scan(&mut self) -> Result<&InputNode, DiscoveryError> {
        let node = match self.cached.take() {
            Some(node) if node.exists() => node,
            stale => {
                if let Some(stale) = stale {
                    debug!("Cached input node {:?} vanished, rescanning", stale.dev_path);
                }
                let node = scan_input_nodes(&self.paths, self.id)?;
                info!("Found device input node {:?}", node.dev_path);
                node
            }
        };

        Ok(&*self.cached.insert(node))
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    pub fn cached(&self) -> Option<&InputNode> {
        self.cached.as_ref()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    /// Build a fake sysfs/dev layout under a temporary directory.
    pub(crate) fn fake_paths(root: &TempDir) -> SysfsPaths {
        let paths = SysfsPaths {
            input_class: root.path().join("sys/class/input"),
            dev_input: root.path().join("dev/input"),
            usb_devices: root.path().join("sys/bus/usb/devices"),
            dev_bus_usb: root.path().join("dev/bus/usb"),
        };
        for dir in [
            &paths.input_class,
            &paths.dev_input,
            &paths.usb_devices,
            &paths.dev_bus_usb,
        ] {
            fs::create_dir_all(dir).unwrap();
        }
        paths
    }

    pub(crate) fn add_input_node(paths: &SysfsPaths, name: &str, vendor: &str, product: &str) {
        let id_dir = paths.input_class.join(name).join("device").join("id");
        fs::create_dir_all(&id_dir).unwrap();
        fs::write(id_dir.join("vendor"), format!("{}\n", vendor)).unwrap();
        fs::write(id_dir.join("product"), format!("{}\n", product)).unwrap();
        fs::write(paths.dev_input.join(name), b"").unwrap();
    }

    fn add_usb_device(paths: &SysfsPaths, name: &str, vendor: &str, product: &str, bus: u16, dev: u16) {
        let dir = paths.usb_devices.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("idVendor"), format!("{}\n", vendor)).unwrap();
        fs::write(dir.join("idProduct"), format!("{}\n", product)).unwrap();
        fs::write(dir.join("busnum"), format!("{}\n", bus)).unwrap();
        fs::write(dir.join("devnum"), format!("{}\n", dev)).unwrap();
    }

    #[test]
    fn test_scan_input_nodes_matches_ids() {
        let root = tempdir().unwrap();
        let paths = fake_paths(&root);
        add_input_node(&paths, "event2", "046d", "c52b");
        add_input_node(&paths, "event5", "248a", "fa02");
        add_input_node(&paths, "event9", "248a", "fa02");
        fs::create_dir_all(paths.input_class.join("mouse0")).unwrap();

        let node = scan_input_nodes(&paths, FUHLEN_RECEIVER).unwrap();
        assert_eq!(node.name, "event5");
        assert_eq!(node.dev_path, paths.dev_input.join("event5"));
        assert!(node.identity().as_str().starts_with("event5@"));
    }

    #[test]
    fn test_usb_id_display() {
        assert_eq!(FUHLEN_RECEIVER.to_string(), "248a:fa02");
    }

    #[test]
    fn test_scan_input_nodes_not_found() {
        let root = tempdir().unwrap();
        let paths = fake_paths(&root);
        add_input_node(&paths, "event2", "046d", "c52b");

        let err = scan_input_nodes(&paths, FUHLEN_RECEIVER).unwrap_err();
        assert!(matches!(err, DiscoveryError::NotFound { .. }));
    }

    #[test]
    fn test_scan_usb_device_skips_interfaces() {
        let root = tempdir().unwrap();
        let paths = fake_paths(&root);
        fs::create_dir_all(paths.usb_devices.join("1-2:1.0")).unwrap();
        add_usb_device(&paths, "1-1", "046d", "c52b", 1, 2);
        add_usb_device(&paths, "1-2", "248a", "fa02", 1, 7);

        let node = scan_usb_device(&paths, FUHLEN_RECEIVER).unwrap();
        assert_eq!(node.bus, 1);
        assert_eq!(node.address, 7);
        assert_eq!(node.dev_path, paths.dev_bus_usb.join("001").join("007"));
    }

    #[test]
    fn test_malformed_busnum_is_reported() {
        let root = tempdir().unwrap();
        let paths = fake_paths(&root);
        add_usb_device(&paths, "1-2", "248a", "fa02", 1, 7);
        fs::write(paths.usb_devices.join("1-2").join("busnum"), "x\n").unwrap();

        let err = scan_usb_device(&paths, FUHLEN_RECEIVER).unwrap_err();
        assert!(matches!(err, DiscoveryError::MalformedAttribute { .. }));
    }

    #[test]
    fn test_cache_keeps_match_until_removed() {
        let root = tempdir().unwrap();
        let paths = fake_paths(&root);
        add_input_node(&paths, "event5", "248a", "fa02");

        let mut cache = DiscoveryCache::new(paths.clone(), FUHLEN_RECEIVER);
        assert_eq!(cache.lookup_or_scan().unwrap().name, "event5");

        // A lower-numbered match appearing later does not displace the cache
        add_input_node(&paths, "event1", "248a", "fa02");
        assert_eq!(cache.lookup_or_scan().unwrap().name, "event5");

        // Once the cached node disappears the cache rescans
        fs::remove_file(paths.dev_input.join("event5")).unwrap();
        assert_eq!(cache.lookup_or_scan().unwrap().name, "event1");
    }

    /// Lay out a USB device directory the way the kernel does.
    #[cfg(unix)]
    fn add_usb_parent(root: &TempDir, port: &str, devnum: u16) -> PathBuf {
        let usb_dir = root.path().join("sys/devices/pci0000:00/usb1").join(port);
        fs::create_dir_all(&usb_dir).unwrap();
        fs::write(usb_dir.join("busnum"), "1\n").unwrap();
        fs::write(usb_dir.join("devnum"), format!("{}\n", devnum)).unwrap();
        usb_dir
    }

    /// Bind an input node below `usb_dir` and link it from the input class,
    /// replacing any previous link of the same name.
    #[cfg(unix)]
    fn bind_input_node(paths: &SysfsPaths, usb_dir: &Path, hid: &str, input: &str, event: &str) {
        use std::os::unix::fs::symlink;

        let input_dir = usb_dir.join("1-2:1.0").join(hid).join("input").join(input);
        let event_dir = input_dir.join(event);
        fs::create_dir_all(input_dir.join("id")).unwrap();
        fs::create_dir_all(&event_dir).unwrap();
        fs::write(input_dir.join("id").join("vendor"), "248a\n").unwrap();
        fs::write(input_dir.join("id").join("product"), "fa02\n").unwrap();
        symlink("..", event_dir.join("device")).unwrap();

        let class_link = paths.input_class.join(event);
        let _ = fs::remove_file(&class_link);
        symlink(&event_dir, &class_link).unwrap();
        fs::write(paths.dev_input.join(event), b"").unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_comes_from_usb_parent() {
        let root = tempdir().unwrap();
        let paths = fake_paths(&root);
        let usb_dir = add_usb_parent(&root, "1-2", 7);
        bind_input_node(&paths, &usb_dir, "0003:248A:FA02.0001", "input12", "event5");

        let node = scan_input_nodes(&paths, FUHLEN_RECEIVER).unwrap();
        assert_eq!(node.identity().as_str(), "usb:1-2@dev7");
        assert!(node.sysfs_path.ends_with("input12/event5"));
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_survives_driver_rebind() {
        let root = tempdir().unwrap();
        let paths = fake_paths(&root);
        let usb_dir = add_usb_parent(&root, "1-2", 7);
        bind_input_node(&paths, &usb_dir, "0003:248A:FA02.0001", "input12", "event5");

        let mut cache = DiscoveryCache::new(paths.clone(), FUHLEN_RECEIVER);
        let before = cache.lookup_or_scan().unwrap().identity();

        // Rebinding the interface driver recreates the HID and input devices
        fs::remove_dir_all(usb_dir.join("1-2:1.0")).unwrap();
        bind_input_node(&paths, &usb_dir, "0003:248A:FA02.0002", "input13", "event5");

        let rebound = cache.lookup_or_scan().unwrap();
        assert!(rebound.sysfs_path.ends_with("input13/event5"));
        assert_eq!(rebound.identity(), before);
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_changes_on_replug() {
        let root = tempdir().unwrap();
        let paths = fake_paths(&root);
        let usb_dir = add_usb_parent(&root, "1-2", 7);
        bind_input_node(&paths, &usb_dir, "0003:248A:FA02.0001", "input12", "event5");
        let before = scan_input_nodes(&paths, FUHLEN_RECEIVER).unwrap().identity();

        // Re-enumeration hands out a new device number on the same port
        fs::remove_dir_all(usb_dir.join("1-2:1.0")).unwrap();
        fs::write(usb_dir.join("devnum"), "8\n").unwrap();
        bind_input_node(&paths, &usb_dir, "0003:248A:FA02.0003", "input14", "event5");

        let after = scan_input_nodes(&paths, FUHLEN_RECEIVER).unwrap().identity();
        assert_eq!(after.as_str(), "usb:1-2@dev8");
        assert_ne!(after, before);
    }

    #[test]
    fn test_cache_invalidate_forces_rescan() {
        let root = tempdir().unwrap();
        let paths = fake_paths(&root);
        add_input_node(&paths, "event5", "248a", "fa02");

        let mut cache = DiscoveryCache::new(paths.clone(), FUHLEN_RECEIVER);
        cache.lookup_or_scan().unwrap();
        add_input_node(&paths, "event1", "248a", "fa02");

        cache.invalidate();
        assert!(cache.cached().is_none());
        assert_eq!(cache.lookup_or_scan().unwrap().name, "event1");
    }
}
