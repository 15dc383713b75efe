//! sysfs enumeration of camera interfaces
//!
//! Video nodes come from `class/video4linux`, vendor-specific USB interfaces
//! from `bus/usb/devices`, and HID nodes from `class/hidraw`. For every node
//! the owning USB device directory is found by walking up the resolved
//! sysfs path until a directory with `idVendor`/`idProduct` appears.

use crate::types::{HidInterfaceInfo, UsbInterfaceInfo, VideoInterfaceInfo};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// How far up the sysfs tree to search for the owning USB device
const MAX_WALK_DEPTH: usize = 8;

/// USB class code for vendor-specific interfaces
const VENDOR_SPECIFIC_CLASS: u8 = 0xff;

/// Attributes of the USB device directory owning an interface
#[derive(Debug, Clone, PartialEq, Eq)]
struct UsbDeviceAttrs {
    vendor_id: u16,
    product_id: u16,
    serial: Option<String>,
    /// Port path, the directory name (e.g. `1-2.3`)
    location: String,
    busnum: Option<u32>,
    devnum: Option<u32>,
}

/// Enumerates interfaces below a sysfs root
#[derive(Debug, Clone)]
pub struct SysfsEnumerator {
    root: PathBuf,
    dev_root: PathBuf,
}

impl Default for SysfsEnumerator {
    fn default() -> Self {
        Self::new("/sys", "/dev")
    }
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    std::fs::read_to_string(dir.join(name))
        .ok()
        .map(|s| s.trim().to_string())
}

fn read_hex_u16(dir: &Path, name: &str) -> Option<u16> {
    u16::from_str_radix(&read_attr(dir, name)?, 16).ok()
}

fn read_hex_u8(dir: &Path, name: &str) -> Option<u8> {
    u8::from_str_radix(&read_attr(dir, name)?, 16).ok()
}

/// First ancestor (including `start`) that contains `marker`
fn find_ancestor_with(start: &Path, marker: &str) -> Option<PathBuf> {
    let mut path = start.to_path_buf();
    for _ in 0..MAX_WALK_DEPTH {
        if path.join(marker).exists() {
            return Some(path);
        }
        if !path.pop() {
            break;
        }
    }
    None
}

fn usb_device_attrs(dir: &Path) -> Option<UsbDeviceAttrs> {
    let vendor_id = read_hex_u16(dir, "idVendor")?;
    let product_id = read_hex_u16(dir, "idProduct")?;
    let location = dir.file_name()?.to_string_lossy().to_string();
    Some(UsbDeviceAttrs {
        vendor_id,
        product_id,
        serial: read_attr(dir, "serial").filter(|s| !s.is_empty()),
        location,
        busnum: read_attr(dir, "busnum").and_then(|s| s.parse().ok()),
        devnum: read_attr(dir, "devnum").and_then(|s| s.parse().ok()),
    })
}

/// Sorted entry names of a directory; missing directories yield nothing
fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect(),
        Err(e) => {
            trace!("Skipping {}: {}", dir.display(), e);
            Vec::new()
        }
    };
    names.sort();
    names
}

impl SysfsEnumerator {
    /// Create an enumerator reading `root` and building node paths under `dev_root`
    pub fn new(root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dev_root: dev_root.into(),
        }
    }

    /// Resolve the owning interface and device directories of a class node
    fn resolve_node(&self, class: &str, name: &str) -> Option<(PathBuf, UsbDeviceAttrs)> {
        let link = self.root.join("class").join(class).join(name).join("device");
        let resolved = std::fs::canonicalize(&link).ok()?;
        let interface_dir = find_ancestor_with(&resolved, "bInterfaceNumber")?;
        let device_dir = find_ancestor_with(&interface_dir, "idVendor")?;
        Some((interface_dir, usb_device_attrs(&device_dir)?))
    }

    /// Enumerate primary video capture nodes
    pub fn video_interfaces(&self) -> Vec<VideoInterfaceInfo> {
        let class_dir = self.root.join("class").join("video4linux");
        let mut found = Vec::new();

        for name in list_dir(&class_dir) {
            if !name.starts_with("video") {
                continue;
            }
            // Metadata nodes share the interface with a non-zero index
            if let Some(index) = read_attr(&class_dir.join(&name), "index") {
                if index != "0" {
                    continue;
                }
            }
            let Some((interface_dir, device)) = self.resolve_node("video4linux", &name) else {
                trace!("{} is not backed by a USB interface", name);
                continue;
            };
            let Some(interface_number) = read_hex_u8(&interface_dir, "bInterfaceNumber") else {
                continue;
            };

            found.push(VideoInterfaceInfo {
                device_path: self.dev_root.join(&name).to_string_lossy().to_string(),
                id: name,
                vendor_id: device.vendor_id,
                product_id: device.product_id,
                interface_number,
                serial: device.serial,
                location: device.location,
            });
        }

        debug!("Found {} video interfaces", found.len());
        found
    }

    /// Enumerate vendor-specific USB interfaces
    pub fn usb_interfaces(&self) -> Vec<UsbInterfaceInfo> {
        let devices_dir = self.root.join("bus").join("usb").join("devices");
        let mut found = Vec::new();

        for name in list_dir(&devices_dir) {
            // Interface directories are named `<port>:<config>.<interface>`
            let Some((port, _)) = name.split_once(':') else {
                continue;
            };
            let interface_dir = devices_dir.join(&name);
            if read_hex_u8(&interface_dir, "bInterfaceClass") != Some(VENDOR_SPECIFIC_CLASS) {
                continue;
            }
            let Some(interface_number) = read_hex_u8(&interface_dir, "bInterfaceNumber") else {
                continue;
            };
            let Some(device) = usb_device_attrs(&devices_dir.join(port)) else {
                continue;
            };

            let device_path = match (device.busnum, device.devnum) {
                (Some(bus), Some(dev)) => self
                    .dev_root
                    .join("bus")
                    .join("usb")
                    .join(format!("{:03}", bus))
                    .join(format!("{:03}", dev))
                    .to_string_lossy()
                    .to_string(),
                _ => continue,
            };

            found.push(UsbInterfaceInfo {
                id: name,
                vendor_id: device.vendor_id,
                product_id: device.product_id,
                interface_number,
                serial: device.serial,
                location: device.location,
                device_path,
            });
        }

        debug!("Found {} vendor-specific USB interfaces", found.len());
        found
    }

    /// Enumerate hidraw nodes backed by USB interfaces
    pub fn hid_interfaces(&self) -> Vec<HidInterfaceInfo> {
        let class_dir = self.root.join("class").join("hidraw");
        let mut found = Vec::new();

        for name in list_dir(&class_dir) {
            if !name.starts_with("hidraw") {
                continue;
            }
            let Some((interface_dir, device)) = self.resolve_node("hidraw", &name) else {
                continue;
            };
            let Some(interface_number) = read_hex_u8(&interface_dir, "bInterfaceNumber") else {
                continue;
            };
            let sensor_name = std::fs::canonicalize(class_dir.join(&name).join("device"))
                .ok()
                .and_then(|hid_dir| read_attr(&hid_dir, "uevent"))
                .and_then(|uevent| {
                    uevent
                        .lines()
                        .find_map(|line| line.strip_prefix("HID_NAME=").map(str::to_string))
                })
                .unwrap_or_else(|| name.clone());

            found.push(HidInterfaceInfo {
                device_path: self.dev_root.join(&name).to_string_lossy().to_string(),
                id: name,
                vendor_id: device.vendor_id,
                product_id: device.product_id,
                interface_number,
                serial: device.serial,
                location: device.location,
                sensor_name,
            });
        }

        debug!("Found {} HID interfaces", found.len());
        found
    }
}
