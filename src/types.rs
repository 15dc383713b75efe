//! Core data types for the device-access layer
//!
//! This module contains the value types exchanged between backends, the
//! session log, and the device classifier.
//!
//! # Main Types
//!
//! - [`VideoInterfaceInfo`] / [`UsbInterfaceInfo`] / [`HidInterfaceInfo`] - Descriptors
//!   for one enumerated interface, produced fresh on every query
//! - [`DeviceKey`] - Physical-device identity used to group interfaces
//! - [`StreamProfile`] / [`Frame`] - Video stream configuration and delivered frames
//! - [`HidSample`] - A report delivered by a HID capture
//! - [`DeviceChange`] - Hot-plug notification payload
//!
//! Descriptors are plain immutable values. They carry the backend-private
//! `device_path` needed to open the interface later, but no live handle.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of transport interface a descriptor refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    /// UVC-style video interface
    Video,
    /// Vendor-specific USB control interface
    Usb,
    /// HID interface
    Hid,
}

impl InterfaceKind {
    /// Every kind, in enumeration order
    pub const ALL: [InterfaceKind; 3] =
        [InterfaceKind::Video, InterfaceKind::Usb, InterfaceKind::Hid];

    /// Display name for the kind
    pub fn display_name(&self) -> &'static str {
        match self {
            InterfaceKind::Video => "video",
            InterfaceKind::Usb => "usb",
            InterfaceKind::Hid => "hid",
        }
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// How interfaces of one physical device are recognised as belonging together
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceIdentity {
    /// Device reports a serial number
    Serial(String),
    /// No serial; identified by its USB port path (bus topology)
    Port(String),
}

/// Identity of the physical device an interface belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub vendor_id: u16,
    pub product_id: u16,
    pub identity: DeviceIdentity,
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identity {
            DeviceIdentity::Serial(s) => {
                write!(f, "{:04x}:{:04x} serial {}", self.vendor_id, self.product_id, s)
            }
            DeviceIdentity::Port(p) => {
                write!(f, "{:04x}:{:04x} port {}", self.vendor_id, self.product_id, p)
            }
        }
    }
}

fn device_key(vendor_id: u16, product_id: u16, serial: &Option<String>, location: &str) -> DeviceKey {
    let identity = match serial.as_deref() {
        Some(s) if !s.is_empty() => DeviceIdentity::Serial(s.to_string()),
        _ => DeviceIdentity::Port(location.to_string()),
    };
    DeviceKey {
        vendor_id,
        product_id,
        identity,
    }
}

/// Common view over the three descriptor kinds
pub trait InterfaceDescriptor {
    /// Which transport this descriptor belongs to
    const KIND: InterfaceKind;

    /// Host node name (e.g. `video0`, `1-2:1.4`, `hidraw3`)
    fn id(&self) -> &str;

    /// USB interface number (`mi`)
    fn interface_number(&self) -> u8;

    /// Physical-device identity used for grouping
    fn device_key(&self) -> DeviceKey;
}

/// Descriptor for a video (UVC) interface
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VideoInterfaceInfo {
    pub id: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface_number: u8,
    #[serde(default)]
    pub serial: Option<String>,
    pub location: String,
    pub device_path: String,
}

/// Descriptor for a vendor-specific USB control interface
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UsbInterfaceInfo {
    pub id: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface_number: u8,
    #[serde(default)]
    pub serial: Option<String>,
    pub location: String,
    pub device_path: String,
}

/// Descriptor for a HID interface
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HidInterfaceInfo {
    pub id: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface_number: u8,
    #[serde(default)]
    pub serial: Option<String>,
    pub location: String,
    pub device_path: String,
    /// Sensor name reported by the HID descriptor (e.g. `accel_3d`)
    #[serde(default)]
    pub sensor_name: String,
}

macro_rules! impl_descriptor {
    ($ty:ty, $kind:expr) => {
        impl InterfaceDescriptor for $ty {
            const KIND: InterfaceKind = $kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn interface_number(&self) -> u8 {
                self.interface_number
            }

            fn device_key(&self) -> DeviceKey {
                device_key(self.vendor_id, self.product_id, &self.serial, &self.location)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(
                    f,
                    "{} {} ({:04x}:{:04x} mi {}) at {}",
                    $kind, self.id, self.vendor_id, self.product_id, self.interface_number, self.location
                )
            }
        }
    };
}

impl_descriptor!(VideoInterfaceInfo, InterfaceKind::Video);
impl_descriptor!(UsbInterfaceInfo, InterfaceKind::Usb);
impl_descriptor!(HidInterfaceInfo, InterfaceKind::Hid);

/// Snapshot of every interface visible on the host at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSnapshot {
    #[serde(default)]
    pub video: Vec<VideoInterfaceInfo>,
    #[serde(default)]
    pub usb: Vec<UsbInterfaceInfo>,
    #[serde(default)]
    pub hid: Vec<HidInterfaceInfo>,
}

impl InterfaceSnapshot {
    /// Check if the snapshot has no interfaces
    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.usb.is_empty() && self.hid.is_empty()
    }

    /// Total number of interfaces
    pub fn len(&self) -> usize {
        self.video.len() + self.usb.len() + self.hid.len()
    }

    /// Interfaces present in `self` but not in `other`
    pub fn difference(&self, other: &InterfaceSnapshot) -> InterfaceSnapshot {
        InterfaceSnapshot {
            video: self
                .video
                .iter()
                .filter(|v| !other.video.contains(v))
                .cloned()
                .collect(),
            usb: self
                .usb
                .iter()
                .filter(|u| !other.usb.contains(u))
                .cloned()
                .collect(),
            hid: self
                .hid
                .iter()
                .filter(|h| !other.hid.contains(h))
                .cloned()
                .collect(),
        }
    }
}

/// Hot-plug notification: what appeared and disappeared since the last snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceChange {
    pub added: InterfaceSnapshot,
    pub removed: InterfaceSnapshot,
}

impl DeviceChange {
    /// Compute the change between two snapshots
    pub fn between(previous: &InterfaceSnapshot, current: &InterfaceSnapshot) -> Self {
        Self {
            added: current.difference(previous),
            removed: previous.difference(current),
        }
    }

    /// Check if nothing changed
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Build a V4L2-style FourCC code from four ASCII bytes
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

/// One stream configuration a video interface can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// FourCC pixel format
    pub format: u32,
}

impl StreamProfile {
    pub fn new(width: u32, height: u32, fps: u32, format: u32) -> Self {
        Self {
            width,
            height,
            fps,
            format,
        }
    }

    /// Printable FourCC of the pixel format
    pub fn format_name(&self) -> String {
        self.format
            .to_le_bytes()
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
            .collect()
    }

    /// Bytes per pixel for the formats this layer knows about
    pub fn bytes_per_pixel(&self) -> usize {
        match &self.format.to_le_bytes() {
            b"Z16 " | b"YUYV" | b"UYVY" | b"Y16 " | b"INVI" => 2,
            b"GREY" | b"Y8  " => 1,
            b"RGB3" | b"BGR3" => 3,
            b"RGB4" | b"BGR4" => 4,
            _ => 2,
        }
    }

    /// Size of one uncompressed frame in bytes
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel()
    }
}

impl fmt::Display for StreamProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{} {}",
            self.width,
            self.height,
            self.fps,
            self.format_name()
        )
    }
}

/// A frame delivered by a streaming video interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub profile: StreamProfile,
    /// Per-stream frame counter
    pub sequence: u64,
    /// Capture time in microseconds since streaming started
    pub timestamp_us: u64,
    pub data: Vec<u8>,
}

/// Sensor exposed by a HID interface
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HidSensor {
    pub name: String,
}

/// A report delivered by a HID capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidSample {
    pub sensor: String,
    pub sequence: u64,
    /// Capture time in microseconds since capture started
    pub timestamp_us: u64,
    pub data: Vec<u8>,
}

/// Device power state as exposed by UVC devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerState {
    /// Fully powered
    #[default]
    D0,
    /// Suspended
    D3,
}

/// Address of a UVC extension-unit control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct XuControl {
    pub unit: u8,
    pub selector: u8,
}

impl XuControl {
    pub fn new(unit: u8, selector: u8) -> Self {
        Self { unit, selector }
    }
}
