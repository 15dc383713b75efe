//! Classified devices

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{DeviceKey, HidInterfaceInfo, UsbInterfaceInfo, VideoInterfaceInfo};

/// SR300-like camera (family A)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sr300Info {
    pub key: DeviceKey,
    pub product_name: String,
    /// Video interfaces, sorted
    pub video: Vec<VideoInterfaceInfo>,
    /// Command interface(s), sorted
    pub usb: Vec<UsbInterfaceInfo>,
}

/// DS5-like camera (family B)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ds5Info {
    pub key: DeviceKey,
    pub product_name: String,
    pub video: Vec<VideoInterfaceInfo>,
    pub usb: Vec<UsbInterfaceInfo>,
    /// Motion sensors, empty on models without an IMU
    pub hid: Vec<HidInterfaceInfo>,
    /// Whether the optional color interface is present
    pub has_color: bool,
}

impl Ds5Info {
    /// Whether the device exposes motion sensors
    pub fn has_imu(&self) -> bool {
        !self.hid.is_empty()
    }
}

/// Device in firmware-recovery mode
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecoveryInfo {
    pub key: DeviceKey,
    pub product_name: String,
    pub usb: UsbInterfaceInfo,
}

/// One physical device, grouped and tagged with its family
///
/// Carries descriptors only; interfaces are opened later through the
/// backend that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum DeviceInfo {
    Sr300(Sr300Info),
    Ds5(Ds5Info),
    Recovery(RecoveryInfo),
}

impl DeviceInfo {
    /// Display name for the family
    pub fn family_name(&self) -> &'static str {
        match self {
            DeviceInfo::Sr300(_) => "SR300",
            DeviceInfo::Ds5(_) => "DS5",
            DeviceInfo::Recovery(_) => "Recovery",
        }
    }

    /// Physical-device identity
    pub fn key(&self) -> &DeviceKey {
        match self {
            DeviceInfo::Sr300(info) => &info.key,
            DeviceInfo::Ds5(info) => &info.key,
            DeviceInfo::Recovery(info) => &info.key,
        }
    }

    pub fn product_name(&self) -> &str {
        match self {
            DeviceInfo::Sr300(info) => &info.product_name,
            DeviceInfo::Ds5(info) => &info.product_name,
            DeviceInfo::Recovery(info) => &info.product_name,
        }
    }

    /// Number of interfaces making up the device
    pub fn interface_count(&self) -> usize {
        match self {
            DeviceInfo::Sr300(info) => info.video.len() + info.usb.len(),
            DeviceInfo::Ds5(info) => info.video.len() + info.usb.len() + info.hid.len(),
            DeviceInfo::Recovery(_) => 1,
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({}, {} interfaces)",
            self.family_name(),
            self.product_name(),
            self.key(),
            self.interface_count()
        )
    }
}
