//! Device classification
//!
//! Turns the three flat interface lists a backend enumerates into one
//! [`DeviceInfo`] per physical device.
//!
//! # Algorithm
//!
//! Each [`FamilyMatcher`] runs in [`FamilyMatcher::PRIORITY`] order over
//! the pools it covers. A camera matcher groups its candidate interfaces
//! by [`DeviceKey`], keeps groups with every required video interface,
//! and removes each matched group from the pools before the next matcher
//! runs. An interface taken by an earlier family is never offered to a
//! later one. Interfaces no family claims are dropped without error.
//!
//! Group members are sorted, so the same input in any order produces the
//! same set of devices.

pub mod device_info;
pub mod families;

pub use device_info::{DeviceInfo, Ds5Info, RecoveryInfo, Sr300Info};
pub use families::{FamilySignature, FamilyTable, Product, INTEL_VENDOR_ID};

use std::collections::BTreeSet;

use crate::types::{
    DeviceKey, HidInterfaceInfo, InterfaceDescriptor, InterfaceKind, InterfaceSnapshot,
    UsbInterfaceInfo, VideoInterfaceInfo,
};

/// Interfaces not yet claimed by any family
#[derive(Debug, Clone, Default)]
struct Pools {
    video: Vec<VideoInterfaceInfo>,
    usb: Vec<UsbInterfaceInfo>,
    hid: Vec<HidInterfaceInfo>,
}

impl Pools {
    /// Take every member of `key` out of `pool`, sorted
    fn take<T: InterfaceDescriptor + Ord>(pool: &mut Vec<T>, key: &DeviceKey) -> Vec<T> {
        let (mut taken, kept): (Vec<T>, Vec<T>) =
            pool.drain(..).partition(|d| &d.device_key() == key);
        *pool = kept;
        taken.sort();
        if !taken.is_empty() {
            tracing::trace!("Claimed {} {} interfaces of {}", taken.len(), T::KIND, key);
        }
        taken
    }

    /// Number of unclaimed interfaces of `kind`
    fn remaining(&self, kind: InterfaceKind) -> usize {
        match kind {
            InterfaceKind::Video => self.video.len(),
            InterfaceKind::Usb => self.usb.len(),
            InterfaceKind::Hid => self.hid.len(),
        }
    }
}

/// The closed set of device families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FamilyMatcher {
    /// Family A: video + USB
    Sr300,
    /// Family B: video + USB + HID
    Ds5,
    /// Firmware-recovery devices: USB only
    Recovery,
}

impl FamilyMatcher {
    /// Order in which families claim interfaces
    pub const PRIORITY: [FamilyMatcher; 3] =
        [FamilyMatcher::Sr300, FamilyMatcher::Ds5, FamilyMatcher::Recovery];

    /// Display name for the family
    pub fn display_name(&self) -> &'static str {
        match self {
            FamilyMatcher::Sr300 => "SR300",
            FamilyMatcher::Ds5 => "DS5",
            FamilyMatcher::Recovery => "Recovery",
        }
    }

    fn signature<'a>(&self, table: &'a FamilyTable) -> &'a FamilySignature {
        match self {
            FamilyMatcher::Sr300 => &table.sr300,
            FamilyMatcher::Ds5 => &table.ds5,
            FamilyMatcher::Recovery => &table.recovery,
        }
    }

    /// Claim every matching group from `pools`
    fn pick(&self, table: &FamilyTable, pools: &mut Pools) -> Vec<DeviceInfo> {
        let signature = self.signature(table);
        match self {
            FamilyMatcher::Sr300 | FamilyMatcher::Ds5 => self.pick_cameras(signature, pools),
            FamilyMatcher::Recovery => pick_recovery(signature, pools),
        }
    }

    fn pick_cameras(&self, signature: &FamilySignature, pools: &mut Pools) -> Vec<DeviceInfo> {
        // Groups in order of first appearance in the video pool
        let mut keys: Vec<DeviceKey> = Vec::new();
        for video in &pools.video {
            if signature.matches(video.vendor_id, video.product_id) {
                let key = video.device_key();
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }

        let mut devices = Vec::new();
        for key in keys {
            let present: BTreeSet<u8> = pools
                .video
                .iter()
                .filter(|v| v.device_key() == key)
                .map(|v| v.interface_number)
                .collect();
            let complete = signature
                .required_video_interfaces
                .iter()
                .all(|mi| present.contains(mi));
            if !complete {
                tracing::debug!(
                    "{} group {} lacks required interfaces (has {:?})",
                    self.display_name(),
                    key,
                    present
                );
                continue;
            }

            let video = Pools::take(&mut pools.video, &key);
            let usb = Pools::take(&mut pools.usb, &key);
            let product_name = signature
                .product_name(key.product_id)
                .unwrap_or(self.display_name())
                .to_string();

            let device = match self {
                FamilyMatcher::Sr300 => DeviceInfo::Sr300(Sr300Info {
                    key,
                    product_name,
                    video,
                    usb,
                }),
                _ => {
                    let hid = Pools::take(&mut pools.hid, &key);
                    let has_color = signature
                        .optional_video_interfaces
                        .iter()
                        .any(|mi| present.contains(mi));
                    DeviceInfo::Ds5(Ds5Info {
                        key,
                        product_name,
                        video,
                        usb,
                        hid,
                        has_color,
                    })
                }
            };
            tracing::debug!("Classified {}", device);
            devices.push(device);
        }
        devices
    }
}

fn pick_recovery(signature: &FamilySignature, pools: &mut Pools) -> Vec<DeviceInfo> {
    let mut keys: Vec<DeviceKey> = Vec::new();
    for usb in &pools.usb {
        if signature.matches(usb.vendor_id, usb.product_id) {
            let key = usb.device_key();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }

    let mut devices = Vec::new();
    for key in keys {
        let mut members = Pools::take(&mut pools.usb, &key);
        if members.is_empty() {
            continue;
        }
        // One device per group; the lowest-numbered interface represents it
        let usb = members.remove(0);
        let product_name = signature
            .product_name(key.product_id)
            .unwrap_or("Recovery")
            .to_string();
        devices.push(DeviceInfo::Recovery(RecoveryInfo {
            key,
            product_name,
            usb,
        }));
    }
    devices
}

/// Stateless classifier over one enumeration snapshot
#[derive(Debug, Clone, Default)]
pub struct DeviceClassifier {
    table: FamilyTable,
}

impl DeviceClassifier {
    /// Create a classifier using `table` for family signatures
    pub fn new(table: FamilyTable) -> Self {
        Self { table }
    }

    /// The signature table in use
    pub fn table(&self) -> &FamilyTable {
        &self.table
    }

    /// Classify one snapshot
    ///
    /// Devices are ordered by family priority, then by first appearance
    /// within the family.
    pub fn classify(&self, snapshot: &InterfaceSnapshot) -> Vec<DeviceInfo> {
        let mut pools = Pools {
            video: snapshot.video.clone(),
            usb: snapshot.usb.clone(),
            hid: snapshot.hid.clone(),
        };

        let mut devices = Vec::new();
        for matcher in FamilyMatcher::PRIORITY {
            devices.extend(matcher.pick(&self.table, &mut pools));
        }

        for kind in InterfaceKind::ALL {
            let unclaimed = pools.remaining(kind);
            if unclaimed > 0 {
                tracing::debug!("{} {} interfaces matched no family", unclaimed, kind);
            }
        }
        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockDeviceSpec;
    use proptest::prelude::*;

    fn snapshot(specs: &[MockDeviceSpec]) -> InterfaceSnapshot {
        let mut snapshot = InterfaceSnapshot::default();
        for spec in specs {
            snapshot.video.extend(spec.video.iter().cloned());
            snapshot.usb.extend(spec.usb.iter().cloned());
            snapshot.hid.extend(spec.hid.iter().cloned());
        }
        snapshot
    }

    #[test]
    fn test_one_of_each_family() {
        let input = snapshot(&[
            MockDeviceSpec::recovery(0x0ADB, "1-3"),
            MockDeviceSpec::ds5(0x0B07, "DS-1", "1-2", true),
            MockDeviceSpec::sr300("SR-1", "1-1"),
        ]);

        let devices = DeviceClassifier::default().classify(&input);
        let families: Vec<_> = devices.iter().map(|d| d.family_name()).collect();
        assert_eq!(families, vec!["SR300", "DS5", "Recovery"]);

        match &devices[1] {
            DeviceInfo::Ds5(info) => {
                assert!(info.has_imu());
                assert!(info.has_color);
                assert_eq!(info.product_name, "Intel RealSense D435");
            }
            other => panic!("unexpected device {other}"),
        }
    }

    #[test]
    fn test_incomplete_group_is_dropped() {
        // SR300 without its depth interface
        let mut spec = MockDeviceSpec::sr300("SR-1", "1-1");
        spec.video.retain(|v| v.interface_number == 0);
        let devices = DeviceClassifier::default().classify(&snapshot(&[spec]));
        assert!(devices.is_empty());
    }

    #[test]
    fn test_ds5_without_color_or_imu() {
        let mut spec = MockDeviceSpec::ds5(0x0AD4, "DS-2", "2-1", false);
        spec.video.retain(|v| v.interface_number == 0);
        let devices = DeviceClassifier::default().classify(&snapshot(&[spec]));
        assert_eq!(devices.len(), 1);
        match &devices[0] {
            DeviceInfo::Ds5(info) => {
                assert!(!info.has_color);
                assert!(!info.has_imu());
            }
            other => panic!("unexpected device {other}"),
        }
    }

    #[test]
    fn test_serial_less_cameras_grouped_by_port() {
        let spec_a = MockDeviceSpec::new()
            .with_video(0x8086, 0x0AA5, 0, None, "1-1")
            .with_video(0x8086, 0x0AA5, 2, None, "1-1");
        let spec_b = MockDeviceSpec::new()
            .with_video(0x8086, 0x0AA5, 0, None, "1-4")
            .with_video(0x8086, 0x0AA5, 2, None, "1-4");
        let devices = DeviceClassifier::default().classify(&snapshot(&[spec_a, spec_b]));
        assert_eq!(devices.len(), 2);
        assert_ne!(devices[0].key(), devices[1].key());
    }

    #[test]
    fn test_earlier_family_claims_shared_interfaces() {
        // Same product id listed in both camera families
        let mut table = FamilyTable::default();
        table.ds5.products.push(Product::new(0x0AA5, "Ambiguous"));
        table.ds5.required_video_interfaces = vec![0];

        let input = snapshot(&[MockDeviceSpec::sr300("SR-1", "1-1")]);
        let devices = DeviceClassifier::new(table).classify(&input);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].family_name(), "SR300");
        assert_eq!(devices[0].interface_count(), 3);
    }

    #[test]
    fn test_unrelated_devices_are_ignored() {
        let input = snapshot(&[
            MockDeviceSpec::unrelated_usb(0x046d, 0x0825, "1-7"),
            MockDeviceSpec::new().with_video(0x046d, 0x0825, 0, None, "1-7"),
        ]);
        assert!(DeviceClassifier::default().classify(&input).is_empty());
    }

    #[test]
    fn test_unclaimed_interfaces_counted_per_kind() {
        let input = snapshot(&[
            MockDeviceSpec::sr300("SR-1", "1-1"),
            MockDeviceSpec::unrelated_usb(0x046d, 0x0825, "1-7"),
            MockDeviceSpec::new().with_video(0x046d, 0x0825, 0, None, "1-7"),
        ]);
        let table = FamilyTable::default();
        let mut pools = Pools {
            video: input.video.clone(),
            usb: input.usb.clone(),
            hid: input.hid.clone(),
        };
        for matcher in FamilyMatcher::PRIORITY {
            matcher.pick(&table, &mut pools);
        }

        let left: Vec<_> = InterfaceKind::ALL
            .iter()
            .map(|kind| (kind.display_name(), pools.remaining(*kind)))
            .collect();
        assert_eq!(left, vec![("video", 1), ("usb", 1), ("hid", 0)]);
    }

    #[test]
    fn test_recovery_device() {
        let input = snapshot(&[MockDeviceSpec::recovery(0x0ADB, "3-1")]);
        let devices = DeviceClassifier::default().classify(&input);
        assert_eq!(devices.len(), 1);
        match &devices[0] {
            DeviceInfo::Recovery(info) => {
                assert_eq!(info.usb.location, "3-1");
                assert_eq!(info.product_name, "Intel RealSense D4xx Recovery");
            }
            other => panic!("unexpected device {other}"),
        }
    }

    fn permuted<T: Clone>(items: &[T], seed: u64) -> Vec<T> {
        let mut out = items.to_vec();
        // Deterministic Fisher-Yates driven by a simple LCG
        let mut state = seed;
        for i in (1..out.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = (state >> 33) as usize % (i + 1);
            out.swap(i, j);
        }
        out
    }

    proptest! {
        #[test]
        fn prop_classification_ignores_input_order(seed_v in any::<u64>(), seed_u in any::<u64>(), seed_h in any::<u64>()) {
            let input = snapshot(&[
                MockDeviceSpec::sr300("SR-1", "1-1"),
                MockDeviceSpec::ds5(0x0AD3, "DS-1", "1-2", true),
                MockDeviceSpec::ds5(0x0B07, "DS-2", "1-3", false),
                MockDeviceSpec::recovery(0x0ADB, "1-4"),
                MockDeviceSpec::unrelated_usb(0x046d, 0x0825, "1-5"),
            ]);
            let shuffled = InterfaceSnapshot {
                video: permuted(&input.video, seed_v),
                usb: permuted(&input.usb, seed_u),
                hid: permuted(&input.hid, seed_h),
            };

            let classifier = DeviceClassifier::default();
            let expected: BTreeSet<DeviceInfo> = classifier.classify(&input).into_iter().collect();
            let actual: BTreeSet<DeviceInfo> = classifier.classify(&shuffled).into_iter().collect();
            prop_assert_eq!(expected.len(), 4);
            prop_assert_eq!(actual, expected);
        }
    }
}
