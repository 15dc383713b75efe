//! Test data builders for creating interface snapshots

use cambackend::backend::MockDeviceSpec;
use cambackend::types::InterfaceSnapshot;

/// Builder for snapshots made of several simulated devices
#[derive(Default)]
pub struct SnapshotBuilder {
    snapshot: InterfaceSnapshot,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(mut self, spec: MockDeviceSpec) -> Self {
        self.snapshot.video.extend(spec.video);
        self.snapshot.usb.extend(spec.usb);
        self.snapshot.hid.extend(spec.hid);
        self
    }

    /// Add `count` unrelated USB devices
    pub fn strays(mut self, count: usize) -> Self {
        for i in 0..count {
            let port = self.snapshot.usb.len() + 1;
            self = self.device(MockDeviceSpec::unrelated_usb(
                0x046d,
                0x0825 + i as u16,
                &format!("5-{}", port),
            ));
        }
        self
    }

    pub fn build(self) -> InterfaceSnapshot {
        self.snapshot
    }
}

/// Reverse every pool of `snapshot`
pub fn reversed(snapshot: &InterfaceSnapshot) -> InterfaceSnapshot {
    let mut out = snapshot.clone();
    out.video.reverse();
    out.usb.reverse();
    out.hid.reverse();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_builder() {
        let snapshot = SnapshotBuilder::new()
            .device(MockDeviceSpec::sr300("SR-1", "1-1"))
            .strays(2)
            .build();

        assert_eq!(snapshot.video.len(), 2);
        assert_eq!(snapshot.usb.len(), 3);
        assert!(snapshot.hid.is_empty());
    }
}
