//! Standard backend: the host's real camera transports
//!
//! Enumeration reads sysfs, so it works (and returns empty lists) on any
//! host. Opening interfaces requires Linux device nodes; on other hosts
//! every `open_*` fails with `DeviceNotFound`.
//!
//! # Main Types
//!
//! - [`StandardBackend`] - The [`Backend`] over sysfs and `/dev`
//! - [`SysfsEnumerator`] - Interface discovery below a configurable sysfs root
//! - [`HotplugPoller`] - Re-enumerates periodically and reports differences

pub mod hotplug;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod sysfs;

pub use hotplug::HotplugPoller;
pub use sysfs::SysfsEnumerator;

use super::{Backend, DeviceChangedCallback, HidDevice, UsbDevice, VideoDevice};
use crate::config::StandardConfig;
use crate::error::{BackendError, Result};
use crate::types::{HidInterfaceInfo, InterfaceSnapshot, UsbInterfaceInfo, VideoInterfaceInfo};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Backend talking to the host's device nodes
pub struct StandardBackend {
    enumerator: Arc<SysfsEnumerator>,
    poll_interval: Duration,
    poller: Mutex<Option<HotplugPoller>>,
}

impl Default for StandardBackend {
    fn default() -> Self {
        Self::new(&StandardConfig::default())
    }
}

impl StandardBackend {
    /// Create a backend from its configuration
    pub fn new(config: &StandardConfig) -> Self {
        info!(
            "Standard backend on sysfs root {}",
            config.sysfs_root.display()
        );
        Self {
            enumerator: Arc::new(SysfsEnumerator::new(
                config.sysfs_root.clone(),
                config.dev_root.clone(),
            )),
            poll_interval: Duration::from_millis(config.hotplug_poll_interval_ms.max(1)),
            poller: Mutex::new(None),
        }
    }

    fn enumerate(enumerator: &SysfsEnumerator) -> InterfaceSnapshot {
        InterfaceSnapshot {
            video: enumerator.video_interfaces(),
            usb: enumerator.usb_interfaces(),
            hid: enumerator.hid_interfaces(),
        }
    }
}

impl Backend for StandardBackend {
    fn query_video_interfaces(&self) -> Result<Vec<VideoInterfaceInfo>> {
        Ok(self.enumerator.video_interfaces())
    }

    fn query_usb_interfaces(&self) -> Result<Vec<UsbInterfaceInfo>> {
        Ok(self.enumerator.usb_interfaces())
    }

    fn query_hid_interfaces(&self) -> Result<Vec<HidInterfaceInfo>> {
        Ok(self.enumerator.hid_interfaces())
    }

    #[cfg(target_os = "linux")]
    fn open_video(&self, info: &VideoInterfaceInfo) -> Result<Box<dyn VideoDevice>> {
        Ok(Box::new(linux::LinuxVideoDevice::open(info)?))
    }

    #[cfg(not(target_os = "linux"))]
    fn open_video(&self, info: &VideoInterfaceInfo) -> Result<Box<dyn VideoDevice>> {
        Err(BackendError::DeviceNotFound(info.device_path.clone()))
    }

    #[cfg(target_os = "linux")]
    fn open_usb(&self, info: &UsbInterfaceInfo) -> Result<Box<dyn UsbDevice>> {
        Ok(Box::new(linux::LinuxUsbDevice::open(info)?))
    }

    #[cfg(not(target_os = "linux"))]
    fn open_usb(&self, info: &UsbInterfaceInfo) -> Result<Box<dyn UsbDevice>> {
        Err(BackendError::DeviceNotFound(info.device_path.clone()))
    }

    #[cfg(target_os = "linux")]
    fn open_hid(&self, info: &HidInterfaceInfo) -> Result<Box<dyn HidDevice>> {
        Ok(Box::new(linux::LinuxHidDevice::open(info)?))
    }

    #[cfg(not(target_os = "linux"))]
    fn open_hid(&self, info: &HidInterfaceInfo) -> Result<Box<dyn HidDevice>> {
        Err(BackendError::DeviceNotFound(info.device_path.clone()))
    }

    fn subscribe_devices_changed(&self, callback: DeviceChangedCallback) -> Result<()> {
        let mut slot = self
            .poller
            .lock()
            .map_err(|_| BackendError::Transport("hot-plug state poisoned".to_string()))?;
        // Replacing the poller joins the previous thread first
        slot.take();

        let enumerator = self.enumerator.clone();
        let initial = Self::enumerate(&enumerator);
        let poller = HotplugPoller::spawn(
            initial,
            self.poll_interval,
            move || Self::enumerate(&enumerator),
            callback,
        )?;
        *slot = Some(poller);
        debug!("Hot-plug polling every {:?}", self.poll_interval);
        Ok(())
    }

    fn unsubscribe_devices_changed(&self) -> Result<()> {
        if let Ok(mut slot) = self.poller.lock() {
            slot.take();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sysfs_root() {
        let config = StandardConfig {
            sysfs_root: "/nonexistent/sysfs".into(),
            ..Default::default()
        };
        let backend = StandardBackend::new(&config);
        assert!(backend.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = StandardConfig {
            sysfs_root: tmp.path().to_path_buf(),
            hotplug_poll_interval_ms: 5,
            ..Default::default()
        };
        let backend = StandardBackend::new(&config);
        backend.subscribe_devices_changed(Arc::new(|_| {})).unwrap();
        backend.subscribe_devices_changed(Arc::new(|_| {})).unwrap();
        backend.unsubscribe_devices_changed().unwrap();
        assert!(backend.poller.lock().unwrap().is_none());
    }
}
