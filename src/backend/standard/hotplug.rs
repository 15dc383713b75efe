//! Hot-plug detection by periodic re-enumeration

use crate::backend::DeviceChangedCallback;
use crate::types::{DeviceChange, InterfaceSnapshot};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

/// Background thread comparing successive snapshots
///
/// Dropping the poller stops the thread and joins it.
pub struct HotplugPoller {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HotplugPoller {
    /// Start polling `enumerate` every `interval`, starting from `initial`
    pub fn spawn<E>(
        initial: InterfaceSnapshot,
        interval: Duration,
        enumerate: E,
        callback: DeviceChangedCallback,
    ) -> std::io::Result<Self>
    where
        E: Fn() -> InterfaceSnapshot + Send + 'static,
    {
        let (shutdown, shutdown_rx) = bounded::<()>(0);
        let handle = std::thread::Builder::new()
            .name("cambackend-hotplug".to_string())
            .spawn(move || {
                let mut previous = initial;
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    let current = enumerate();
                    let change = DeviceChange::between(&previous, &current);
                    if !change.is_empty() {
                        info!(
                            "Devices changed: {} interfaces added, {} removed",
                            change.added.len(),
                            change.removed.len()
                        );
                        callback(change);
                    }
                    previous = current;
                }
                debug!("Hot-plug poller stopped");
            })?;

        Ok(Self {
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }
}

impl Drop for HotplugPoller {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the thread
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UsbInterfaceInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn usb(id: &str) -> UsbInterfaceInfo {
        UsbInterfaceInfo {
            id: id.to_string(),
            vendor_id: 0x8086,
            product_id: 0x0ADB,
            interface_number: 0,
            serial: None,
            location: id.to_string(),
            device_path: format!("/dev/bus/usb/001/{}", id),
        }
    }

    #[test]
    fn test_reports_changes_once() {
        let attached = Arc::new(Mutex::new(InterfaceSnapshot::default()));
        let source = attached.clone();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();

        let poller = HotplugPoller::spawn(
            InterfaceSnapshot::default(),
            Duration::from_millis(5),
            move || source.lock().unwrap().clone(),
            Arc::new(move |change| sink.lock().unwrap().push(change)),
        )
        .unwrap();

        attached.lock().unwrap().usb.push(usb("1-4"));
        std::thread::sleep(Duration::from_millis(100));
        drop(poller);

        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].added.usb[0].id, "1-4");
    }

    #[test]
    fn test_drop_stops_thread() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let poller = HotplugPoller::spawn(
            InterfaceSnapshot::default(),
            Duration::from_millis(5),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                InterfaceSnapshot::default()
            },
            Arc::new(|_| {}),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        drop(poller);
        let after_drop = polls.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(polls.load(Ordering::SeqCst), after_drop);
    }
}
