//! Mock Backend Implementation for Testing
//!
//! This module provides an in-memory backend that behaves like attached
//! camera hardware without touching the host. Tests and demos describe the
//! devices they want with [`MockDeviceSpec`] and plug them into a
//! [`MockDeviceBackend`].
//!
//! # Features
//!
//! - **Device presets**: SR300-like, DS5-like, recovery and unrelated devices
//! - **Streaming**: Frames and HID reports generated on background threads
//!   with a configurable delay, interval and count
//! - **Hot-plug**: [`MockDeviceBackend::plug`] / [`MockDeviceBackend::unplug`]
//!   notify the subscribed callback
//! - **Failure injection**: Interfaces can be marked as exclusively held
//! - **Slow transfers**: USB transfers can be delayed to exercise cancellation
//!
//! # Example
//!
//! ```ignore
//! use cambackend::backend::{Backend, MockDeviceBackend, MockDeviceSpec};
//!
//! let backend = MockDeviceBackend::new()
//!     .with_device(MockDeviceSpec::sr300("SR300-0001", "1-1"));
//!
//! let video = backend.query_video_interfaces()?;
//! let device = backend.open_video(&video[0])?;
//! ```

use crate::error::{BackendError, Result};
use crate::types::{
    fourcc, DeviceChange, Frame, HidInterfaceInfo, HidSample, HidSensor, InterfaceSnapshot,
    PowerState, StreamProfile, UsbInterfaceInfo, VideoInterfaceInfo, XuControl,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::cancel::{run_cancellable, CancelToken};
use super::{Backend, DeviceChangedCallback, FrameCallback, HidCallback, HidDevice, UsbDevice, VideoDevice};

/// Intel vendor id used by the presets
pub const MOCK_VENDOR_ID: u16 = 0x8086;

/// Interfaces making up one simulated physical device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockDeviceSpec {
    pub video: Vec<VideoInterfaceInfo>,
    pub usb: Vec<UsbInterfaceInfo>,
    pub hid: Vec<HidInterfaceInfo>,
}

fn node_suffix(location: &str) -> String {
    location.replace(['-', '.', ':'], "_")
}

impl MockDeviceSpec {
    /// Empty device with no interfaces
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a video interface
    pub fn with_video(
        mut self,
        vendor_id: u16,
        product_id: u16,
        interface_number: u8,
        serial: Option<&str>,
        location: &str,
    ) -> Self {
        let id = format!("video_{}_{}", node_suffix(location), interface_number);
        self.video.push(VideoInterfaceInfo {
            device_path: format!("/dev/mock/{}", id),
            id,
            vendor_id,
            product_id,
            interface_number,
            serial: serial.map(str::to_string),
            location: location.to_string(),
        });
        self
    }

    /// Add a USB control interface
    pub fn with_usb(
        mut self,
        vendor_id: u16,
        product_id: u16,
        interface_number: u8,
        serial: Option<&str>,
        location: &str,
    ) -> Self {
        let id = format!("{}:1.{}", location, interface_number);
        self.usb.push(UsbInterfaceInfo {
            device_path: format!("/dev/mock/usb_{}", node_suffix(&id)),
            id,
            vendor_id,
            product_id,
            interface_number,
            serial: serial.map(str::to_string),
            location: location.to_string(),
        });
        self
    }

    /// Add a HID interface
    pub fn with_hid(
        mut self,
        vendor_id: u16,
        product_id: u16,
        interface_number: u8,
        serial: Option<&str>,
        location: &str,
        sensor_name: &str,
    ) -> Self {
        let id = format!("hidraw_{}_{}", node_suffix(location), sensor_name);
        self.hid.push(HidInterfaceInfo {
            device_path: format!("/dev/mock/{}", id),
            id,
            vendor_id,
            product_id,
            interface_number,
            serial: serial.map(str::to_string),
            location: location.to_string(),
            sensor_name: sensor_name.to_string(),
        });
        self
    }

    /// SR300-like camera: color (mi 0), depth (mi 2), command interface (mi 4)
    pub fn sr300(serial: &str, location: &str) -> Self {
        Self::new()
            .with_video(MOCK_VENDOR_ID, 0x0AA5, 0, Some(serial), location)
            .with_video(MOCK_VENDOR_ID, 0x0AA5, 2, Some(serial), location)
            .with_usb(MOCK_VENDOR_ID, 0x0AA5, 4, Some(serial), location)
    }

    /// DS5-like camera: depth (mi 0), color (mi 3), command interface, optional IMU
    pub fn ds5(product_id: u16, serial: &str, location: &str, with_imu: bool) -> Self {
        let spec = Self::new()
            .with_video(MOCK_VENDOR_ID, product_id, 0, Some(serial), location)
            .with_video(MOCK_VENDOR_ID, product_id, 3, Some(serial), location)
            .with_usb(MOCK_VENDOR_ID, product_id, 4, Some(serial), location);
        if with_imu {
            spec.with_hid(MOCK_VENDOR_ID, product_id, 5, Some(serial), location, "accel_3d")
                .with_hid(MOCK_VENDOR_ID, product_id, 5, Some(serial), location, "gyro_3d")
        } else {
            spec
        }
    }

    /// Device in firmware-recovery mode: a single USB interface, no serial
    pub fn recovery(product_id: u16, location: &str) -> Self {
        Self::new().with_usb(MOCK_VENDOR_ID, product_id, 0, None, location)
    }

    /// Unrelated third-party USB device
    pub fn unrelated_usb(vendor_id: u16, product_id: u16, location: &str) -> Self {
        Self::new().with_usb(vendor_id, product_id, 0, None, location)
    }

    fn snapshot(&self) -> InterfaceSnapshot {
        InterfaceSnapshot {
            video: self.video.clone(),
            usb: self.usb.clone(),
            hid: self.hid.clone(),
        }
    }
}

/// Timing of generated frames and HID reports
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MockStreamTiming {
    /// Delay before the first delivery
    pub first_delay: Duration,
    /// Spacing between deliveries
    pub interval: Duration,
    /// Number of deliveries per start call
    pub count: u64,
}

impl Default for MockStreamTiming {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_millis(10),
            interval: Duration::from_millis(10),
            count: 5,
        }
    }
}

#[derive(Debug)]
struct MockShared {
    attached: RwLock<InterfaceSnapshot>,
    held: RwLock<HashSet<String>>,
    timing: MockStreamTiming,
    usb_delay: Duration,
    profiles: Vec<StreamProfile>,
}

/// In-memory backend simulating attached cameras
pub struct MockDeviceBackend {
    shared: Arc<MockShared>,
    hotplug: Mutex<Option<DeviceChangedCallback>>,
}

impl Default for MockDeviceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockDeviceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDeviceBackend")
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

impl MockDeviceBackend {
    /// Create a backend with nothing attached
    pub fn new() -> Self {
        Self::with_settings(MockStreamTiming::default(), Duration::ZERO)
    }

    fn with_settings(timing: MockStreamTiming, usb_delay: Duration) -> Self {
        Self {
            shared: Arc::new(MockShared {
                attached: RwLock::new(InterfaceSnapshot::default()),
                held: RwLock::new(HashSet::new()),
                timing,
                usb_delay,
                profiles: default_profiles(),
            }),
            hotplug: Mutex::new(None),
        }
    }

    fn rebuild(self, timing: MockStreamTiming, usb_delay: Duration) -> Self {
        let attached = self.attached();
        let held = self
            .shared
            .held
            .read()
            .map(|h| h.clone())
            .unwrap_or_default();
        let rebuilt = Self::with_settings(timing, usb_delay);
        if let Ok(mut a) = rebuilt.shared.attached.write() {
            *a = attached;
        }
        if let Ok(mut h) = rebuilt.shared.held.write() {
            *h = held;
        }
        rebuilt
    }

    /// Attach a device before the backend is shared
    pub fn with_device(self, spec: MockDeviceSpec) -> Self {
        self.attach(&spec);
        self
    }

    /// Set the timing of generated frames and reports
    pub fn with_stream_timing(self, timing: MockStreamTiming) -> Self {
        let usb_delay = self.shared.usb_delay;
        self.rebuild(timing, usb_delay)
    }

    /// Delay every USB transfer by `delay`
    pub fn with_usb_delay(self, delay: Duration) -> Self {
        let timing = self.shared.timing;
        self.rebuild(timing, delay)
    }

    /// Mark an interface (by id) as exclusively held elsewhere
    pub fn hold_interface(&self, id: &str) {
        if let Ok(mut held) = self.shared.held.write() {
            held.insert(id.to_string());
        }
    }

    /// Current attached interfaces
    pub fn attached(&self) -> InterfaceSnapshot {
        self.shared
            .attached
            .read()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    fn attach(&self, spec: &MockDeviceSpec) {
        if let Ok(mut attached) = self.shared.attached.write() {
            attached.video.extend(spec.video.iter().cloned());
            attached.usb.extend(spec.usb.iter().cloned());
            attached.hid.extend(spec.hid.iter().cloned());
        }
    }

    fn notify(&self, change: DeviceChange) {
        let callback = self.hotplug.lock().ok().and_then(|c| c.clone());
        if let Some(callback) = callback {
            callback(change);
        }
    }

    /// Attach a device and notify the hot-plug subscriber
    pub fn plug(&self, spec: &MockDeviceSpec) {
        self.attach(spec);
        tracing::debug!("Mock device plugged ({} interfaces)", spec.snapshot().len());
        self.notify(DeviceChange {
            added: spec.snapshot(),
            removed: InterfaceSnapshot::default(),
        });
    }

    /// Detach every interface at `location` and notify the hot-plug subscriber
    pub fn unplug(&self, location: &str) {
        let removed = {
            let Ok(mut attached) = self.shared.attached.write() else {
                return;
            };
            let removed = InterfaceSnapshot {
                video: attached
                    .video
                    .iter()
                    .filter(|v| v.location == location)
                    .cloned()
                    .collect(),
                usb: attached
                    .usb
                    .iter()
                    .filter(|u| u.location == location)
                    .cloned()
                    .collect(),
                hid: attached
                    .hid
                    .iter()
                    .filter(|h| h.location == location)
                    .cloned()
                    .collect(),
            };
            attached.video.retain(|v| v.location != location);
            attached.usb.retain(|u| u.location != location);
            attached.hid.retain(|h| h.location != location);
            removed
        };

        if !removed.is_empty() {
            tracing::debug!("Mock device unplugged at {}", location);
            self.notify(DeviceChange {
                added: InterfaceSnapshot::default(),
                removed,
            });
        }
    }

    fn check_openable(&self, id: &str, present: bool) -> Result<()> {
        if !present {
            return Err(BackendError::DeviceNotFound(id.to_string()));
        }
        let held = self
            .shared
            .held
            .read()
            .map(|h| h.contains(id))
            .unwrap_or(false);
        if held {
            return Err(BackendError::AccessDenied(id.to_string()));
        }
        Ok(())
    }
}

fn default_profiles() -> Vec<StreamProfile> {
    vec![
        StreamProfile::new(64, 48, 30, fourcc(b"Z16 ")),
        StreamProfile::new(64, 48, 30, fourcc(b"YUYV")),
        StreamProfile::new(32, 24, 60, fourcc(b"Z16 ")),
    ]
}

impl Backend for MockDeviceBackend {
    fn query_video_interfaces(&self) -> Result<Vec<VideoInterfaceInfo>> {
        Ok(self.attached().video)
    }

    fn query_usb_interfaces(&self) -> Result<Vec<UsbInterfaceInfo>> {
        Ok(self.attached().usb)
    }

    fn query_hid_interfaces(&self) -> Result<Vec<HidInterfaceInfo>> {
        Ok(self.attached().hid)
    }

    fn open_video(&self, info: &VideoInterfaceInfo) -> Result<Box<dyn VideoDevice>> {
        let present = self.attached().video.contains(info);
        self.check_openable(&info.id, present)?;
        Ok(Box::new(MockVideoHandle {
            info: info.clone(),
            shared: self.shared.clone(),
            token: Arc::new(CancelToken::new()),
            streaming: Mutex::new(None),
            power: Mutex::new(PowerState::D0),
            xu: Mutex::new(HashMap::new()),
            pu: Mutex::new(HashMap::new()),
        }))
    }

    fn open_usb(&self, info: &UsbInterfaceInfo) -> Result<Box<dyn UsbDevice>> {
        let present = self.attached().usb.contains(info);
        self.check_openable(&info.id, present)?;
        Ok(Box::new(MockUsbHandle {
            info: info.clone(),
            delay: self.shared.usb_delay,
            token: CancelToken::new(),
        }))
    }

    fn open_hid(&self, info: &HidInterfaceInfo) -> Result<Box<dyn HidDevice>> {
        let present = self.attached().hid.contains(info);
        self.check_openable(&info.id, present)?;
        Ok(Box::new(MockHidHandle {
            info: info.clone(),
            shared: self.shared.clone(),
            token: Arc::new(CancelToken::new()),
            capture: Mutex::new(None),
        }))
    }

    fn subscribe_devices_changed(&self, callback: DeviceChangedCallback) -> Result<()> {
        if let Ok(mut slot) = self.hotplug.lock() {
            *slot = Some(callback);
        }
        Ok(())
    }

    fn unsubscribe_devices_changed(&self) -> Result<()> {
        if let Ok(mut slot) = self.hotplug.lock() {
            *slot = None;
        }
        Ok(())
    }
}

/// Deterministic payload for generated data
fn pattern(seed: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (seed as usize + i) as u8).collect()
}

/// Longest uninterrupted sleep of a generator thread
const PAUSE_SLICE: Duration = Duration::from_millis(2);

/// Sleep for `duration` in short slices; false once stopped or cancelled
fn pause(duration: Duration, stop: &AtomicBool, token: &CancelToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::SeqCst) || token.is_cancelled() {
            return false;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return true;
        }
        std::thread::sleep(left.min(PAUSE_SLICE));
    }
}

/// Running generator thread
struct Generator {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Generator {
    /// Stop the thread and wait out a delivery in progress
    fn halt(self) {
        self.stop.store(true, Ordering::SeqCst);
        // A callback stopping its own stream cannot wait for itself
        if self.thread.thread().id() != std::thread::current().id() {
            let _ = self.thread.join();
        }
    }
}

/// Spawn a generator thread delivering `timing.count` items
fn spawn_generator<F>(
    name: &str,
    timing: MockStreamTiming,
    token: Arc<CancelToken>,
    mut deliver: F,
) -> Result<Generator>
where
    F: FnMut(u64, u64) + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let thread = std::thread::Builder::new()
        .name(format!("cambackend-mock-{}", name))
        .spawn(move || {
            let start = Instant::now();
            if !pause(timing.first_delay, &flag, &token) {
                return;
            }
            for sequence in 0..timing.count {
                if sequence > 0 && !pause(timing.interval, &flag, &token) {
                    break;
                }
                deliver(sequence, start.elapsed().as_micros() as u64);
            }
        })
        .map_err(BackendError::Io)?;
    Ok(Generator { stop, thread })
}

struct MockVideoHandle {
    info: VideoInterfaceInfo,
    shared: Arc<MockShared>,
    token: Arc<CancelToken>,
    streaming: Mutex<Option<Generator>>,
    power: Mutex<PowerState>,
    xu: Mutex<HashMap<XuControl, Vec<u8>>>,
    pu: Mutex<HashMap<u32, i32>>,
}

impl VideoDevice for MockVideoHandle {
    fn info(&self) -> &VideoInterfaceInfo {
        &self.info
    }

    fn profiles(&self) -> Result<Vec<StreamProfile>> {
        self.token.check()?;
        Ok(self.shared.profiles.clone())
    }

    fn start_streaming(&self, profile: StreamProfile, callback: FrameCallback) -> Result<()> {
        self.token.check()?;
        if !self.shared.profiles.contains(&profile) {
            return Err(BackendError::InvalidArgument(format!(
                "profile {} not supported by {}",
                profile, self.info.id
            )));
        }

        let mut streaming = self
            .streaming
            .lock()
            .map_err(|_| BackendError::Transport("stream state poisoned".to_string()))?;
        if streaming.is_some() {
            return Err(BackendError::AccessDenied(format!(
                "{} is already streaming",
                self.info.id
            )));
        }

        let len = profile.frame_size();
        let generator = spawn_generator(
            &self.info.id,
            self.shared.timing,
            self.token.clone(),
            move |sequence, ts| {
                callback(Frame {
                    profile,
                    sequence,
                    timestamp_us: ts,
                    data: pattern(sequence, len),
                })
            },
        )?;
        *streaming = Some(generator);
        Ok(())
    }

    fn stop_streaming(&self) -> Result<()> {
        self.token.check()?;
        let generator = self.streaming.lock().ok().and_then(|mut s| s.take());
        if let Some(generator) = generator {
            generator.halt();
        }
        Ok(())
    }

    fn power_state(&self) -> Result<PowerState> {
        self.token.check()?;
        Ok(self.power.lock().map(|p| *p).unwrap_or_default())
    }

    fn set_power_state(&self, state: PowerState) -> Result<()> {
        self.token.check()?;
        if let Ok(mut power) = self.power.lock() {
            *power = state;
        }
        Ok(())
    }

    fn get_xu(&self, control: XuControl, len: usize) -> Result<Vec<u8>> {
        self.token.check()?;
        let stored = self
            .xu
            .lock()
            .ok()
            .and_then(|xu| xu.get(&control).cloned());
        let mut value = stored.unwrap_or_default();
        value.resize(len, 0);
        Ok(value)
    }

    fn set_xu(&self, control: XuControl, data: &[u8]) -> Result<()> {
        self.token.check()?;
        if let Ok(mut xu) = self.xu.lock() {
            xu.insert(control, data.to_vec());
        }
        Ok(())
    }

    fn get_pu(&self, control: u32) -> Result<i32> {
        self.token.check()?;
        Ok(self
            .pu
            .lock()
            .ok()
            .and_then(|pu| pu.get(&control).copied())
            .unwrap_or(0))
    }

    fn set_pu(&self, control: u32, value: i32) -> Result<()> {
        self.token.check()?;
        if let Ok(mut pu) = self.pu.lock() {
            pu.insert(control, value);
        }
        Ok(())
    }

    fn close(&self) {
        self.token.cancel();
    }
}

struct MockUsbHandle {
    info: UsbInterfaceInfo,
    delay: Duration,
    token: CancelToken,
}

impl UsbDevice for MockUsbHandle {
    fn info(&self) -> &UsbInterfaceInfo {
        &self.info
    }

    fn send_receive(
        &self,
        data: &[u8],
        _timeout: Duration,
        require_response: bool,
    ) -> Result<Vec<u8>> {
        let request = data.to_vec();
        let delay = self.delay;
        run_cancellable(&self.token, move || {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            // The simulated firmware echoes the opcode word followed by the payload
            if require_response {
                Ok(request)
            } else {
                Ok(Vec::new())
            }
        })
    }

    fn close(&self) {
        self.token.cancel();
    }
}

struct MockHidHandle {
    info: HidInterfaceInfo,
    shared: Arc<MockShared>,
    token: Arc<CancelToken>,
    capture: Mutex<Option<Generator>>,
}

impl HidDevice for MockHidHandle {
    fn info(&self) -> &HidInterfaceInfo {
        &self.info
    }

    fn sensors(&self) -> Result<Vec<HidSensor>> {
        self.token.check()?;
        Ok(vec![HidSensor {
            name: self.info.sensor_name.clone(),
        }])
    }

    fn start_capture(&self, callback: HidCallback) -> Result<()> {
        self.token.check()?;
        let mut capture = self
            .capture
            .lock()
            .map_err(|_| BackendError::Transport("capture state poisoned".to_string()))?;
        if capture.is_some() {
            return Err(BackendError::AccessDenied(format!(
                "{} is already capturing",
                self.info.id
            )));
        }

        let sensor = self.info.sensor_name.clone();
        let generator = spawn_generator(
            &self.info.id,
            self.shared.timing,
            self.token.clone(),
            move |sequence, ts| {
                callback(HidSample {
                    sensor: sensor.clone(),
                    sequence,
                    timestamp_us: ts,
                    data: pattern(sequence * 3, 12),
                })
            },
        )?;
        *capture = Some(generator);
        Ok(())
    }

    fn stop_capture(&self) -> Result<()> {
        self.token.check()?;
        let generator = self.capture.lock().ok().and_then(|mut c| c.take());
        if let Some(generator) = generator {
            generator.halt();
        }
        Ok(())
    }

    fn write_report(&self, data: &[u8]) -> Result<()> {
        self.token.check()?;
        if data.is_empty() {
            return Err(BackendError::InvalidArgument("empty HID report".to_string()));
        }
        Ok(())
    }

    fn close(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_presets_enumerate() {
        let backend = MockDeviceBackend::new()
            .with_device(MockDeviceSpec::sr300("SR-1", "1-1"))
            .with_device(MockDeviceSpec::ds5(0x0AD3, "DS-1", "1-2", true));

        assert_eq!(backend.query_video_interfaces().unwrap().len(), 4);
        assert_eq!(backend.query_usb_interfaces().unwrap().len(), 2);
        assert_eq!(backend.query_hid_interfaces().unwrap().len(), 2);
    }

    #[test]
    fn test_open_held_interface_is_denied() {
        let backend = MockDeviceBackend::new().with_device(MockDeviceSpec::sr300("SR-1", "1-1"));
        let usb = backend.query_usb_interfaces().unwrap();
        backend.hold_interface(&usb[0].id);

        assert!(matches!(
            backend.open_usb(&usb[0]),
            Err(BackendError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_open_stale_descriptor_not_found() {
        let backend = MockDeviceBackend::new().with_device(MockDeviceSpec::sr300("SR-1", "1-1"));
        let video = backend.query_video_interfaces().unwrap();
        backend.unplug("1-1");

        assert!(matches!(
            backend.open_video(&video[0]),
            Err(BackendError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_streaming_delivers_frames() {
        let backend = MockDeviceBackend::new()
            .with_device(MockDeviceSpec::sr300("SR-1", "1-1"))
            .with_stream_timing(MockStreamTiming {
                first_delay: Duration::ZERO,
                interval: Duration::from_millis(1),
                count: 3,
            });
        let video = backend.query_video_interfaces().unwrap();
        let device = backend.open_video(&video[0]).unwrap();
        let profile = device.profiles().unwrap()[0];

        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        device
            .start_streaming(
                profile,
                Arc::new(move |frame: Frame| {
                    assert_eq!(frame.data.len(), profile.frame_size());
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(received.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_no_frame_after_stop_streaming() {
        let backend = MockDeviceBackend::new()
            .with_device(MockDeviceSpec::sr300("SR-1", "1-1"))
            .with_stream_timing(MockStreamTiming {
                first_delay: Duration::ZERO,
                interval: Duration::from_millis(1),
                count: 100_000,
            });
        let video = backend.query_video_interfaces().unwrap();
        let device = backend.open_video(&video[0]).unwrap();
        let profile = device.profiles().unwrap()[0];

        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        device
            .start_streaming(
                profile,
                Arc::new(move |_frame: Frame| {
                    // Widen the window between the stop check and delivery
                    std::thread::sleep(Duration::from_millis(3));
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        device.stop_streaming().unwrap();
        let at_stop = received.load(Ordering::SeqCst);
        assert!(at_stop > 0);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(received.load(Ordering::SeqCst), at_stop);
    }

    #[test]
    fn test_hotplug_notifies_subscriber() {
        let backend = MockDeviceBackend::new();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        backend
            .subscribe_devices_changed(Arc::new(move |change| {
                sink.lock().unwrap().push(change);
            }))
            .unwrap();

        backend.plug(&MockDeviceSpec::recovery(0x0ADB, "2-1"));
        backend.unplug("2-1");

        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].added.usb.len(), 1);
        assert_eq!(changes[1].removed.usb.len(), 1);
    }

    #[test]
    fn test_xu_and_pu_roundtrip() {
        let backend = MockDeviceBackend::new().with_device(MockDeviceSpec::sr300("SR-1", "1-1"));
        let video = backend.query_video_interfaces().unwrap();
        let device = backend.open_video(&video[0]).unwrap();

        let control = XuControl::new(6, 2);
        device.set_xu(control, &[1, 2, 3]).unwrap();
        assert_eq!(device.get_xu(control, 4).unwrap(), vec![1, 2, 3, 0]);

        device.set_pu(0x0098_0900, 42).unwrap();
        assert_eq!(device.get_pu(0x0098_0900).unwrap(), 42);

        device.close();
        assert!(matches!(device.get_pu(1), Err(BackendError::Cancelled)));
    }
}
