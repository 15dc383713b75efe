//! Playback backend
//!
//! [`PlaybackBackend`] answers every backend and device call from a
//! recorded section, without touching hardware. Calls must arrive in the
//! recorded order; the first divergence returns `PlaybackMismatch` and
//! poisons the instance so that every later call fails the same way.
//!
//! Asynchronous deliveries are replayed by a clock thread at the recorded
//! pace (scaled by the configured speed) to whichever callback is
//! registered for their source at that moment.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};

use crate::backend::{
    Backend, DeviceChangedCallback, FrameCallback, HidCallback, HidDevice, UsbDevice, VideoDevice,
};
use crate::config::PlaybackConfig;
use crate::error::{BackendError, Result};
use crate::types::{
    Frame, HidInterfaceInfo, HidSample, HidSensor, PowerState, StreamProfile, UsbInterfaceInfo,
    VideoInterfaceInfo, XuControl,
};

use super::log::SessionLog;
use super::types::{
    describe_call, CallEntry, CallKind, CallOutcome, CallValue, EventEntry, EventPayload,
    EventSource,
};

/// Callback registered for one event source
#[derive(Clone)]
enum Listener {
    Frames(FrameCallback),
    Reports(HidCallback),
    Hotplug(DeviceChangedCallback),
}

/// Position in the recorded call sequence
struct Cursor {
    calls: Vec<CallEntry>,
    position: usize,
    /// First divergence, repeated for every later call
    poisoned: Option<(u64, String, String)>,
}

struct PlaybackShared {
    cursor: Mutex<Cursor>,
    listeners: RwLock<HashMap<EventSource, Listener>>,
}

fn mismatch(seq: u64, expected: &str, actual: &str) -> BackendError {
    BackendError::PlaybackMismatch {
        seq,
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

fn unexpected_value(entry: &CallEntry) -> BackendError {
    BackendError::InvalidRecording(format!(
        "entry {} ({}) holds a result of the wrong type",
        entry.seq,
        entry.describe()
    ))
}

impl PlaybackShared {
    /// Consume the next recorded call, which must be `call` on `target`
    fn next(&self, call: CallKind, target: Option<u64>) -> Result<CallEntry> {
        let mut cursor = self
            .cursor
            .lock()
            .map_err(|_| BackendError::Transport("playback cursor poisoned".to_string()))?;

        if let Some((seq, expected, actual)) = &cursor.poisoned {
            return Err(mismatch(*seq, expected, actual));
        }

        let actual = describe_call(call, target);
        let position = cursor.position;
        let divergence = match cursor.calls.get(position) {
            Some(entry) if entry.call == call && entry.target == target => None,
            Some(entry) => Some((entry.seq, entry.describe())),
            None => {
                let seq = cursor.calls.last().map(|e| e.seq + 1).unwrap_or(0);
                Some((seq, "end of recording".to_string()))
            }
        };

        let Some((seq, expected)) = divergence else {
            let entry = cursor.calls[position].clone();
            cursor.position += 1;
            return Ok(entry);
        };
        tracing::error!(
            "Playback diverged at entry {}: recorded {}, called {}",
            seq,
            expected,
            actual
        );
        cursor.poisoned = Some((seq, expected.clone(), actual.clone()));
        Err(mismatch(seq, &expected, &actual))
    }

    /// Consume the next call and return its recorded value, or its recorded error
    fn replay(&self, call: CallKind, target: Option<u64>) -> Result<(CallEntry, CallValue)> {
        let entry = self.next(call, target)?;
        match entry.outcome.clone() {
            CallOutcome::Ok(value) => Ok((entry, value)),
            CallOutcome::Err(err) => Err(err.into()),
            CallOutcome::Pending => Err(BackendError::InvalidRecording(format!(
                "entry {} ({}) never returned in the recording",
                entry.seq,
                entry.describe()
            ))),
        }
    }

    fn replay_unit(&self, call: CallKind, target: Option<u64>) -> Result<()> {
        match self.replay(call, target)? {
            (_, CallValue::Unit) => Ok(()),
            (entry, _) => Err(unexpected_value(&entry)),
        }
    }

    fn listen(&self, source: EventSource, listener: Listener) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.insert(source, listener);
        }
    }

    fn forget(&self, source: &EventSource) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.remove(source);
        }
    }

    /// Hand one recorded event to its listener, if any
    fn deliver(&self, event: &EventEntry) {
        // Clone out so the callback runs without the registry lock
        let listener = self
            .listeners
            .read()
            .ok()
            .and_then(|l| l.get(&event.source).cloned());
        let Some(listener) = listener else {
            tracing::trace!("Dropping event {} from {}: no listener", event.seq, event.source);
            return;
        };

        match (&event.payload, listener) {
            (
                EventPayload::Frame {
                    profile,
                    sequence,
                    frame_timestamp_us,
                    data,
                },
                Listener::Frames(callback),
            ) => match data.decode() {
                Ok(data) => callback(Frame {
                    profile: *profile,
                    sequence: *sequence,
                    timestamp_us: *frame_timestamp_us,
                    data,
                }),
                Err(e) => tracing::warn!("Skipping frame event {}: {}", event.seq, e),
            },
            (
                EventPayload::HidSample {
                    sensor,
                    sequence,
                    sample_timestamp_us,
                    data,
                },
                Listener::Reports(callback),
            ) => match data.decode() {
                Ok(data) => callback(HidSample {
                    sensor: sensor.clone(),
                    sequence: *sequence,
                    timestamp_us: *sample_timestamp_us,
                    data,
                }),
                Err(e) => tracing::warn!("Skipping HID event {}: {}", event.seq, e),
            },
            (EventPayload::DevicesChanged { change }, Listener::Hotplug(callback)) => {
                callback(change.clone())
            }
            _ => tracing::warn!(
                "Event {} from {} does not match its listener",
                event.seq,
                event.source
            ),
        }
    }
}

// ==================== Replay clock ====================

/// Thread delivering recorded events at their recorded offsets
struct ReplayClock {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ReplayClock {
    fn spawn(shared: Arc<PlaybackShared>, events: Vec<EventEntry>, speed: f64) -> Result<Self> {
        let (shutdown, shutdown_rx) = bounded::<()>(0);
        let handle = std::thread::Builder::new()
            .name("cambackend-replay".to_string())
            .spawn(move || {
                let start = Instant::now();
                for event in &events {
                    let due = Duration::from_secs_f64(event.timestamp_us as f64 / 1e6 / speed);
                    let wait = due.saturating_sub(start.elapsed());
                    match shutdown_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => shared.deliver(event),
                        _ => return,
                    }
                }
                tracing::debug!("Replay clock delivered {} events", events.len());
            })?;

        Ok(Self {
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }
}

impl Drop for ReplayClock {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            // A callback dropping the backend runs on the clock thread itself
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

// ==================== Backend ====================

/// Backend answering calls from a recorded session
///
/// Event timestamps count from the creation of the recording's
/// [`SessionWriter`](super::SessionWriter), while the replay clock starts
/// when this backend is built. Events therefore fire at their recorded
/// offset from construction, not from the first replayed call; an event
/// recorded shortly after the writer opened may fire before the caller has
/// subscribed to its source, in which case it is dropped.
pub struct PlaybackBackend {
    shared: Arc<PlaybackShared>,
    _clock: ReplayClock,
}

impl PlaybackBackend {
    /// Load section `section` of the log at `path` and start the replay clock
    pub fn open(path: impl AsRef<Path>, section: &str, config: &PlaybackConfig) -> Result<Self> {
        let log = SessionLog::load(path.as_ref(), section)?;
        tracing::info!(
            "Replaying section '{}' recorded {} ({} calls, {} events)",
            section,
            log.header.recorded_at.to_rfc3339(),
            log.calls.len(),
            log.events.len()
        );
        Self::from_log(log, config)
    }

    /// Replay an already loaded section
    pub fn from_log(log: SessionLog, config: &PlaybackConfig) -> Result<Self> {
        let shared = Arc::new(PlaybackShared {
            cursor: Mutex::new(Cursor {
                calls: log.calls,
                position: 0,
                poisoned: None,
            }),
            listeners: RwLock::new(HashMap::new()),
        });
        let clock = ReplayClock::spawn(shared.clone(), log.events, config.effective_speed())?;
        Ok(Self {
            shared,
            _clock: clock,
        })
    }

    /// Whether a divergence has poisoned this instance
    pub fn is_poisoned(&self) -> bool {
        self.shared
            .cursor
            .lock()
            .map(|c| c.poisoned.is_some())
            .unwrap_or(true)
    }

    /// Number of recorded calls not yet replayed
    pub fn remaining_calls(&self) -> usize {
        self.shared
            .cursor
            .lock()
            .map(|c| c.calls.len() - c.position)
            .unwrap_or(0)
    }

    fn replay_handle(&self, call: CallKind) -> Result<u64> {
        match self.shared.replay(call, None)? {
            (_, CallValue::Handle(handle)) => Ok(handle),
            (entry, _) => Err(unexpected_value(&entry)),
        }
    }
}

impl Backend for PlaybackBackend {
    fn query_video_interfaces(&self) -> Result<Vec<VideoInterfaceInfo>> {
        match self.shared.replay(CallKind::QueryVideoInterfaces, None)? {
            (_, CallValue::VideoInterfaces(list)) => Ok(list),
            (entry, _) => Err(unexpected_value(&entry)),
        }
    }

    fn query_usb_interfaces(&self) -> Result<Vec<UsbInterfaceInfo>> {
        match self.shared.replay(CallKind::QueryUsbInterfaces, None)? {
            (_, CallValue::UsbInterfaces(list)) => Ok(list),
            (entry, _) => Err(unexpected_value(&entry)),
        }
    }

    fn query_hid_interfaces(&self) -> Result<Vec<HidInterfaceInfo>> {
        match self.shared.replay(CallKind::QueryHidInterfaces, None)? {
            (_, CallValue::HidInterfaces(list)) => Ok(list),
            (entry, _) => Err(unexpected_value(&entry)),
        }
    }

    fn open_video(&self, info: &VideoInterfaceInfo) -> Result<Box<dyn VideoDevice>> {
        let handle = self.replay_handle(CallKind::OpenVideo)?;
        Ok(Box::new(PlaybackVideoDevice {
            info: info.clone(),
            handle,
            shared: self.shared.clone(),
        }))
    }

    fn open_usb(&self, info: &UsbInterfaceInfo) -> Result<Box<dyn UsbDevice>> {
        let handle = self.replay_handle(CallKind::OpenUsb)?;
        Ok(Box::new(PlaybackUsbDevice {
            info: info.clone(),
            handle,
            shared: self.shared.clone(),
        }))
    }

    fn open_hid(&self, info: &HidInterfaceInfo) -> Result<Box<dyn HidDevice>> {
        let handle = self.replay_handle(CallKind::OpenHid)?;
        Ok(Box::new(PlaybackHidDevice {
            info: info.clone(),
            handle,
            shared: self.shared.clone(),
        }))
    }

    fn subscribe_devices_changed(&self, callback: DeviceChangedCallback) -> Result<()> {
        self.shared
            .replay_unit(CallKind::SubscribeDevicesChanged, None)?;
        self.shared
            .listen(EventSource::Hotplug, Listener::Hotplug(callback));
        Ok(())
    }

    fn unsubscribe_devices_changed(&self) -> Result<()> {
        let result = self
            .shared
            .replay_unit(CallKind::UnsubscribeDevicesChanged, None);
        self.shared.forget(&EventSource::Hotplug);
        result
    }
}

// ==================== Device stand-ins ====================

struct PlaybackVideoDevice {
    info: VideoInterfaceInfo,
    handle: u64,
    shared: Arc<PlaybackShared>,
}

impl PlaybackVideoDevice {
    fn source(&self) -> EventSource {
        EventSource::Video {
            handle: self.handle,
        }
    }
}

impl VideoDevice for PlaybackVideoDevice {
    fn info(&self) -> &VideoInterfaceInfo {
        &self.info
    }

    fn profiles(&self) -> Result<Vec<StreamProfile>> {
        match self.shared.replay(CallKind::VideoProfiles, Some(self.handle))? {
            (_, CallValue::Profiles(profiles)) => Ok(profiles),
            (entry, _) => Err(unexpected_value(&entry)),
        }
    }

    fn start_streaming(&self, _profile: StreamProfile, callback: FrameCallback) -> Result<()> {
        self.shared
            .replay_unit(CallKind::VideoStartStreaming, Some(self.handle))?;
        self.shared.listen(self.source(), Listener::Frames(callback));
        Ok(())
    }

    fn stop_streaming(&self) -> Result<()> {
        let result = self
            .shared
            .replay_unit(CallKind::VideoStopStreaming, Some(self.handle));
        self.shared.forget(&self.source());
        result
    }

    fn power_state(&self) -> Result<PowerState> {
        match self.shared.replay(CallKind::VideoPowerState, Some(self.handle))? {
            (_, CallValue::PowerState(state)) => Ok(state),
            (entry, _) => Err(unexpected_value(&entry)),
        }
    }

    fn set_power_state(&self, _state: PowerState) -> Result<()> {
        self.shared
            .replay_unit(CallKind::VideoSetPowerState, Some(self.handle))
    }

    fn get_xu(&self, _control: XuControl, _len: usize) -> Result<Vec<u8>> {
        match self.shared.replay(CallKind::VideoGetXu, Some(self.handle))? {
            (_, CallValue::Bytes(data)) => Ok(data),
            (entry, _) => Err(unexpected_value(&entry)),
        }
    }

    fn set_xu(&self, _control: XuControl, _data: &[u8]) -> Result<()> {
        self.shared.replay_unit(CallKind::VideoSetXu, Some(self.handle))
    }

    fn get_pu(&self, _control: u32) -> Result<i32> {
        match self.shared.replay(CallKind::VideoGetPu, Some(self.handle))? {
            (_, CallValue::Int(value)) => Ok(value),
            (entry, _) => Err(unexpected_value(&entry)),
        }
    }

    fn set_pu(&self, _control: u32, _value: i32) -> Result<()> {
        self.shared.replay_unit(CallKind::VideoSetPu, Some(self.handle))
    }

    fn close(&self) {
        self.shared.forget(&self.source());
        if let Err(e) = self.shared.replay_unit(CallKind::VideoClose, Some(self.handle)) {
            tracing::debug!("Replayed close of video handle {}: {}", self.handle, e);
        }
    }
}

struct PlaybackUsbDevice {
    info: UsbInterfaceInfo,
    handle: u64,
    shared: Arc<PlaybackShared>,
}

impl UsbDevice for PlaybackUsbDevice {
    fn info(&self) -> &UsbInterfaceInfo {
        &self.info
    }

    fn send_receive(
        &self,
        _data: &[u8],
        _timeout: Duration,
        _require_response: bool,
    ) -> Result<Vec<u8>> {
        match self.shared.replay(CallKind::UsbSendReceive, Some(self.handle))? {
            (_, CallValue::Bytes(data)) => Ok(data),
            (entry, _) => Err(unexpected_value(&entry)),
        }
    }

    fn close(&self) {
        if let Err(e) = self.shared.replay_unit(CallKind::UsbClose, Some(self.handle)) {
            tracing::debug!("Replayed close of USB handle {}: {}", self.handle, e);
        }
    }
}

struct PlaybackHidDevice {
    info: HidInterfaceInfo,
    handle: u64,
    shared: Arc<PlaybackShared>,
}

impl PlaybackHidDevice {
    fn source(&self) -> EventSource {
        EventSource::Hid {
            handle: self.handle,
        }
    }
}

impl HidDevice for PlaybackHidDevice {
    fn info(&self) -> &HidInterfaceInfo {
        &self.info
    }

    fn sensors(&self) -> Result<Vec<HidSensor>> {
        match self.shared.replay(CallKind::HidSensors, Some(self.handle))? {
            (_, CallValue::Sensors(sensors)) => Ok(sensors),
            (entry, _) => Err(unexpected_value(&entry)),
        }
    }

    fn start_capture(&self, callback: HidCallback) -> Result<()> {
        self.shared
            .replay_unit(CallKind::HidStartCapture, Some(self.handle))?;
        self.shared.listen(self.source(), Listener::Reports(callback));
        Ok(())
    }

    fn stop_capture(&self) -> Result<()> {
        let result = self
            .shared
            .replay_unit(CallKind::HidStopCapture, Some(self.handle));
        self.shared.forget(&self.source());
        result
    }

    fn write_report(&self, _data: &[u8]) -> Result<()> {
        self.shared
            .replay_unit(CallKind::HidWriteReport, Some(self.handle))
    }

    fn close(&self) {
        self.shared.forget(&self.source());
        if let Err(e) = self.shared.replay_unit(CallKind::HidClose, Some(self.handle)) {
            tracing::debug!("Replayed close of HID handle {}: {}", self.handle, e);
        }
    }
}
