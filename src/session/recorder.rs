//! Recording backend
//!
//! [`RecordingBackend`] wraps a live backend and forwards every call to it
//! unchanged, logging the call, its arguments and its outcome. Opened
//! devices are wrapped too, and each gets a handle id so later calls and
//! deliveries can be matched to it on replay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{
    Backend, DeviceChangedCallback, FrameCallback, HidCallback, HidDevice, UsbDevice, VideoDevice,
};
use crate::error::{RecordedError, Result};
use crate::types::{
    HidInterfaceInfo, HidSensor, PowerState, StreamProfile, UsbInterfaceInfo, VideoInterfaceInfo,
    XuControl,
};

use super::types::{CallArgs, CallKind, CallOutcome, CallValue, EventPayload, EventSource};
use super::writer::SessionWriter;

/// Log the call, run `f`, then log how it returned
///
/// The start is on disk before `f` runs, so a call that blocks or never
/// returns still shows up in the log.
fn record_call<T>(
    writer: &SessionWriter,
    call: CallKind,
    target: Option<u64>,
    args: CallArgs,
    f: impl FnOnce() -> Result<T>,
    value: impl FnOnce(&T) -> CallValue,
) -> Result<T> {
    let seq = writer.start_call(call, target, args);
    let result = f();
    let outcome = match &result {
        Ok(v) => CallOutcome::Ok(value(v)),
        Err(e) => CallOutcome::Err(RecordedError::from(e)),
    };
    writer.finish_call(seq, outcome);
    result
}

fn unit<T>(_: &T) -> CallValue {
    CallValue::Unit
}

/// Backend decorator that logs every call to a session log
pub struct RecordingBackend {
    inner: Box<dyn Backend>,
    writer: Arc<SessionWriter>,
    next_handle: AtomicU64,
}

impl RecordingBackend {
    /// Wrap `inner`, logging through `writer`
    pub fn new(inner: Box<dyn Backend>, writer: SessionWriter) -> Self {
        Self {
            inner,
            writer: Arc::new(writer),
            next_handle: AtomicU64::new(1),
        }
    }

    /// The writer this backend logs through
    pub fn writer(&self) -> &SessionWriter {
        &self.writer
    }

    fn allocate_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }
}

impl Backend for RecordingBackend {
    fn query_video_interfaces(&self) -> Result<Vec<VideoInterfaceInfo>> {
        record_call(
            &self.writer,
            CallKind::QueryVideoInterfaces,
            None,
            CallArgs::None,
            || self.inner.query_video_interfaces(),
            |v| CallValue::VideoInterfaces(v.clone()),
        )
    }

    fn query_usb_interfaces(&self) -> Result<Vec<UsbInterfaceInfo>> {
        record_call(
            &self.writer,
            CallKind::QueryUsbInterfaces,
            None,
            CallArgs::None,
            || self.inner.query_usb_interfaces(),
            |v| CallValue::UsbInterfaces(v.clone()),
        )
    }

    fn query_hid_interfaces(&self) -> Result<Vec<HidInterfaceInfo>> {
        record_call(
            &self.writer,
            CallKind::QueryHidInterfaces,
            None,
            CallArgs::None,
            || self.inner.query_hid_interfaces(),
            |v| CallValue::HidInterfaces(v.clone()),
        )
    }

    fn open_video(&self, info: &VideoInterfaceInfo) -> Result<Box<dyn VideoDevice>> {
        let (handle, device) = record_call(
            &self.writer,
            CallKind::OpenVideo,
            None,
            CallArgs::Video { info: info.clone() },
            || {
                self.inner
                    .open_video(info)
                    .map(|device| (self.allocate_handle(), device))
            },
            |(handle, _)| CallValue::Handle(*handle),
        )?;
        tracing::debug!("Recording video handle {} for {}", handle, info.id);
        Ok(Box::new(RecordingVideoDevice {
            inner: device,
            handle,
            writer: self.writer.clone(),
        }))
    }

    fn open_usb(&self, info: &UsbInterfaceInfo) -> Result<Box<dyn UsbDevice>> {
        let (handle, device) = record_call(
            &self.writer,
            CallKind::OpenUsb,
            None,
            CallArgs::Usb { info: info.clone() },
            || {
                self.inner
                    .open_usb(info)
                    .map(|device| (self.allocate_handle(), device))
            },
            |(handle, _)| CallValue::Handle(*handle),
        )?;
        tracing::debug!("Recording USB handle {} for {}", handle, info.id);
        Ok(Box::new(RecordingUsbDevice::new(
            device,
            handle,
            self.writer.clone(),
        )))
    }

    fn open_hid(&self, info: &HidInterfaceInfo) -> Result<Box<dyn HidDevice>> {
        let (handle, device) = record_call(
            &self.writer,
            CallKind::OpenHid,
            None,
            CallArgs::Hid { info: info.clone() },
            || {
                self.inner
                    .open_hid(info)
                    .map(|device| (self.allocate_handle(), device))
            },
            |(handle, _)| CallValue::Handle(*handle),
        )?;
        tracing::debug!("Recording HID handle {} for {}", handle, info.id);
        Ok(Box::new(RecordingHidDevice {
            inner: device,
            handle,
            writer: self.writer.clone(),
        }))
    }

    fn subscribe_devices_changed(&self, callback: DeviceChangedCallback) -> Result<()> {
        let writer = self.writer.clone();
        let wrapped: DeviceChangedCallback = Arc::new(move |change| {
            writer.write_event(
                EventSource::Hotplug,
                EventPayload::DevicesChanged {
                    change: change.clone(),
                },
            );
            callback(change);
        });
        record_call(
            &self.writer,
            CallKind::SubscribeDevicesChanged,
            None,
            CallArgs::None,
            || self.inner.subscribe_devices_changed(wrapped),
            unit,
        )
    }

    fn unsubscribe_devices_changed(&self) -> Result<()> {
        record_call(
            &self.writer,
            CallKind::UnsubscribeDevicesChanged,
            None,
            CallArgs::None,
            || self.inner.unsubscribe_devices_changed(),
            unit,
        )
    }
}

// ==================== Device wrappers ====================

struct RecordingVideoDevice {
    inner: Box<dyn VideoDevice>,
    handle: u64,
    writer: Arc<SessionWriter>,
}

impl VideoDevice for RecordingVideoDevice {
    fn info(&self) -> &VideoInterfaceInfo {
        self.inner.info()
    }

    fn profiles(&self) -> Result<Vec<StreamProfile>> {
        record_call(
            &self.writer,
            CallKind::VideoProfiles,
            Some(self.handle),
            CallArgs::None,
            || self.inner.profiles(),
            |p| CallValue::Profiles(p.clone()),
        )
    }

    fn start_streaming(&self, profile: StreamProfile, callback: FrameCallback) -> Result<()> {
        let writer = self.writer.clone();
        let source = EventSource::Video {
            handle: self.handle,
        };
        let wrapped: FrameCallback = Arc::new(move |frame| {
            match EventPayload::from_frame(&frame, writer.mode()) {
                Ok(payload) => writer.write_event(source, payload),
                Err(e) => writer.fail(&e),
            }
            callback(frame);
        });
        record_call(
            &self.writer,
            CallKind::VideoStartStreaming,
            Some(self.handle),
            CallArgs::Profile { profile },
            || self.inner.start_streaming(profile, wrapped),
            unit,
        )
    }

    fn stop_streaming(&self) -> Result<()> {
        record_call(
            &self.writer,
            CallKind::VideoStopStreaming,
            Some(self.handle),
            CallArgs::None,
            || self.inner.stop_streaming(),
            unit,
        )
    }

    fn power_state(&self) -> Result<PowerState> {
        record_call(
            &self.writer,
            CallKind::VideoPowerState,
            Some(self.handle),
            CallArgs::None,
            || self.inner.power_state(),
            |s| CallValue::PowerState(*s),
        )
    }

    fn set_power_state(&self, state: PowerState) -> Result<()> {
        record_call(
            &self.writer,
            CallKind::VideoSetPowerState,
            Some(self.handle),
            CallArgs::PowerState { state },
            || self.inner.set_power_state(state),
            unit,
        )
    }

    fn get_xu(&self, control: XuControl, len: usize) -> Result<Vec<u8>> {
        record_call(
            &self.writer,
            CallKind::VideoGetXu,
            Some(self.handle),
            CallArgs::XuRead { control, len },
            || self.inner.get_xu(control, len),
            |data| CallValue::Bytes(data.clone()),
        )
    }

    fn set_xu(&self, control: XuControl, data: &[u8]) -> Result<()> {
        record_call(
            &self.writer,
            CallKind::VideoSetXu,
            Some(self.handle),
            CallArgs::XuWrite {
                control,
                data: data.to_vec(),
            },
            || self.inner.set_xu(control, data),
            unit,
        )
    }

    fn get_pu(&self, control: u32) -> Result<i32> {
        record_call(
            &self.writer,
            CallKind::VideoGetPu,
            Some(self.handle),
            CallArgs::PuRead { control },
            || self.inner.get_pu(control),
            |v| CallValue::Int(*v),
        )
    }

    fn set_pu(&self, control: u32, value: i32) -> Result<()> {
        record_call(
            &self.writer,
            CallKind::VideoSetPu,
            Some(self.handle),
            CallArgs::PuWrite { control, value },
            || self.inner.set_pu(control, value),
            unit,
        )
    }

    fn close(&self) {
        let _ = record_call(
            &self.writer,
            CallKind::VideoClose,
            Some(self.handle),
            CallArgs::None,
            || {
                self.inner.close();
                Ok(())
            },
            unit,
        );
    }
}

pub(crate) struct RecordingUsbDevice {
    inner: Box<dyn UsbDevice>,
    handle: u64,
    writer: Arc<SessionWriter>,
}

impl RecordingUsbDevice {
    pub(crate) fn new(inner: Box<dyn UsbDevice>, handle: u64, writer: Arc<SessionWriter>) -> Self {
        Self {
            inner,
            handle,
            writer,
        }
    }
}

impl UsbDevice for RecordingUsbDevice {
    fn info(&self) -> &UsbInterfaceInfo {
        self.inner.info()
    }

    fn send_receive(
        &self,
        data: &[u8],
        timeout: Duration,
        require_response: bool,
    ) -> Result<Vec<u8>> {
        record_call(
            &self.writer,
            CallKind::UsbSendReceive,
            Some(self.handle),
            CallArgs::Transfer {
                data: data.to_vec(),
                timeout_ms: timeout.as_millis() as u64,
                require_response,
            },
            || self.inner.send_receive(data, timeout, require_response),
            |response| CallValue::Bytes(response.clone()),
        )
    }

    fn close(&self) {
        let _ = record_call(
            &self.writer,
            CallKind::UsbClose,
            Some(self.handle),
            CallArgs::None,
            || {
                self.inner.close();
                Ok(())
            },
            unit,
        );
    }
}

struct RecordingHidDevice {
    inner: Box<dyn HidDevice>,
    handle: u64,
    writer: Arc<SessionWriter>,
}

impl HidDevice for RecordingHidDevice {
    fn info(&self) -> &HidInterfaceInfo {
        self.inner.info()
    }

    fn sensors(&self) -> Result<Vec<HidSensor>> {
        record_call(
            &self.writer,
            CallKind::HidSensors,
            Some(self.handle),
            CallArgs::None,
            || self.inner.sensors(),
            |s| CallValue::Sensors(s.clone()),
        )
    }

    fn start_capture(&self, callback: HidCallback) -> Result<()> {
        let writer = self.writer.clone();
        let source = EventSource::Hid {
            handle: self.handle,
        };
        let wrapped: HidCallback = Arc::new(move |sample| {
            match EventPayload::from_hid_sample(&sample, writer.mode()) {
                Ok(payload) => writer.write_event(source, payload),
                Err(e) => writer.fail(&e),
            }
            callback(sample);
        });
        record_call(
            &self.writer,
            CallKind::HidStartCapture,
            Some(self.handle),
            CallArgs::None,
            || self.inner.start_capture(wrapped),
            unit,
        )
    }

    fn stop_capture(&self) -> Result<()> {
        record_call(
            &self.writer,
            CallKind::HidStopCapture,
            Some(self.handle),
            CallArgs::None,
            || self.inner.stop_capture(),
            unit,
        )
    }

    fn write_report(&self, data: &[u8]) -> Result<()> {
        record_call(
            &self.writer,
            CallKind::HidWriteReport,
            Some(self.handle),
            CallArgs::Report {
                data: data.to_vec(),
            },
            || self.inner.write_report(data),
            unit,
        )
    }

    fn close(&self) {
        let _ = record_call(
            &self.writer,
            CallKind::HidClose,
            Some(self.handle),
            CallArgs::None,
            || {
                self.inner.close();
                Ok(())
            },
            unit,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockDeviceBackend, MockDeviceSpec, MockUsbDevice};
    use crate::error::BackendError;
    use crate::session::types::{LogRecord, RecordingMode};
    use crate::session::SessionLog;
    use tempfile::TempDir;

    fn usb_info() -> UsbInterfaceInfo {
        UsbInterfaceInfo {
            id: "1-1:1.4".to_string(),
            vendor_id: 0x8086,
            product_id: 0x0AA5,
            interface_number: 4,
            serial: Some("SR-1".to_string()),
            location: "1-1".to_string(),
            device_path: "/dev/bus/usb/001/002".to_string(),
        }
    }

    #[test]
    fn test_transport_error_is_passed_through_and_logged() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");
        let writer = Arc::new(
            SessionWriter::create(&path, "s", RecordingMode::BestQuality, true).unwrap(),
        );

        let info = usb_info();
        let mut mock = MockUsbDevice::new();
        mock.expect_info().return_const(info);
        mock.expect_send_receive()
            .times(1)
            .returning(|_, _, _| Err(BackendError::AccessDenied("claimed by kernel".to_string())));
        mock.expect_close().times(1).return_const(());

        let device = RecordingUsbDevice::new(Box::new(mock), 7, writer.clone());
        let result = device.send_receive(&[0x14, 0x00], Duration::from_millis(100), true);
        assert!(matches!(result, Err(BackendError::AccessDenied(_))));
        assert_eq!(device.info().id, "1-1:1.4");
        device.close();
        drop(device);
        drop(writer);

        let log = SessionLog::load(&path, "s").unwrap();
        assert_eq!(log.calls.len(), 2);
        assert_eq!(log.calls[0].target, Some(7));
        assert!(matches!(
            log.calls[0].outcome,
            CallOutcome::Err(RecordedError::AccessDenied { .. })
        ));
        assert_eq!(log.calls[1].call, CallKind::UsbClose);
    }

    #[test]
    fn test_handles_start_at_one() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");
        let live = MockDeviceBackend::new().with_device(MockDeviceSpec::sr300("SR-1", "1-1"));
        let writer = SessionWriter::create(&path, "s", RecordingMode::BestQuality, true).unwrap();
        let backend = RecordingBackend::new(Box::new(live), writer);

        let video = backend.query_video_interfaces().unwrap();
        let usb = backend.query_usb_interfaces().unwrap();
        let first = backend.open_video(&video[0]).unwrap();
        let second = backend.open_usb(&usb[0]).unwrap();
        first.close();
        second.close();
        drop(backend);

        let log = SessionLog::load(&path, "s").unwrap();
        let handles: Vec<_> = log
            .calls
            .iter()
            .filter_map(|c| match &c.outcome {
                CallOutcome::Ok(CallValue::Handle(h)) => Some(*h),
                _ => None,
            })
            .collect();
        assert_eq!(handles, vec![1, 2]);
        assert_eq!(log.calls.last().unwrap().target, Some(2));
    }

    #[test]
    fn test_failed_open_recorded() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");
        let live = MockDeviceBackend::new().with_device(MockDeviceSpec::sr300("SR-1", "1-1"));
        let usb = live.query_usb_interfaces().unwrap();
        live.hold_interface(&usb[0].id);
        let writer = SessionWriter::create(&path, "s", RecordingMode::BestQuality, true).unwrap();
        let backend = RecordingBackend::new(Box::new(live), writer);

        assert!(matches!(
            backend.open_usb(&usb[0]),
            Err(BackendError::AccessDenied(_))
        ));
        drop(backend);

        let records: Vec<LogRecord> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        let start = records
            .iter()
            .find_map(|r| match r {
                LogRecord::Call(c) => Some(c),
                _ => None,
            })
            .unwrap();
        assert_eq!(start.call, CallKind::OpenUsb);
        let completion = records
            .iter()
            .find_map(|r| match r {
                LogRecord::Return(done) if done.seq == start.seq => Some(done),
                _ => None,
            })
            .unwrap();
        assert!(matches!(completion.outcome, CallOutcome::Err(_)));
    }

    #[test]
    fn test_blocked_call_is_on_disk_before_it_returns() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");
        let writer = Arc::new(
            SessionWriter::create(&path, "s", RecordingMode::BestQuality, true).unwrap(),
        );

        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        let mut mock = MockUsbDevice::new();
        mock.expect_info().return_const(usb_info());
        mock.expect_send_receive().times(1).returning(move |_, _, _| {
            let _ = entered_tx.send(());
            let _ = release_rx.recv();
            Ok(vec![0xab])
        });
        mock.expect_close().return_const(());

        let device = Arc::new(RecordingUsbDevice::new(Box::new(mock), 3, writer.clone()));
        let worker = {
            let device = device.clone();
            std::thread::spawn(move || {
                device.send_receive(&[0x14], Duration::from_secs(30), true)
            })
        };
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let in_flight = SessionLog::load(&path, "s").unwrap();
        assert_eq!(in_flight.calls.len(), 1);
        assert_eq!(in_flight.calls[0].call, CallKind::UsbSendReceive);
        assert_eq!(in_flight.calls[0].target, Some(3));
        assert!(in_flight.calls[0].is_pending());

        release_tx.send(()).unwrap();
        assert_eq!(worker.join().unwrap().unwrap(), vec![0xab]);
        let done = SessionLog::load(&path, "s").unwrap();
        assert_eq!(
            done.calls[0].outcome,
            CallOutcome::Ok(CallValue::Bytes(vec![0xab]))
        );
    }
}
