//! Backend abstraction over video, USB-control and HID transports
//!
//! Every way of reaching hardware satisfies the same [`Backend`] contract:
//!
//! - [`StandardBackend`] - Talks to the real OS transports
//! - [`RecordingBackend`](crate::session::RecordingBackend) - Wraps a live backend and logs every call
//! - [`PlaybackBackend`](crate::session::PlaybackBackend) - Answers calls from a session log
//! - [`MockDeviceBackend`] - In-memory devices for tests and demos
//!
//! Upper layers hold an `Arc<dyn Backend>` and never learn which one they
//! were given.
//!
//! # Handles
//!
//! `open_*` returns a boxed device handle. Handle methods take `&self` so a
//! handle can be shared across threads; [`VideoDevice::close`] (and its USB
//! and HID counterparts) cancels any call still in flight on that handle
//! with [`BackendError::Cancelled`](crate::error::BackendError::Cancelled).
//!
//! # Asynchronous deliveries
//!
//! Frames, HID reports and hot-plug changes are pushed to callbacks from
//! transport-owned threads. Callbacks must not block for long.

pub mod cancel;
pub mod mock;
pub mod standard;

pub use cancel::{run_cancellable, CancelToken};
pub use mock::{MockDeviceBackend, MockDeviceSpec};
pub use standard::StandardBackend;

use crate::error::{BackendError, Result};
use crate::types::{
    DeviceChange, Frame, HidInterfaceInfo, HidSample, HidSensor, InterfaceSnapshot, PowerState,
    StreamProfile, UsbInterfaceInfo, VideoInterfaceInfo, XuControl,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Callback receiving streamed video frames
pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// Callback receiving HID reports
pub type HidCallback = Arc<dyn Fn(HidSample) + Send + Sync>;

/// Callback receiving hot-plug changes
pub type DeviceChangedCallback = Arc<dyn Fn(DeviceChange) + Send + Sync>;

/// Which backend implementation a context is wired to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// Real hardware
    #[default]
    Standard,
    /// Real hardware, every call logged to a session file
    Record,
    /// No hardware, every call answered from a session file
    Playback,
}

impl BackendMode {
    /// Display name for the mode
    pub fn display_name(&self) -> &'static str {
        match self {
            BackendMode::Standard => "standard",
            BackendMode::Record => "record",
            BackendMode::Playback => "playback",
        }
    }

    /// Whether this mode needs a session log path
    pub fn requires_log(&self) -> bool {
        !matches!(self, BackendMode::Standard)
    }
}

impl TryFrom<i32> for BackendMode {
    type Error = BackendError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(BackendMode::Standard),
            1 => Ok(BackendMode::Record),
            2 => Ok(BackendMode::Playback),
            other => Err(BackendError::UnsupportedBackendMode(other)),
        }
    }
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Unified interface over the host's camera transports
///
/// Implementations must be `Send + Sync`; all methods may be called
/// concurrently. Enumeration order is host order and is not stable across
/// calls.
pub trait Backend: Send + Sync {
    /// Enumerate attached video interfaces
    fn query_video_interfaces(&self) -> Result<Vec<VideoInterfaceInfo>>;

    /// Enumerate attached vendor-specific USB control interfaces
    fn query_usb_interfaces(&self) -> Result<Vec<UsbInterfaceInfo>>;

    /// Enumerate attached HID interfaces
    fn query_hid_interfaces(&self) -> Result<Vec<HidInterfaceInfo>>;

    /// Open a video interface
    ///
    /// Fails with `DeviceNotFound` if the descriptor is stale and
    /// `AccessDenied` if the interface is held elsewhere.
    fn open_video(&self, info: &VideoInterfaceInfo) -> Result<Box<dyn VideoDevice>>;

    /// Open a USB control interface
    fn open_usb(&self, info: &UsbInterfaceInfo) -> Result<Box<dyn UsbDevice>>;

    /// Open a HID interface
    fn open_hid(&self, info: &HidInterfaceInfo) -> Result<Box<dyn HidDevice>>;

    /// Register the hot-plug callback, replacing any previous one
    fn subscribe_devices_changed(&self, callback: DeviceChangedCallback) -> Result<()>;

    /// Remove the hot-plug callback
    fn unsubscribe_devices_changed(&self) -> Result<()>;

    /// Enumerate all three pools at once
    fn snapshot(&self) -> Result<InterfaceSnapshot> {
        Ok(InterfaceSnapshot {
            video: self.query_video_interfaces()?,
            usb: self.query_usb_interfaces()?,
            hid: self.query_hid_interfaces()?,
        })
    }
}

/// A shared backend can be wrapped by a decorator while the owner keeps a handle
impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn query_video_interfaces(&self) -> Result<Vec<VideoInterfaceInfo>> {
        (**self).query_video_interfaces()
    }

    fn query_usb_interfaces(&self) -> Result<Vec<UsbInterfaceInfo>> {
        (**self).query_usb_interfaces()
    }

    fn query_hid_interfaces(&self) -> Result<Vec<HidInterfaceInfo>> {
        (**self).query_hid_interfaces()
    }

    fn open_video(&self, info: &VideoInterfaceInfo) -> Result<Box<dyn VideoDevice>> {
        (**self).open_video(info)
    }

    fn open_usb(&self, info: &UsbInterfaceInfo) -> Result<Box<dyn UsbDevice>> {
        (**self).open_usb(info)
    }

    fn open_hid(&self, info: &HidInterfaceInfo) -> Result<Box<dyn HidDevice>> {
        (**self).open_hid(info)
    }

    fn subscribe_devices_changed(&self, callback: DeviceChangedCallback) -> Result<()> {
        (**self).subscribe_devices_changed(callback)
    }

    fn unsubscribe_devices_changed(&self) -> Result<()> {
        (**self).unsubscribe_devices_changed()
    }
}

/// An open video interface
pub trait VideoDevice: Send + Sync {
    /// Descriptor this handle was opened from
    fn info(&self) -> &VideoInterfaceInfo;

    /// Stream configurations the interface supports
    fn profiles(&self) -> Result<Vec<StreamProfile>>;

    /// Configure `profile` and start delivering frames to `callback`
    fn start_streaming(&self, profile: StreamProfile, callback: FrameCallback) -> Result<()>;

    /// Stop delivering frames
    fn stop_streaming(&self) -> Result<()>;

    /// Current power state
    fn power_state(&self) -> Result<PowerState>;

    /// Change power state
    fn set_power_state(&self, state: PowerState) -> Result<()>;

    /// Read an extension-unit control
    fn get_xu(&self, control: XuControl, len: usize) -> Result<Vec<u8>>;

    /// Write an extension-unit control
    fn set_xu(&self, control: XuControl, data: &[u8]) -> Result<()>;

    /// Read a processing-unit control
    fn get_pu(&self, control: u32) -> Result<i32>;

    /// Write a processing-unit control
    fn set_pu(&self, control: u32, value: i32) -> Result<()>;

    /// Close the handle, cancelling in-flight calls
    fn close(&self);
}

/// An open USB control interface
#[cfg_attr(test, mockall::automock)]
pub trait UsbDevice: Send + Sync {
    /// Descriptor this handle was opened from
    fn info(&self) -> &UsbInterfaceInfo;

    /// Send a command and optionally wait for the device's response
    fn send_receive(
        &self,
        data: &[u8],
        timeout: Duration,
        require_response: bool,
    ) -> Result<Vec<u8>>;

    /// Close the handle, cancelling in-flight calls
    fn close(&self);
}

/// An open HID interface
pub trait HidDevice: Send + Sync {
    /// Descriptor this handle was opened from
    fn info(&self) -> &HidInterfaceInfo;

    /// Sensors exposed by the interface
    fn sensors(&self) -> Result<Vec<HidSensor>>;

    /// Start delivering reports to `callback`
    fn start_capture(&self, callback: HidCallback) -> Result<()>;

    /// Stop delivering reports
    fn stop_capture(&self) -> Result<()>;

    /// Send an output report
    fn write_report(&self, data: &[u8]) -> Result<()>;

    /// Close the handle, cancelling in-flight calls
    fn close(&self);
}
