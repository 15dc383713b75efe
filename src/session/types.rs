//! Session log data types
//!
//! A session log is a JSON Lines file. Each line is one [`LogRecord`]:
//!
//! ```text
//! {"record":"section","name":"session","format_version":2,...}
//! {"record":"call","seq":0,"call":"query_video_interfaces",...,"started_us":12}
//! {"record":"return","seq":0,"outcome":{"ok":...},"finished_us":40}
//! {"record":"event","seq":7,"source":{"kind":"video","handle":1},...}
//! {"record":"end","name":"session","entries":42}
//! ```
//!
//! A call is written when it is issued and again when it returns, so a
//! call that blocks or never returns is still on disk. Several sections may
//! share one file.

use chrono::{DateTime, Utc};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};

use crate::error::{BackendError, RecordedError, Result};
use crate::types::{
    DeviceChange, Frame, HidInterfaceInfo, HidSample, HidSensor, PowerState, StreamProfile,
    UsbInterfaceInfo, VideoInterfaceInfo, XuControl,
};

/// Version of the log layout written by this crate
pub const FORMAT_VERSION: u32 = 2;

/// Serialize byte buffers as standard base64 strings
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ==================== Recording Mode ====================

/// How frame and HID payloads are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMode {
    /// Payload bytes stored verbatim
    #[default]
    BestQuality,
    /// Payload bytes deflated
    Compressed,
    /// Only payload length stored; replay yields zeroes
    BlankFrames,
}

impl RecordingMode {
    /// Display name for the mode
    pub fn display_name(&self) -> &'static str {
        match self {
            RecordingMode::BestQuality => "best quality",
            RecordingMode::Compressed => "compressed",
            RecordingMode::BlankFrames => "blank frames",
        }
    }

    /// All modes
    pub fn all() -> &'static [RecordingMode] {
        &[
            RecordingMode::BestQuality,
            RecordingMode::Compressed,
            RecordingMode::BlankFrames,
        ]
    }
}

impl fmt::Display for RecordingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

// ==================== Payloads ====================

/// Stored form of a frame or HID report payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum FramePayload {
    Raw {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    Deflate {
        #[serde(with = "b64")]
        data: Vec<u8>,
        len: usize,
    },
    Blank {
        len: usize,
    },
}

impl FramePayload {
    /// Encode `data` for storage under `mode`
    pub fn encode(mode: RecordingMode, data: &[u8]) -> Result<Self> {
        match mode {
            RecordingMode::BestQuality => Ok(FramePayload::Raw {
                data: data.to_vec(),
            }),
            RecordingMode::Compressed => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
                encoder.write_all(data)?;
                Ok(FramePayload::Deflate {
                    data: encoder.finish()?,
                    len: data.len(),
                })
            }
            RecordingMode::BlankFrames => Ok(FramePayload::Blank { len: data.len() }),
        }
    }

    /// Rebuild the payload bytes
    pub fn decode(&self) -> Result<Vec<u8>> {
        match self {
            FramePayload::Raw { data } => Ok(data.clone()),
            FramePayload::Deflate { data, len } => {
                let mut out = Vec::with_capacity(*len);
                DeflateDecoder::new(data.as_slice())
                    .read_to_end(&mut out)
                    .map_err(|e| {
                        BackendError::InvalidRecording(format!("corrupt compressed payload: {}", e))
                    })?;
                if out.len() != *len {
                    return Err(BackendError::InvalidRecording(format!(
                        "compressed payload is {} bytes, expected {}",
                        out.len(),
                        len
                    )));
                }
                Ok(out)
            }
            FramePayload::Blank { len } => Ok(vec![0u8; *len]),
        }
    }

    /// Length of the original payload
    pub fn len(&self) -> usize {
        match self {
            FramePayload::Raw { data } => data.len(),
            FramePayload::Deflate { len, .. } | FramePayload::Blank { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ==================== Calls ====================

/// Every operation the backend surface exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    QueryVideoInterfaces,
    QueryUsbInterfaces,
    QueryHidInterfaces,
    OpenVideo,
    OpenUsb,
    OpenHid,
    SubscribeDevicesChanged,
    UnsubscribeDevicesChanged,
    VideoProfiles,
    VideoStartStreaming,
    VideoStopStreaming,
    VideoPowerState,
    VideoSetPowerState,
    VideoGetXu,
    VideoSetXu,
    VideoGetPu,
    VideoSetPu,
    VideoClose,
    UsbSendReceive,
    UsbClose,
    HidSensors,
    HidStartCapture,
    HidStopCapture,
    HidWriteReport,
    HidClose,
}

impl CallKind {
    /// Display name for the call
    pub fn display_name(&self) -> &'static str {
        match self {
            CallKind::QueryVideoInterfaces => "query_video_interfaces",
            CallKind::QueryUsbInterfaces => "query_usb_interfaces",
            CallKind::QueryHidInterfaces => "query_hid_interfaces",
            CallKind::OpenVideo => "open_video",
            CallKind::OpenUsb => "open_usb",
            CallKind::OpenHid => "open_hid",
            CallKind::SubscribeDevicesChanged => "subscribe_devices_changed",
            CallKind::UnsubscribeDevicesChanged => "unsubscribe_devices_changed",
            CallKind::VideoProfiles => "video.profiles",
            CallKind::VideoStartStreaming => "video.start_streaming",
            CallKind::VideoStopStreaming => "video.stop_streaming",
            CallKind::VideoPowerState => "video.power_state",
            CallKind::VideoSetPowerState => "video.set_power_state",
            CallKind::VideoGetXu => "video.get_xu",
            CallKind::VideoSetXu => "video.set_xu",
            CallKind::VideoGetPu => "video.get_pu",
            CallKind::VideoSetPu => "video.set_pu",
            CallKind::VideoClose => "video.close",
            CallKind::UsbSendReceive => "usb.send_receive",
            CallKind::UsbClose => "usb.close",
            CallKind::HidSensors => "hid.sensors",
            CallKind::HidStartCapture => "hid.start_capture",
            CallKind::HidStopCapture => "hid.stop_capture",
            CallKind::HidWriteReport => "hid.write_report",
            CallKind::HidClose => "hid.close",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Describe a call by kind and target handle
pub fn describe_call(call: CallKind, target: Option<u64>) -> String {
    match target {
        Some(handle) => format!("{} on handle {}", call, handle),
        None => call.to_string(),
    }
}

/// Arguments of a recorded call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallArgs {
    None,
    Video {
        info: VideoInterfaceInfo,
    },
    Usb {
        info: UsbInterfaceInfo,
    },
    Hid {
        info: HidInterfaceInfo,
    },
    Profile {
        profile: StreamProfile,
    },
    PowerState {
        state: PowerState,
    },
    XuRead {
        control: XuControl,
        len: usize,
    },
    XuWrite {
        control: XuControl,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    PuRead {
        control: u32,
    },
    PuWrite {
        control: u32,
        value: i32,
    },
    Transfer {
        #[serde(with = "b64")]
        data: Vec<u8>,
        timeout_ms: u64,
        require_response: bool,
    },
    Report {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
}

/// Successful result of a recorded call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CallValue {
    Unit,
    VideoInterfaces(Vec<VideoInterfaceInfo>),
    UsbInterfaces(Vec<UsbInterfaceInfo>),
    HidInterfaces(Vec<HidInterfaceInfo>),
    /// Handle id assigned to an opened device
    Handle(u64),
    Profiles(Vec<StreamProfile>),
    PowerState(PowerState),
    Bytes(#[serde(with = "b64")] Vec<u8>),
    Int(i32),
    Sensors(Vec<HidSensor>),
}

/// Recorded result of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Ok(CallValue),
    Err(RecordedError),
    /// Still in flight when the recording ended
    Pending,
}

/// A call as written when it was issued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStart {
    /// Issue order, shared with events
    pub seq: u64,
    pub call: CallKind,
    /// Handle id of the device the call was made on; `None` for backend calls
    #[serde(default)]
    pub target: Option<u64>,
    pub args: CallArgs,
    pub started_us: u64,
}

/// Completion of the call with the same `seq`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallReturn {
    pub seq: u64,
    pub outcome: CallOutcome,
    pub finished_us: u64,
}

/// One backend or device call, start and completion paired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEntry {
    pub seq: u64,
    pub call: CallKind,
    pub target: Option<u64>,
    pub args: CallArgs,
    /// [`CallOutcome::Pending`] if the call never returned
    pub outcome: CallOutcome,
    pub started_us: u64,
    pub finished_us: Option<u64>,
}

impl CallEntry {
    /// Pair a start with its completion, if one was recorded
    pub fn from_parts(start: CallStart, completion: Option<CallReturn>) -> Self {
        let (outcome, finished_us) = match completion {
            Some(done) => (done.outcome, Some(done.finished_us)),
            None => (CallOutcome::Pending, None),
        };
        Self {
            seq: start.seq,
            call: start.call,
            target: start.target,
            args: start.args,
            outcome,
            started_us: start.started_us,
            finished_us,
        }
    }

    /// Whether the call was still in flight when the recording ended
    pub fn is_pending(&self) -> bool {
        self.outcome == CallOutcome::Pending
    }

    /// Human-readable identity of this entry
    pub fn describe(&self) -> String {
        describe_call(self.call, self.target)
    }
}

// ==================== Events ====================

/// Where an asynchronous delivery came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventSource {
    Hotplug,
    Video { handle: u64 },
    Hid { handle: u64 },
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::Hotplug => f.write_str("hotplug"),
            EventSource::Video { handle } => write!(f, "video handle {}", handle),
            EventSource::Hid { handle } => write!(f, "hid handle {}", handle),
        }
    }
}

/// Content of an asynchronous delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Frame {
        profile: StreamProfile,
        sequence: u64,
        frame_timestamp_us: u64,
        data: FramePayload,
    },
    HidSample {
        sensor: String,
        sequence: u64,
        sample_timestamp_us: u64,
        data: FramePayload,
    },
    DevicesChanged {
        change: DeviceChange,
    },
}

impl EventPayload {
    /// Stored form of a frame
    pub fn from_frame(frame: &Frame, mode: RecordingMode) -> Result<Self> {
        Ok(EventPayload::Frame {
            profile: frame.profile,
            sequence: frame.sequence,
            frame_timestamp_us: frame.timestamp_us,
            data: FramePayload::encode(mode, &frame.data)?,
        })
    }

    /// Stored form of a HID report
    pub fn from_hid_sample(sample: &HidSample, mode: RecordingMode) -> Result<Self> {
        Ok(EventPayload::HidSample {
            sensor: sample.sensor.clone(),
            sequence: sample.sequence,
            sample_timestamp_us: sample.timestamp_us,
            data: FramePayload::encode(mode, &sample.data)?,
        })
    }
}

/// One asynchronous delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEntry {
    pub seq: u64,
    pub source: EventSource,
    pub payload: EventPayload,
    /// Microseconds since the recording started
    pub timestamp_us: u64,
}

// ==================== Sections ====================

/// First record of a section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionHeader {
    pub name: String,
    pub format_version: u32,
    pub recorded_at: DateTime<Utc>,
    pub recording_mode: RecordingMode,
    pub api_version: String,
}

/// Last record of a cleanly closed section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionEnd {
    pub name: String,
    /// Number of records between the header and this marker
    pub entries: u64,
}

/// One line of a session log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LogRecord {
    Section(SectionHeader),
    Call(CallStart),
    Return(CallReturn),
    Event(EventEntry),
    End(SectionEnd),
}
