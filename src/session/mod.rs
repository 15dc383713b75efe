//! Session recording and playback
//!
//! This module provides the two backend decorators that make hardware
//! sessions reproducible:
//!
//! - [`RecordingBackend`] - Forwards to a live backend and logs every call,
//!   outcome and asynchronous delivery to a session log
//! - [`PlaybackBackend`] - Replays a session log with no hardware attached
//!
//! # Features
//!
//! - JSON Lines log, append-only, several named sections per file
//! - Calls logged when issued and again when they return
//! - Three payload storage modes (verbatim, deflated, length only)
//! - Recorded errors come back as the same error variant on replay
//! - Deliveries replayed at the recorded pace, optionally sped up

pub mod log;
pub mod player;
pub mod recorder;
pub mod types;
pub mod writer;

pub use log::SessionLog;
pub use player::PlaybackBackend;
pub use recorder::RecordingBackend;
pub use types::{
    CallArgs, CallEntry, CallKind, CallOutcome, CallReturn, CallStart, CallValue, EventEntry,
    EventPayload, EventSource, FramePayload, LogRecord, RecordingMode, SectionEnd, SectionHeader,
    FORMAT_VERSION,
};
pub use writer::SessionWriter;

/// Section name used when none is given
pub const DEFAULT_SECTION: &str = "session";
