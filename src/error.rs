//! Error handling for the device-access core
//!
//! This module defines the error taxonomy shared by every backend, the
//! session decorators, and the context, plus a serialisable mirror used
//! to store failures in a session log and rebuild them on replay.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for backend operations
#[derive(Error, Debug)]
pub enum BackendError {
    /// The descriptor no longer refers to an attached device
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The interface is held exclusively elsewhere
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Replay diverged from the recorded call sequence
    #[error("Playback mismatch at entry {seq}: recorded {expected}, called {actual}")]
    PlaybackMismatch {
        seq: u64,
        expected: String,
        actual: String,
    },

    /// Session log missing, corrupt, or without the requested section
    #[error("Invalid recording: {0}")]
    InvalidRecording(String),

    /// Backend mode value outside the known set
    #[error("Unsupported backend mode: {0}")]
    UnsupportedBackendMode(i32),

    /// In-flight call unblocked because its handle was closed
    #[error("Operation cancelled")]
    Cancelled,

    /// Caller supplied an unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport-level failure reported by the OS layer
    #[error("Transport error: {0}")]
    Transport(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<BackendError>,
    },
}

impl BackendError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        BackendError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Map an OS-level I/O error onto the backend taxonomy
    ///
    /// `what` names the node or interface the operation targeted.
    pub fn from_io(err: std::io::Error, what: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => BackendError::DeviceNotFound(what.to_string()),
            std::io::ErrorKind::PermissionDenied => BackendError::AccessDenied(what.to_string()),
            _ if err.raw_os_error() == Some(libc::EBUSY) => {
                BackendError::AccessDenied(format!("{} is busy", what))
            }
            _ if err.raw_os_error() == Some(libc::ENODEV) => {
                BackendError::DeviceNotFound(what.to_string())
            }
            _ => BackendError::Io(err),
        }
    }

    /// Whether this error is a handle-closure cancellation (possibly wrapped)
    pub fn is_cancelled(&self) -> bool {
        match self {
            BackendError::Cancelled => true,
            BackendError::WithContext { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Whether this error is a playback divergence (possibly wrapped)
    pub fn is_playback_mismatch(&self) -> bool {
        match self {
            BackendError::PlaybackMismatch { .. } => true,
            BackendError::WithContext { source, .. } => source.is_playback_mismatch(),
            _ => false,
        }
    }
}

/// Result type alias for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

/// Serialisable form of [`BackendError`] stored in session logs
///
/// Every variant maps back onto the variant it was taken from, so a
/// replayed failure is indistinguishable from the live one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordedError {
    DeviceNotFound { message: String },
    AccessDenied { message: String },
    PlaybackMismatch { seq: u64, expected: String, actual: String },
    InvalidRecording { message: String },
    UnsupportedBackendMode { mode: i32 },
    Cancelled,
    InvalidArgument { message: String },
    Transport { message: String },
    Config { message: String },
    Io { raw_os_error: Option<i32>, message: String },
    Serialization { message: String },
    WithContext { context: String, source: Box<RecordedError> },
}

impl From<&BackendError> for RecordedError {
    fn from(err: &BackendError) -> Self {
        match err {
            BackendError::DeviceNotFound(m) => RecordedError::DeviceNotFound { message: m.clone() },
            BackendError::AccessDenied(m) => RecordedError::AccessDenied { message: m.clone() },
            BackendError::PlaybackMismatch {
                seq,
                expected,
                actual,
            } => RecordedError::PlaybackMismatch {
                seq: *seq,
                expected: expected.clone(),
                actual: actual.clone(),
            },
            BackendError::InvalidRecording(m) => {
                RecordedError::InvalidRecording { message: m.clone() }
            }
            BackendError::UnsupportedBackendMode(mode) => {
                RecordedError::UnsupportedBackendMode { mode: *mode }
            }
            BackendError::Cancelled => RecordedError::Cancelled,
            BackendError::InvalidArgument(m) => RecordedError::InvalidArgument { message: m.clone() },
            BackendError::Transport(m) => RecordedError::Transport { message: m.clone() },
            BackendError::Config(m) => RecordedError::Config { message: m.clone() },
            BackendError::Io(e) => RecordedError::Io {
                raw_os_error: e.raw_os_error(),
                message: e.to_string(),
            },
            BackendError::Serialization(m) => RecordedError::Serialization { message: m.clone() },
            BackendError::WithContext { context, source } => RecordedError::WithContext {
                context: context.clone(),
                source: Box::new(RecordedError::from(source.as_ref())),
            },
        }
    }
}

impl From<RecordedError> for BackendError {
    fn from(err: RecordedError) -> Self {
        match err {
            RecordedError::DeviceNotFound { message } => BackendError::DeviceNotFound(message),
            RecordedError::AccessDenied { message } => BackendError::AccessDenied(message),
            RecordedError::PlaybackMismatch {
                seq,
                expected,
                actual,
            } => BackendError::PlaybackMismatch {
                seq,
                expected,
                actual,
            },
            RecordedError::InvalidRecording { message } => BackendError::InvalidRecording(message),
            RecordedError::UnsupportedBackendMode { mode } => {
                BackendError::UnsupportedBackendMode(mode)
            }
            RecordedError::Cancelled => BackendError::Cancelled,
            RecordedError::InvalidArgument { message } => BackendError::InvalidArgument(message),
            RecordedError::Transport { message } => BackendError::Transport(message),
            RecordedError::Config { message } => BackendError::Config(message),
            RecordedError::Io {
                raw_os_error,
                message,
            } => match raw_os_error {
                Some(code) => BackendError::Io(std::io::Error::from_raw_os_error(code)),
                None => BackendError::Io(std::io::Error::other(message)),
            },
            RecordedError::Serialization { message } => BackendError::Serialization(message),
            RecordedError::WithContext { context, source } => BackendError::WithContext {
                context,
                source: Box::new(BackendError::from(*source)),
            },
        }
    }
}
