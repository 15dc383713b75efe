//! Context façade
//!
//! A [`Context`] is built once for a [`BackendMode`] and owns the backend
//! for that mode for its whole life. Upper layers ask it for devices and
//! open their interfaces through [`Context::backend`]; they never learn
//! whether hardware is live, being recorded, or replayed.
//!
//! # Example
//!
//! ```ignore
//! use cambackend::{BackendMode, Context};
//!
//! let ctx = Context::new(BackendMode::Record, Some("capture.jsonl".as_ref()), Some("s1"))?;
//! for device in ctx.query_devices()? {
//!     println!("{}", device);
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::{Backend, BackendMode, StandardBackend};
use crate::classifier::{DeviceClassifier, DeviceInfo};
use crate::config::{CoreConfig, StandardConfig};
use crate::error::{BackendError, Result};
use crate::session::{
    PlaybackBackend, RecordingBackend, RecordingMode, SessionWriter, DEFAULT_SECTION,
};

/// Entry point tying a backend to the device classifier
pub struct Context {
    mode: BackendMode,
    backend: Arc<dyn Backend>,
    classifier: DeviceClassifier,
    log_path: Option<PathBuf>,
    section: Option<String>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("mode", &self.mode)
            .field("log_path", &self.log_path)
            .field("section", &self.section)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Build a context with the default configuration
    ///
    /// `path` is required for [`BackendMode::Record`] and
    /// [`BackendMode::Playback`]; `section` defaults to
    /// [`DEFAULT_SECTION`].
    pub fn new(mode: BackendMode, path: Option<&Path>, section: Option<&str>) -> Result<Self> {
        let mut builder = ContextBuilder::new(mode);
        if let Some(path) = path {
            builder = builder.log_path(path);
        }
        if let Some(section) = section {
            builder = builder.section(section);
        }
        builder.build()
    }

    /// Build a context from a raw mode code (0 standard, 1 record, 2 playback)
    pub fn from_mode_code(code: i32, path: Option<&Path>, section: Option<&str>) -> Result<Self> {
        let mode = BackendMode::try_from(code)?;
        Self::new(mode, path, section)
    }

    /// Start configuring a context
    pub fn builder(mode: BackendMode) -> ContextBuilder {
        ContextBuilder::new(mode)
    }

    /// Mode fixed at construction
    pub fn mode(&self) -> BackendMode {
        self.mode
    }

    /// Session log in use, if any
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Section recorded or replayed, if any
    pub fn section(&self) -> Option<&str> {
        self.section.as_deref()
    }

    /// The backend devices must be opened through
    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    /// The classifier used by [`Context::query_devices`]
    pub fn classifier(&self) -> &DeviceClassifier {
        &self.classifier
    }

    /// Enumerate and classify attached devices
    ///
    /// Never cached: each call queries the backend again.
    pub fn query_devices(&self) -> Result<Vec<DeviceInfo>> {
        let snapshot = self.backend.snapshot()?;
        let devices = self.classifier.classify(&snapshot);
        tracing::debug!(
            "{} interfaces classified into {} devices",
            snapshot.len(),
            devices.len()
        );
        Ok(devices)
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    mode: BackendMode,
    config: CoreConfig,
    log_path: Option<PathBuf>,
    section: Option<String>,
    recording_mode: Option<RecordingMode>,
    live_backend: Option<Box<dyn Backend>>,
}

impl ContextBuilder {
    pub fn new(mode: BackendMode) -> Self {
        Self {
            mode,
            config: CoreConfig::default(),
            log_path: None,
            section: None,
            recording_mode: None,
            live_backend: None,
        }
    }

    /// Use `config` instead of the defaults
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Session log to record to or replay from
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Section name inside the session log
    pub fn section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    /// Override the payload storage mode from the config
    pub fn recording_mode(mut self, mode: RecordingMode) -> Self {
        self.recording_mode = Some(mode);
        self
    }

    /// Use `backend` as the live backend instead of the standard one
    ///
    /// Ignored in playback mode.
    pub fn live_backend(mut self, backend: Box<dyn Backend>) -> Self {
        self.live_backend = Some(backend);
        self
    }

    fn require_log_path(&self) -> Result<PathBuf> {
        match &self.log_path {
            None => Err(BackendError::InvalidArgument(format!(
                "{} mode requires a session log path",
                self.mode
            ))),
            Some(path) if path.as_os_str().is_empty() => Err(BackendError::InvalidArgument(
                "session log path is empty".to_string(),
            )),
            Some(path) => Ok(path.clone()),
        }
    }

    fn resolve_section(&self) -> Result<String> {
        match self.section.as_deref() {
            None => Ok(DEFAULT_SECTION.to_string()),
            Some("") => Err(BackendError::InvalidArgument(
                "section name is empty".to_string(),
            )),
            Some(section) => Ok(section.to_string()),
        }
    }

    /// Validate the arguments and wire the backend for the mode
    pub fn build(self) -> Result<Context> {
        let classifier = DeviceClassifier::new(self.config.families.clone());

        let (backend, log_path, section): (Arc<dyn Backend>, _, _) = match self.mode {
            BackendMode::Standard => {
                let backend = live_or_standard(self.live_backend, &self.config.standard);
                (Arc::from(backend), None, None)
            }
            BackendMode::Record => {
                let path = self.require_log_path()?;
                let section = self.resolve_section()?;
                let mode = self.recording_mode.unwrap_or(self.config.recording.mode);
                let writer = SessionWriter::create(
                    &path,
                    &section,
                    mode,
                    self.config.recording.flush_each_entry,
                )?;
                let live = live_or_standard(self.live_backend, &self.config.standard);
                let backend: Arc<dyn Backend> = Arc::new(RecordingBackend::new(live, writer));
                (backend, Some(path), Some(section))
            }
            BackendMode::Playback => {
                let path = self.require_log_path()?;
                let section = self.resolve_section()?;
                let backend: Arc<dyn Backend> =
                    Arc::new(PlaybackBackend::open(&path, &section, &self.config.playback)?);
                (backend, Some(path), Some(section))
            }
        };

        tracing::info!("Context created in {} mode", self.mode);
        Ok(Context {
            mode: self.mode,
            backend,
            classifier,
            log_path,
            section,
        })
    }
}

fn live_or_standard(backend: Option<Box<dyn Backend>>, config: &StandardConfig) -> Box<dyn Backend> {
    match backend {
        Some(backend) => backend,
        None => Box::new(StandardBackend::new(config)),
    }
}
