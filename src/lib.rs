//! # cambackend: Device-Access Core for Depth Cameras
//!
//! Enumerates the video, USB-control and HID interfaces of attached depth
//! cameras, groups them into physical devices by family, and makes whole
//! hardware sessions reproducible by recording them to a log and replaying
//! that log with no hardware attached.
//!
//! ## Architecture
//!
//! - **Backend**: One contract over the raw transports, satisfied by the
//!   standard (live), recording, playback and mock implementations
//! - **Session**: JSON Lines session log with a writer, a reader, and the
//!   recording/playback decorators built on them
//! - **Classifier**: Closed set of device families tried in a fixed
//!   priority order
//! - **Context**: Picks the backend for a mode once and classifies devices
//!   on demand
//!
//! ## Configuration
//!
//! [`CoreConfig`] is read from `cambackend/config.json` (or `.toml`) in the
//! platform config directory, or from the path in `CAMBACKEND_CONFIG`:
//!
//! - **Linux**: `~/.config/cambackend/`
//! - **macOS**: `~/Library/Application Support/cambackend/`
//! - **Windows**: `%APPDATA%\cambackend\`
//!
//! ## Example
//!
//! ```ignore
//! use cambackend::{BackendMode, Context, CoreConfig};
//!
//! fn main() -> cambackend::Result<()> {
//!     let ctx = Context::builder(BackendMode::Record)
//!         .config(CoreConfig::load_or_default())
//!         .log_path("session.jsonl")
//!         .section("bring-up")
//!         .build()?;
//!
//!     for device in ctx.query_devices()? {
//!         println!("{}", device);
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod classifier;
pub mod config;
pub mod context;
pub mod error;
pub mod session;
pub mod types;

/// Version string stamped into every recorded section
pub const API_VERSION: &str = concat!("VERSION: ", env!("CARGO_PKG_VERSION"));

// Re-export commonly used types
pub use backend::{Backend, BackendMode, HidDevice, UsbDevice, VideoDevice};
pub use classifier::{DeviceClassifier, DeviceInfo, FamilyMatcher};
pub use config::CoreConfig;
pub use context::{Context, ContextBuilder};
pub use error::{BackendError, Result, ResultExt};
pub use session::{PlaybackBackend, RecordingBackend, RecordingMode};
pub use types::{
    DeviceChange, HidInterfaceInfo, InterfaceSnapshot, UsbInterfaceInfo, VideoInterfaceInfo,
};
