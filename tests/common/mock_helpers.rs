//! Mock construction helpers

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cambackend::backend::mock::MockStreamTiming;
use cambackend::backend::{MockDeviceBackend, MockDeviceSpec};
use cambackend::session::{RecordingBackend, RecordingMode, SessionWriter};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tempfile::TempDir;

/// Host with one SR300 and one DS5 with IMU
pub fn create_test_host() -> Arc<MockDeviceBackend> {
    Arc::new(
        MockDeviceBackend::new()
            .with_device(MockDeviceSpec::sr300("SR-0001", "1-1"))
            .with_device(MockDeviceSpec::ds5(0x0B07, "DS-0001", "1-2", true))
            .with_stream_timing(MockStreamTiming {
                first_delay: Duration::from_millis(20),
                interval: Duration::from_millis(5),
                count: 4,
            }),
    )
}

/// Session log path inside a fresh temporary directory
pub fn temp_log() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("session.jsonl");
    (dir, path)
}

/// Recording backend over `host`, writing section `section` of `path`
pub fn create_recorder(
    host: Arc<MockDeviceBackend>,
    path: &Path,
    section: &str,
    mode: RecordingMode,
) -> RecordingBackend {
    let writer = SessionWriter::create(path, section, mode, true).expect("session writer");
    RecordingBackend::new(Box::new(host), writer)
}

/// Channel for collecting callback deliveries
pub fn create_test_channel<T>() -> (Sender<T>, Receiver<T>) {
    unbounded()
}
