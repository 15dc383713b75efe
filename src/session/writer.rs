//! Append-only session log writer

use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crate::error::{BackendError, Result};

use super::types::{
    CallArgs, CallKind, CallOutcome, CallReturn, CallStart, EventEntry, EventPayload, EventSource,
    LogRecord, RecordingMode, SectionEnd, SectionHeader, FORMAT_VERSION,
};

struct WriterState {
    out: BufWriter<File>,
    next_seq: u64,
    entries: u64,
    finished: bool,
}

/// Writes one section of a session log
///
/// Calls and events draw their `seq` from one shared counter, and every
/// timestamp is measured on one monotonic clock started at creation. Both
/// are taken under the same lock that appends the line, so `seq` and time
/// never run backwards in file order. After the first write failure the
/// writer disables itself; the failure is logged once and never reaches
/// the recorded calls.
pub struct SessionWriter {
    path: PathBuf,
    name: String,
    mode: RecordingMode,
    flush_each_entry: bool,
    clock: Instant,
    disabled: AtomicBool,
    state: Mutex<WriterState>,
}

impl std::fmt::Debug for SessionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWriter")
            .field("path", &self.path)
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

impl SessionWriter {
    /// Open `path` for appending and start a new section named `name`
    pub fn create(
        path: impl AsRef<Path>,
        name: &str,
        mode: RecordingMode,
        flush_each_entry: bool,
    ) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                BackendError::from(e).with_context(format!("create log directory {:?}", parent))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| BackendError::from(e).with_context(format!("open session log {:?}", path)))?;

        let writer = Self {
            path: path.to_path_buf(),
            name: name.to_string(),
            mode,
            flush_each_entry,
            clock: Instant::now(),
            disabled: AtomicBool::new(false),
            state: Mutex::new(WriterState {
                out: BufWriter::new(file),
                next_seq: 0,
                entries: 0,
                finished: false,
            }),
        };

        let header = LogRecord::Section(SectionHeader {
            name: name.to_string(),
            format_version: FORMAT_VERSION,
            recorded_at: Utc::now(),
            recording_mode: mode,
            api_version: crate::API_VERSION.to_string(),
        });
        {
            let mut state = writer
                .state
                .lock()
                .map_err(|_| BackendError::Transport("session log poisoned".to_string()))?;
            write_line(&mut state.out, &header)?;
            state.out.flush()?;
        }

        tracing::info!("Recording section '{}' to {:?} ({})", name, path, mode);
        Ok(writer)
    }

    /// Payload storage mode of this section
    pub fn mode(&self) -> RecordingMode {
        self.mode
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a write failure has disabled recording
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Microseconds since the writer was created
    pub fn now_us(&self) -> u64 {
        self.clock.elapsed().as_micros() as u64
    }

    /// Append the start of a call and return its `seq`
    pub fn start_call(&self, call: CallKind, target: Option<u64>, args: CallArgs) -> u64 {
        self.append(|seq, started_us| {
            (
                seq + 1,
                LogRecord::Call(CallStart {
                    seq,
                    call,
                    target,
                    args,
                    started_us,
                }),
            )
        })
    }

    /// Append the completion of the call started as `seq`
    pub fn finish_call(&self, seq: u64, outcome: CallOutcome) {
        self.append(|next_seq, finished_us| {
            (
                next_seq,
                LogRecord::Return(CallReturn {
                    seq,
                    outcome,
                    finished_us,
                }),
            )
        });
    }

    /// Append an asynchronous delivery, stamping it with the next `seq`
    pub fn write_event(&self, source: EventSource, payload: EventPayload) {
        self.append(|seq, timestamp_us| {
            (
                seq + 1,
                LogRecord::Event(EventEntry {
                    seq,
                    source,
                    payload,
                    timestamp_us,
                }),
            )
        });
    }

    /// Disable recording after a failure, logging only the first one
    pub fn fail(&self, err: &BackendError) {
        if !self.disabled.swap(true, Ordering::SeqCst) {
            tracing::error!(
                "Session log {:?} failed, recording disabled: {}",
                self.path,
                err
            );
        }
    }

    /// Stamp and append one record under the state lock
    ///
    /// `build` gets the next free `seq` and the current time and returns the
    /// counter's new value with the record. Returns the `seq` it was given.
    fn append(&self, build: impl FnOnce(u64, u64) -> (u64, LogRecord)) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = state.next_seq;
        let (next_seq, record) = build(seq, self.now_us());
        state.next_seq = next_seq;
        if state.finished || self.is_disabled() {
            return seq;
        }

        let written = write_line(&mut state.out, &record).and_then(|_| {
            if self.flush_each_entry {
                state.out.flush()?;
            }
            Ok(())
        });
        match written {
            Ok(()) => state.entries += 1,
            Err(e) => {
                drop(state);
                self.fail(&e);
            }
        }
        seq
    }

    /// Write the end marker; later entries are ignored
    pub fn finish(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.finished {
            return;
        }
        state.finished = true;
        if self.is_disabled() {
            return;
        }

        let end = LogRecord::End(SectionEnd {
            name: self.name.clone(),
            entries: state.entries,
        });
        let entries = state.entries;
        let result = write_line(&mut state.out, &end).and_then(|_| Ok(state.out.flush()?));
        drop(state);
        match result {
            Ok(()) => tracing::info!("Closed section '{}' with {} entries", self.name, entries),
            Err(e) => self.fail(&e),
        }
    }
}

impl Drop for SessionWriter {
    fn drop(&mut self) {
        self.finish();
    }
}

fn write_line(out: &mut impl Write, record: &LogRecord) -> Result<()> {
    let line =
        serde_json::to_string(record).map_err(|e| BackendError::Serialization(e.to_string()))?;
    out.write_all(line.as_bytes())?;
    out.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecordedError;
    use crate::session::types::{CallArgs, CallKind, CallOutcome, CallValue};
    use crate::types::DeviceChange;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn lines(path: &Path) -> Vec<LogRecord> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_section_layout() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");

        let writer = SessionWriter::create(&path, "s1", RecordingMode::BestQuality, true).unwrap();
        let seq = writer.start_call(CallKind::QueryUsbInterfaces, None, CallArgs::None);
        writer.write_event(
            EventSource::Hotplug,
            EventPayload::DevicesChanged {
                change: DeviceChange::default(),
            },
        );
        writer.finish_call(seq, CallOutcome::Ok(CallValue::UsbInterfaces(Vec::new())));
        drop(writer);

        let records = lines(&path);
        assert_eq!(records.len(), 5);
        assert!(matches!(&records[0], LogRecord::Section(h) if h.name == "s1"));
        assert!(matches!(&records[1], LogRecord::Call(c) if c.seq == 0));
        // Delivered while the call was in flight
        assert!(matches!(&records[2], LogRecord::Event(e) if e.seq == 1));
        assert!(matches!(&records[3], LogRecord::Return(r) if r.seq == 0));
        assert!(matches!(&records[4], LogRecord::End(end) if end.entries == 3));
    }

    #[test]
    fn test_concurrent_writers_keep_file_order_monotonic() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");
        let writer = Arc::new(
            SessionWriter::create(&path, "threads", RecordingMode::BestQuality, false).unwrap(),
        );

        let threads: Vec<_> = (0..8)
            .map(|n| {
                let writer = writer.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if n % 2 == 0 {
                            let seq =
                                writer.start_call(CallKind::QueryHidInterfaces, None, CallArgs::None);
                            writer.finish_call(seq, CallOutcome::Ok(CallValue::Unit));
                        } else {
                            writer.write_event(
                                EventSource::Hid { handle: n },
                                EventPayload::DevicesChanged {
                                    change: DeviceChange::default(),
                                },
                            );
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        drop(writer);

        let records = lines(&path);
        let mut seqs = Vec::new();
        let mut stamps = Vec::new();
        for record in &records {
            match record {
                LogRecord::Call(c) => {
                    seqs.push(c.seq);
                    stamps.push(c.started_us);
                }
                LogRecord::Event(e) => {
                    seqs.push(e.seq);
                    stamps.push(e.timestamp_us);
                }
                LogRecord::Return(r) => stamps.push(r.finished_us),
                _ => {}
            }
        }
        assert_eq!(seqs.len(), 1600);
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_sections_append() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");

        drop(SessionWriter::create(&path, "a", RecordingMode::Compressed, false).unwrap());
        drop(SessionWriter::create(&path, "b", RecordingMode::BlankFrames, false).unwrap());

        let records = lines(&path);
        assert_eq!(records.len(), 4);
        assert!(matches!(&records[2], LogRecord::Section(h) if h.name == "b"));
    }

    #[test]
    fn test_finish_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");
        let writer = SessionWriter::create(&path, "s", RecordingMode::BestQuality, true).unwrap();
        writer.finish();
        let seq = writer.start_call(CallKind::UsbClose, Some(1), CallArgs::None);
        writer.finish_call(seq, CallOutcome::Err(RecordedError::Cancelled));
        drop(writer);
        assert_eq!(lines(&path).len(), 2);
    }

    #[test]
    fn test_unwritable_path_fails_creation() {
        let tmp = TempDir::new().unwrap();
        let result = SessionWriter::create(tmp.path(), "s", RecordingMode::BestQuality, true);
        assert!(result.is_err());
    }
}
