//! Session log reader

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::error::{BackendError, Result};

use super::types::{
    CallEntry, CallReturn, CallStart, EventEntry, LogRecord, SectionHeader, FORMAT_VERSION,
};

/// One section of a session log, loaded into memory
#[derive(Debug, Clone)]
pub struct SessionLog {
    pub header: SectionHeader,
    /// Calls in issue (`seq`) order; a call without a completion is pending
    pub calls: Vec<CallEntry>,
    /// Events in delivery order (`timestamp_us`, then `seq`)
    pub events: Vec<EventEntry>,
    /// Whether the section has an end marker
    pub complete: bool,
}

struct PartialSection {
    header: SectionHeader,
    starts: BTreeMap<u64, CallStart>,
    returns: HashMap<u64, CallReturn>,
    events: Vec<EventEntry>,
    complete: bool,
}

impl PartialSection {
    fn new(header: SectionHeader) -> Self {
        Self {
            header,
            starts: BTreeMap::new(),
            returns: HashMap::new(),
            events: Vec::new(),
            complete: false,
        }
    }

    /// Pair every start with its completion, in `seq` order
    fn pair_calls(&mut self, path: &Path) -> Vec<CallEntry> {
        let starts = std::mem::take(&mut self.starts);
        let calls: Vec<CallEntry> = starts
            .into_values()
            .map(|start| {
                let completion = self.returns.remove(&start.seq);
                CallEntry::from_parts(start, completion)
            })
            .collect();

        for entry in calls.iter().filter(|c| c.is_pending()) {
            tracing::warn!(
                "Entry {} ({}) in {:?} never returned before the recording ended",
                entry.seq,
                entry.describe(),
                path
            );
        }
        if !self.returns.is_empty() {
            tracing::warn!(
                "Ignoring {} completions without a matching call in {:?}",
                self.returns.len(),
                path
            );
        }
        calls
    }
}

fn read_records(path: &Path) -> Result<Vec<LogRecord>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        BackendError::InvalidRecording(format!("cannot read {:?}: {}", path, e))
    })?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|e| {
                BackendError::InvalidRecording(format!(
                    "{:?} line {}: {}",
                    path,
                    index + 1,
                    e
                ))
            })
        })
        .collect()
}

impl SessionLog {
    /// Load the last section named `section` from `path`
    ///
    /// A section without an end marker is accepted with a warning.
    pub fn load(path: impl AsRef<Path>, section: &str) -> Result<Self> {
        let path = path.as_ref();
        let records = read_records(path)?;

        let mut selected: Option<PartialSection> = None;
        // Whether records currently belong to the section being collected
        let mut collecting = false;

        for record in records {
            match record {
                LogRecord::Section(header) => {
                    collecting = header.name == section;
                    if collecting {
                        // Later sections with the same name replace earlier ones
                        selected = Some(PartialSection::new(header));
                    }
                }
                LogRecord::Call(start) if collecting => {
                    if let Some(s) = selected.as_mut() {
                        s.starts.insert(start.seq, start);
                    }
                }
                LogRecord::Return(completion) if collecting => {
                    if let Some(s) = selected.as_mut() {
                        s.returns.insert(completion.seq, completion);
                    }
                }
                LogRecord::Event(event) if collecting => {
                    if let Some(s) = selected.as_mut() {
                        s.events.push(event);
                    }
                }
                LogRecord::End(end) if collecting && end.name == section => {
                    if let Some(s) = selected.as_mut() {
                        s.complete = true;
                    }
                    collecting = false;
                }
                _ => {}
            }
        }

        let Some(mut s) = selected else {
            return Err(BackendError::InvalidRecording(format!(
                "section '{}' not found in {:?}",
                section, path
            )));
        };

        if s.header.format_version != FORMAT_VERSION {
            return Err(BackendError::InvalidRecording(format!(
                "section '{}' has format version {}, expected {}",
                section, s.header.format_version, FORMAT_VERSION
            )));
        }
        if !s.complete {
            tracing::warn!(
                "Section '{}' in {:?} has no end marker; the recording may be truncated",
                section,
                path
            );
        }

        let calls = s.pair_calls(path);
        s.events.sort_by_key(|e| (e.timestamp_us, e.seq));

        tracing::debug!(
            "Loaded section '{}': {} calls, {} events",
            section,
            calls.len(),
            s.events.len()
        );

        Ok(Self {
            header: s.header,
            calls,
            events: s.events,
            complete: s.complete,
        })
    }

    /// Names of every section in `path`, in file order
    pub fn sections(path: impl AsRef<Path>) -> Result<Vec<String>> {
        Ok(read_records(path.as_ref())?
            .into_iter()
            .filter_map(|r| match r {
                LogRecord::Section(header) => Some(header.name),
                _ => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::{CallArgs, CallKind, CallOutcome, CallValue, RecordingMode};
    use crate::error::RecordedError;
    use crate::session::SessionWriter;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_section(path: &Path, name: &str, calls: u64) {
        let writer = SessionWriter::create(path, name, RecordingMode::BestQuality, true).unwrap();
        for _ in 0..calls {
            let seq = writer.start_call(CallKind::QueryVideoInterfaces, None, CallArgs::None);
            writer.finish_call(seq, CallOutcome::Ok(CallValue::VideoInterfaces(Vec::new())));
        }
    }

    #[test]
    fn test_last_section_with_name_wins() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");
        write_section(&path, "s", 1);
        write_section(&path, "other", 5);
        write_section(&path, "s", 3);

        let log = SessionLog::load(&path, "s").unwrap();
        assert_eq!(log.calls.len(), 3);
        assert!(log.complete);
        assert_eq!(
            SessionLog::sections(&path).unwrap(),
            vec!["s".to_string(), "other".to_string(), "s".to_string()]
        );
    }

    #[test]
    fn test_missing_section() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");
        write_section(&path, "s", 1);

        assert!(matches!(
            SessionLog::load(&path, "absent"),
            Err(BackendError::InvalidRecording(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            SessionLog::load("/nonexistent/log.jsonl", "s"),
            Err(BackendError::InvalidRecording(_))
        ));
    }

    #[test]
    fn test_malformed_line_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");
        write_section(&path, "s", 1);
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{\"record\":\"call\",\"seq\":").unwrap();

        let err = SessionLog::load(&path, "s").unwrap_err();
        assert!(err.to_string().contains("line 5"));
    }

    #[test]
    fn test_truncated_section_accepted() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");
        write_section(&path, "s", 2);

        // Drop the end marker
        let content = std::fs::read_to_string(&path).unwrap();
        let kept: Vec<&str> = content.lines().take(5).collect();
        std::fs::write(&path, kept.join("\n")).unwrap();

        let log = SessionLog::load(&path, "s").unwrap();
        assert!(!log.complete);
        assert_eq!(log.calls.len(), 2);
        assert!(log.calls.iter().all(|c| !c.is_pending()));
    }

    #[test]
    fn test_unreturned_call_loads_as_pending() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");
        {
            let writer =
                SessionWriter::create(&path, "s", RecordingMode::BestQuality, true).unwrap();
            let blocked = writer.start_call(CallKind::UsbSendReceive, Some(1), CallArgs::None);
            let seq = writer.start_call(CallKind::UsbClose, Some(1), CallArgs::None);
            writer.finish_call(seq, CallOutcome::Ok(CallValue::Unit));
            assert_eq!(blocked, 0);
            // The process dies before the transfer returns
            std::mem::forget(writer);
        }

        let log = SessionLog::load(&path, "s").unwrap();
        assert!(!log.complete);
        assert_eq!(log.calls.len(), 2);
        assert_eq!(log.calls[0].call, CallKind::UsbSendReceive);
        assert!(log.calls[0].is_pending());
        assert_eq!(log.calls[0].finished_us, None);
        assert_eq!(log.calls[1].outcome, CallOutcome::Ok(CallValue::Unit));
    }

    #[test]
    fn test_completion_pairs_by_seq() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.jsonl");
        {
            let writer =
                SessionWriter::create(&path, "s", RecordingMode::BestQuality, true).unwrap();
            let first = writer.start_call(CallKind::UsbSendReceive, Some(1), CallArgs::None);
            let second = writer.start_call(CallKind::UsbSendReceive, Some(2), CallArgs::None);
            writer.finish_call(second, CallOutcome::Ok(CallValue::Bytes(vec![2])));
            writer.finish_call(first, CallOutcome::Err(RecordedError::Cancelled));
        }

        let log = SessionLog::load(&path, "s").unwrap();
        assert_eq!(log.calls[0].target, Some(1));
        assert_eq!(log.calls[0].outcome, CallOutcome::Err(RecordedError::Cancelled));
        assert_eq!(log.calls[1].outcome, CallOutcome::Ok(CallValue::Bytes(vec![2])));
        assert!(log.calls[0].finished_us >= log.calls[1].finished_us);
    }
}
