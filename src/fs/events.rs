//! Append-only event log of filesystem activity.
//!
//! One line per event:
//! `<unix-nanoseconds> <verb padded to 10> <subject>[ <correlation-id>]`.
//! The sink is created once per mount and handed to every interceptor; the
//! file itself is opened on the first event and kept open afterwards.
//! Subjects are written verbatim, so a path containing a newline spans two
//! lines and the second one does not parse back.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, Write},
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use tracing::warn;

use crate::Result;

pub const VERB_WIDTH: usize = 10;
pub const EVENT_FILE_PREFIX: &str = "fs-record.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventVerb {
    Lookup,
    Open,
    Create,
    Close,
    Complete,
}

impl EventVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            EventVerb::Lookup => "Lookup",
            EventVerb::Open => "Open",
            EventVerb::Create => "Create",
            EventVerb::Close => "Close",
            EventVerb::Complete => "Complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Lookup" => Some(EventVerb::Lookup),
            "Open" => Some(EventVerb::Open),
            "Create" => Some(EventVerb::Create),
            "Close" => Some(EventVerb::Close),
            "Complete" => Some(EventVerb::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for EventVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub timestamp_ns: u128,
    pub verb: EventVerb,
    pub subject: String,
    pub correlation: Option<i64>,
}

impl EventRecord {
    /// Parse one log line back into a record.
    ///
    /// A trailing integer is read as the correlation id for every verb that
    /// carries one (`Open`, `Create`, `Close`, `Complete`).
    pub fn parse_line(line: &str) -> Option<Self> {
        let (ts, rest) = line.split_once(' ')?;
        let timestamp_ns = ts.parse().ok()?;
        if rest.len() < VERB_WIDTH + 1 || !rest.is_char_boundary(VERB_WIDTH) {
            return None;
        }
        let verb = EventVerb::parse(rest[..VERB_WIDTH].trim_end())?;
        let body = rest.get(VERB_WIDTH + 1..)?;

        let (subject, correlation) = match verb {
            EventVerb::Lookup => (body.to_string(), None),
            _ => match body.rsplit_once(' ') {
                Some((subject, id)) => match id.parse::<i64>() {
                    Ok(id) => (subject.to_string(), Some(id)),
                    Err(_) => (body.to_string(), None),
                },
                None => (body.to_string(), None),
            },
        };

        Some(Self {
            timestamp_ns,
            verb,
            subject,
            correlation,
        })
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<width$} {}",
            self.timestamp_ns,
            self.verb,
            self.subject,
            width = VERB_WIDTH
        )?;
        if let Some(id) = self.correlation {
            write!(f, " {id}")?;
        }
        Ok(())
    }
}

/// Handle to the per-mount event sink. Cloning shares the sink; a disabled
/// log ignores every event.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    sink: Option<Arc<EventSink>>,
}

#[derive(Debug)]
struct EventSink {
    path: PathBuf,
    state: Mutex<SinkState>,
}

#[derive(Debug, Default)]
struct SinkState {
    file: Option<File>,
    open_failed: bool,
    last_ns: u128,
    written: u64,
}

impl EventLog {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            sink: Some(Arc::new(EventSink {
                path: path.into(),
                state: Mutex::new(SinkState::default()),
            })),
        }
    }

    pub fn from_config(path: Option<&Path>) -> Self {
        match path {
            Some(p) => Self::to_file(p),
            None => Self::disabled(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.as_deref().map(|s| s.path.as_path())
    }

    /// Number of lines appended so far.
    pub fn events_written(&self) -> u64 {
        self.sink.as_deref().map(|s| s.state.lock().written).unwrap_or(0)
    }

    pub fn record(&self, verb: EventVerb, subject: &Path, correlation: Option<i64>) {
        if self.sink.is_none() {
            return;
        }
        self.record_str(verb, &subject.to_string_lossy(), correlation);
    }

    pub fn record_str(&self, verb: EventVerb, subject: &str, correlation: Option<i64>) {
        let Some(sink) = self.sink.as_deref() else {
            return;
        };
        if let Err(err) = sink.append(verb, subject, correlation) {
            warn!(path = %sink.path.display(), verb = verb.as_str(), error = %err, "event not recorded");
        }
    }

    /// Widen permissions on the finished log so other users can read it.
    pub fn publish(&self) -> io::Result<()> {
        let Some(path) = self.path() else {
            return Ok(());
        };
        match std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl EventSink {
    fn append(&self, verb: EventVerb, subject: &str, correlation: Option<i64>) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.file.is_none() {
            if state.open_failed {
                return Ok(());
            }
            match OpenOptions::new()
                .create(true)
                .append(true)
                .mode(0o600)
                .open(&self.path)
            {
                Ok(file) => state.file = Some(file),
                Err(err) => {
                    state.open_failed = true;
                    return Err(err);
                }
            }
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        // Wall clock may step backwards; the log never does.
        let timestamp_ns = now.max(state.last_ns);
        state.last_ns = timestamp_ns;

        let record = EventRecord {
            timestamp_ns,
            verb,
            subject: subject.to_string(),
            correlation,
        };
        let line = format!("{record}\n");
        if let Some(file) = state.file.as_mut() {
            file.write_all(line.as_bytes())?;
        }
        state.written += 1;
        Ok(())
    }
}

/// Create a fresh, uniquely named event file in `out_dir` (or the current
/// directory) and return its path.
pub fn create_event_file(out_dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match out_dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir()?,
    };
    let file = tempfile::Builder::new()
        .prefix(EVENT_FILE_PREFIX)
        .tempfile_in(&dir)?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Read every parseable record from an event log.
pub fn read_events(path: &Path) -> Result<Vec<EventRecord>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents.lines().filter_map(EventRecord::parse_line).collect())
}
