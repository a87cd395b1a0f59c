//! Append-only attendance ledger stored as JSON Lines.
//!
//! One [`AttendanceEvent`] per line, in insertion order. Insertion order is
//! chronological order: appends with a timestamp older than the last record
//! are rejected, as are appends that would give a person two consecutive
//! events of the same type.

use crate::types::{AttendanceEvent, EventType};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}:{line}: malformed attendance record: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("event for {person_id} at {got} is older than the last record ({last})")]
    OutOfOrder {
        person_id: String,
        last: DateTime<Utc>,
        got: DateTime<Utc>,
    },
    #[error("{person_id}: expected {expected}, got {got}")]
    Sequence {
        person_id: String,
        expected: EventType,
        got: EventType,
    },
    #[error("{person_id} already has a {existing} recorded at {timestamp}")]
    Conflict {
        person_id: String,
        timestamp: DateTime<Utc>,
        existing: EventType,
    },
    #[error("event has an empty person id")]
    EmptyPersonId,
    #[error("{path}: ledger was opened read-only")]
    ReadOnly { path: PathBuf },
    #[error("failed to encode attendance record: {0}")]
    Encode(#[source] serde_json::Error),
}

/// What [`Ledger::append`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The same person already has this event at this timestamp; nothing written.
    Duplicate,
}

/// Half-open `[from, to)` range of timestamps. Either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn new(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        Self { from, to }
    }

    /// Whole calendar days `[first, last]` in `tz`, converted to UTC bounds.
    pub fn days<Tz: TimeZone>(first: Option<NaiveDate>, last: Option<NaiveDate>, tz: &Tz) -> Self {
        let start_of = |day: NaiveDate| {
            let midnight = day.and_hms_opt(0, 0, 0).unwrap_or_default();
            tz.from_local_datetime(&midnight)
                .earliest()
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|| midnight.and_utc())
        };
        Self {
            from: first.map(start_of),
            to: last.and_then(|d| d.succ_opt()).map(start_of),
        }
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| *ts >= from) && self.to.map_or(true, |to| *ts < to)
    }
}

/// Counters shown on the attendance dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct Summary {
    pub total_records: usize,
    pub unique_people: usize,
    pub today_records: usize,
}

/// Append-only attendance ledger backed by a JSON Lines file.
pub struct Ledger {
    path: PathBuf,
    /// Append handle; `None` when opened read-only.
    file: Option<File>,
    /// Byte length of the committed records.
    len: u64,
    count: usize,
    last_timestamp: Option<DateTime<Utc>>,
    last_by_person: HashMap<String, EventType>,
    seen: HashMap<(String, DateTime<Utc>), EventType>,
}

impl Ledger {
    /// Open (or create) the ledger at `path` and index its records.
    ///
    /// A final line without a trailing newline is the remains of an
    /// interrupted append and is truncated away.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(io_err(&path))?;

        let mut ledger = Self {
            path,
            file: Some(file),
            len: 0,
            count: 0,
            last_timestamp: None,
            last_by_person: HashMap::new(),
            seen: HashMap::new(),
        };
        ledger.load()?;

        tracing::info!(
            path = %ledger.path.display(),
            records = ledger.count,
            "ledger opened"
        );
        Ok(ledger)
    }

    /// Open the ledger for reading only.
    ///
    /// Nothing is created or repaired: a missing file reads as an empty
    /// ledger and an incomplete trailing record is skipped, not truncated.
    /// [`append`](Self::append) fails with [`LedgerError::ReadOnly`].
    pub fn open_read_only(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let mut ledger = Self {
            path: path.into(),
            file: None,
            len: 0,
            count: 0,
            last_timestamp: None,
            last_by_person: HashMap::new(),
            seen: HashMap::new(),
        };
        ledger.load()?;
        Ok(ledger)
    }

    fn load(&mut self) -> Result<(), LedgerError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound && self.file.is_none() => return Ok(()),
            Err(e) => return Err(io_err(&self.path)(e)),
        };
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut offset = 0u64;
        let mut line_no = 0usize;

        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).map_err(io_err(&self.path))?;
            if n == 0 {
                break;
            }
            line_no += 1;

            if buf.last() != Some(&b'\n') {
                match &self.file {
                    Some(file) => {
                        tracing::warn!(
                            path = %self.path.display(),
                            line = line_no,
                            bytes = n,
                            "truncating incomplete trailing record"
                        );
                        file.set_len(offset).map_err(io_err(&self.path))?;
                    }
                    None => tracing::warn!(
                        path = %self.path.display(),
                        line = line_no,
                        "skipping incomplete trailing record"
                    ),
                }
                break;
            }
            offset += n as u64;

            if buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let event: AttendanceEvent =
                serde_json::from_slice(&buf).map_err(|source| LedgerError::Corrupt {
                    path: self.path.clone(),
                    line: line_no,
                    source,
                })?;
            self.index(&event);
        }

        self.len = offset;
        Ok(())
    }

    fn index(&mut self, event: &AttendanceEvent) {
        self.count += 1;
        self.last_timestamp = Some(match self.last_timestamp {
            Some(last) => last.max(event.timestamp),
            None => event.timestamp,
        });
        self.last_by_person
            .insert(event.person_id.clone(), event.event_type);
        self.seen
            .insert((event.person_id.clone(), event.timestamp), event.event_type);
    }

    /// Append an event.
    ///
    /// Re-appending an event already recorded for the same person and
    /// timestamp is a no-op returning [`AppendOutcome::Duplicate`]. The record
    /// is written with a single write and synced; on failure the file is cut
    /// back to its previous length so no partial record remains.
    pub fn append(&mut self, event: &AttendanceEvent) -> Result<AppendOutcome, LedgerError> {
        if self.file.is_none() {
            return Err(LedgerError::ReadOnly {
                path: self.path.clone(),
            });
        }
        if event.person_id.is_empty() {
            return Err(LedgerError::EmptyPersonId);
        }

        if let Some(&existing) = self.seen.get(&(event.person_id.clone(), event.timestamp)) {
            if existing == event.event_type {
                tracing::debug!(person = %event.person_id, ts = %event.timestamp, "duplicate append ignored");
                return Ok(AppendOutcome::Duplicate);
            }
            return Err(LedgerError::Conflict {
                person_id: event.person_id.clone(),
                timestamp: event.timestamp,
                existing,
            });
        }

        if let Some(last) = self.last_timestamp {
            if event.timestamp < last {
                return Err(LedgerError::OutOfOrder {
                    person_id: event.person_id.clone(),
                    last,
                    got: event.timestamp,
                });
            }
        }

        let expected = EventType::next_after(self.last_event(&event.person_id));
        if event.event_type != expected {
            return Err(LedgerError::Sequence {
                person_id: event.person_id.clone(),
                expected,
                got: event.event_type,
            });
        }

        let mut line = serde_json::to_vec(event).map_err(LedgerError::Encode)?;
        line.push(b'\n');

        let Some(file) = self.file.as_mut() else {
            return Err(LedgerError::ReadOnly {
                path: self.path.clone(),
            });
        };
        let written = file.write_all(&line).and_then(|()| file.sync_data());
        if let Err(source) = written {
            if let Err(e) = file.set_len(self.len) {
                tracing::error!(path = %self.path.display(), error = %e, "failed to roll back partial record");
            }
            return Err(LedgerError::Io {
                path: self.path.clone(),
                source,
            });
        }

        self.len += line.len() as u64;
        self.index(event);
        tracing::debug!(
            person = %event.person_id,
            event = %event.event_type,
            ts = %event.timestamp,
            "attendance recorded"
        );
        Ok(AppendOutcome::Appended)
    }

    /// Stream events, optionally filtered by person and date range.
    ///
    /// Each call reads the file afresh, so the sequence can be restarted by
    /// calling `query` again. It ends at the records present when it reaches
    /// end of file.
    pub fn query(&self, person_id: Option<&str>, range: Option<DateRange>) -> Result<Events, LedgerError> {
        let reader = match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound && self.file.is_none() => None,
            Err(e) => return Err(io_err(&self.path)(e)),
        };
        Ok(Events {
            path: self.path.clone(),
            reader,
            line_no: 0,
            person_id: person_id.map(str::to_string),
            range: range.unwrap_or_default(),
        })
    }

    /// Event type recorded for `person_id` at exactly `timestamp`, if any.
    pub fn recorded_at(&self, person_id: &str, timestamp: DateTime<Utc>) -> Option<EventType> {
        self.seen.get(&(person_id.to_string(), timestamp)).copied()
    }

    /// Timestamp of the newest record.
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp
    }

    /// Most recent event type recorded for `person_id`.
    pub fn last_event(&self, person_id: &str) -> Option<EventType> {
        self.last_by_person.get(person_id).copied()
    }

    /// Ids of people whose latest event is a check-in, sorted.
    pub fn present(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .last_by_person
            .iter()
            .filter(|(_, ty)| **ty == EventType::CheckIn)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Dashboard counters; `today` is a calendar day in `tz`.
    pub fn summary<Tz: TimeZone>(&self, today: NaiveDate, tz: &Tz) -> Result<Summary, LedgerError> {
        let mut summary = Summary::default();
        let mut people = HashSet::new();
        for event in self.query(None, None)? {
            let event = event?;
            summary.total_records += 1;
            if event.timestamp.with_timezone(tz).date_naive() == today {
                summary.today_records += 1;
            }
            people.insert(event.person_id);
        }
        summary.unique_people = people.len();
        Ok(summary)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> LedgerError + '_ {
    move |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Lazy, finite stream of ledger events returned by [`Ledger::query`].
pub struct Events {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    line_no: usize,
    person_id: Option<String>,
    range: DateRange,
}

impl Iterator for Events {
    type Item = Result<AttendanceEvent, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(source) => {
                    return Some(Err(LedgerError::Io {
                        path: self.path.clone(),
                        source,
                    }))
                }
            }
            self.line_no += 1;

            // A record still being written by this process ends without '\n'.
            if !line.ends_with('\n') {
                return None;
            }
            if line.trim().is_empty() {
                continue;
            }

            let event: AttendanceEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(source) => {
                    return Some(Err(LedgerError::Corrupt {
                        path: self.path.clone(),
                        line: self.line_no,
                        source,
                    }))
                }
            };

            if self
                .person_id
                .as_deref()
                .is_some_and(|id| id != event.person_id)
            {
                continue;
            }
            if !self.range.contains(&event.timestamp) {
                continue;
            }
            return Some(Ok(event));
        }
    }
}
