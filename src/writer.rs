//! Log Writer: owns the single CSV output of a session.
//!
//! The writer never fails construction. If the file cannot be created it sits
//! in a failed state where every `append` is a logged no-op, so acquisition
//! keeps running even though nothing is persisted.
//!
//! A line only counts as written once a flush has pushed it to the sink. A
//! failed write or flush discards whatever is still buffered; nothing is
//! retried.

use crate::error::{RecorderError, Result};
use crate::reading::{ReadingKind, HEADER};
use log::{debug, error, info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Attempts at finding a free file name before giving up
const MAX_NAME_ATTEMPTS: u32 = 100;

/// Destination of the log bytes
pub trait LogSink: Write + Send {
    /// Force written bytes down to the storage device
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// What became of the lines handed to a writer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteTally {
    /// Lines known to have reached the sink, per kind
    pub written: [u64; 3],
    /// Lines buffered and not flushed yet
    pub pending: u64,
    /// Lines discarded after a failed write or flush, or refused by a failed writer
    pub lost: u64,
    /// Failed write, flush and sync operations
    pub errors: u64,
}

impl WriteTally {
    pub fn written(&self, kind: ReadingKind) -> u64 {
        self.written[kind.index()]
    }

    pub fn total_written(&self) -> u64 {
        self.written.iter().sum()
    }
}

enum WriterState {
    Open { out: BufWriter<Box<dyn LogSink>> },
    Failed { reason: String },
    Closed,
}

pub struct LogWriter {
    state: WriterState,
    path: Option<PathBuf>,
    flush_every: usize,
    since_flush: usize,
    pending: [u64; 3],
    tally: WriteTally,
    failure_reported: bool,
}

impl LogWriter {
    /// Create `<dir>/<prefix><session_id>.csv` and write the header line.
    pub fn open(dir: &Path, prefix: &str, session_id: &str, flush_every: usize) -> Self {
        match create_log_file(dir, prefix, session_id) {
            Ok((file, path)) => Self::with_sink(Box::new(file), Some(path), flush_every),
            Err(e) => {
                error!(
                    "[writer] Failed to create log file in {}: {} (recording continues without persistence)",
                    dir.display(),
                    e
                );
                Self::new(
                    WriterState::Failed {
                        reason: e.to_string(),
                    },
                    None,
                    flush_every,
                )
            }
        }
    }

    /// Write the header to an already open sink. `path` only labels the log.
    pub fn with_sink(sink: Box<dyn LogSink>, path: Option<PathBuf>, flush_every: usize) -> Self {
        let label = describe(path.as_deref());
        let mut out = BufWriter::new(sink);
        let header = writeln!(out, "{}", HEADER).and_then(|_| out.flush());
        let state = match header {
            Ok(()) => {
                info!("[writer] Opened {}", label);
                WriterState::Open { out }
            }
            Err(e) => {
                error!("[writer] Failed to write header to {}: {}", label, e);
                WriterState::Failed {
                    reason: format!("header write failed: {}", e),
                }
            }
        };
        let path = match state {
            WriterState::Open { .. } => path,
            _ => None,
        };
        Self::new(state, path, flush_every)
    }

    fn new(state: WriterState, path: Option<PathBuf>, flush_every: usize) -> Self {
        LogWriter {
            state,
            path,
            flush_every,
            since_flush: 0,
            pending: [0; 3],
            tally: WriteTally::default(),
            failure_reported: false,
        }
    }

    /// Append one formatted record followed by a newline.
    ///
    /// A failed line is reported and skipped; there is no retry.
    pub fn append(&mut self, kind: ReadingKind, line: &str) -> Result<()> {
        let out = match &mut self.state {
            WriterState::Open { out } => out,
            WriterState::Failed { reason } => {
                self.tally.errors += 1;
                self.tally.lost += 1;
                if !self.failure_reported {
                    warn!("[writer] Storage unavailable, dropping lines: {}", reason);
                    self.failure_reported = true;
                }
                return Err(RecorderError::StorageError(reason.clone()));
            }
            WriterState::Closed => {
                self.tally.errors += 1;
                self.tally.lost += 1;
                return Err(RecorderError::StorageError("writer closed".to_string()));
            }
        };

        let written = writeln!(out, "{}", line);
        self.pending[kind.index()] += 1;
        if let Err(e) = written {
            return Err(self.discard_pending(e));
        }

        self.since_flush += 1;
        if self.flush_every > 0 && self.since_flush >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    /// Push buffered lines to the sink and count them as written
    pub fn flush(&mut self) -> Result<()> {
        let out = match &mut self.state {
            WriterState::Open { out } => out,
            _ => return Ok(()),
        };
        if let Err(e) = out.flush() {
            return Err(self.discard_pending(e));
        }

        for (written, pending) in self.tally.written.iter_mut().zip(self.pending.iter()) {
            *written += pending;
        }
        self.pending = [0; 3];
        self.since_flush = 0;
        Ok(())
    }

    /// Drop everything still buffered so a failing sink never sees it again
    fn discard_pending(&mut self, e: io::Error) -> RecorderError {
        let lost: u64 = self.pending.iter().sum();
        self.pending = [0; 3];
        self.since_flush = 0;
        self.tally.lost += lost;
        self.tally.errors += 1;

        if let WriterState::Open { out } = std::mem::replace(&mut self.state, WriterState::Closed) {
            let (sink, _unwritten) = out.into_parts();
            self.state = WriterState::Open {
                out: BufWriter::new(sink),
            };
        }

        let label = describe(self.path.as_deref());
        if !self.failure_reported {
            warn!("[writer] Write to {} failed, {} line(s) discarded: {}", label, lost, e);
            self.failure_reported = true;
        } else {
            debug!("[writer] Write failed, {} line(s) discarded: {}", lost, e);
        }
        e.into()
    }

    /// Flush and release the file. Safe to call any number of times.
    pub fn close(&mut self) -> Result<()> {
        let flushed = self.flush();
        match std::mem::replace(&mut self.state, WriterState::Closed) {
            WriterState::Open { out } => {
                let label = describe(self.path.as_deref());
                let (mut sink, _) = out.into_parts();
                let synced = sink.sync().map_err(|e| {
                    self.tally.errors += 1;
                    RecorderError::from(e)
                });
                drop(sink);
                match flushed.and(synced) {
                    Ok(()) => {
                        info!("[writer] Closed {}", label);
                        Ok(())
                    }
                    Err(e) => {
                        error!("[writer] Error closing {}: {}", label, e);
                        Err(e)
                    }
                }
            }
            failed @ WriterState::Failed { .. } => {
                self.state = failed;
                Ok(())
            }
            WriterState::Closed => Ok(()),
        }
    }

    pub fn tally(&self) -> WriteTally {
        WriteTally {
            pending: self.pending.iter().sum(),
            ..self.tally
        }
    }

    /// Path of the log file, if it was created
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, WriterState::Failed { .. })
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, WriterState::Open { .. })
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn describe(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "log sink".to_string())
}

/// File name for a session; `attempt > 0` adds a collision suffix
pub fn log_file_name(prefix: &str, session_id: &str, attempt: u32) -> String {
    if attempt == 0 {
        format!("{}{}.csv", prefix, session_id)
    } else {
        format!("{}{}_{}.csv", prefix, session_id, attempt)
    }
}

/// Session id carried by a log file name, collision suffix included
pub fn session_id_from_path(path: &Path, prefix: &str) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    stem.strip_prefix(prefix).map(str::to_string)
}

fn create_log_file(dir: &Path, prefix: &str, session_id: &str) -> io::Result<(File, PathBuf)> {
    fs::create_dir_all(dir)?;

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let path = dir.join(log_file_name(prefix, session_id, attempt));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free log file name for session {}", session_id),
    ))
}
