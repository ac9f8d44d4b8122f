//! Ingestion Router and the serial worker behind it.
//!
//! Producers on any thread call `submit*`; lines travel over one bounded
//! channel to a single `log-writer` thread which owns the `LogWriter`.
//! Open, append and close all run on that thread, so writes can never
//! interleave and a close can never race a write.

use crate::error::{lock_poisoned, RecorderError, Result};
use crate::reading::{Reading, ReadingKind};
use crate::writer::LogWriter;
use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Log a dropped reading on the first drop and then every N drops
const DROP_LOG_EVERY: u64 = 1000;

/// Parameters the serial worker needs to open the log
#[derive(Debug, Clone)]
pub struct WriterTarget {
    pub dir: PathBuf,
    pub prefix: String,
    pub session_id: String,
    pub flush_every: usize,
}

enum WorkerCommand {
    Append { kind: ReadingKind, line: String },
    Close,
}

/// Counters shared between producers, the worker and status readers
#[derive(Debug, Default)]
pub struct PipelineStats {
    accepted: [AtomicU64; 3],
    written: [AtomicU64; 3],
    dropped: AtomicU64,
    rejected: AtomicU64,
    lost: AtomicU64,
    write_errors: AtomicU64,
    writer_failed: AtomicBool,
    log_path: Mutex<Option<PathBuf>>,
}

/// Point-in-time copy of `PipelineStats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    /// Readings queued for the writer, per kind
    pub accepted: [u64; 3],
    /// Lines flushed to the log, per kind
    pub written: [u64; 3],
    /// Readings dropped on a full queue
    pub dropped: u64,
    /// Readings submitted after the router was sealed
    pub rejected: u64,
    /// Queued lines that never reached the log
    pub lost: u64,
    pub write_errors: u64,
    pub writer_failed: bool,
    pub log_path: Option<PathBuf>,
}

impl PipelineSnapshot {
    pub fn written(&self, kind: ReadingKind) -> u64 {
        self.written[kind.index()]
    }

    pub fn accepted(&self, kind: ReadingKind) -> u64 {
        self.accepted[kind.index()]
    }

    pub fn total_written(&self) -> u64 {
        self.written.iter().sum()
    }
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineSnapshot {
        let load = |counters: &[AtomicU64; 3]| {
            [
                counters[0].load(Ordering::Relaxed),
                counters[1].load(Ordering::Relaxed),
                counters[2].load(Ordering::Relaxed),
            ]
        };
        PipelineSnapshot {
            accepted: load(&self.accepted),
            written: load(&self.written),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            writer_failed: self.writer_failed.load(Ordering::Relaxed),
            log_path: self.log_path.lock().ok().and_then(|p| p.clone()),
        }
    }

    /// Mirror the writer's own account of its lines
    fn record(&self, writer: &LogWriter) {
        let tally = writer.tally();
        for (counter, written) in self.written.iter().zip(tally.written.iter()) {
            counter.store(*written, Ordering::Relaxed);
        }
        self.lost.store(tally.lost, Ordering::Relaxed);
        self.write_errors.store(tally.errors, Ordering::Relaxed);
        self.writer_failed.store(writer.is_failed(), Ordering::Relaxed);
    }
}

/// Single entry point for all event sources of one session
pub struct IngestionRouter {
    queue: RwLock<Option<Sender<WorkerCommand>>>,
    submit_timeout: Duration,
    stats: Arc<PipelineStats>,
}

impl IngestionRouter {
    /// Spawn the serial worker and return both halves once it has opened the log.
    ///
    /// The log path (and so the final file name) is in `stats()` on return.
    pub fn spawn(
        target: WriterTarget,
        queue_capacity: usize,
        submit_timeout: Duration,
    ) -> Result<(Arc<IngestionRouter>, SerialWorker)> {
        let (tx, rx) = channel::bounded::<WorkerCommand>(queue_capacity.max(1));
        let (opened_tx, opened_rx) = channel::bounded::<()>(1);
        let stats = Arc::new(PipelineStats::default());

        let worker_stats = Arc::clone(&stats);
        let handle = thread::Builder::new()
            .name("log-writer".to_string())
            .spawn(move || run_worker(target, rx, worker_stats, opened_tx))
            .map_err(|e| RecorderError::Internal(format!("Failed to spawn log writer: {}", e)))?;

        if opened_rx.recv().is_err() {
            warn!("[router] Log writer exited before opening the log");
        }

        let router = Arc::new(IngestionRouter {
            queue: RwLock::new(Some(tx)),
            submit_timeout,
            stats,
        });

        Ok((router, SerialWorker { handle: Some(handle) }))
    }

    /// Queue a reading for the log.
    ///
    /// Waits at most `submit_timeout` on a full queue; after that the reading
    /// is dropped and counted.
    pub fn submit(&self, reading: Reading) -> Result<()> {
        let guard = self.queue.read().map_err(|_| lock_poisoned("router queue"))?;
        let tx = match guard.as_ref() {
            Some(tx) => tx,
            None => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(RecorderError::NotRunning);
            }
        };

        let kind = reading.kind();
        let command = WorkerCommand::Append {
            kind,
            line: reading.to_line(),
        };

        match tx.send_timeout(command, self.submit_timeout) {
            Ok(()) => {
                self.stats.accepted[kind.index()].fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % DROP_LOG_EVERY == 0 {
                    warn!(
                        "[router] Write queue full, {} reading(s) dropped so far",
                        dropped
                    );
                }
                Err(RecorderError::QueueFull)
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(RecorderError::NotRunning)
            }
        }
    }

    pub fn submit_accelerometer(&self, timestamp_ms: i64, x: f64, y: f64, z: f64) -> Result<()> {
        self.submit(Reading::accelerometer(timestamp_ms, x, y, z))
    }

    pub fn submit_gyroscope(&self, timestamp_ms: i64, x: f64, y: f64, z: f64) -> Result<()> {
        self.submit(Reading::gyroscope(timestamp_ms, x, y, z))
    }

    pub fn submit_location(&self, timestamp_ms: i64, latitude: f64, longitude: f64) -> Result<()> {
        self.submit(Reading::location(timestamp_ms, latitude, longitude))
    }

    /// Stop accepting readings and queue `Close` behind everything already queued.
    ///
    /// Waits for in-flight submissions, so once this returns nothing else can
    /// reach the writer. Calling it again is a no-op.
    pub fn seal(&self) -> Result<()> {
        let mut guard = self.queue.write().map_err(|_| lock_poisoned("router queue"))?;
        if let Some(tx) = guard.take() {
            // Blocking send: the worker is draining, so this waits at most one queue's worth
            if tx.send(WorkerCommand::Close).is_err() {
                debug!("[router] Log writer already gone at seal");
            }
        }
        Ok(())
    }

    pub fn is_accepting(&self) -> bool {
        self.queue.read().map(|q| q.is_some()).unwrap_or(false)
    }

    pub fn stats(&self) -> PipelineSnapshot {
        self.stats.snapshot()
    }
}

/// Handle to the `log-writer` thread
pub struct SerialWorker {
    handle: Option<JoinHandle<()>>,
}

impl SerialWorker {
    /// Wait for the worker to drain its queue and close the log
    pub fn join(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| RecorderError::Internal("Log writer thread panicked".to_string())),
            None => Ok(()),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }
}

fn run_worker(
    target: WriterTarget,
    rx: Receiver<WorkerCommand>,
    stats: Arc<PipelineStats>,
    opened: Sender<()>,
) {
    let mut writer = LogWriter::open(
        &target.dir,
        &target.prefix,
        &target.session_id,
        target.flush_every,
    );
    if let Ok(mut path) = stats.log_path.lock() {
        *path = writer.path().map(|p| p.to_path_buf());
    }
    stats.record(&writer);
    let _ = opened.send(());
    drop(opened);

    for command in rx.iter() {
        match command {
            WorkerCommand::Append { kind, line } => {
                if let Err(e) = writer.append(kind, &line) {
                    debug!("[worker] Skipped line: {}", e);
                }
                // Caught up with the producers: push what we have to the file
                if rx.is_empty() {
                    if let Err(e) = writer.flush() {
                        debug!("[worker] Flush failed: {}", e);
                    }
                }
                stats.record(&writer);
            }
            WorkerCommand::Close => break,
        }
    }

    // Reached on Close or when every sender is gone
    if let Err(e) = writer.close() {
        debug!("[worker] Close failed: {}", e);
    }
    stats.record(&writer);
    let snapshot = stats.snapshot();
    info!(
        "[worker] Log writer finished: {} line(s) written, {} lost, {} error(s)",
        snapshot.total_written(),
        snapshot.lost,
        snapshot.write_errors
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn target(dir: &TempDir, session_id: &str) -> WriterTarget {
        WriterTarget {
            dir: dir.path().to_path_buf(),
            prefix: "test_".to_string(),
            session_id: session_id.to_string(),
            flush_every: 0,
        }
    }

    #[test]
    fn test_submissions_drain_before_close() {
        let dir = TempDir::new().unwrap();
        let (router, mut worker) =
            IngestionRouter::spawn(target(&dir, "drain"), 16, Duration::from_secs(1)).unwrap();

        for i in 0..200 {
            router.submit_accelerometer(i, 0.0, 0.0, 9.81).unwrap();
        }
        router.submit_location(500, 37.0, -122.0).unwrap();
        router.seal().unwrap();
        worker.join().unwrap();

        let stats = router.stats();
        assert_eq!(stats.written(ReadingKind::Accelerometer), 200);
        assert_eq!(stats.written(ReadingKind::Location), 1);
        for kind in ReadingKind::ALL {
            assert_eq!(stats.accepted(kind), stats.written(kind));
        }
        assert_eq!(stats.lost, 0);

        let contents = fs::read_to_string(stats.log_path.unwrap()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 202);
        assert_eq!(lines[1], "0,Accelerometer,0.0,0.0,9.81,,");
        assert_eq!(lines[201], "500,Location,,,,37.0,-122.0");
    }

    #[test]
    fn test_submit_after_seal_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (router, mut worker) =
            IngestionRouter::spawn(target(&dir, "sealed"), 4, Duration::from_millis(10)).unwrap();

        router.seal().unwrap();
        assert!(!router.is_accepting());
        assert_eq!(
            router.submit_gyroscope(1, 0.0, 0.0, 0.0),
            Err(RecorderError::NotRunning)
        );
        // Second seal is harmless
        router.seal().unwrap();
        worker.join().unwrap();
        assert!(worker.is_finished());
        assert_eq!(router.stats().rejected, 1);
    }

    #[test]
    fn test_per_source_order_with_concurrent_producers() {
        let dir = TempDir::new().unwrap();
        let (router, mut worker) =
            IngestionRouter::spawn(target(&dir, "order"), 64, Duration::from_secs(1)).unwrap();

        let accel_router = Arc::clone(&router);
        let accel = thread::spawn(move || {
            for i in 0..300 {
                accel_router.submit_accelerometer(i, i as f64, 0.0, 0.0).unwrap();
            }
        });
        let gyro_router = Arc::clone(&router);
        let gyro = thread::spawn(move || {
            for i in 0..300 {
                gyro_router.submit_gyroscope(i, i as f64, 0.0, 0.0).unwrap();
            }
        });
        accel.join().unwrap();
        gyro.join().unwrap();
        router.seal().unwrap();
        worker.join().unwrap();

        let contents = fs::read_to_string(router.stats().log_path.unwrap()).unwrap();
        for label in ["Accelerometer", "Gyroscope"] {
            let stamps: Vec<i64> = contents
                .lines()
                .skip(1)
                .filter(|l| l.split(',').nth(1) == Some(label))
                .map(|l| l.split(',').next().unwrap().parse().unwrap())
                .collect();
            assert_eq!(stamps, (0..300).collect::<Vec<i64>>());
        }
    }

    #[test]
    fn test_failed_storage_counts_errors() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, "x").unwrap();

        let target = WriterTarget {
            dir: blocker,
            prefix: "test_".to_string(),
            session_id: "fail".to_string(),
            flush_every: 0,
        };
        let (router, mut worker) =
            IngestionRouter::spawn(target, 8, Duration::from_secs(1)).unwrap();
        router.submit_location(1, 1.0, 2.0).unwrap();
        router.seal().unwrap();
        worker.join().unwrap();

        let stats = router.stats();
        assert!(stats.writer_failed);
        assert_eq!(stats.total_written(), 0);
        assert_eq!(stats.write_errors, 1);
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.accepted(ReadingKind::Location), 1);
        assert!(stats.log_path.is_none());
    }

    #[test]
    fn test_log_path_known_when_spawn_returns() {
        let dir = TempDir::new().unwrap();
        let (router, mut worker) =
            IngestionRouter::spawn(target(&dir, "early"), 4, Duration::from_secs(1)).unwrap();

        let path = router.stats().log_path.unwrap();
        assert_eq!(path.file_name().unwrap(), "test_early.csv");
        router.seal().unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_lines_are_flushed_while_running() {
        let dir = TempDir::new().unwrap();
        let (router, mut worker) =
            IngestionRouter::spawn(target(&dir, "live"), 16, Duration::from_secs(1)).unwrap();
        router.submit_gyroscope(1, 0.1, 0.2, 0.3).unwrap();

        // The worker flushes once it has drained the queue
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while router.stats().written(ReadingKind::Gyroscope) == 0 {
            assert!(std::time::Instant::now() < deadline, "line never flushed");
            thread::sleep(Duration::from_millis(5));
        }
        let contents = fs::read_to_string(router.stats().log_path.unwrap()).unwrap();
        assert!(contents.ends_with("1,Gyroscope,0.1,0.2,0.3,,\n"));

        router.seal().unwrap();
        worker.join().unwrap();
    }
}
