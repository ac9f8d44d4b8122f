use crate::config::RecorderConfig;
use crate::error::Result;
use crate::reading::{now_millis, ReadingKind};
use crate::router::{IngestionRouter, PipelineSnapshot, SerialWorker, WriterTarget};
use crate::sources::SkippedSource;
use crate::writer::session_id_from_path;
use chrono::{DateTime, Local};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// What a finished session produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub log_path: Option<PathBuf>,
    pub accelerometer_lines: u64,
    pub gyroscope_lines: u64,
    pub location_lines: u64,
    pub dropped: u64,
    /// Lines queued for the log that never reached it
    pub lost_lines: u64,
    pub write_errors: u64,
    pub writer_failed: bool,
    pub skipped_sources: Vec<SkippedSource>,
}

impl SessionSummary {
    pub fn lines(&self, kind: ReadingKind) -> u64 {
        match kind {
            ReadingKind::Accelerometer => self.accelerometer_lines,
            ReadingKind::Gyroscope => self.gyroscope_lines,
            ReadingKind::Location => self.location_lines,
        }
    }

    pub fn total_lines(&self) -> u64 {
        self.accelerometer_lines + self.gyroscope_lines + self.location_lines
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.ended_at_ms - self.started_at_ms).max(0) as f64 / 1000.0
    }
}

/// One recording run. Owns the router and the serial worker (and through
/// it the open log) until `close`.
pub struct Session {
    id: String,
    started_at_ms: i64,
    router: Arc<IngestionRouter>,
    worker: SerialWorker,
    skipped: Vec<SkippedSource>,
    closed: bool,
}

impl Session {
    /// Spawn the serial worker and open the log.
    ///
    /// The id is the start time, plus the file name's collision suffix when an
    /// earlier session already took that second.
    pub fn open(config: &RecorderConfig, started_at: DateTime<Local>) -> Result<Self> {
        let base_id = session_id_for(&started_at);
        let target = WriterTarget {
            dir: config.output_dir.clone(),
            prefix: config.file_prefix.clone(),
            session_id: base_id.clone(),
            flush_every: config.flush_every_lines,
        };
        let (router, worker) =
            IngestionRouter::spawn(target, config.queue_capacity, config.submit_timeout())?;
        let id = router
            .stats()
            .log_path
            .and_then(|path| session_id_from_path(&path, &config.file_prefix))
            .unwrap_or(base_id);

        info!("[session] {} opened", id);
        Ok(Session {
            id,
            started_at_ms: started_at.timestamp_millis(),
            router,
            worker,
            skipped: Vec::new(),
            closed: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at_ms(&self) -> i64 {
        self.started_at_ms
    }

    pub fn router(&self) -> Arc<IngestionRouter> {
        Arc::clone(&self.router)
    }

    pub fn record_skipped(&mut self, skipped: SkippedSource) {
        self.skipped.push(skipped);
    }

    pub fn skipped(&self) -> &[SkippedSource] {
        &self.skipped
    }

    pub fn stats(&self) -> PipelineSnapshot {
        self.router.stats()
    }

    /// Seal the router, let the worker drain and close the log.
    ///
    /// Sources must already be unregistered.
    pub fn close(mut self) -> Result<SessionSummary> {
        self.shutdown()?;
        Ok(self.summary(now_millis()))
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.router.seal()?;
        self.worker.join()
    }

    fn summary(&self, ended_at_ms: i64) -> SessionSummary {
        let stats = self.router.stats();
        SessionSummary {
            session_id: self.id.clone(),
            started_at_ms: self.started_at_ms,
            ended_at_ms,
            log_path: stats.log_path.clone(),
            accelerometer_lines: stats.written(ReadingKind::Accelerometer),
            gyroscope_lines: stats.written(ReadingKind::Gyroscope),
            location_lines: stats.written(ReadingKind::Location),
            dropped: stats.dropped,
            lost_lines: stats.lost,
            write_errors: stats.write_errors,
            writer_failed: stats.writer_failed,
            skipped_sources: self.skipped.clone(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("[session] {} did not close cleanly: {}", self.id, e);
        }
    }
}

/// Session id derived from the start time, used as the log file stem
pub fn session_id_for(started_at: &DateTime<Local>) -> String {
    started_at.format("%Y%m%d_%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_session_id_format() {
        let at = Local.with_ymd_and_hms(2025, 11, 19, 8, 5, 3).unwrap();
        assert_eq!(session_id_for(&at), "20251119_080503");
    }

    #[test]
    fn test_close_reports_counts() {
        let dir = TempDir::new().unwrap();
        let config = RecorderConfig::with_output_dir(dir.path());
        let mut session = Session::open(&config, Local::now()).unwrap();
        session.record_skipped(SkippedSource {
            name: "gyroscope".to_string(),
            kind: ReadingKind::Gyroscope,
            reason: "not available".to_string(),
        });

        let router = session.router();
        router.submit_accelerometer(1, 0.1, 0.2, 9.8).unwrap();
        router.submit_accelerometer(2, 0.1, 0.2, 9.8).unwrap();
        router.submit_location(3, 37.0, -122.0).unwrap();

        let summary = session.close().unwrap();
        assert_eq!(summary.accelerometer_lines, 2);
        assert_eq!(summary.location_lines, 1);
        assert_eq!(summary.total_lines(), 3);
        assert_eq!(summary.lines(ReadingKind::Accelerometer), 2);
        assert_eq!(summary.lost_lines, 0);
        assert_eq!(summary.skipped_sources.len(), 1);
        assert!(!summary.writer_failed);

        let path = summary.log_path.unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("sensor_data_"));
        assert_eq!(fs::read_to_string(path).unwrap().lines().count(), 4);
        assert!(!router.is_accepting());
    }

    #[test]
    fn test_same_second_sessions_get_distinct_ids() {
        let dir = TempDir::new().unwrap();
        let config = RecorderConfig::with_output_dir(dir.path());
        let at = Local.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let first = Session::open(&config, at).unwrap();
        let second = Session::open(&config, at).unwrap();
        assert_eq!(first.id(), "20250101_000000");
        assert_eq!(second.id(), "20250101_000000_1");

        let first = first.close().unwrap();
        let second = second.close().unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert!(second
            .log_path
            .unwrap()
            .ends_with("sensor_data_20250101_000000_1.csv"));
    }

    #[test]
    fn test_failed_log_keeps_time_based_id() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, "x").unwrap();
        let config = RecorderConfig::with_output_dir(&blocker);
        let at = Local.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let session = Session::open(&config, at).unwrap();
        assert_eq!(session.id(), "20250101_000000");
        assert!(session.close().unwrap().writer_failed);
    }

    #[test]
    fn test_drop_drains_open_session() {
        let dir = TempDir::new().unwrap();
        let config = RecorderConfig::with_output_dir(dir.path());
        let session = Session::open(&config, Local::now()).unwrap();
        let router = session.router();
        router.submit_gyroscope(7, 0.0, 0.0, 0.1).unwrap();
        drop(session);

        let path = router.stats().log_path.unwrap();
        let contents = fs::read_to_string(path).unwrap();
        assert!(contents.ends_with("7,Gyroscope,0.0,0.0,0.1,,\n"));
    }
}
