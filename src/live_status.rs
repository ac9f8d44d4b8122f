use crate::controller::RecordingState;
use crate::sources::SkippedSource;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Snapshot of the recorder for out-of-process observers
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LiveStatus {
    pub timestamp_ms: i64,
    pub state: RecordingState,
    pub session_id: Option<String>,
    pub log_path: Option<PathBuf>,
    pub accelerometer_lines: u64,
    pub gyroscope_lines: u64,
    pub location_lines: u64,
    pub dropped_readings: u64,
    #[serde(default)]
    pub lost_lines: u64,
    pub write_errors: u64,
    pub writer_failed: bool,
    pub skipped_sources: Vec<SkippedSource>,
    pub session_seconds: u64,
    pub uptime_seconds: u64,
}

impl LiveStatus {
    pub fn new() -> Self {
        Self {
            timestamp_ms: crate::reading::now_millis(),
            state: RecordingState::Stopped,
            session_id: None,
            log_path: None,
            accelerometer_lines: 0,
            gyroscope_lines: 0,
            location_lines: 0,
            dropped_readings: 0,
            lost_lines: 0,
            write_errors: 0,
            writer_failed: false,
            skipped_sources: Vec::new(),
            session_seconds: 0,
            uptime_seconds: 0,
        }
    }

    pub fn total_lines(&self) -> u64 {
        self.accelerometer_lines + self.gyroscope_lines + self.location_lines
    }

    /// Write as pretty JSON, replacing any previous snapshot atomically
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl Default for LiveStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::ReadingKind;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("live_status.json");

        let mut status = LiveStatus::new();
        status.state = RecordingState::Running;
        status.session_id = Some("20250101_000000".to_string());
        status.accelerometer_lines = 10;
        status.location_lines = 2;
        status.skipped_sources.push(SkippedSource {
            name: "gyroscope".to_string(),
            kind: ReadingKind::Gyroscope,
            reason: "gyroscope not available on this device".to_string(),
        });
        status.save(&path).unwrap();

        let loaded = LiveStatus::load(&path).unwrap();
        assert_eq!(loaded, status);
        assert_eq!(loaded.total_lines(), 12);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(LiveStatus::load(&dir.path().join("absent.json")).is_err());
    }
}
