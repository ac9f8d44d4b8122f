use crate::error::{RecorderError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where readings come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceBackend {
    /// Synthetic waveforms, always available
    Simulated,
    /// Termux:API tools (`termux-sensor`, `termux-location`)
    Termux,
}

impl Default for SourceBackend {
    fn default() -> Self {
        SourceBackend::Simulated
    }
}

/// Recorder configuration, loadable from JSON. Missing keys take defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub output_dir: PathBuf,
    pub file_prefix: String,
    /// Persisted lifecycle flag; defaults to `<output_dir>/recorder_state.json`
    pub state_file: Option<PathBuf>,
    /// Live status snapshot; defaults to `<output_dir>/live_status.json`
    pub status_file: Option<PathBuf>,
    /// Cross-process stop marker; defaults to `<output_dir>/stop.request`
    pub stop_request_file: Option<PathBuf>,
    pub queue_capacity: usize,
    pub submit_timeout_ms: u64,
    /// Flush after this many lines (0 = only on close)
    pub flush_every_lines: usize,
    pub motion_interval_ms: u64,
    pub location_interval_ms: u64,
    pub location_min_interval_ms: u64,
    pub backend: SourceBackend,
    pub enable_accelerometer: bool,
    pub enable_gyroscope: bool,
    pub enable_location: bool,
    pub status_interval_secs: u64,
    pub trigger_poll_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            file_prefix: "sensor_data_".to_string(),
            state_file: None,
            status_file: None,
            stop_request_file: None,
            queue_capacity: 4096,
            submit_timeout_ms: 50,
            flush_every_lines: 500,
            motion_interval_ms: 20, // ~50Hz
            location_interval_ms: 1000,
            location_min_interval_ms: 500,
            backend: SourceBackend::Simulated,
            enable_accelerometer: true,
            enable_gyroscope: true,
            enable_location: true,
            status_interval_secs: 2,
            trigger_poll_ms: 500,
        }
    }
}

impl RecorderConfig {
    /// Default configuration writing into `output_dir`
    pub fn with_output_dir(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    /// Load from a JSON file and validate
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RecorderError::InvalidParameters(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: RecorderConfig = serde_json::from_str(&text).map_err(|e| {
            RecorderError::InvalidParameters(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(RecorderError::InvalidParameters(
                "queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.motion_interval_ms == 0 || self.location_interval_ms == 0 {
            return Err(RecorderError::InvalidParameters(
                "sampling intervals must be greater than zero".to_string(),
            ));
        }
        if self.location_min_interval_ms > self.location_interval_ms {
            return Err(RecorderError::InvalidParameters(format!(
                "location_min_interval_ms ({}) exceeds location_interval_ms ({})",
                self.location_min_interval_ms, self.location_interval_ms
            )));
        }
        if self.file_prefix.contains(|c: char| c == '/' || c == '\\') {
            return Err(RecorderError::InvalidParameters(
                "file_prefix must not contain path separators".to_string(),
            ));
        }
        Ok(())
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.output_dir.join("recorder_state.json"))
    }

    pub fn status_file(&self) -> PathBuf {
        self.status_file
            .clone()
            .unwrap_or_else(|| self.output_dir.join("live_status.json"))
    }

    pub fn stop_request_file(&self) -> PathBuf {
        self.stop_request_file
            .clone()
            .unwrap_or_else(|| self.output_dir.join("stop.request"))
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn motion_interval(&self) -> Duration {
        Duration::from_millis(self.motion_interval_ms)
    }

    pub fn location_interval(&self) -> Duration {
        Duration::from_millis(self.location_interval_ms)
    }

    pub fn location_min_interval(&self) -> Duration {
        Duration::from_millis(self.location_min_interval_ms)
    }

    pub fn trigger_poll(&self) -> Duration {
        Duration::from_millis(self.trigger_poll_ms.max(10))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RecorderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.state_file(), PathBuf::from("recordings/recorder_state.json"));
        assert_eq!(config.location_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: RecorderConfig =
            serde_json::from_str(r#"{"output_dir": "/tmp/rides", "backend": "termux"}"#).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/tmp/rides"));
        assert_eq!(config.backend, SourceBackend::Termux);
        assert_eq!(config.queue_capacity, 4096);
        assert_eq!(config.stop_request_file(), PathBuf::from("/tmp/rides/stop.request"));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = RecorderConfig::default();
        config.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = RecorderConfig::default();
        config.location_min_interval_ms = 5000;
        assert!(config.validate().is_err());

        let mut config = RecorderConfig::default();
        config.file_prefix = "../escape".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("recorder.json");
        std::fs::write(&path, r#"{"motion_interval_ms": 10, "enable_gyroscope": false}"#).unwrap();

        let config = RecorderConfig::load(&path).unwrap();
        assert_eq!(config.motion_interval_ms, 10);
        assert!(!config.enable_gyroscope);

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            RecorderConfig::load(&path),
            Err(RecorderError::InvalidParameters(_))
        ));
    }
}
