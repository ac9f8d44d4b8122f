//! External stop trigger.
//!
//! A system-level action (a quick-settings tile, a shell shortcut, another
//! process) can stop the recording without any UI being alive. In-process
//! callers hold a `StopTrigger`; out-of-process callers drop a marker file
//! that `watch_stop_requests` picks up.

use crate::controller::{LifecycleController, StopOutcome};
use crate::error::Result;
use log::{debug, error, info};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct StopTrigger {
    controller: Arc<LifecycleController>,
}

impl StopTrigger {
    pub fn new(controller: Arc<LifecycleController>) -> Self {
        Self { controller }
    }

    /// Forward one stop request. A no-op if nothing is recording.
    pub fn fire(&self) -> Result<StopOutcome> {
        info!("[trigger] Stop requested");
        self.controller.stop()
    }
}

/// Marker file used as a stop button across processes
#[derive(Debug, Clone)]
pub struct StopRequestFile {
    path: PathBuf,
}

impl StopRequestFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File a request. Filing twice before it is taken still means one stop.
    pub fn request(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        writeln!(file, "{}", crate::reading::now_millis())?;
        file.sync_all()
    }

    /// Consume a pending request; true if there was one
    pub fn take(&self) -> io::Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Discard a request left over from an earlier run
    pub fn clear(&self) -> io::Result<()> {
        if self.take()? {
            debug!("[trigger] Cleared stale stop request {}", self.path.display());
        }
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.path.exists()
    }
}

/// Poll `file` until a stop request shows up, then fire `trigger` once.
///
/// Returns the outcome of that stop. The stop itself drains the writer, so
/// it runs on a blocking thread.
pub async fn watch_stop_requests(
    file: StopRequestFile,
    trigger: StopTrigger,
    poll: Duration,
) -> Result<StopOutcome> {
    let mut interval = tokio::time::interval(poll);
    loop {
        interval.tick().await;
        match file.take() {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => error!("[trigger] Cannot read {}: {}", file.path().display(), e),
        }
    }

    tokio::task::spawn_blocking(move || trigger.fire())
        .await
        .map_err(|e| crate::RecorderError::Internal(format!("stop task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecorderConfig;
    use crate::notify::{LifecycleEvent, Notifier};
    use crate::state_store::MemoryStateStore;
    use tempfile::TempDir;

    fn running_controller(dir: &TempDir) -> (Arc<LifecycleController>, Arc<Notifier>) {
        let notifier = Arc::new(Notifier::new());
        let controller = Arc::new(
            LifecycleController::new(
                RecorderConfig::with_output_dir(dir.path()),
                Vec::new(),
                Arc::new(MemoryStateStore::new()),
                Arc::clone(&notifier),
            )
            .unwrap(),
        );
        controller.start().unwrap();
        (controller, notifier)
    }

    #[test]
    fn test_request_take_clear() {
        let dir = TempDir::new().unwrap();
        let file = StopRequestFile::new(dir.path().join("nested").join("stop.request"));

        assert!(!file.take().unwrap());
        file.request().unwrap();
        file.request().unwrap();
        assert!(file.is_pending());
        assert!(file.take().unwrap());
        assert!(!file.take().unwrap());

        file.request().unwrap();
        file.clear().unwrap();
        assert!(!file.is_pending());
    }

    #[test]
    fn test_fire_stops_once() {
        let dir = TempDir::new().unwrap();
        let (controller, notifier) = running_controller(&dir);
        let events = notifier.subscribe();
        let trigger = StopTrigger::new(Arc::clone(&controller));

        assert!(matches!(trigger.fire().unwrap(), StopOutcome::Stopped(_)));
        assert_eq!(trigger.fire().unwrap(), StopOutcome::AlreadyStopped);
        assert!(!controller.is_recording());

        let received: Vec<LifecycleEvent> = events.try_iter().collect();
        assert_eq!(received, vec![LifecycleEvent::Stopped]);
    }

    #[tokio::test]
    async fn test_watcher_fires_on_request() {
        let dir = TempDir::new().unwrap();
        let (controller, _) = running_controller(&dir);
        let file = StopRequestFile::new(dir.path().join("stop.request"));

        let watcher = tokio::spawn(watch_stop_requests(
            file.clone(),
            StopTrigger::new(Arc::clone(&controller)),
            Duration::from_millis(10),
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(controller.is_recording());

        file.request().unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(matches!(outcome, StopOutcome::Stopped(_)));
        assert!(!controller.is_recording());
        assert!(!file.is_pending());
    }
}
