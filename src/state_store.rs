use crate::error::{lock_poisoned, RecorderError, Result};
use crate::owner::RecorderOwner;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Durable lifecycle flag, the source of truth for observers that may have
/// missed a notification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleState {
    pub is_recording: bool,
    /// Milliseconds since the Unix epoch of the last start/stop
    #[serde(default)]
    pub last_transition_ms: Option<i64>,
    /// Recorder holding the recording; only set while `is_recording`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<RecorderOwner>,
}

impl LifecycleState {
    pub fn running(at_ms: i64) -> Self {
        Self {
            is_recording: true,
            last_transition_ms: Some(at_ms),
            owner: None,
        }
    }

    pub fn with_owner(mut self, owner: RecorderOwner) -> Self {
        self.owner = Some(owner);
        self
    }

    /// The live recorder named by this state, if it is recording
    pub fn live_owner(&self) -> Option<RecorderOwner> {
        self.owner.filter(|owner| self.is_recording && owner.is_alive())
    }

    pub fn stopped(at_ms: i64) -> Self {
        Self {
            is_recording: false,
            last_transition_ms: Some(at_ms),
            owner: None,
        }
    }
}

/// Key/value persistence of the lifecycle flag
pub trait StateStore: Send + Sync {
    /// Read the flag; a store that was never written reads as stopped
    fn load(&self) -> Result<LifecycleState>;

    fn save(&self, state: &LifecycleState) -> Result<()>;
}

/// JSON file store, replaced atomically on every save
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonStateStore {
    fn load(&self) -> Result<LifecycleState> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LifecycleState::default())
            }
            Err(e) => return Err(RecorderError::StateStore(e.to_string())),
        };
        serde_json::from_str(&text).map_err(|e| {
            RecorderError::StateStore(format!("{}: {}", self.path.display(), e))
        })
    }

    fn save(&self, state: &LifecycleState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| RecorderError::StateStore(e.to_string()))?;
            }
        }

        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| RecorderError::StateStore(format!("{}: {}", self.path.display(), e)))
    }
}

/// In-process store that counts writes
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<LifecycleState>,
    writes: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `state`, e.g. a flag left behind by a killed process
    pub fn with_state(state: LifecycleState) -> Self {
        Self {
            state: Mutex::new(state),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<LifecycleState> {
        self.state
            .lock()
            .map(|s| *s)
            .map_err(|_| lock_poisoned("state store"))
    }

    fn save(&self, state: &LifecycleState) -> Result<()> {
        let mut current = self.state.lock().map_err(|_| lock_poisoned("state store"))?;
        *current = *state;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_reads_stopped() {
        let dir = TempDir::new().unwrap();
        let store = JsonStateStore::new(dir.path().join("state.json"));
        assert_eq!(store.load().unwrap(), LifecycleState::default());
        assert!(!store.load().unwrap().is_recording);
    }

    #[test]
    fn test_json_roundtrip_uses_flag_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let store = JsonStateStore::new(&path);

        store.save(&LifecycleState::running(1234)).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"is_recording\": true"));

        let loaded = store.load().unwrap();
        assert!(loaded.is_recording);
        assert_eq!(loaded.last_transition_ms, Some(1234));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_flag_only_file_is_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"is_recording": true}"#).unwrap();

        let loaded = JsonStateStore::new(&path).load().unwrap();
        assert!(loaded.is_recording);
        assert_eq!(loaded.last_transition_ms, None);
    }

    #[test]
    fn test_owner_is_persisted() {
        let dir = TempDir::new().unwrap();
        let store = JsonStateStore::new(dir.path().join("state.json"));
        let owner = RecorderOwner::register();

        store
            .save(&LifecycleState::running(5).with_owner(owner))
            .unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.owner, Some(owner));
        assert_eq!(loaded.live_owner(), Some(owner));

        owner.release();
        assert_eq!(store.load().unwrap().live_owner(), None);
        assert_eq!(LifecycleState::stopped(6).with_owner(owner).live_owner(), None);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{{{").unwrap();
        assert!(matches!(
            JsonStateStore::new(&path).load(),
            Err(RecorderError::StateStore(_))
        ));
    }

    #[test]
    fn test_memory_store_counts_writes() {
        let store = MemoryStateStore::with_state(LifecycleState::running(1));
        assert!(store.load().unwrap().is_recording);
        store.save(&LifecycleState::stopped(2)).unwrap();
        assert_eq!(store.writes(), 1);
        assert!(!store.load().unwrap().is_recording);
    }
}
