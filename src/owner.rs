//! Which recorder holds the recording, and whether it is still alive.
//!
//! The persisted flag names its owner: the process id, that process's start
//! time (so a recycled pid is not mistaken for the owner) and an instance
//! number telling apart controllers living in the same process.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use sysinfo::{Pid, ProcessesToUpdate, System};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);
static LIVE_INSTANCES: Mutex<Vec<u64>> = Mutex::new(Vec::new());
static OWN_START: OnceLock<Option<u64>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderOwner {
    pub pid: u32,
    pub instance: u64,
    /// Process start time in seconds since the Unix epoch, when it could be read
    #[serde(default)]
    pub process_started_secs: Option<u64>,
}

impl RecorderOwner {
    /// Identity for a new controller; it counts as alive until `release`
    pub(crate) fn register() -> Self {
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut live) = LIVE_INSTANCES.lock() {
            live.push(instance);
        }
        RecorderOwner {
            pid: std::process::id(),
            instance,
            process_started_secs: own_start_time(),
        }
    }

    pub(crate) fn release(&self) {
        if let Ok(mut live) = LIVE_INSTANCES.lock() {
            live.retain(|i| *i != self.instance);
        }
    }

    /// True while the controller that wrote this owner could still be recording
    pub fn is_alive(&self) -> bool {
        if self.pid == std::process::id() && self.process_started_secs == own_start_time() {
            return LIVE_INSTANCES
                .lock()
                .map(|live| live.contains(&self.instance))
                .unwrap_or(false);
        }
        match (process_start_time(self.pid), self.process_started_secs) {
            (None, _) => false,
            (Some(started), Some(expected)) => started == expected,
            (Some(_), None) => true,
        }
    }
}

fn own_start_time() -> Option<u64> {
    *OWN_START.get_or_init(|| process_start_time(std::process::id()))
}

fn process_start_time(pid: u32) -> Option<u64> {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
    system.process(pid).map(|process| process.start_time())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_owner_is_alive_until_released() {
        let owner = RecorderOwner::register();
        assert_eq!(owner.pid, std::process::id());
        assert!(owner.is_alive());

        owner.release();
        assert!(!owner.is_alive());
    }

    #[test]
    fn test_instances_are_distinct() {
        let a = RecorderOwner::register();
        let b = RecorderOwner::register();
        assert_ne!(a.instance, b.instance);
        a.release();
        assert!(b.is_alive());
        b.release();
    }

    #[test]
    fn test_owner_from_earlier_process_is_dead() {
        // Same pid, but a process that started at a different time
        let owner = RecorderOwner {
            pid: std::process::id(),
            instance: 1,
            process_started_secs: Some(1),
        };
        assert!(!owner.is_alive());
    }

    #[test]
    fn test_missing_process_is_dead() {
        let owner = RecorderOwner {
            pid: u32::MAX - 7,
            instance: 1,
            process_started_secs: None,
        };
        assert!(!owner.is_alive());
    }
}
