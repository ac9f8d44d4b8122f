//! Push-driven source: an external capability provider hands readings in
//! through a `ManualSourceHandle` from whatever thread it runs on.

use super::{EventSource, ReadingCallback, SourceError};
use crate::reading::{Reading, ReadingKind};
use log::{debug, info};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Shared {
    callback: Option<ReadingCallback>,
    availability: Result<(), SourceError>,
    min_interval_ms: i64,
    last_delivered: Option<i64>,
    delivered: u64,
}

pub struct ManualSource {
    name: String,
    kind: ReadingKind,
    shared: Arc<Mutex<Shared>>,
}

/// Producer side of a `ManualSource`
#[derive(Clone)]
pub struct ManualSourceHandle {
    kind: ReadingKind,
    shared: Arc<Mutex<Shared>>,
}

impl ManualSource {
    pub fn new(name: &str, kind: ReadingKind) -> (Self, ManualSourceHandle) {
        let shared = Arc::new(Mutex::new(Shared {
            callback: None,
            availability: Ok(()),
            min_interval_ms: 0,
            last_delivered: None,
            delivered: 0,
        }));
        let source = ManualSource {
            name: name.to_string(),
            kind,
            shared: Arc::clone(&shared),
        };
        (source, ManualSourceHandle { kind, shared })
    }

    /// Discard readings closer together than `interval` (position sources)
    pub fn with_min_interval(self, interval: Duration) -> Self {
        if let Ok(mut shared) = self.shared.lock() {
            shared.min_interval_ms = interval.as_millis() as i64;
        }
        self
    }
}

impl EventSource for ManualSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ReadingKind {
        self.kind
    }

    fn register(&mut self, callback: ReadingCallback) -> Result<(), SourceError> {
        let mut shared = self
            .shared
            .lock()
            .map_err(|_| SourceError::Failed(format!("{} lock poisoned", self.name)))?;
        shared.availability.clone()?;
        shared.callback = Some(callback);
        shared.last_delivered = None;
        info!("[{}] Registered", self.name);
        Ok(())
    }

    fn unregister(&mut self) {
        // Taking the lock waits out any delivery in progress
        if let Ok(mut shared) = self.shared.lock() {
            if shared.callback.take().is_some() {
                info!(
                    "[{}] Unregistered after {} readings",
                    self.name, shared.delivered
                );
            }
        }
    }
}

impl ManualSourceHandle {
    /// Deliver a reading. Returns false when the source is not registered,
    /// the reading is of the wrong kind, or it came too soon after the last one.
    pub fn push(&self, reading: Reading) -> bool {
        if reading.kind() != self.kind {
            debug!(
                "[manual] Ignoring {:?} reading on {:?} source",
                reading.kind(),
                self.kind
            );
            return false;
        }

        let mut shared = match self.shared.lock() {
            Ok(shared) => shared,
            Err(_) => return false,
        };
        let callback = match shared.callback.as_ref() {
            Some(callback) => Arc::clone(callback),
            None => return false,
        };
        if let Some(last) = shared.last_delivered {
            if reading.timestamp_ms() - last < shared.min_interval_ms {
                return false;
            }
        }
        shared.last_delivered = Some(reading.timestamp_ms());
        shared.delivered += 1;
        callback(reading);
        true
    }

    /// Make the next `register` fail, e.g. to model a missing sensor
    pub fn set_unavailable(&self, error: SourceError) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.availability = Err(error);
        }
    }

    pub fn set_available(&self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.availability = Ok(());
        }
    }

    pub fn is_registered(&self) -> bool {
        self.shared
            .lock()
            .map(|s| s.callback.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> (ReadingCallback, Arc<Mutex<Vec<i64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ReadingCallback = Arc::new(move |r: Reading| {
            sink.lock().unwrap().push(r.timestamp_ms());
        });
        (callback, seen)
    }

    #[test]
    fn test_push_only_while_registered() {
        let (mut source, handle) = ManualSource::new("accelerometer", ReadingKind::Accelerometer);
        let (callback, seen) = counter();

        assert!(!handle.push(Reading::accelerometer(1, 0.0, 0.0, 0.0)));
        source.register(callback).unwrap();
        assert!(handle.is_registered());
        assert!(handle.push(Reading::accelerometer(2, 0.0, 0.0, 0.0)));
        source.unregister();
        assert!(!handle.push(Reading::accelerometer(3, 0.0, 0.0, 0.0)));

        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_wrong_kind_is_ignored() {
        let (mut source, handle) = ManualSource::new("location", ReadingKind::Location);
        let (callback, seen) = counter();
        source.register(callback).unwrap();

        assert!(!handle.push(Reading::gyroscope(1, 0.0, 0.0, 0.0)));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unavailable_registration() {
        let (mut source, handle) = ManualSource::new("gyroscope", ReadingKind::Gyroscope);
        handle.set_unavailable(SourceError::Unavailable("gyroscope".to_string()));
        let (callback, _) = counter();

        assert!(source.register(Arc::clone(&callback)).is_err());
        assert!(!handle.is_registered());

        handle.set_available();
        assert!(source.register(callback).is_ok());
    }

    #[test]
    fn test_min_interval_throttles_fixes() {
        let (source, handle) = ManualSource::new("location", ReadingKind::Location);
        let mut source = source.with_min_interval(Duration::from_millis(500));
        let (callback, seen) = counter();
        source.register(callback).unwrap();

        assert!(handle.push(Reading::location(1000, 1.0, 1.0)));
        assert!(!handle.push(Reading::location(1200, 1.0, 1.0)));
        assert!(handle.push(Reading::location(1500, 1.0, 1.0)));

        assert_eq!(*seen.lock().unwrap(), vec![1000, 1500]);
    }
}
