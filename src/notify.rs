use crate::error::{lock_poisoned, Result};
use crossbeam::channel::{self, Receiver, Sender};
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Lifecycle signal delivered to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Started,
    Stopped,
}

/// In-process publish/subscribe of lifecycle events.
///
/// Delivery is at-most-once and not durable: an observer that subscribes
/// late, or drops its receiver, misses events. Observers that need the
/// current state read the persisted `LifecycleState` instead.
#[derive(Default)]
pub struct Notifier {
    observers: Mutex<Vec<Sender<LifecycleEvent>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<LifecycleEvent> {
        let (tx, rx) = channel::unbounded();
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(tx);
        }
        rx
    }

    /// Deliver to every live observer; returns how many received it
    pub fn publish(&self, event: LifecycleEvent) -> Result<usize> {
        let mut observers = self.observers.lock().map_err(|_| lock_poisoned("notifier"))?;
        observers.retain(|tx| tx.send(event).is_ok());
        debug!("[notify] {:?} delivered to {} observer(s)", event, observers.len());
        Ok(observers.len())
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().map(|o| o.len()).unwrap_or(0)
    }
}
