//! Lifecycle Controller: the only place that starts and stops sources and
//! the log writer.
//!
//! ```text
//!            start (opens session, registers sources)
//!   Stopped ─────────────────────────────────────────▶ Running
//!      ▲                                                  │
//!      └──────────────────────────────────────────────────┘
//!            stop (unregisters sources, drains, closes)
//! ```
//!
//! Transitions are serialized by one mutex. Each transition persists the
//! lifecycle flag and then publishes a notification.
//!
//! The persisted flag names the recorder that set it. Another controller
//! sharing the same store leaves a live owner's flag alone and refuses to
//! start until that owner stops or dies.

use crate::config::RecorderConfig;
use crate::error::{lock_poisoned, Result};
use crate::live_status::LiveStatus;
use crate::notify::{LifecycleEvent, Notifier};
use crate::owner::RecorderOwner;
use crate::reading::{now_millis, Reading, ReadingKind};
use crate::session::{Session, SessionSummary};
use crate::sources::{EventSource, ReadingCallback, SkippedSource, SourceError};
use crate::state_store::{LifecycleState, StateStore};
use crate::RecorderError;
use chrono::Local;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Held from the owner check until the running flag is written
static CLAIM: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started {
        session_id: String,
        skipped: Vec<SkippedSource>,
    },
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped(SessionSummary),
    AlreadyStopped,
}

struct Inner {
    session: Option<Session>,
    sources: Vec<Box<dyn EventSource>>,
    last_summary: Option<SessionSummary>,
}

pub struct LifecycleController {
    config: RecorderConfig,
    inner: Mutex<Inner>,
    store: Arc<dyn StateStore>,
    notifier: Arc<Notifier>,
    owner: RecorderOwner,
    created: Instant,
}

impl LifecycleController {
    /// Build the controller and reconcile the persisted flag.
    ///
    /// A "running" flag whose owner is gone was left behind by a recorder
    /// that died mid-recording. It is rewritten to stopped and a `Stopped`
    /// event is published. A flag held by a live recorder is left as is.
    pub fn new(
        config: RecorderConfig,
        sources: Vec<Box<dyn EventSource>>,
        store: Arc<dyn StateStore>,
        notifier: Arc<Notifier>,
    ) -> Result<Self> {
        config.validate()?;
        let controller = LifecycleController {
            config,
            inner: Mutex::new(Inner {
                session: None,
                sources,
                last_summary: None,
            }),
            store,
            notifier,
            owner: RecorderOwner::register(),
            created: Instant::now(),
        };
        controller.reconcile();
        Ok(controller)
    }

    fn reconcile(&self) {
        match self.store.load() {
            Ok(state) if state.is_recording => match state.live_owner() {
                Some(owner) => info!(
                    "[controller] Recording held by pid {} (instance {}); leaving its state alone",
                    owner.pid, owner.instance
                ),
                None => {
                    warn!(
                        "[controller] Persisted state says recording (since {:?}) but its recorder is gone; resetting to stopped",
                        state.last_transition_ms
                    );
                    self.persist(LifecycleState::stopped(now_millis()));
                    self.publish(LifecycleEvent::Stopped);
                }
            },
            Ok(_) => debug!("[controller] Persisted state is stopped"),
            Err(e) => {
                warn!("[controller] Unreadable lifecycle state ({}), resetting to stopped", e);
                self.persist(LifecycleState::stopped(now_millis()));
            }
        }
    }

    /// Stopped → Running. A no-op while already running.
    ///
    /// Fails with `AlreadyRunning` while another live recorder holds the
    /// persisted flag.
    pub fn start(&self) -> Result<StartOutcome> {
        let mut inner = self.inner.lock().map_err(|_| lock_poisoned("controller"))?;
        if inner.session.is_some() {
            debug!("[controller] start ignored, already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        let _claim = CLAIM.lock().map_err(|_| lock_poisoned("recording claim"))?;
        match self.store.load() {
            Ok(state) => {
                if let Some(owner) = self.held_elsewhere(&state) {
                    warn!(
                        "[controller] Not starting: pid {} (instance {}) is recording",
                        owner.pid, owner.instance
                    );
                    return Err(RecorderError::AlreadyRunning);
                }
            }
            Err(e) => debug!("[controller] Lifecycle state unreadable, claiming it: {}", e),
        }

        let mut session = Session::open(&self.config, Local::now())?;
        let callback = submit_callback(&session);

        let mut registered = 0;
        for source in inner.sources.iter_mut() {
            match source.register(Arc::clone(&callback)) {
                Ok(()) => registered += 1,
                Err(e) => {
                    warn!("[controller] Skipping {}: {}", source.name(), e);
                    session.record_skipped(skipped_source(source.as_ref(), &e));
                }
            }
        }
        if registered == 0 {
            warn!("[controller] No source could be registered; the log will hold only its header");
        }

        let session_id = session.id().to_string();
        let skipped = session.skipped().to_vec();
        inner.session = Some(session);

        self.persist(LifecycleState::running(now_millis()).with_owner(self.owner));
        self.publish(LifecycleEvent::Started);
        info!(
            "[controller] Recording started: session {} ({} source(s), {} skipped)",
            session_id,
            registered,
            skipped.len()
        );

        Ok(StartOutcome::Started {
            session_id,
            skipped,
        })
    }

    /// Running → Stopped. A no-op while already stopped.
    ///
    /// Sources are unregistered first; readings queued before that are still
    /// written, then the log is flushed and closed.
    pub fn stop(&self) -> Result<StopOutcome> {
        let mut inner = self.inner.lock().map_err(|_| lock_poisoned("controller"))?;
        let session = match inner.session.take() {
            Some(session) => session,
            None => {
                debug!("[controller] stop ignored, already stopped");
                return Ok(StopOutcome::AlreadyStopped);
            }
        };

        for source in inner.sources.iter_mut() {
            source.unregister();
        }

        let closed = session.close();

        self.persist(LifecycleState::stopped(now_millis()));
        self.publish(LifecycleEvent::Stopped);

        let summary = closed.map_err(|e| {
            error!("[controller] Session did not close cleanly: {}", e);
            e
        })?;
        info!(
            "[controller] Recording stopped: session {} wrote {} line(s) in {:.1}s to {}",
            summary.session_id,
            summary.total_lines(),
            summary.duration_seconds(),
            summary
                .log_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "nowhere".to_string())
        );
        inner.last_summary = Some(summary.clone());
        Ok(StopOutcome::Stopped(summary))
    }

    pub fn state(&self) -> RecordingState {
        match self.inner.lock() {
            Ok(inner) if inner.session.is_some() => RecordingState::Running,
            _ => RecordingState::Stopped,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state() == RecordingState::Running
    }

    /// Read the persisted flag, correcting it if it disagrees with the live state.
    ///
    /// A flag held by another live recorder is correct as it stands.
    pub fn persisted_state(&self) -> Result<LifecycleState> {
        let inner = self.inner.lock().map_err(|_| lock_poisoned("controller"))?;
        let running = inner.session.is_some();
        let stored = self.store.load().unwrap_or_else(|e| {
            warn!("[controller] Unreadable lifecycle state: {}", e);
            LifecycleState::stopped(now_millis())
        });

        let consistent = if running {
            stored.is_recording && stored.owner == Some(self.owner)
        } else {
            !stored.is_recording || self.held_elsewhere(&stored).is_some()
        };
        if consistent {
            return Ok(stored);
        }

        warn!(
            "[controller] Persisted flag ({}) disagrees with live state ({}); rewriting",
            stored.is_recording, running
        );
        let corrected = if running {
            LifecycleState::running(now_millis()).with_owner(self.owner)
        } else {
            LifecycleState::stopped(now_millis())
        };
        self.store.save(&corrected)?;
        Ok(corrected)
    }

    /// Identity this controller writes into the persisted flag
    pub fn owner(&self) -> RecorderOwner {
        self.owner
    }

    fn held_elsewhere(&self, state: &LifecycleState) -> Option<RecorderOwner> {
        state.live_owner().filter(|owner| *owner != self.owner)
    }

    pub fn last_summary(&self) -> Option<SessionSummary> {
        self.inner.lock().ok().and_then(|inner| inner.last_summary.clone())
    }

    /// Current counters for observers
    pub fn live_status(&self) -> Result<LiveStatus> {
        let inner = self.inner.lock().map_err(|_| lock_poisoned("controller"))?;
        let mut status = LiveStatus::new();
        status.uptime_seconds = self.created.elapsed().as_secs();

        if let Some(session) = inner.session.as_ref() {
            let stats = session.stats();
            status.state = RecordingState::Running;
            status.session_id = Some(session.id().to_string());
            status.log_path = stats.log_path.clone();
            status.accelerometer_lines = stats.written(ReadingKind::Accelerometer);
            status.gyroscope_lines = stats.written(ReadingKind::Gyroscope);
            status.location_lines = stats.written(ReadingKind::Location);
            status.dropped_readings = stats.dropped;
            status.lost_lines = stats.lost;
            status.write_errors = stats.write_errors;
            status.writer_failed = stats.writer_failed;
            status.skipped_sources = session.skipped().to_vec();
            status.session_seconds =
                ((status.timestamp_ms - session.started_at_ms()).max(0) / 1000) as u64;
        } else if let Some(summary) = inner.last_summary.as_ref() {
            status.session_id = Some(summary.session_id.clone());
            status.log_path = summary.log_path.clone();
            status.accelerometer_lines = summary.accelerometer_lines;
            status.gyroscope_lines = summary.gyroscope_lines;
            status.location_lines = summary.location_lines;
            status.dropped_readings = summary.dropped;
            status.lost_lines = summary.lost_lines;
            status.write_errors = summary.write_errors;
            status.writer_failed = summary.writer_failed;
            status.skipped_sources = summary.skipped_sources.clone();
            status.session_seconds = summary.duration_seconds() as u64;
        }

        Ok(status)
    }

    fn persist(&self, state: LifecycleState) {
        if let Err(e) = self.store.save(&state) {
            error!(
                "[controller] Failed to persist lifecycle state (is_recording={}): {}",
                state.is_recording, e
            );
        }
    }

    fn publish(&self, event: LifecycleEvent) {
        if let Err(e) = self.notifier.publish(event) {
            warn!("[controller] Failed to publish {:?}: {}", event, e);
        }
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        if self.is_recording() {
            if let Err(e) = self.stop() {
                error!("[controller] Stop on shutdown failed: {}", e);
            }
        }
        self.owner.release();
    }
}

fn submit_callback(session: &Session) -> ReadingCallback {
    let router = session.router();
    Arc::new(move |reading: Reading| match router.submit(reading) {
        Ok(()) | Err(RecorderError::QueueFull) => {}
        Err(e) => debug!("[controller] {:?} reading not queued: {}", reading.kind(), e),
    })
}

fn skipped_source(source: &dyn EventSource, error: &SourceError) -> SkippedSource {
    SkippedSource {
        name: source.name().to_string(),
        kind: source.kind(),
        reason: error.to_string(),
    }
}
