//! Acquisition sources: two motion streams and one position stream.
//!
//! Every source exposes `register(callback)` / `unregister()`. A source that
//! cannot register (missing hardware, missing authorization) is skipped by
//! the controller and the rest keep recording.

pub mod manual;
pub mod polling;

use crate::config::{RecorderConfig, SourceBackend};
use crate::reading::{Reading, ReadingKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use manual::{ManualSource, ManualSourceHandle};
pub use polling::{PollingSource, Sampler};

/// Callback a source invokes for every reading it produces
pub type ReadingCallback = Arc<dyn Fn(Reading) + Send + Sync>;

/// Why a source could not be registered
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("{0} not available on this device")]
    Unavailable(String),

    #[error("{0} requires an authorization that was not granted")]
    PermissionDenied(String),

    #[error("{0}")]
    Failed(String),
}

/// A capability provider the controller starts and stops with each session
pub trait EventSource: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> ReadingKind;

    /// Begin delivering readings to `callback`. Must return promptly.
    fn register(&mut self, callback: ReadingCallback) -> Result<(), SourceError>;

    /// Stop delivering. No callback may run once this returns. Idempotent.
    fn unregister(&mut self);
}

/// Update cadence requested from a position source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationRequest {
    /// Target interval between fixes
    pub interval: Duration,
    /// Fixes closer together than this are discarded
    pub min_update_interval: Duration,
}

impl Default for LocationRequest {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            min_update_interval: Duration::from_millis(500),
        }
    }
}

impl LocationRequest {
    pub fn from_config(config: &RecorderConfig) -> Self {
        Self {
            interval: config.location_interval(),
            min_update_interval: config.location_min_interval(),
        }
    }
}

/// A source the controller could not register for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedSource {
    pub name: String,
    pub kind: ReadingKind,
    pub reason: String,
}

/// Build the sources enabled in `config` for its backend
pub fn build_sources(config: &RecorderConfig) -> Vec<Box<dyn EventSource>> {
    let mut sources: Vec<Box<dyn EventSource>> = Vec::new();
    let motion_interval = config.motion_interval();
    let location = LocationRequest::from_config(config);

    match config.backend {
        SourceBackend::Simulated => {
            if config.enable_accelerometer {
                sources.push(Box::new(PollingSource::new(
                    "accelerometer",
                    motion_interval,
                    polling::SimulatedAccelerometer::new(),
                )));
            }
            if config.enable_gyroscope {
                sources.push(Box::new(PollingSource::new(
                    "gyroscope",
                    motion_interval,
                    polling::SimulatedGyroscope::new(),
                )));
            }
            if config.enable_location {
                sources.push(Box::new(PollingSource::for_location(
                    "location",
                    location,
                    polling::SimulatedLocation::new(),
                )));
            }
        }
        SourceBackend::Termux => {
            if config.enable_accelerometer {
                sources.push(Box::new(PollingSource::new(
                    "accelerometer",
                    motion_interval,
                    polling::TermuxMotion::new(ReadingKind::Accelerometer),
                )));
            }
            if config.enable_gyroscope {
                sources.push(Box::new(PollingSource::new(
                    "gyroscope",
                    motion_interval,
                    polling::TermuxMotion::new(ReadingKind::Gyroscope),
                )));
            }
            if config.enable_location {
                sources.push(Box::new(PollingSource::for_location(
                    "location",
                    location,
                    polling::TermuxLocation::new(),
                )));
            }
        }
    }

    sources
}
