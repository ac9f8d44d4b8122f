// Road Sensor Recorder
// Background recording pipeline: motion + position sources fanned into one CSV log

pub mod config;
pub mod controller;
pub mod error;
pub mod live_status;
pub mod notify;
pub mod owner;
pub mod reading;
pub mod router;
pub mod session;
pub mod sources;
pub mod state_store;
pub mod trigger;
pub mod writer;

pub use config::{RecorderConfig, SourceBackend};
pub use controller::{LifecycleController, RecordingState, StartOutcome, StopOutcome};
pub use error::{RecorderError, Result};
pub use live_status::LiveStatus;
pub use notify::{LifecycleEvent, Notifier};
pub use owner::RecorderOwner;
pub use reading::{Reading, ReadingKind, ReadingPayload};
pub use session::{Session, SessionSummary};
pub use sources::{EventSource, ReadingCallback, SkippedSource, SourceError};
pub use state_store::{JsonStateStore, LifecycleState, MemoryStateStore, StateStore};
pub use trigger::{StopRequestFile, StopTrigger};
pub use writer::{LogSink, LogWriter, WriteTally};
