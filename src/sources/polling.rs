//! Thread-driven sources that poll a `Sampler` at a fixed cadence.

use super::{EventSource, LocationRequest, ReadingCallback, SourceError};
use crate::reading::{now_millis, Reading, ReadingKind};
use crossbeam::channel::{self, Sender};
use log::{debug, info, warn};
use serde::Deserialize;
use std::io;
use std::process::Command;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Produces one reading per poll
pub trait Sampler: Send + 'static {
    fn kind(&self) -> ReadingKind;

    /// Check the capability before registration
    fn check_available(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    /// `None` when no reading is available this tick
    fn sample(&mut self) -> Option<Reading>;
}

struct Running {
    stop_tx: Sender<()>,
    handle: JoinHandle<Box<dyn Sampler>>,
}

pub struct PollingSource {
    name: String,
    kind: ReadingKind,
    interval: Duration,
    min_spacing: Duration,
    sampler: Option<Box<dyn Sampler>>,
    running: Option<Running>,
}

impl PollingSource {
    /// Fixed-rate source polled every `interval`
    pub fn new(name: &str, interval: Duration, sampler: impl Sampler) -> Self {
        PollingSource {
            name: name.to_string(),
            kind: sampler.kind(),
            interval,
            min_spacing: Duration::ZERO,
            sampler: Some(Box::new(sampler)),
            running: None,
        }
    }

    /// Position source honouring both the target and minimum update interval
    pub fn for_location(name: &str, request: LocationRequest, sampler: impl Sampler) -> Self {
        let mut source = Self::new(name, request.interval, sampler);
        source.min_spacing = request.min_update_interval;
        source
    }

    pub fn is_registered(&self) -> bool {
        self.running.is_some()
    }
}

impl EventSource for PollingSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ReadingKind {
        self.kind
    }

    fn register(&mut self, callback: ReadingCallback) -> Result<(), SourceError> {
        if self.running.is_some() {
            self.unregister();
        }

        let mut sampler = self
            .sampler
            .take()
            .ok_or_else(|| SourceError::Failed(format!("{} sampler lost", self.name)))?;

        if let Err(e) = sampler.check_available() {
            self.sampler = Some(sampler);
            return Err(e);
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(self.interval);
        let min_spacing_ms = self.min_spacing.as_millis() as i64;
        let name = self.name.clone();

        let handle = thread::Builder::new()
            .name(format!("source-{}", self.name))
            .spawn(move || {
                let mut last_delivered: Option<i64> = None;
                let mut delivered = 0u64;
                let mut running = true;
                while running {
                    channel::select! {
                        recv(stop_rx) -> _ => running = false,
                        recv(ticker) -> _ => {
                            if let Some(reading) = sampler.sample() {
                                let spaced = last_delivered
                                    .map(|last| reading.timestamp_ms() - last >= min_spacing_ms)
                                    .unwrap_or(true);
                                if spaced {
                                    last_delivered = Some(reading.timestamp_ms());
                                    callback(reading);
                                    delivered += 1;
                                    if delivered % 1000 == 0 {
                                        debug!("[{}] {} readings", name, delivered);
                                    }
                                }
                            }
                        }
                    }
                }
                debug!("[{}] Stopped after {} readings", name, delivered);
                sampler
            })
            .map_err(|e| SourceError::Failed(format!("{}: {}", self.name, e)))?;

        info!("[{}] Registered ({:?} interval)", self.name, self.interval);
        self.running = Some(Running { stop_tx, handle });
        Ok(())
    }

    fn unregister(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.stop_tx.send(());
            match running.handle.join() {
                Ok(sampler) => self.sampler = Some(sampler),
                Err(_) => warn!("[{}] Source thread panicked", self.name),
            }
            info!("[{}] Unregistered", self.name);
        }
    }
}

impl Drop for PollingSource {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// Synthetic accelerometer: small oscillation around gravity on Z
pub struct SimulatedAccelerometer {
    tick: u64,
}

impl SimulatedAccelerometer {
    pub fn new() -> Self {
        Self { tick: 0 }
    }
}

impl Default for SimulatedAccelerometer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for SimulatedAccelerometer {
    fn kind(&self) -> ReadingKind {
        ReadingKind::Accelerometer
    }

    fn sample(&mut self) -> Option<Reading> {
        use std::f64::consts::PI;
        let t = self.tick as f64 * 0.02;
        self.tick += 1;
        Some(Reading::accelerometer(
            now_millis(),
            (t * 2.0 * PI).sin() * 0.5,
            (t * 2.0 * PI).cos() * 0.3,
            9.81 + (t * PI).sin() * 0.1,
        ))
    }
}

/// Synthetic gyroscope: slow rotation rates
pub struct SimulatedGyroscope {
    tick: u64,
}

impl SimulatedGyroscope {
    pub fn new() -> Self {
        Self { tick: 0 }
    }
}

impl Default for SimulatedGyroscope {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for SimulatedGyroscope {
    fn kind(&self) -> ReadingKind {
        ReadingKind::Gyroscope
    }

    fn sample(&mut self) -> Option<Reading> {
        let t = self.tick as f64 * 0.02;
        self.tick += 1;
        Some(Reading::gyroscope(
            now_millis(),
            (t * 0.5).sin() * 0.05,
            (t * 0.3).cos() * 0.03,
            t.sin() * 0.1,
        ))
    }
}

/// Synthetic position: a fix drifting slowly north-east
pub struct SimulatedLocation {
    seq: u64,
    origin: (f64, f64),
}

impl SimulatedLocation {
    pub fn new() -> Self {
        Self {
            seq: 0,
            origin: (37.7749, -122.4194),
        }
    }
}

impl Default for SimulatedLocation {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for SimulatedLocation {
    fn kind(&self) -> ReadingKind {
        ReadingKind::Location
    }

    fn sample(&mut self) -> Option<Reading> {
        let seq = self.seq as f64;
        self.seq += 1;
        Some(Reading::location(
            now_millis(),
            self.origin.0 + seq * 0.00001,
            self.origin.1 + seq * 0.00001,
        ))
    }
}

/// Motion readings from `termux-sensor`
pub struct TermuxMotion {
    kind: ReadingKind,
}

impl TermuxMotion {
    pub fn new(kind: ReadingKind) -> Self {
        Self { kind }
    }

    fn sensor_name(&self) -> &'static str {
        match self.kind {
            ReadingKind::Gyroscope => "gyroscope",
            _ => "accelerometer",
        }
    }

    fn read(&self) -> io::Result<Option<[f64; 3]>> {
        let output = run_tool("termux-sensor", &["-s", self.sensor_name(), "-n", "1"])?;
        Ok(parse_sensor_values(&output))
    }
}

impl Sampler for TermuxMotion {
    fn kind(&self) -> ReadingKind {
        self.kind
    }

    fn check_available(&mut self) -> Result<(), SourceError> {
        match self.read() {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(SourceError::Unavailable(self.sensor_name().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SourceError::Unavailable(
                format!("{} (termux-sensor not installed)", self.sensor_name()),
            )),
            Err(e) => Err(SourceError::Failed(format!("{}: {}", self.sensor_name(), e))),
        }
    }

    fn sample(&mut self) -> Option<Reading> {
        let [x, y, z] = self.read().ok().flatten()?;
        let timestamp = now_millis();
        Some(match self.kind {
            ReadingKind::Gyroscope => Reading::gyroscope(timestamp, x, y, z),
            _ => Reading::accelerometer(timestamp, x, y, z),
        })
    }
}

/// Position fixes from `termux-location`
pub struct TermuxLocation {
    provider: String,
}

impl TermuxLocation {
    pub fn new() -> Self {
        Self::with_provider("gps")
    }

    pub fn with_provider(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
        }
    }

    fn query_args(&self) -> [&str; 4] {
        ["-p", &self.provider, "-r", "last"]
    }

    /// Last fix from the configured provider; availability checks and samples share it
    fn query(&self) -> io::Result<String> {
        run_tool("termux-location", &self.query_args())
    }
}

impl Default for TermuxLocation {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for TermuxLocation {
    fn kind(&self) -> ReadingKind {
        ReadingKind::Location
    }

    fn check_available(&mut self) -> Result<(), SourceError> {
        match self.query() {
            Ok(output) if output.to_lowercase().contains("permission") => {
                Err(SourceError::PermissionDenied("location".to_string()))
            }
            // An empty answer just means no fix yet
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SourceError::Unavailable(
                "location (termux-location not installed)".to_string(),
            )),
            Err(e) => Err(SourceError::Failed(format!("location: {}", e))),
        }
    }

    fn sample(&mut self) -> Option<Reading> {
        let output = self.query().ok()?;
        let (latitude, longitude) = parse_location(&output)?;
        Some(Reading::location(now_millis(), latitude, longitude))
    }
}

fn run_tool(program: &str, args: &[&str]) -> io::Result<String> {
    let output = Command::new(program).args(args).output()?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Extract the first three values from `termux-sensor` JSON output:
/// `{"<sensor name>": {"values": [x, y, z]}}`
pub fn parse_sensor_values(output: &str) -> Option<[f64; 3]> {
    let value: serde_json::Value = serde_json::from_str(output.trim()).ok()?;
    value.as_object()?.values().find_map(|sensor| {
        let values = sensor.get("values")?.as_array()?;
        let x = values.first()?.as_f64()?;
        let y = values.get(1)?.as_f64()?;
        let z = values.get(2)?.as_f64()?;
        Some([x, y, z])
    })
}

#[derive(Deserialize)]
struct TermuxFix {
    latitude: f64,
    longitude: f64,
}

/// Extract latitude/longitude from `termux-location` JSON output
pub fn parse_location(output: &str) -> Option<(f64, f64)> {
    let fix: TermuxFix = serde_json::from_str(output.trim()).ok()?;
    Some((fix.latitude, fix.longitude))
}
