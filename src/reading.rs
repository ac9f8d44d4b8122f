use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Column header written as the first line of every log file
pub const HEADER: &str = "Time,Type,X,Y,Z,Latitude,Longitude";

/// Number of comma-separated columns in every log line
pub const COLUMN_COUNT: usize = 7;

/// Which source produced a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadingKind {
    /// First motion stream
    Accelerometer,
    /// Second motion stream
    Gyroscope,
    /// Position fixes
    Location,
}

impl ReadingKind {
    pub const ALL: [ReadingKind; 3] = [
        ReadingKind::Accelerometer,
        ReadingKind::Gyroscope,
        ReadingKind::Location,
    ];

    /// Value of the `Type` column
    pub fn label(&self) -> &'static str {
        match self {
            ReadingKind::Accelerometer => "Accelerometer",
            ReadingKind::Gyroscope => "Gyroscope",
            ReadingKind::Location => "Location",
        }
    }

    pub fn is_motion(&self) -> bool {
        !matches!(self, ReadingKind::Location)
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            ReadingKind::Accelerometer => 0,
            ReadingKind::Gyroscope => 1,
            ReadingKind::Location => 2,
        }
    }
}

/// Kind-dependent values carried by a reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ReadingPayload {
    Motion { x: f64, y: f64, z: f64 },
    Position { latitude: f64, longitude: f64 },
}

/// One timestamped data point. Immutable once built.
///
/// Only the kind-specific constructors exist, so a motion kind always carries
/// three axes and a location always carries a latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    timestamp_ms: i64,
    kind: ReadingKind,
    payload: ReadingPayload,
}

impl Reading {
    pub fn accelerometer(timestamp_ms: i64, x: f64, y: f64, z: f64) -> Self {
        Self {
            timestamp_ms,
            kind: ReadingKind::Accelerometer,
            payload: ReadingPayload::Motion { x, y, z },
        }
    }

    pub fn gyroscope(timestamp_ms: i64, x: f64, y: f64, z: f64) -> Self {
        Self {
            timestamp_ms,
            kind: ReadingKind::Gyroscope,
            payload: ReadingPayload::Motion { x, y, z },
        }
    }

    pub fn location(timestamp_ms: i64, latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp_ms,
            kind: ReadingKind::Location,
            payload: ReadingPayload::Position {
                latitude,
                longitude,
            },
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn kind(&self) -> ReadingKind {
        self.kind
    }

    pub fn payload(&self) -> ReadingPayload {
        self.payload
    }

    /// Five value columns in order X, Y, Z, Latitude, Longitude.
    /// Columns that do not apply to the kind are `None`.
    pub fn columns(&self) -> [Option<f64>; 5] {
        match self.payload {
            ReadingPayload::Motion { x, y, z } => [Some(x), Some(y), Some(z), None, None],
            ReadingPayload::Position {
                latitude,
                longitude,
            } => [None, None, None, Some(latitude), Some(longitude)],
        }
    }

    /// Serialize as `timestamp,kind,x,y,z,latitude,longitude` (no trailing newline)
    pub fn to_line(&self) -> String {
        let mut line = String::with_capacity(64);
        let _ = write!(line, "{},{}", self.timestamp_ms, self.kind.label());
        for column in self.columns() {
            line.push(',');
            if let Some(value) = column {
                // Debug keeps the fractional part: 37.0 stays "37.0"
                let _ = write!(line, "{:?}", value);
            }
        }
        line
    }
}

/// Wall-clock milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_line_leaves_position_empty() {
        let reading = Reading::accelerometer(1000, 0.1, 0.2, 9.8);
        assert_eq!(reading.to_line(), "1000,Accelerometer,0.1,0.2,9.8,,");
    }

    #[test]
    fn test_location_line_leaves_axes_empty() {
        let reading = Reading::location(1500, 37.0, -122.0);
        assert_eq!(reading.to_line(), "1500,Location,,,,37.0,-122.0");
    }

    #[test]
    fn test_every_line_has_seven_columns() {
        let readings = [
            Reading::accelerometer(1, 1.0, 2.0, 3.0),
            Reading::gyroscope(2, -0.01, 0.0, 0.5),
            Reading::location(3, 51.5, -0.12),
        ];
        for reading in readings {
            let line = reading.to_line();
            assert_eq!(line.split(',').count(), COLUMN_COUNT, "{}", line);
        }
        assert_eq!(HEADER.split(',').count(), COLUMN_COUNT);
    }

    #[test]
    fn test_kind_matches_payload() {
        let gyro = Reading::gyroscope(5, 0.1, 0.2, 0.3);
        assert_eq!(gyro.kind(), ReadingKind::Gyroscope);
        assert!(gyro.kind().is_motion());
        assert!(matches!(gyro.payload(), ReadingPayload::Motion { .. }));

        let fix = Reading::location(6, 1.0, 2.0);
        assert!(!fix.kind().is_motion());
        assert_eq!(fix.columns()[0], None);
        assert_eq!(fix.columns()[3], Some(1.0));
    }
}
