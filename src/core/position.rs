//! Geographic coordinates and per-session position records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

use crate::error::{PulseError, Result};

/// A validated point; serialized as `[longitude, latitude]` on the wire
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 2]", into = "[f64; 2]")]
pub struct Coordinates {
    longitude: f64,
    latitude: f64,
}

impl Coordinates {
    pub fn new(longitude: f64, latitude: f64) -> Result<Self> {
        if !longitude.is_finite() || !latitude.is_finite() {
            return Err(PulseError::ValidationError(
                "coordinates must be finite numbers".to_string(),
            ));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(PulseError::ValidationError(format!(
                "longitude {} out of range [-180, 180]",
                longitude
            )));
        }
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(PulseError::ValidationError(format!(
                "latitude {} out of range [-90, 90]",
                latitude
            )));
        }
        Ok(Self { longitude, latitude })
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }
}

impl TryFrom<[f64; 2]> for Coordinates {
    type Error = PulseError;

    fn try_from(pair: [f64; 2]) -> Result<Self> {
        Coordinates::new(pair[0], pair[1])
    }
}

impl From<Coordinates> for [f64; 2] {
    fn from(c: Coordinates) -> Self {
        [c.longitude, c.latitude]
    }
}

/// Optional device telemetry attached to a position update
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionMeta {
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
}

/// Last known position of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub coordinates: Coordinates,
    /// Capture time as reported by the client
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub meta: PositionMeta,
}

impl PositionRecord {
    pub fn new(coordinates: Coordinates, timestamp: DateTime<Utc>, meta: PositionMeta) -> Self {
        Self {
            coordinates,
            timestamp,
            meta,
        }
    }

    /// Last-writer-wins by capture time: an update replaces this record
    /// unless it is strictly older. Client clocks are trusted here, so a
    /// client with a clock running ahead can shadow its own later updates.
    pub fn is_superseded_by(&self, incoming: &PositionRecord) -> bool {
        incoming.timestamp >= self.timestamp
    }
}
