//! The validated sensor observation handed to storage.

use serde::{Deserialize, Serialize};

/// A validated reading ready for persistence.
///
/// `timestamp` is the capture time in unix seconds (UTC), assigned when the
/// ingestion loop accepts the frame. Fields are private so a reading cannot
/// be altered after construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    timestamp: i64,
    temperature: f64,
    humidity: Option<f64>,
}

impl Reading {
    pub fn new(timestamp: i64, temperature: f64, humidity: Option<f64>) -> Self {
        Self {
            timestamp,
            temperature,
            humidity,
        }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Temperature in the unit the device reports.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn humidity(&self) -> Option<f64> {
        self.humidity
    }
}
