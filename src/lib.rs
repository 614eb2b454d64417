//! # Walk Sim
//!
//! Simulates a pedestrian walking a fixed route at constant speed.
//!
//! This library provides:
//! - A tick-driven progress engine that advances a cursor along a polyline,
//!   emitting one location fix per tick and one per crossed vertex
//! - Remaining distance/time for any position, on or off the route
//! - Step estimation from travelled distance with batched ledger sync
//! - Resumable progress through a single-record progress store
//!
//! ## Features
//!
//! - **`persistence`** (default) - SQLite-backed progress store
//!
//! ## Quick Start
//!
//! ```rust
//! use walk_sim::{GpsPoint, ProgressEngine, Route, LocationUpdate};
//! use std::time::Duration;
//!
//! let route = Route::new(vec![
//!     GpsPoint::new(0.0, 0.0),
//!     GpsPoint::new(0.0, 0.01),
//! ]);
//!
//! let mut engine = ProgressEngine::new();
//! let first = engine.start(route, 1.389, Duration::from_millis(1000)).unwrap();
//! assert_eq!(first.vertex, Some(0));
//!
//! let mut fixes: Vec<LocationUpdate> = Vec::new();
//! engine.tick(&mut |u: &LocationUpdate| fixes.push(u.clone()));
//! assert_eq!(fixes.len(), 1);
//! println!("{:.0}m to go", engine.remaining_distance());
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, WalkSimError};

// Geographic utilities (distance, bearing, interpolation)
pub mod geo_utils;

// Route polyline with cumulative distances
pub mod route;
pub use route::{Cursor, Route};

// Tick-driven progress state machine
pub mod engine;
pub use engine::{LocationSink, LocationUpdate, Phase, Progress, ProgressEngine, TickReport};

// Remaining distance and time for arbitrary positions
pub mod remaining;
pub use remaining::{remaining_time, RemainingDistanceCalculator, RouteLocation};

// External step ledger collaborator
pub mod ledger;
pub use ledger::{InMemoryLedger, SessionRecord, StepBatch, StepLedger};

// Step estimation with batched sync
pub mod steps;
pub use steps::{FinalizeReport, StepEstimator, StepStats, SyncOutcome};

// Walk state persistence
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteProgressStore;
pub use persistence::{MemoryProgressStore, PersistedWalkState, ProgressStore, RestoredWalk};

// Session driver tying everything to a ticker
pub mod session;
pub use session::{SessionReport, SessionSnapshot, WalkSession};

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude; one vertex of a route.
///
/// # Example
/// ```
/// use walk_sim::GpsPoint;
/// let point = GpsPoint::new(51.5074, -0.1278); // London
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Configuration for a walk simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkConfig {
    /// Wall-clock interval between ticks in milliseconds.
    /// Default: 1000
    pub tick_interval_ms: u64,

    /// Average stride used to turn distance into steps (meters).
    /// Default: 0.762
    pub average_step_length_m: f64,

    /// Minimum time between step batch syncs (seconds).
    /// Default: 60
    pub sync_interval_secs: u64,

    /// Upper bound for a single ledger call (milliseconds).
    /// Default: 10000
    pub ledger_timeout_ms: u64,

    /// Speed used when a restored walk carries none (km/h).
    /// Default: 5.0
    pub default_speed_kmh: f64,

    /// How closely the latitude and longitude projection fractions must agree
    /// for a point to count as lying on a segment.
    /// Default: 1e-6
    pub axis_match_tolerance: f64,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            average_step_length_m: 0.762,
            sync_interval_secs: 60,
            ledger_timeout_ms: 10_000,
            default_speed_kmh: 5.0,
            axis_match_tolerance: 1e-6,
        }
    }
}

impl WalkConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: WalkConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the simulation cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(invalid_config("tick_interval_ms must be positive"));
        }
        if !(self.average_step_length_m.is_finite() && self.average_step_length_m > 0.0) {
            return Err(invalid_config("average_step_length_m must be positive"));
        }
        if self.ledger_timeout_ms == 0 {
            return Err(invalid_config("ledger_timeout_ms must be positive"));
        }
        if !(self.default_speed_kmh.is_finite() && self.default_speed_kmh > 0.0) {
            return Err(invalid_config("default_speed_kmh must be positive"));
        }
        if !(self.axis_match_tolerance.is_finite() && self.axis_match_tolerance >= 0.0) {
            return Err(invalid_config("axis_match_tolerance must be non-negative"));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_interval_ms)
    }
}

fn invalid_config(message: &str) -> WalkSimError {
    WalkSimError::InvalidConfig {
        message: message.to_string(),
    }
}

/// Convert km/h to m/s.
#[inline]
pub fn kmh_to_mps(speed_kmh: f64) -> f64 {
    speed_kmh * 1000.0 / 3600.0
}

/// Convert m/s to km/h.
#[inline]
pub fn mps_to_kmh(speed_mps: f64) -> f64 {
    speed_mps * 3.6
}

/// Validate a driver-supplied speed in km/h.
pub fn validate_speed(speed: f64) -> Result<f64> {
    if speed.is_finite() && speed > 0.0 {
        Ok(speed)
    } else {
        Err(WalkSimError::InvalidSpeed { speed })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_point_validity() {
        assert!(GpsPoint::new(51.5, -0.12).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, f64::NAN).is_valid());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = WalkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval_ms, 1000);
        assert_eq!(config.sync_interval_secs, 60);
        assert_eq!(config.average_step_length_m, 0.762);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config = WalkConfig::from_json(r#"{"tick_interval_ms": 250}"#).unwrap();
        assert_eq!(config.tick_interval_ms, 250);
        assert_eq!(config.sync_interval_secs, 60);
    }

    #[test]
    fn test_config_rejects_zero_tick() {
        let result = WalkConfig::from_json(r#"{"tick_interval_ms": 0}"#);
        assert!(matches!(result, Err(WalkSimError::InvalidConfig { .. })));

        let result = WalkConfig::from_json("not json");
        assert!(matches!(result, Err(WalkSimError::InvalidConfig { .. })));
    }

    #[test]
    fn test_speed_conversion() {
        assert!((kmh_to_mps(5.0) - 1.388_888).abs() < 1e-5);
        assert!((mps_to_kmh(kmh_to_mps(7.2)) - 7.2).abs() < 1e-12);
    }

    #[test]
    fn test_validate_speed() {
        assert_eq!(validate_speed(5.0), Ok(5.0));
        assert_eq!(
            validate_speed(0.0),
            Err(WalkSimError::InvalidSpeed { speed: 0.0 })
        );
        assert!(validate_speed(-3.0).is_err());
        assert!(validate_speed(f64::INFINITY).is_err());
    }
}
