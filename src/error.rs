//! Unified error handling for the walk simulator.
//!
//! Geometry and state-machine errors are returned synchronously to the caller.
//! Ledger sync failures are transient and never halt a walk. Persistence
//! failures are surfaced but the simulation keeps running in memory.

use std::fmt;

/// Unified error type for walk-sim operations.
#[derive(Debug, Clone, PartialEq)]
pub enum WalkSimError {
    /// Route has too few points for motion
    InvalidRoute {
        point_count: usize,
        minimum_required: usize,
    },
    /// Route vertex is not a finite, in-range coordinate
    InvalidCoordinate {
        index: usize,
        latitude: f64,
        longitude: f64,
    },
    /// Speed is zero, negative or not finite
    InvalidSpeed { speed: f64 },
    /// Configuration error
    InvalidConfig { message: String },
    /// Step ledger rejected or failed a write
    SyncFailure { message: String },
    /// Step ledger did not answer within the configured timeout
    SyncTimeout { timeout_ms: u64 },
    /// Storage or encoding error in the progress store
    PersistenceFailure { message: String },
    /// Path append attempted while no walk is saved
    NoActiveWalk,
    /// Operation requires a running session
    SessionNotRunning,
    /// Generic internal error
    Internal { message: String },
}

impl WalkSimError {
    /// Whether the error is a ledger sync problem that the next batch window retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WalkSimError::SyncFailure { .. } | WalkSimError::SyncTimeout { .. }
        )
    }
}

impl fmt::Display for WalkSimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalkSimError::InvalidRoute {
                point_count,
                minimum_required,
            } => {
                write!(
                    f,
                    "Route has {} points, minimum {} required",
                    point_count, minimum_required
                )
            }
            WalkSimError::InvalidCoordinate {
                index,
                latitude,
                longitude,
            } => {
                write!(
                    f,
                    "Route point {} ({}, {}) is not a valid coordinate",
                    index, latitude, longitude
                )
            }
            WalkSimError::InvalidSpeed { speed } => {
                write!(f, "Invalid speed {}: must be positive", speed)
            }
            WalkSimError::InvalidConfig { message } => {
                write!(f, "Configuration error: {}", message)
            }
            WalkSimError::SyncFailure { message } => {
                write!(f, "Step sync failed: {}", message)
            }
            WalkSimError::SyncTimeout { timeout_ms } => {
                write!(f, "Step sync timed out after {}ms", timeout_ms)
            }
            WalkSimError::PersistenceFailure { message } => {
                write!(f, "Persistence error: {}", message)
            }
            WalkSimError::NoActiveWalk => write!(f, "No active walk is saved"),
            WalkSimError::SessionNotRunning => write!(f, "Walk session is not running"),
            WalkSimError::Internal { message } => {
                write!(f, "Internal error: {}", message)
            }
        }
    }
}

impl std::error::Error for WalkSimError {}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for WalkSimError {
    fn from(err: rusqlite::Error) -> Self {
        WalkSimError::PersistenceFailure {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rmp_serde::encode::Error> for WalkSimError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        WalkSimError::PersistenceFailure {
            message: format!("encode: {}", err),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rmp_serde::decode::Error> for WalkSimError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        WalkSimError::PersistenceFailure {
            message: format!("decode: {}", err),
        }
    }
}

impl From<serde_json::Error> for WalkSimError {
    fn from(err: serde_json::Error) -> Self {
        WalkSimError::InvalidConfig {
            message: err.to_string(),
        }
    }
}

/// Result type alias for walk-sim operations.
pub type Result<T> = std::result::Result<T, WalkSimError>;

/// Extension trait for converting Option to WalkSimError.
pub trait OptionExt<T> {
    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| WalkSimError::Internal {
            message: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WalkSimError::InvalidRoute {
            point_count: 1,
            minimum_required: 2,
        };
        assert!(err.to_string().contains("1 points"));
        assert!(err.to_string().contains("minimum 2"));

        let err = WalkSimError::SyncTimeout { timeout_ms: 250 };
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(WalkSimError::SyncFailure {
            message: "offline".into()
        }
        .is_transient());
        assert!(WalkSimError::SyncTimeout { timeout_ms: 1 }.is_transient());
        assert!(!WalkSimError::InvalidSpeed { speed: 0.0 }.is_transient());
        assert!(!WalkSimError::NoActiveWalk.is_transient());
    }

    #[test]
    fn test_option_ext() {
        let none: Option<i32> = None;
        assert!(matches!(
            none.ok_or_internal("missing"),
            Err(WalkSimError::Internal { message }) if message == "missing"
        ));

        let some = Some(3).ok_or_internal("unused");
        assert_eq!(some, Ok(3));
    }
}
