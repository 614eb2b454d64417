//! # Geographic Utilities
//!
//! Route geometry primitives used by the progress engine and the remaining
//! distance calculator. All functions are pure.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two GPS points |
//! | [`initial_bearing`] | Initial great-circle bearing from one point to another |
//! | [`interpolate`] | Linear lat/lng interpolation along a segment |
//! | [`cumulative_distances`] | Running arc-length sums over a polyline |
//!
//! ## Algorithm Notes
//!
//! Distances assume a spherical Earth (mean radius 6,371 km), which is well
//! within the accuracy a walking simulation needs. Interpolation is linear in
//! latitude/longitude so that a point produced by [`interpolate`] projects back
//! onto its segment with identical per-axis fractions.

use geo::{Distance, Haversine, Point};

use crate::GpsPoint;

// =============================================================================
// Distance Functions
// =============================================================================

/// Calculate the great-circle distance between two GPS points using the Haversine formula.
///
/// # Example
///
/// ```rust
/// use walk_sim::{GpsPoint, geo_utils};
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
///
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0); // ~344 km
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Running arc-length sums over a polyline.
///
/// `result[0] == 0` and `result[i] == result[i - 1] + dist(points[i - 1], points[i])`,
/// so the table is monotonically non-decreasing and its last entry is the total
/// length. An empty polyline yields a single `0.0` so that the total is always
/// defined.
pub fn cumulative_distances(points: &[GpsPoint]) -> Vec<f64> {
    let mut cumulative = Vec::with_capacity(points.len().max(1));
    cumulative.push(0.0);

    let mut running = 0.0;
    for w in points.windows(2) {
        running += haversine_distance(&w[0], &w[1]);
        cumulative.push(running);
    }
    cumulative
}

// =============================================================================
// Bearing and Interpolation
// =============================================================================

/// Initial great-circle bearing from `from` to `to`, in degrees clockwise from
/// north, normalised to `[0, 360)`.
///
/// Identical points have no defined bearing and return 0.
pub fn initial_bearing(from: &GpsPoint, to: &GpsPoint) -> f64 {
    if from == to {
        return 0.0;
    }

    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let delta_lng = (to.longitude - from.longitude).to_radians();

    let y = delta_lng.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * delta_lng.cos();

    normalize_bearing(y.atan2(x).to_degrees())
}

/// Fold any angle in degrees into `[0, 360)`.
#[inline]
pub fn normalize_bearing(degrees: f64) -> f64 {
    let b = degrees.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if b >= 360.0 {
        0.0
    } else {
        b
    }
}

/// Linear interpolation between two points. `fraction` is not clamped.
#[inline]
pub fn interpolate(start: &GpsPoint, end: &GpsPoint, fraction: f64) -> GpsPoint {
    GpsPoint::new(
        start.latitude + (end.latitude - start.latitude) * fraction,
        start.longitude + (end.longitude - start.longitude) * fraction,
    )
}

// =============================================================================
// Unit Tests
// =============================================================================
