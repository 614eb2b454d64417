//! # Remaining Distance
//!
//! Remaining distance along a route for an arbitrary position.
//!
//! Two modes, tried in order:
//!
//! 1. **On-route projection**: for each segment, the position is projected
//!    independently on the latitude and longitude axes. The segment matches when
//!    both axis fractions agree (within a tolerance) and lie in `[0, 1]`. When one
//!    axis of the segment is degenerate (zero extent) the other axis decides.
//!    Unlike a bare "other axis governs" rule, the position must also sit on
//!    the segment's line along the flat axis; otherwise a point on a
//!    north-bound leg would match the end of a preceding east-bound leg.
//!    The first matching segment in route order wins.
//! 2. **Nearest-vertex fallback**: for positions that match no segment (GPS noise,
//!    rounding at vertices, off-route points), the closest vertex by great-circle
//!    distance is used and the remaining distance is measured from there.
//!
//! The fallback keeps remaining-time estimates stable when the position sits
//! slightly off the ideal line.
//!
//! Routes that pass the same place twice (loops, out-and-back) are ambiguous
//! from a position alone. The `*_after` variants take the segment the walker
//! is known to have reached and never match anything before it.

use std::time::Duration;

use crate::geo_utils::haversine_distance;
use crate::route::{Cursor, Route};
use crate::{kmh_to_mps, GpsPoint, WalkConfig};

/// Default tolerance for per-axis fraction agreement.
pub const DEFAULT_AXIS_TOLERANCE: f64 = 1e-6;

/// Where a position lands on a route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RouteLocation {
    /// Position projects onto segment `index` at `fraction` of its length
    OnSegment { index: usize, fraction: f64 },
    /// Position is off-route; `index` is the closest vertex
    NearestVertex { index: usize, distance_m: f64 },
}

/// Computes remaining distance for positions on or near a route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemainingDistanceCalculator {
    tolerance: f64,
}

impl Default for RemainingDistanceCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_AXIS_TOLERANCE)
    }
}

impl RemainingDistanceCalculator {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    pub fn from_config(config: &WalkConfig) -> Self {
        Self::new(config.axis_match_tolerance)
    }

    /// Locate `point` on `route`. `None` only for an empty route.
    pub fn locate(&self, route: &Route, point: &GpsPoint) -> Option<RouteLocation> {
        self.locate_after(route, point, 0)
    }

    /// Locate `point` considering only segment `first_segment` onwards (and
    /// vertices from `first_segment` for the fallback).
    pub fn locate_after(
        &self,
        route: &Route,
        point: &GpsPoint,
        first_segment: usize,
    ) -> Option<RouteLocation> {
        for index in first_segment..route.segment_count() {
            if let Some(fraction) = route
                .segment(index)
                .and_then(|(start, end)| self.segment_fraction(&start, &end, point))
            {
                return Some(RouteLocation::OnSegment { index, fraction });
            }
        }

        nearest_vertex_after(route, point, first_segment)
            .map(|(index, distance_m)| RouteLocation::NearestVertex { index, distance_m })
    }

    /// Meters from `point` to the end of `route`.
    pub fn remaining(&self, route: &Route, point: &GpsPoint) -> f64 {
        self.remaining_after(route, point, 0)
    }

    /// [`remaining`](Self::remaining) for a walker known to be on segment
    /// `first_segment` or later.
    pub fn remaining_after(&self, route: &Route, point: &GpsPoint, first_segment: usize) -> f64 {
        match self.locate_after(route, point, first_segment) {
            Some(RouteLocation::OnSegment { index, fraction }) => {
                let walked = route.distance_to_vertex(index) + fraction * route.segment_length(index);
                (route.total_distance() - walked).max(0.0)
            }
            Some(RouteLocation::NearestVertex { index, .. }) => route.remaining_from_vertex(index),
            None => 0.0,
        }
    }

    /// Cursor consistent with `point`, normalised so a position on a shared
    /// vertex starts the following segment.
    pub fn cursor_for(&self, route: &Route, point: &GpsPoint) -> Cursor {
        self.cursor_after(route, point, 0)
    }

    /// [`cursor_for`](Self::cursor_for) that never lands before segment
    /// `first_segment`.
    pub fn cursor_after(&self, route: &Route, point: &GpsPoint, first_segment: usize) -> Cursor {
        let cursor = match self.locate_after(route, point, first_segment) {
            // snap rounding noise at either end of the segment onto the vertex
            Some(RouteLocation::OnSegment { index, fraction }) if 1.0 - fraction <= self.tolerance => {
                Cursor::at_vertex(index + 1)
            }
            Some(RouteLocation::OnSegment { index, fraction }) if fraction <= self.tolerance => {
                Cursor::at_vertex(index)
            }
            Some(RouteLocation::OnSegment { index, fraction }) => {
                Cursor::new(index, fraction * route.segment_length(index))
            }
            Some(RouteLocation::NearestVertex { index, .. }) => Cursor::at_vertex(index),
            None => Cursor::default(),
        };
        route.normalize(cursor)
    }

    /// Cursor at the end of a recorded path, replayed in order so each point
    /// is matched no earlier than the segment its predecessor reached.
    pub fn cursor_for_path(&self, route: &Route, path: &[GpsPoint]) -> Cursor {
        path.iter().fold(Cursor::default(), |cursor, point| {
            self.cursor_after(route, point, cursor.segment_index)
        })
    }

    /// Fraction along `start → end` at which `point` projects, if it matches.
    fn segment_fraction(&self, start: &GpsPoint, end: &GpsPoint, point: &GpsPoint) -> Option<f64> {
        let d_lat = end.latitude - start.latitude;
        let d_lng = end.longitude - start.longitude;

        let f_lat = (d_lat != 0.0).then(|| (point.latitude - start.latitude) / d_lat);
        let f_lng = (d_lng != 0.0).then(|| (point.longitude - start.longitude) / d_lng);

        let fraction = match (f_lat, f_lng) {
            (Some(a), Some(b)) if (a - b).abs() <= self.tolerance => a,
            (Some(a), None) if (point.longitude - start.longitude).abs() <= self.tolerance => a,
            (None, Some(b)) if (point.latitude - start.latitude).abs() <= self.tolerance => b,
            _ => return None,
        };

        (0.0..=1.0).contains(&fraction).then_some(fraction)
    }
}

/// Closest route vertex to `point` by great-circle distance (first wins on ties).
pub fn nearest_vertex(route: &Route, point: &GpsPoint) -> Option<(usize, f64)> {
    nearest_vertex_after(route, point, 0)
}

fn nearest_vertex_after(route: &Route, point: &GpsPoint, first: usize) -> Option<(usize, f64)> {
    route
        .points()
        .iter()
        .enumerate()
        .skip(first)
        .map(|(i, p)| (i, haversine_distance(p, point)))
        .fold(None, |best: Option<(usize, f64)>, (i, d)| match best {
            Some((_, best_d)) if best_d <= d => best,
            _ => Some((i, d)),
        })
}

/// Time to cover `distance_m` at `speed_kmh`.
///
/// `None` when the speed is not positive; zero when nothing is left.
pub fn remaining_time(distance_m: f64, speed_kmh: f64) -> Option<Duration> {
    if !(speed_kmh.is_finite() && speed_kmh > 0.0) {
        return None;
    }
    if !(distance_m > 0.0) {
        return Some(Duration::ZERO);
    }
    Duration::try_from_secs_f64(distance_m / kmh_to_mps(speed_kmh)).ok()
}
