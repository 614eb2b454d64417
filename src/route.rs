//! # Route
//!
//! An ordered polyline plus its precomputed cumulative arc-length table.
//!
//! A route is immutable once built. Adopting a new polyline means building a
//! new `Route`, which recomputes the cumulative table from scratch.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WalkSimError};
use crate::geo_utils::{cumulative_distances, haversine_distance, initial_bearing, interpolate};
use crate::GpsPoint;

/// Minimum number of points a route needs for the walker to move.
pub const MIN_MOTION_POINTS: usize = 2;

/// Position along a route: the segment being walked and how far into it.
///
/// `segment_index == route.len() - 1` marks the final vertex (walk complete).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Cursor {
    pub segment_index: usize,
    pub distance_along_segment: f64,
}

impl Cursor {
    pub fn new(segment_index: usize, distance_along_segment: f64) -> Self {
        Self {
            segment_index,
            distance_along_segment,
        }
    }

    /// Cursor sitting on a vertex.
    pub fn at_vertex(index: usize) -> Self {
        Self::new(index, 0.0)
    }
}

/// A walkable route with cumulative distances.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    points: Vec<GpsPoint>,
    segment_lengths: Vec<f64>,
    cumulative: Vec<f64>,
}

impl Route {
    /// Build a route, computing segment lengths and cumulative distances.
    pub fn new(points: Vec<GpsPoint>) -> Self {
        let segment_lengths = points
            .windows(2)
            .map(|w| haversine_distance(&w[0], &w[1]))
            .collect();
        let cumulative = cumulative_distances(&points);
        Self {
            points,
            segment_lengths,
            cumulative,
        }
    }

    /// Build a route that the walker can actually traverse (see [`Route::require_motion`]).
    pub fn for_motion(points: Vec<GpsPoint>) -> Result<Self> {
        let route = Self::new(points);
        route.require_motion()?;
        Ok(route)
    }

    /// Fail with `InvalidCoordinate` for a NaN or out-of-range vertex, and with
    /// `InvalidRoute` unless the route has at least one segment.
    pub fn require_motion(&self) -> Result<()> {
        if let Some((index, p)) = self.points.iter().enumerate().find(|(_, p)| !p.is_valid()) {
            return Err(WalkSimError::InvalidCoordinate {
                index,
                latitude: p.latitude,
                longitude: p.longitude,
            });
        }
        if self.points.len() < MIN_MOTION_POINTS {
            return Err(WalkSimError::InvalidRoute {
                point_count: self.points.len(),
                minimum_required: MIN_MOTION_POINTS,
            });
        }
        Ok(())
    }

    pub fn points(&self) -> &[GpsPoint] {
        &self.points
    }

    pub fn into_points(self) -> Vec<GpsPoint> {
        self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of segments (`len - 1`, or 0 for degenerate routes).
    pub fn segment_count(&self) -> usize {
        self.segment_lengths.len()
    }

    /// Index of the final vertex. Zero for empty routes.
    pub fn last_index(&self) -> usize {
        self.points.len().saturating_sub(1)
    }

    pub fn first_point(&self) -> Option<GpsPoint> {
        self.points.first().copied()
    }

    pub fn point(&self, index: usize) -> Option<GpsPoint> {
        self.points.get(index).copied()
    }

    /// Running arc-length sums; `cumulative_distances()[i]` is the distance
    /// from the start to vertex `i`.
    pub fn cumulative_distances(&self) -> &[f64] {
        &self.cumulative
    }

    /// Total route length in meters. Zero for routes with fewer than 2 points.
    pub fn total_distance(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }

    /// Distance from the start to vertex `index` (clamped to the final vertex).
    pub fn distance_to_vertex(&self, index: usize) -> f64 {
        let i = index.min(self.cumulative.len().saturating_sub(1));
        self.cumulative.get(i).copied().unwrap_or(0.0)
    }

    /// Endpoints of segment `index`.
    pub fn segment(&self, index: usize) -> Option<(GpsPoint, GpsPoint)> {
        Some((*self.points.get(index)?, *self.points.get(index + 1)?))
    }

    /// Length of segment `index` in meters; 0 for out-of-range indices.
    pub fn segment_length(&self, index: usize) -> f64 {
        self.segment_lengths.get(index).copied().unwrap_or(0.0)
    }

    /// Bearing of segment `index`; 0 when the segment does not exist.
    pub fn segment_bearing(&self, index: usize) -> f64 {
        self.segment(index)
            .map(|(start, end)| initial_bearing(&start, &end))
            .unwrap_or(0.0)
    }

    /// Distance travelled from the start to `cursor`.
    pub fn distance_along(&self, cursor: &Cursor) -> f64 {
        self.distance_to_vertex(cursor.segment_index) + cursor.distance_along_segment
    }

    /// Distance left from `cursor` to the end of the route, never negative.
    pub fn remaining_from(&self, cursor: &Cursor) -> f64 {
        (self.total_distance() - self.distance_along(cursor)).max(0.0)
    }

    /// Distance from vertex `index` to the end of the route.
    pub fn remaining_from_vertex(&self, index: usize) -> f64 {
        (self.total_distance() - self.distance_to_vertex(index)).max(0.0)
    }

    /// Geographic position of `cursor`, interpolated linearly within its segment.
    pub fn point_at(&self, cursor: &Cursor) -> Option<GpsPoint> {
        match self.segment(cursor.segment_index) {
            Some((start, end)) => {
                let length = self.segment_length(cursor.segment_index);
                let fraction = if length > 0.0 {
                    cursor.distance_along_segment / length
                } else {
                    0.0
                };
                Some(interpolate(&start, &end, fraction))
            }
            None => self.point(cursor.segment_index),
        }
    }

    /// Move a cursor that sits exactly on (or past) its segment end onto the
    /// start of the following segment, repeatedly. A cursor reaching the final
    /// vertex becomes `Cursor::at_vertex(last_index)`.
    pub fn normalize(&self, cursor: Cursor) -> Cursor {
        let last = self.last_index();
        let mut c = cursor;
        if c.segment_index >= last {
            return Cursor::at_vertex(last);
        }
        c.distance_along_segment = c.distance_along_segment.max(0.0);
        while c.segment_index < last
            && c.distance_along_segment >= self.segment_length(c.segment_index)
        {
            c.distance_along_segment -= self.segment_length(c.segment_index);
            c.segment_index += 1;
        }
        if c.segment_index >= last {
            Cursor::at_vertex(last)
        } else {
            c
        }
    }
}

impl From<Vec<GpsPoint>> for Route {
    fn from(points: Vec<GpsPoint>) -> Self {
        Route::new(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    fn l_shaped() -> Route {
        Route::new(vec![
            GpsPoint::new(0.0, 0.0),
            GpsPoint::new(0.0, 0.01),
            GpsPoint::new(0.01, 0.01),
        ])
    }

    #[test]
    fn test_cumulative_matches_segments() {
        let route = l_shaped();
        let cum = route.cumulative_distances();
        assert_eq!(cum.len(), 3);
        assert_eq!(cum[0], 0.0);
        assert!(approx_eq(cum[1], route.segment_length(0), 1e-9));
        assert!(approx_eq(
            cum[2],
            route.segment_length(0) + route.segment_length(1),
            1e-9
        ));
        assert!(approx_eq(route.total_distance(), cum[2], 1e-12));
    }

    #[test]
    fn test_single_point_route_is_degenerate() {
        let route = Route::new(vec![GpsPoint::new(1.0, 1.0)]);
        assert_eq!(route.total_distance(), 0.0);
        assert_eq!(route.segment_count(), 0);
        assert_eq!(route.segment_bearing(0), 0.0);
        assert!(matches!(
            route.require_motion(),
            Err(WalkSimError::InvalidRoute {
                point_count: 1,
                minimum_required: 2
            })
        ));
    }

    #[test]
    fn test_for_motion_rejects_empty() {
        assert!(Route::for_motion(vec![]).is_err());
        assert!(Route::for_motion(vec![GpsPoint::new(0.0, 0.0), GpsPoint::new(0.0, 0.001)]).is_ok());
    }

    #[test]
    fn test_for_motion_rejects_invalid_coordinates() {
        let nan = vec![GpsPoint::new(0.0, 0.0), GpsPoint::new(f64::NAN, 0.001)];
        assert!(matches!(
            Route::for_motion(nan),
            Err(WalkSimError::InvalidCoordinate { index: 1, .. })
        ));

        let out_of_range = vec![GpsPoint::new(0.0, 181.0), GpsPoint::new(0.0, 0.0)];
        assert!(matches!(
            Route::for_motion(out_of_range),
            Err(WalkSimError::InvalidCoordinate { index: 0, .. })
        ));
    }

    #[test]
    fn test_segment_bearing() {
        let route = l_shaped();
        assert!(approx_eq(route.segment_bearing(0), 90.0, 1e-6));
        assert!(approx_eq(route.segment_bearing(1), 0.0, 1e-6));
        assert_eq!(route.segment_bearing(5), 0.0);
    }

    #[test]
    fn test_remaining_from_cursor() {
        let route = l_shaped();
        let cursor = Cursor::new(1, 100.0);
        let expected = route.total_distance() - route.segment_length(0) - 100.0;
        assert!(approx_eq(route.remaining_from(&cursor), expected, 1e-9));
        assert_eq!(route.remaining_from(&Cursor::at_vertex(2)), 0.0);
        assert!(approx_eq(
            route.remaining_from_vertex(1),
            route.segment_length(1),
            1e-9
        ));
    }

    #[test]
    fn test_point_at_interpolates() {
        let route = l_shaped();
        let half = route.segment_length(0) / 2.0;
        let p = route.point_at(&Cursor::new(0, half)).unwrap();
        assert!(approx_eq(p.latitude, 0.0, 1e-12));
        assert!(approx_eq(p.longitude, 0.005, 1e-9));
        assert_eq!(route.point_at(&Cursor::at_vertex(2)), route.point(2));
    }

    #[test]
    fn test_normalize_rolls_over_vertices() {
        let route = l_shaped();
        let len0 = route.segment_length(0);

        let c = route.normalize(Cursor::new(0, len0));
        assert_eq!(c, Cursor::at_vertex(1));

        let c = route.normalize(Cursor::new(0, len0 + 10.0));
        assert_eq!(c.segment_index, 1);
        assert!(approx_eq(c.distance_along_segment, 10.0, 1e-6));

        let c = route.normalize(Cursor::new(0, route.total_distance() + 5.0));
        assert_eq!(c, Cursor::at_vertex(2));
    }
}
