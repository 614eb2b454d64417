//! # Progress Engine
//!
//! Tick-driven state machine that walks a cursor along a [`Route`] at constant
//! speed.
//!
//! ## States
//!
//! `Idle → Running → {Stopped, Completed}`. `stop()` is accepted from any state.
//!
//! ## Tick semantics
//!
//! Each tick advances the cursor by `speed × tick_interval`. Every vertex the
//! cursor crosses is emitted as its own [`LocationUpdate`] (positioned exactly on
//! the vertex, carrying the bearing of the segment it ends), so dense waypoints
//! are never skipped. If the cursor is still inside a segment afterwards, one
//! interpolated fix is emitted. Reaching the final vertex completes the walk and
//! any leftover distance is discarded.
//!
//! The engine owns its `Progress` exclusively and only `tick` mutates it. It does
//! no scheduling of its own; see [`crate::session`] for the ticker.

use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{OptionExt, Result, WalkSimError};
use crate::remaining::remaining_time;
use crate::route::{Cursor, Route};
use crate::{mps_to_kmh, GpsPoint};

// ============================================================================
// Core Types
// ============================================================================

/// Lifecycle phase of a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Running,
    Stopped,
    Completed,
}

/// Cursor plus the bearing of the segment being walked.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub segment_index: usize,
    pub distance_along_segment: f64,
    /// Degrees clockwise from north, constant within a segment
    pub last_bearing: f64,
}

impl Progress {
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.segment_index, self.distance_along_segment)
    }
}

/// A position fix emitted by the engine. Not retained after emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub point: GpsPoint,
    pub bearing: f64,
    pub is_moving: bool,
    pub speed_kmh: f64,
    /// Route vertex index when the fix sits exactly on a vertex
    pub vertex: Option<usize>,
}

/// Consumer of location updates. Emission is synchronous and best-effort.
pub trait LocationSink {
    fn emit(&mut self, update: &LocationUpdate);
}

impl<F> LocationSink for F
where
    F: FnMut(&LocationUpdate),
{
    fn emit(&mut self, update: &LocationUpdate) {
        self(update)
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    /// Number of updates handed to the sink
    pub emitted: usize,
    /// Vertices crossed during this tick
    pub vertices_crossed: usize,
    /// Route distance actually covered (leftover past the end is dropped)
    pub distance_m: f64,
    /// Phase after the tick
    pub phase: Phase,
}

impl TickReport {
    fn idle(phase: Phase) -> Self {
        Self {
            emitted: 0,
            vertices_crossed: 0,
            distance_m: 0.0,
            phase,
        }
    }
}

// ============================================================================
// Progress Engine
// ============================================================================

/// The walk state machine.
#[derive(Debug, Clone)]
pub struct ProgressEngine {
    route: Route,
    speed_mps: f64,
    tick_interval: Duration,
    progress: Progress,
    phase: Phase,
}

impl Default for ProgressEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressEngine {
    /// Create an idle engine with no route.
    pub fn new() -> Self {
        Self {
            route: Route::new(Vec::new()),
            speed_mps: 0.0,
            tick_interval: Duration::ZERO,
            progress: Progress {
                segment_index: 0,
                distance_along_segment: 0.0,
                last_bearing: 0.0,
            },
            phase: Phase::Idle,
        }
    }

    /// Start walking `route` from its first vertex.
    ///
    /// Returns the initial fix at `route[0]` (not moving). Fails with
    /// `InvalidRoute` for fewer than two points, `InvalidCoordinate` for a NaN
    /// or out-of-range vertex and `InvalidSpeed` for a non-positive speed; on
    /// failure the engine is left untouched.
    pub fn start(
        &mut self,
        route: Route,
        speed_mps: f64,
        tick_interval: Duration,
    ) -> Result<LocationUpdate> {
        Self::validate(&route, speed_mps, tick_interval)?;

        let start = route.point(0).ok_or_internal("route has no first point")?;
        let bearing = route.segment_bearing(0);

        self.route = route;
        self.speed_mps = speed_mps;
        self.tick_interval = tick_interval;
        self.progress = Progress {
            segment_index: 0,
            distance_along_segment: 0.0,
            last_bearing: bearing,
        };
        self.phase = Phase::Running;

        info!(
            "[ProgressEngine] Started: {} points, {:.0}m at {:.2} m/s every {:?}",
            self.route.len(),
            self.route.total_distance(),
            speed_mps,
            tick_interval
        );

        Ok(LocationUpdate {
            point: start,
            bearing,
            is_moving: false,
            speed_kmh: self.speed_kmh(),
            vertex: Some(0),
        })
    }

    /// Continue a walk from `cursor` (e.g. after a restart).
    ///
    /// A cursor at the final vertex puts the engine straight into `Completed`.
    /// Returns the fix at the resumed position.
    pub fn resume(
        &mut self,
        route: Route,
        cursor: Cursor,
        speed_mps: f64,
        tick_interval: Duration,
    ) -> Result<LocationUpdate> {
        Self::validate(&route, speed_mps, tick_interval)?;

        let cursor = route.normalize(cursor);
        let point = route
            .point_at(&cursor)
            .ok_or_internal("cursor outside route")?;
        let completed = cursor.segment_index >= route.last_index();
        let bearing = if completed {
            route.segment_bearing(route.last_index().saturating_sub(1))
        } else {
            route.segment_bearing(cursor.segment_index)
        };

        self.route = route;
        self.speed_mps = speed_mps;
        self.tick_interval = tick_interval;
        self.progress = Progress {
            segment_index: cursor.segment_index,
            distance_along_segment: cursor.distance_along_segment,
            last_bearing: bearing,
        };
        self.phase = if completed {
            Phase::Completed
        } else {
            Phase::Running
        };

        info!(
            "[ProgressEngine] Resumed at segment {} (+{:.1}m), {:.0}m remaining, phase {:?}",
            cursor.segment_index,
            cursor.distance_along_segment,
            self.remaining_distance(),
            self.phase
        );

        Ok(LocationUpdate {
            point,
            bearing,
            is_moving: false,
            speed_kmh: self.speed_kmh(),
            vertex: (cursor.distance_along_segment == 0.0).then_some(cursor.segment_index),
        })
    }

    fn validate(route: &Route, speed_mps: f64, tick_interval: Duration) -> Result<()> {
        route.require_motion()?;
        if !(speed_mps.is_finite() && speed_mps > 0.0) {
            return Err(WalkSimError::InvalidSpeed { speed: speed_mps });
        }
        if tick_interval.is_zero() {
            return Err(WalkSimError::InvalidConfig {
                message: "tick interval must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Advance one tick, emitting fixes to `sink`.
    ///
    /// Outside `Running` this is a no-op that emits nothing.
    pub fn tick<S: LocationSink + ?Sized>(&mut self, sink: &mut S) -> TickReport {
        if self.phase != Phase::Running {
            return TickReport::idle(self.phase);
        }

        let last = self.route.last_index();
        let speed_kmh = self.speed_kmh();
        let step = self.speed_mps * self.tick_interval.as_secs_f64();
        let before = self.route.distance_along(&self.progress.cursor());

        let mut emitted = 0;
        let mut vertices_crossed = 0;
        self.progress.distance_along_segment += step;

        loop {
            let index = self.progress.segment_index;
            let segment_length = self.route.segment_length(index);
            if self.progress.distance_along_segment < segment_length {
                break;
            }

            let vertex = index + 1;
            if let Some(point) = self.route.point(vertex) {
                sink.emit(&LocationUpdate {
                    point,
                    bearing: self.progress.last_bearing,
                    is_moving: true,
                    speed_kmh,
                    vertex: Some(vertex),
                });
                emitted += 1;
            }
            vertices_crossed += 1;

            self.progress.distance_along_segment -= segment_length;
            self.progress.segment_index = vertex;

            if vertex >= last {
                self.progress.distance_along_segment = 0.0;
                self.phase = Phase::Completed;
                info!(
                    "[ProgressEngine] Completed: reached final vertex {} ({:.0}m)",
                    vertex,
                    self.route.total_distance()
                );
                return TickReport {
                    emitted,
                    vertices_crossed,
                    distance_m: self.route.total_distance() - before,
                    phase: self.phase,
                };
            }

            self.progress.last_bearing = self.route.segment_bearing(vertex);
        }

        if let Some(point) = self.route.point_at(&self.progress.cursor()) {
            sink.emit(&LocationUpdate {
                point,
                bearing: self.progress.last_bearing,
                is_moving: true,
                speed_kmh,
                vertex: None,
            });
            emitted += 1;
        }

        debug!(
            "[ProgressEngine] Tick: segment {} +{:.2}m, {} vertices crossed",
            self.progress.segment_index, self.progress.distance_along_segment, vertices_crossed
        );

        TickReport {
            emitted,
            vertices_crossed,
            distance_m: step,
            phase: self.phase,
        }
    }

    /// Stop the walk. Idempotent; accepted from any phase.
    pub fn stop(&mut self) {
        if self.phase != Phase::Stopped {
            info!("[ProgressEngine] Stopped from {:?}", self.phase);
            self.phase = Phase::Stopped;
        }
    }

    /// Meters left to walk; zero once completed.
    pub fn remaining_distance(&self) -> f64 {
        if self.phase == Phase::Completed {
            return 0.0;
        }
        self.route.remaining_from(&self.progress.cursor())
    }

    /// Time left at the current speed.
    pub fn remaining_time(&self) -> Option<Duration> {
        remaining_time(self.remaining_distance(), self.speed_kmh())
    }

    /// Meters walked from the start.
    pub fn distance_travelled(&self) -> f64 {
        self.route.distance_along(&self.progress.cursor())
    }

    /// Current position on the route, if a route is loaded.
    pub fn current_point(&self) -> Option<GpsPoint> {
        self.route.point_at(&self.progress.cursor())
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn speed_mps(&self) -> f64 {
        self.speed_mps
    }

    pub fn speed_kmh(&self) -> f64 {
        mps_to_kmh(self.speed_mps)
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }
}

// ============================================================================
// Tests
// ============================================================================
