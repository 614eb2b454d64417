//! # Walk Session
//!
//! Drives a [`ProgressEngine`] from a periodic tokio timer and wires its output
//! to the collaborators:
//!
//! ```text
//! interval tick ─► engine.tick ─► for each update:
//!                                   store.append_to_path
//!                                   sink.emit
//!                                   estimator.record_position
//!                ─► remaining distance ─► snapshot
//! ```
//!
//! ## Concurrency
//!
//! - The tick loop is a single task, so ticks never overlap. A slow tick delays
//!   the next one rather than bunching them up.
//! - Store writes happen inline, once per update, before the next tick.
//! - Ledger syncs run on their own tasks (see [`crate::steps`]).
//! - [`WalkSession::stop`] signals cancellation, then joins the loop. Once it
//!   returns no further tick can fire.
//!
//! Persistence failures do not stop the walk. The session keeps going in
//! memory and reports `durability_degraded` in its snapshot.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::engine::{LocationSink, LocationUpdate, Phase, ProgressEngine};
use crate::error::{Result, WalkSimError};
use crate::ledger::StepLedger;
use crate::persistence::{ProgressStore, RestoredWalk};
use crate::remaining::{remaining_time, RemainingDistanceCalculator};
use crate::route::Route;
use crate::steps::{FinalizeReport, StepEstimator, SyncOutcome};
use crate::{kmh_to_mps, validate_speed, GpsPoint, WalkConfig};

/// Point-in-time view of a running session, for display layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub position: Option<GpsPoint>,
    pub remaining_m: f64,
    pub remaining_time: Option<Duration>,
    /// Steps not yet confirmed by the ledger
    pub total_steps: u64,
    pub session_steps: u64,
    pub total_distance_m: f64,
    pub last_sync: Option<DateTime<Utc>>,
    /// A store write failed; a crash now would lose progress
    pub durability_degraded: bool,
    pub ticks: u64,
}

/// Outcome of a finished session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    /// `Completed` when the route end was reached, `Stopped` otherwise
    pub phase: Phase,
    pub snapshot: SessionSnapshot,
    pub finalize: FinalizeReport,
}

/// Wall-clock time that follows tokio's clock, so paused-time tests see sync
/// windows elapse.
#[derive(Debug, Clone, Copy)]
struct SessionClock {
    wall: DateTime<Utc>,
    instant: Instant,
}

impl SessionClock {
    fn start() -> Self {
        Self {
            wall: Utc::now(),
            instant: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.instant.elapsed())
            .map(|elapsed| self.wall + elapsed)
            .unwrap_or(self.wall)
    }
}

struct Control {
    handle: Option<JoinHandle<SessionReport>>,
    report: Option<SessionReport>,
}

/// A walk running on a tokio timer.
pub struct WalkSession {
    cancel: watch::Sender<bool>,
    control: tokio::sync::Mutex<Control>,
    snapshot: Arc<Mutex<SessionSnapshot>>,
    estimator: StepEstimator,
}

impl WalkSession {
    /// Start walking `route` at `speed_kmh`.
    ///
    /// Saves the route with the start point as the first path entry, emits the
    /// initial fix and spawns the tick loop on the current tokio runtime.
    pub fn start(
        route: Vec<GpsPoint>,
        speed_kmh: f64,
        config: WalkConfig,
        store: Box<dyn ProgressStore + Send>,
        ledger: Arc<dyn StepLedger>,
        sink: Box<dyn LocationSink + Send>,
    ) -> Result<Self> {
        config.validate()?;
        let speed_kmh = validate_speed(speed_kmh)?;
        let route = Route::for_motion(route)?;
        let runtime = current_runtime()?;

        let mut engine = ProgressEngine::new();
        let initial = engine.start(route, kmh_to_mps(speed_kmh), config.tick_interval())?;

        let mut runner = Runner::new(engine, &config, store, ledger, sink);
        if let Err(e) = runner.store.save(
            runner.engine.route().points(),
            &[initial.point],
            speed_kmh,
        ) {
            runner.degrade(&e);
        }
        runner.begin(&initial);

        info!(
            "[WalkSession] Started: {:.0}m at {:.1} km/h",
            runner.engine.route().total_distance(),
            speed_kmh
        );
        Ok(Self::spawn(runtime, runner, &config))
    }

    /// Continue a walk rebuilt by [`ProgressStore::restore`].
    ///
    /// The store is expected to still hold the walk; it is appended to, not
    /// re-saved. A restored walk that had already reached the end finishes
    /// immediately.
    pub fn resume(
        restored: RestoredWalk,
        config: WalkConfig,
        store: Box<dyn ProgressStore + Send>,
        ledger: Arc<dyn StepLedger>,
        sink: Box<dyn LocationSink + Send>,
    ) -> Result<Self> {
        config.validate()?;
        let speed_kmh = validate_speed(restored.speed_kmh)?;
        let runtime = current_runtime()?;

        let mut engine = ProgressEngine::new();
        let fix = engine.resume(
            restored.route,
            restored.cursor,
            kmh_to_mps(speed_kmh),
            config.tick_interval(),
        )?;

        let mut runner = Runner::new(engine, &config, store, ledger, sink);
        runner.begin(&fix);

        info!(
            "[WalkSession] Resumed with {} path points, {:.0}m remaining",
            restored.path_history.len(),
            runner.engine.remaining_distance()
        );
        Ok(Self::spawn(runtime, runner, &config))
    }

    fn spawn(runtime: Handle, runner: Runner, config: &WalkConfig) -> Self {
        let (cancel, cancelled) = watch::channel(false);
        let snapshot = Arc::clone(&runner.snapshot);
        let estimator = runner.estimator.clone();
        let handle = runtime.spawn(run(runner, cancelled, config.tick_interval()));

        Self {
            cancel,
            control: tokio::sync::Mutex::new(Control {
                handle: Some(handle),
                report: None,
            }),
            snapshot,
            estimator,
        }
    }

    /// Stop the walk and wait for the loop to wind down.
    ///
    /// Idempotent: later calls return the same report. A walk that already
    /// completed reports `Completed`.
    pub async fn stop(&self) -> Result<SessionReport> {
        self.join(true).await
    }

    /// Wait for the walk to finish on its own.
    pub async fn wait(&self) -> Result<SessionReport> {
        self.join(false).await
    }

    async fn join(&self, cancel: bool) -> Result<SessionReport> {
        // Signal before taking the lock: a concurrent `wait` holds it while
        // joining and would otherwise keep the loop alive.
        if cancel {
            self.cancel.send_replace(true);
        }

        let mut control = self.control.lock().await;
        if let Some(report) = &control.report {
            return Ok(report.clone());
        }

        let handle = control
            .handle
            .as_mut()
            .ok_or(WalkSimError::SessionNotRunning)?;
        let joined = handle.await;
        control.handle = None;
        let report = joined.map_err(|e| {
            error!("[WalkSession] Walk loop failed: {}", e);
            WalkSimError::Internal {
                message: format!("walk loop failed: {}", e),
            }
        })?;

        control.report = Some(report.clone());
        Ok(report)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Result of the latest ledger sync, if any ran.
    pub fn last_sync_outcome(&self) -> Option<SyncOutcome> {
        self.estimator.last_outcome()
    }
}

fn current_runtime() -> Result<Handle> {
    Handle::try_current().map_err(|_| WalkSimError::Internal {
        message: "walk session needs a tokio runtime".to_string(),
    })
}

/// Tick loop. Exits on completion, on `stop`, or when the session is dropped.
async fn run(
    mut runner: Runner,
    mut cancelled: watch::Receiver<bool>,
    period: Duration,
) -> SessionReport {
    let mut interval = tokio::time::interval_at(runner.clock.instant + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while runner.engine.is_running() {
        tokio::select! {
            biased;
            changed = cancelled.changed() => {
                if changed.is_err() || *cancelled.borrow() {
                    break;
                }
            }
            _ = interval.tick() => runner.on_tick(),
        }
    }

    runner.finish().await
}

/// Flag lost durability, warning only the first time.
fn degrade(durability_degraded: &mut bool, error: &WalkSimError) {
    if !*durability_degraded {
        warn!(
            "[WalkSession] Progress store failed, continuing in memory: {}",
            error
        );
    }
    *durability_degraded = true;
}

// ============================================================================
// Runner (owned by the tick task)
// ============================================================================

struct Runner {
    engine: ProgressEngine,
    store: Box<dyn ProgressStore + Send>,
    sink: Box<dyn LocationSink + Send>,
    estimator: StepEstimator,
    calculator: RemainingDistanceCalculator,
    snapshot: Arc<Mutex<SessionSnapshot>>,
    clock: SessionClock,
    position: Option<GpsPoint>,
    durability_degraded: bool,
    ticks: u64,
}

impl Runner {
    fn new(
        engine: ProgressEngine,
        config: &WalkConfig,
        store: Box<dyn ProgressStore + Send>,
        ledger: Arc<dyn StepLedger>,
        sink: Box<dyn LocationSink + Send>,
    ) -> Self {
        let snapshot = SessionSnapshot {
            phase: engine.phase(),
            position: None,
            remaining_m: engine.remaining_distance(),
            remaining_time: engine.remaining_time(),
            total_steps: 0,
            session_steps: 0,
            total_distance_m: 0.0,
            last_sync: None,
            durability_degraded: false,
            ticks: 0,
        };
        Self {
            engine,
            store,
            sink,
            estimator: StepEstimator::new(ledger, config),
            calculator: RemainingDistanceCalculator::from_config(config),
            snapshot: Arc::new(Mutex::new(snapshot)),
            clock: SessionClock::start(),
            position: None,
            durability_degraded: false,
            ticks: 0,
        }
    }

    /// Emit the opening fix and anchor step counting there.
    fn begin(&mut self, fix: &LocationUpdate) {
        self.sink.emit(fix);
        self.estimator.initialize_at(fix.point, self.clock.now());
        self.position = Some(fix.point);
        self.publish();
    }

    fn on_tick(&mut self) {
        let now = self.clock.now();
        let Runner {
            engine,
            store,
            sink,
            estimator,
            position,
            durability_degraded,
            ..
        } = self;

        let report = engine.tick(&mut |update: &LocationUpdate| {
            if let Err(e) = store.append_to_path(update.point) {
                degrade(durability_degraded, &e);
            }
            sink.emit(update);
            estimator.record_position_at(update.point, now);
            *position = Some(update.point);
        });

        self.ticks += 1;
        debug!(
            "[WalkSession] Tick {}: {} updates, phase {:?}",
            self.ticks, report.emitted, report.phase
        );
        self.publish();
    }

    fn degrade(&mut self, error: &WalkSimError) {
        degrade(&mut self.durability_degraded, error);
    }

    fn publish(&self) {
        let remaining_m = match self.position {
            Some(p) if self.engine.phase() != Phase::Completed => self.calculator.remaining_after(
                self.engine.route(),
                &p,
                self.engine.progress().segment_index,
            ),
            _ => self.engine.remaining_distance(),
        };
        let stats = self.estimator.stats();

        let mut snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        *snapshot = SessionSnapshot {
            phase: self.engine.phase(),
            position: self.position,
            remaining_m,
            remaining_time: remaining_time(remaining_m, self.engine.speed_kmh()),
            total_steps: stats.total_steps,
            session_steps: stats.session_steps,
            total_distance_m: stats.total_distance_m,
            last_sync: stats.last_sync_time,
            durability_degraded: self.durability_degraded,
            ticks: self.ticks,
        };
    }

    async fn finish(mut self) -> SessionReport {
        if self.engine.is_running() {
            self.engine.stop();
        }

        let finalize = self.estimator.finalize_at(self.clock.now()).await;
        if let Err(e) = self.store.clear() {
            self.degrade(&e);
        }
        self.publish();

        let snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone();
        info!(
            "[WalkSession] Finished {:?} after {} ticks, {} steps",
            snapshot.phase, snapshot.ticks, snapshot.session_steps
        );
        SessionReport {
            phase: snapshot.phase,
            snapshot,
            finalize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::persistence::MemoryProgressStore;

    type Fixes = Arc<Mutex<Vec<LocationUpdate>>>;

    fn collecting_sink() -> (Fixes, Box<dyn LocationSink + Send>) {
        let fixes: Fixes = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(&fixes);
        let sink: Box<dyn LocationSink + Send> =
            Box::new(move |u: &LocationUpdate| inner.lock().unwrap().push(u.clone()));
        (fixes, sink)
    }

    /// ~111m due east along the equator
    fn short_route() -> Vec<GpsPoint> {
        vec![
            GpsPoint::new(0.0, 0.0),
            GpsPoint::new(0.0, 0.0005),
            GpsPoint::new(0.0, 0.001),
        ]
    }

    /// ~2.2km, long enough that nothing finishes during a test
    fn long_route() -> Vec<GpsPoint> {
        vec![GpsPoint::new(0.0, 0.0), GpsPoint::new(0.0, 0.02)]
    }

    #[tokio::test(start_paused = true)]
    async fn test_walk_runs_to_completion() {
        let store = MemoryProgressStore::new();
        let ledger = Arc::new(InMemoryLedger::new());
        let (fixes, sink) = collecting_sink();

        // 36 km/h = 10 m/s
        let session = WalkSession::start(
            short_route(),
            36.0,
            WalkConfig::default(),
            Box::new(store.clone()),
            ledger.clone(),
            sink,
        )
        .unwrap();

        let report = session.wait().await.unwrap();
        assert_eq!(report.phase, Phase::Completed);
        assert_eq!(report.snapshot.remaining_m, 0.0);
        assert_eq!(report.snapshot.remaining_time, Some(Duration::ZERO));
        assert_eq!(report.snapshot.ticks, 12);
        assert!(report.finalize.is_complete());

        let fixes = fixes.lock().unwrap();
        assert_eq!(fixes.first().unwrap().vertex, Some(0));
        assert!(!fixes.first().unwrap().is_moving);
        assert!(fixes.iter().any(|f| f.vertex == Some(1)));
        assert_eq!(fixes.last().unwrap().vertex, Some(2));

        // 11 mid-segment fixes of 10m plus two vertex fixes
        assert_eq!(fixes.len(), 1 + 11 + 2);

        assert_eq!(ledger.sessions().len(), 1);
        assert_eq!(ledger.total_steps(), report.snapshot.session_steps);
        assert!((140..=150).contains(&report.snapshot.session_steps));
        assert!(!store.has_active_walk().unwrap());

        // stop after completion keeps the completed report
        assert_eq!(session.stop().await.unwrap().phase, Phase::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_ticks() {
        let store = MemoryProgressStore::new();
        let (fixes, sink) = collecting_sink();
        let session = WalkSession::start(
            long_route(),
            5.0,
            WalkConfig::default(),
            Box::new(store.clone()),
            Arc::new(InMemoryLedger::new()),
            sink,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(5500)).await;
        let snapshot = session.snapshot();
        assert_eq!(snapshot.phase, Phase::Running);
        assert_eq!(snapshot.ticks, 5);
        assert!(snapshot.remaining_m < 2220.0);
        assert_eq!(store.load().unwrap().unwrap().path_history.len(), 6);

        let report = session.stop().await.unwrap();
        assert_eq!(report.phase, Phase::Stopped);
        let emitted = fixes.lock().unwrap().len();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fixes.lock().unwrap().len(), emitted);
        assert_eq!(session.snapshot().ticks, 5);
        assert!(!store.has_active_walk().unwrap());

        let again = session.stop().await.unwrap();
        assert_eq!(again, report);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steps_sync_every_minute() {
        let ledger = Arc::new(InMemoryLedger::new());
        let (_fixes, sink) = collecting_sink();
        let session = WalkSession::start(
            long_route(),
            5.0,
            WalkConfig::default(),
            Box::new(MemoryProgressStore::new()),
            ledger.clone(),
            sink,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(61_500)).await;
        assert_eq!(ledger.batch_attempts(), 1);
        assert!(matches!(
            session.last_sync_outcome(),
            Some(SyncOutcome::Synced { .. })
        ));
        assert!(session.snapshot().last_sync.is_some());

        let report = session.stop().await.unwrap();
        let batches = ledger.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(
            batches[0].end - batches[0].start,
            chrono::Duration::seconds(60)
        );
        assert_eq!(batches[1].start, batches[0].end);
        assert_eq!(ledger.total_steps(), report.snapshot.session_steps);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_degrades_but_keeps_walking() {
        let store = MemoryProgressStore::new();
        let (_fixes, sink) = collecting_sink();
        let session = WalkSession::start(
            long_route(),
            5.0,
            WalkConfig::default(),
            Box::new(store.clone()),
            Arc::new(InMemoryLedger::new()),
            sink,
        )
        .unwrap();
        assert!(!session.snapshot().durability_degraded);

        store.set_fail_writes(true);
        tokio::time::sleep(Duration::from_millis(3500)).await;

        let snapshot = session.snapshot();
        assert!(snapshot.durability_degraded);
        assert_eq!(snapshot.ticks, 3);
        assert_eq!(snapshot.phase, Phase::Running);
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_rejects_bad_input() {
        let start = |route: Vec<GpsPoint>, speed: f64| {
            WalkSession::start(
                route,
                speed,
                WalkConfig::default(),
                Box::new(MemoryProgressStore::new()),
                Arc::new(InMemoryLedger::new()),
                collecting_sink().1,
            )
        };

        assert!(matches!(
            start(long_route(), 0.0),
            Err(WalkSimError::InvalidSpeed { .. })
        ));
        assert!(matches!(
            start(long_route(), -4.0),
            Err(WalkSimError::InvalidSpeed { .. })
        ));
        assert!(matches!(
            start(vec![GpsPoint::new(0.0, 0.0)], 5.0),
            Err(WalkSimError::InvalidRoute { point_count: 1, .. })
        ));
        assert!(matches!(
            start(vec![GpsPoint::new(0.0, 0.0), GpsPoint::new(f64::NAN, 0.01)], 5.0),
            Err(WalkSimError::InvalidCoordinate { index: 1, .. })
        ));
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let result = WalkSession::start(
            long_route(),
            5.0,
            WalkConfig::default(),
            Box::new(MemoryProgressStore::new()),
            Arc::new(InMemoryLedger::new()),
            collecting_sink().1,
        );
        assert!(matches!(result, Err(WalkSimError::Internal { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_completed_walk_finishes_immediately() {
        let mut store = MemoryProgressStore::new();
        let route = short_route();
        store.save(&route, &route, 5.0).unwrap();
        let restored = store.restore(&WalkConfig::default()).unwrap().unwrap();

        let (fixes, sink) = collecting_sink();
        let session = WalkSession::resume(
            restored,
            WalkConfig::default(),
            Box::new(store.clone()),
            Arc::new(InMemoryLedger::new()),
            sink,
        )
        .unwrap();

        let report = session.wait().await.unwrap();
        assert_eq!(report.phase, Phase::Completed);
        assert_eq!(report.snapshot.ticks, 0);
        assert_eq!(fixes.lock().unwrap().len(), 1);
        assert!(!store.has_active_walk().unwrap());
    }
}
