//! # Step Estimator
//!
//! Turns travelled distance into an estimated step count and syncs the
//! unsynced total to a [`StepLedger`] in batches.
//!
//! ## Sync model
//!
//! - Every recorded movement checks whether a batch is due: at least
//!   `sync_interval_secs` since the last successful sync (or walk start) and a
//!   non-zero unsynced count.
//! - A due batch is written on a spawned task. The caller never waits for it.
//! - At most one sync is in flight. A due check that finds one running is a
//!   no-op; the next movement checks again.
//! - Each ledger call is bounded by `ledger_timeout_ms`. Timeouts count as
//!   failures.
//! - On success the batch count is subtracted from the unsynced counter, so
//!   steps recorded while the write was in flight are kept for the next batch.
//! - On failure nothing is discarded. The next due check retries with the same
//!   window start and the grown count.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{Result, WalkSimError};
use crate::geo_utils::haversine_distance;
use crate::ledger::{SessionRecord, StepBatch, StepLedger};
use crate::{GpsPoint, WalkConfig};

/// Step counters for the current walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStats {
    /// Steps not yet confirmed by the ledger
    pub total_steps: u64,
    /// Distance walked this session in meters (never reset by a sync)
    pub total_distance_m: f64,
    pub walk_start_time: DateTime<Utc>,
    /// End of the last window the ledger confirmed
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Steps the ledger has confirmed this session
    pub synced_steps: u64,
    /// All steps recorded this session, synced or not
    pub session_steps: u64,
}

impl StepStats {
    fn new(walk_start_time: DateTime<Utc>) -> Self {
        Self {
            total_steps: 0,
            total_distance_m: 0.0,
            walk_start_time,
            last_sync_time: None,
            synced_steps: 0,
            session_steps: 0,
        }
    }

    /// Start of the next batch window.
    pub fn window_start(&self) -> DateTime<Utc> {
        self.last_sync_time.unwrap_or(self.walk_start_time)
    }
}

/// Result of one sync attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Ledger confirmed `count` steps for the window ending at `window_end`
    Synced {
        count: u64,
        window_end: DateTime<Utc>,
    },
    /// Ledger failed or timed out; the steps stay unsynced
    Failed { error: WalkSimError },
    /// No unsynced steps
    NothingToSync,
}

/// What `finalize` managed to write.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeReport {
    pub flush: SyncOutcome,
    pub session_recorded: bool,
    pub stats: StepStats,
}

impl FinalizeReport {
    /// Everything reached the ledger.
    pub fn is_complete(&self) -> bool {
        self.session_recorded && !matches!(self.flush, SyncOutcome::Failed { .. })
    }
}

struct EstimatorState {
    stats: StepStats,
    last_point: Option<GpsPoint>,
    last_outcome: Option<SyncOutcome>,
}

struct Shared {
    state: Mutex<EstimatorState>,
    /// Held for the whole duration of a ledger write
    sync_lock: Arc<tokio::sync::Mutex<()>>,
    ledger: Arc<dyn StepLedger>,
    step_length_m: f64,
    sync_interval_secs: i64,
    ledger_timeout: Duration,
}

/// Distance-to-steps estimator with batched ledger sync.
///
/// Cheap to clone; clones share counters and the in-flight sync lock.
#[derive(Clone)]
pub struct StepEstimator {
    shared: Arc<Shared>,
}

impl StepEstimator {
    pub fn new(ledger: Arc<dyn StepLedger>, config: &WalkConfig) -> Self {
        let state = EstimatorState {
            stats: StepStats::new(Utc::now()),
            last_point: None,
            last_outcome: None,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                sync_lock: Arc::new(tokio::sync::Mutex::new(())),
                ledger,
                step_length_m: config.average_step_length_m,
                sync_interval_secs: i64::try_from(config.sync_interval_secs).unwrap_or(i64::MAX),
                ledger_timeout: Duration::from_millis(config.ledger_timeout_ms),
            }),
        }
    }

    pub fn initialize(&self, start_point: GpsPoint) {
        self.initialize_at(start_point, Utc::now());
    }

    /// Reset all counters and anchor distance measurement at `start_point`.
    pub fn initialize_at(&self, start_point: GpsPoint, now: DateTime<Utc>) {
        let mut state = self.shared.lock_state();
        state.stats = StepStats::new(now);
        state.last_point = Some(start_point);
        state.last_outcome = None;
        info!(
            "[StepEstimator] Walk started at ({:.6}, {:.6})",
            start_point.latitude, start_point.longitude
        );
    }

    pub fn record_position(&self, point: GpsPoint) -> u64 {
        self.record_position_at(point, Utc::now())
    }

    /// Record the walker at `point`, counting steps for the distance from the
    /// previous position. The first position only sets the anchor.
    pub fn record_position_at(&self, point: GpsPoint, now: DateTime<Utc>) -> u64 {
        let previous = self.shared.lock_state().last_point.replace(point);
        match previous {
            Some(prev) => self.record_movement_at(haversine_distance(&prev, &point), now),
            None => 0,
        }
    }

    pub fn record_movement(&self, distance_m: f64) -> u64 {
        self.record_movement_at(distance_m, Utc::now())
    }

    /// Count steps for `distance_m` and start a batch sync if one is due.
    ///
    /// Any positive distance counts at least one step. Zero, negative or
    /// non-finite distances count none. Returns the steps added.
    pub fn record_movement_at(&self, distance_m: f64, now: DateTime<Utc>) -> u64 {
        let steps = self.shared.steps_for(distance_m);
        if steps > 0 {
            let mut state = self.shared.lock_state();
            state.stats.total_steps += steps;
            state.stats.session_steps += steps;
            state.stats.total_distance_m += distance_m;
            debug!(
                "[StepEstimator] +{} steps for {:.2}m (unsynced {})",
                steps, distance_m, state.stats.total_steps
            );
        }

        // Fire and forget; the task reports through `last_outcome`.
        drop(self.spawn_sync_if_due_at(now));
        steps
    }

    /// Whether a batch should be written at `now`.
    pub fn sync_due_at(&self, now: DateTime<Utc>) -> bool {
        let state = self.shared.lock_state();
        let elapsed = (now - state.stats.window_start()).num_seconds();
        state.stats.total_steps > 0 && elapsed >= self.shared.sync_interval_secs
    }

    /// Spawn a batch write if one is due and none is in flight.
    ///
    /// Needs a tokio runtime; outside one the sync is skipped and retried on a
    /// later call.
    pub fn spawn_sync_if_due_at(&self, now: DateTime<Utc>) -> Option<JoinHandle<SyncOutcome>> {
        if !self.sync_due_at(now) {
            return None;
        }

        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("[StepEstimator] No async runtime, deferring step sync");
                return None;
            }
        };

        let guard = match self.shared.sync_lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("[StepEstimator] Sync already in flight");
                return None;
            }
        };

        let shared = Arc::clone(&self.shared);
        Some(runtime.spawn(async move {
            let outcome = shared.sync_window(now).await;
            drop(guard);
            outcome
        }))
    }

    pub async fn finalize(&self) -> FinalizeReport {
        self.finalize_at(Utc::now()).await
    }

    /// Flush unsynced steps and record the session marker.
    ///
    /// Waits for any in-flight sync first. Ledger failures are reported in the
    /// returned [`FinalizeReport`], never raised.
    pub async fn finalize_at(&self, now: DateTime<Utc>) -> FinalizeReport {
        let _guard = self.shared.sync_lock.lock().await;

        let flush = self.shared.sync_window(now).await;

        let walk_start = self.shared.lock_state().stats.walk_start_time;
        let record = SessionRecord::walk(walk_start, now);
        let session_recorded = match self
            .shared
            .bounded(self.shared.ledger.write_session_record(record))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("[StepEstimator] Session record not written: {}", e);
                false
            }
        };

        let stats = self.stats();
        info!(
            "[StepEstimator] Finalized: {} steps this session, {} synced, {} pending",
            stats.session_steps, stats.synced_steps, stats.total_steps
        );
        FinalizeReport {
            flush,
            session_recorded,
            stats,
        }
    }

    pub fn stats(&self) -> StepStats {
        self.shared.lock_state().stats.clone()
    }

    /// Result of the most recent sync attempt, for display layers.
    pub fn last_outcome(&self) -> Option<SyncOutcome> {
        self.shared.lock_state().last_outcome.clone()
    }

    pub fn last_point(&self) -> Option<GpsPoint> {
        self.shared.lock_state().last_point
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, EstimatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn steps_for(&self, distance_m: f64) -> u64 {
        if !(distance_m.is_finite() && distance_m > 0.0) {
            return 0;
        }
        ((distance_m / self.step_length_m).round() as u64).max(1)
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.ledger_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(WalkSimError::SyncTimeout {
                timeout_ms: self.ledger_timeout.as_millis() as u64,
            }),
        }
    }

    /// Write the unsynced steps as one batch ending at `now`.
    ///
    /// Callers must hold `sync_lock`.
    async fn sync_window(&self, now: DateTime<Utc>) -> SyncOutcome {
        let batch = {
            let state = self.lock_state();
            if state.stats.total_steps == 0 {
                return SyncOutcome::NothingToSync;
            }
            StepBatch {
                start: state.stats.window_start(),
                end: now,
                count: state.stats.total_steps,
            }
        };

        let result = self.bounded(self.ledger.write_step_batch(batch.clone())).await;

        let mut state = self.lock_state();
        let outcome = match result {
            Ok(()) => {
                state.stats.total_steps = state.stats.total_steps.saturating_sub(batch.count);
                state.stats.synced_steps += batch.count;
                state.stats.last_sync_time = Some(batch.end);
                info!(
                    "[StepEstimator] Synced {} steps for {} .. {}",
                    batch.count, batch.start, batch.end
                );
                SyncOutcome::Synced {
                    count: batch.count,
                    window_end: batch.end,
                }
            }
            Err(error) => {
                warn!(
                    "[StepEstimator] Sync of {} steps failed, will retry: {}",
                    batch.count, error
                );
                SyncOutcome::Failed { error }
            }
        };
        state.last_outcome = Some(outcome.clone());
        outcome
    }
}
