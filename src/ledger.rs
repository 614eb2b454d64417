//! # Step Ledger
//!
//! The external step/health store the step estimator syncs into. The core only
//! inserts step batches and session records; reading aggregates is for display
//! layers.
//!
//! Implementations must tolerate duplicate submission: a batch retried after a
//! failure reuses its window start, so keying by `[start, end)` start time and
//! replacing is enough to avoid double counting.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WalkSimError};

/// Steps counted over the window `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepBatch {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub count: u64,
}

/// Marker for a finished walking session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub title: String,
}

impl SessionRecord {
    pub fn walk(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            title: "Walk".to_string(),
        }
    }
}

/// External step/health ledger, shared as `Arc<dyn StepLedger>`.
#[async_trait]
pub trait StepLedger: Send + Sync {
    /// Insert a step batch. Must not double count a retried window.
    async fn write_step_batch(&self, batch: StepBatch) -> Result<()>;

    /// Insert a completed-session marker.
    async fn write_session_record(&self, record: SessionRecord) -> Result<()>;

    /// Total steps recorded within `[start, end)`.
    async fn aggregate_steps_between(&self, start: DateTime<Utc>, end: DateTime<Utc>)
        -> Result<u64>;
}

// ============================================================================
// In-memory ledger
// ============================================================================

/// Process-local ledger keyed by batch window start.
///
/// Can be told to fail the next N writes or to answer slowly, which makes it
/// useful for exercising retry and timeout paths.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    batches: Mutex<BTreeMap<DateTime<Utc>, StepBatch>>,
    sessions: Mutex<Vec<SessionRecord>>,
    fail_next: AtomicU32,
    batch_attempts: AtomicU32,
    latency: Option<Duration>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger whose every call first waits `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Make the next `count` writes (batches or sessions) fail.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Every `write_step_batch` call so far, successful or not.
    pub fn batch_attempts(&self) -> u32 {
        self.batch_attempts.load(Ordering::SeqCst)
    }

    /// Stored batches in window order.
    pub fn batches(&self) -> Vec<StepBatch> {
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Sum of all stored batches.
    pub fn total_steps(&self) -> u64 {
        self.batches().iter().map(|b| b.count).sum()
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn wait(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl StepLedger for InMemoryLedger {
    async fn write_step_batch(&self, batch: StepBatch) -> Result<()> {
        self.batch_attempts.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        if self.take_failure() {
            return Err(unavailable());
        }
        debug!(
            "[InMemoryLedger] {} steps for {} .. {}",
            batch.count, batch.start, batch.end
        );
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(batch.start, batch);
        Ok(())
    }

    async fn write_session_record(&self, record: SessionRecord) -> Result<()> {
        self.wait().await;
        if self.take_failure() {
            return Err(unavailable());
        }
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }

    async fn aggregate_steps_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        self.wait().await;
        let total = self
            .batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|b| b.start >= start && b.end <= end)
            .map(|b| b.count)
            .sum();
        Ok(total)
    }
}

fn unavailable() -> WalkSimError {
    WalkSimError::SyncFailure {
        message: "ledger unavailable".to_string(),
    }
}
