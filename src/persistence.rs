//! # Progress Store
//!
//! Keeps the single active walk durable so it can resume after the process
//! dies: the route, the ordered path history and the speed.
//!
//! ## Model
//!
//! - At most one walk is saved. `save` overwrites it, `clear` removes it.
//! - `append_to_path` adds one visited point and fails with `NoActiveWalk`
//!   when nothing is saved.
//! - The saved record is the source of truth for recovery. [`ProgressStore::restore`]
//!   rebuilds a fresh [`Route`] (recomputing cumulative distances) and locates
//!   the walker from the last path point.
//!
//! Two backends: [`MemoryProgressStore`] and, with the `persistence` feature,
//! [`SqliteProgressStore`].

use std::sync::{Arc, Mutex, MutexGuard};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WalkSimError};
use crate::remaining::RemainingDistanceCalculator;
use crate::route::{Cursor, Route};
use crate::{validate_speed, GpsPoint, WalkConfig};

/// The durable walk record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedWalkState {
    pub route: Vec<GpsPoint>,
    /// Visited positions in emission order, append-only
    pub path_history: Vec<GpsPoint>,
    pub speed_kmh: f64,
}

/// A saved walk, ready to be handed back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredWalk {
    pub route: Route,
    pub path_history: Vec<GpsPoint>,
    pub speed_kmh: f64,
    /// Position consistent with the last path point
    pub cursor: Cursor,
}

impl RestoredWalk {
    /// The saved walker already stood on the final vertex.
    pub fn is_complete(&self) -> bool {
        self.cursor.segment_index >= self.route.last_index()
    }

    pub fn position(&self) -> Option<GpsPoint> {
        self.route.point_at(&self.cursor)
    }
}

/// Storage for the single active walk.
pub trait ProgressStore {
    /// Replace any saved walk.
    fn save(&mut self, route: &[GpsPoint], path_history: &[GpsPoint], speed_kmh: f64)
        -> Result<()>;

    /// Append a visited point to the saved walk's path history.
    fn append_to_path(&mut self, point: GpsPoint) -> Result<()>;

    /// Drop the saved walk. Clearing an empty store is fine.
    fn clear(&mut self) -> Result<()>;

    /// Raw saved record, if any.
    fn load(&self) -> Result<Option<PersistedWalkState>>;

    fn has_active_walk(&self) -> Result<bool> {
        Ok(self.load()?.is_some())
    }

    /// Rebuild the saved walk.
    ///
    /// The route is rebuilt from its points. The cursor comes from replaying
    /// the path history forward, so a route that revisits a place resumes on
    /// the pass the walker was actually on. Each point is projected onto the
    /// route or snapped to the nearest vertex when off-route. An empty history
    /// starts at the first point. A saved
    /// speed that is not positive falls back to `config.default_speed_kmh`.
    fn restore(&self, config: &WalkConfig) -> Result<Option<RestoredWalk>> {
        let state = match self.load()? {
            Some(state) => state,
            None => return Ok(None),
        };

        let route = Route::for_motion(state.route)?;
        let speed_kmh = validate_speed(state.speed_kmh).unwrap_or(config.default_speed_kmh);
        let cursor = RemainingDistanceCalculator::from_config(config)
            .cursor_for_path(&route, &state.path_history);

        info!(
            "[ProgressStore] Restored walk: {} route points, {} path points, segment {}",
            route.len(),
            state.path_history.len(),
            cursor.segment_index
        );

        Ok(Some(RestoredWalk {
            route,
            path_history: state.path_history,
            speed_kmh,
            cursor,
        }))
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    state: Option<PersistedWalkState>,
    fail_writes: bool,
}

/// Process-local store. Clones share the same record, so a caller can hand
/// one clone to a session and inspect another.
#[derive(Debug, Clone, Default)]
pub struct MemoryProgressStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with `PersistenceFailure` (reads still work).
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn writable(&self) -> Result<MutexGuard<'_, MemoryInner>> {
        let inner = self.lock();
        if inner.fail_writes {
            return Err(WalkSimError::PersistenceFailure {
                message: "store is not writable".to_string(),
            });
        }
        Ok(inner)
    }
}

impl ProgressStore for MemoryProgressStore {
    fn save(
        &mut self,
        route: &[GpsPoint],
        path_history: &[GpsPoint],
        speed_kmh: f64,
    ) -> Result<()> {
        self.writable()?.state = Some(PersistedWalkState {
            route: route.to_vec(),
            path_history: path_history.to_vec(),
            speed_kmh,
        });
        Ok(())
    }

    fn append_to_path(&mut self, point: GpsPoint) -> Result<()> {
        let mut inner = self.writable()?;
        match inner.state.as_mut() {
            Some(state) => {
                state.path_history.push(point);
                Ok(())
            }
            None => Err(WalkSimError::NoActiveWalk),
        }
    }

    fn clear(&mut self) -> Result<()> {
        self.writable()?.state = None;
        Ok(())
    }

    fn load(&self) -> Result<Option<PersistedWalkState>> {
        Ok(self.lock().state.clone())
    }
}

// ============================================================================
// SQLite store
// ============================================================================

#[cfg(feature = "persistence")]
pub use sqlite::SqliteProgressStore;

#[cfg(feature = "persistence")]
mod sqlite {
    use rusqlite::{params, Connection, OptionalExtension};

    use super::{PersistedWalkState, ProgressStore};
    use crate::error::{Result, WalkSimError};
    use crate::GpsPoint;

    /// File-backed store. The route is a MessagePack blob in a single-row
    /// table; path history is one row per point so appends stay cheap.
    pub struct SqliteProgressStore {
        db: Connection,
    }

    impl SqliteProgressStore {
        /// Open (or create) the store at `db_path`.
        pub fn new(db_path: &str) -> Result<Self> {
            let db = Connection::open(db_path)?;
            Self::init_schema(&db)?;
            Ok(Self { db })
        }

        /// Create an in-memory database (for testing).
        pub fn in_memory() -> Result<Self> {
            Self::new(":memory:")
        }

        fn init_schema(conn: &Connection) -> Result<()> {
            conn.execute_batch(
                r#"
                -- The single active walk
                CREATE TABLE IF NOT EXISTS walk_state (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    route BLOB NOT NULL,
                    point_count INTEGER NOT NULL,
                    speed_kmh REAL NOT NULL,
                    saved_at INTEGER DEFAULT (strftime('%s', 'now'))
                );

                -- Visited positions in emission order
                CREATE TABLE IF NOT EXISTS path_points (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    latitude REAL NOT NULL,
                    longitude REAL NOT NULL
                );
                "#,
            )?;
            Ok(())
        }

        fn has_walk_row(&self) -> Result<bool> {
            let count: i64 = self
                .db
                .query_row("SELECT COUNT(*) FROM walk_state", [], |row| row.get(0))?;
            Ok(count > 0)
        }
    }

    impl ProgressStore for SqliteProgressStore {
        fn save(
            &mut self,
            route: &[GpsPoint],
            path_history: &[GpsPoint],
            speed_kmh: f64,
        ) -> Result<()> {
            let route_blob = rmp_serde::to_vec(route)?;

            let tx = self.db.transaction()?;
            tx.execute("DELETE FROM path_points", [])?;
            tx.execute(
                "INSERT OR REPLACE INTO walk_state (id, route, point_count, speed_kmh)
                 VALUES (1, ?, ?, ?)",
                params![route_blob, route.len() as i64, speed_kmh],
            )?;
            {
                let mut stmt =
                    tx.prepare("INSERT INTO path_points (latitude, longitude) VALUES (?, ?)")?;
                for p in path_history {
                    stmt.execute(params![p.latitude, p.longitude])?;
                }
            }
            tx.commit()?;
            Ok(())
        }

        fn append_to_path(&mut self, point: GpsPoint) -> Result<()> {
            if !self.has_walk_row()? {
                return Err(WalkSimError::NoActiveWalk);
            }
            self.db.execute(
                "INSERT INTO path_points (latitude, longitude) VALUES (?, ?)",
                params![point.latitude, point.longitude],
            )?;
            Ok(())
        }

        fn clear(&mut self) -> Result<()> {
            self.db.execute_batch(
                "DELETE FROM path_points;
                 DELETE FROM walk_state;",
            )?;
            Ok(())
        }

        fn load(&self) -> Result<Option<PersistedWalkState>> {
            let row: Option<(Vec<u8>, f64)> = self
                .db
                .query_row(
                    "SELECT route, speed_kmh FROM walk_state WHERE id = 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let (route_blob, speed_kmh) = match row {
                Some(row) => row,
                None => return Ok(None),
            };
            let route: Vec<GpsPoint> = rmp_serde::from_slice(&route_blob)?;

            let mut stmt = self
                .db
                .prepare("SELECT latitude, longitude FROM path_points ORDER BY seq")?;
            let path_history = stmt
                .query_map([], |row| Ok(GpsPoint::new(row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(Some(PersistedWalkState {
                route,
                path_history,
                speed_kmh,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::interpolate;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    fn sample_route() -> Vec<GpsPoint> {
        vec![
            GpsPoint::new(0.0, 0.0),
            GpsPoint::new(0.0, 0.01),
            GpsPoint::new(0.01, 0.01),
        ]
    }

    fn exercise_lifecycle(store: &mut dyn ProgressStore) {
        assert_eq!(store.load().unwrap(), None);
        assert!(matches!(
            store.append_to_path(GpsPoint::new(0.0, 0.0)),
            Err(WalkSimError::NoActiveWalk)
        ));

        let route = sample_route();
        store.save(&route, &[route[0]], 5.0).unwrap();
        store.append_to_path(GpsPoint::new(0.0, 0.001)).unwrap();
        store.append_to_path(GpsPoint::new(0.0, 0.002)).unwrap();

        let state = store.load().unwrap().unwrap();
        assert_eq!(state.route, route);
        assert_eq!(
            state.path_history,
            vec![route[0], GpsPoint::new(0.0, 0.001), GpsPoint::new(0.0, 0.002)]
        );
        assert_eq!(state.speed_kmh, 5.0);
        assert!(store.has_active_walk().unwrap());

        // save overwrites the single record
        store.save(&route[..2], &[], 3.0).unwrap();
        let state = store.load().unwrap().unwrap();
        assert_eq!(state.route.len(), 2);
        assert!(state.path_history.is_empty());
        assert_eq!(state.speed_kmh, 3.0);

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        store.clear().unwrap();
    }

    #[test]
    fn test_memory_store_lifecycle() {
        exercise_lifecycle(&mut MemoryProgressStore::new());
    }

    #[test]
    fn test_memory_store_clones_share_state() {
        let mut store = MemoryProgressStore::new();
        let observer = store.clone();
        store.save(&sample_route(), &[], 4.0).unwrap();
        assert!(observer.has_active_walk().unwrap());
    }

    #[test]
    fn test_memory_store_write_failures() {
        let mut store = MemoryProgressStore::new();
        store.save(&sample_route(), &[], 4.0).unwrap();
        store.set_fail_writes(true);

        assert!(matches!(
            store.append_to_path(GpsPoint::new(0.0, 0.001)),
            Err(WalkSimError::PersistenceFailure { .. })
        ));
        assert!(store.load().unwrap().is_some());
    }

    #[test]
    fn test_restore_from_last_path_point() {
        let mut store = MemoryProgressStore::new();
        let route = sample_route();
        let p0 = route[0];
        let p1 = interpolate(&route[0], &route[1], 0.5);
        let p2 = interpolate(&route[1], &route[2], 0.25);
        store.save(&route, &[p0], 5.0).unwrap();
        store.append_to_path(p1).unwrap();
        store.append_to_path(p2).unwrap();

        let restored = store.restore(&WalkConfig::default()).unwrap().unwrap();
        assert_eq!(restored.path_history, vec![p0, p1, p2]);
        assert_eq!(restored.speed_kmh, 5.0);
        assert_eq!(restored.cursor.segment_index, 1);
        assert!(!restored.is_complete());

        let pos = restored.position().unwrap();
        assert!(approx_eq(pos.latitude, p2.latitude, 1e-9));
        assert!(approx_eq(pos.longitude, p2.longitude, 1e-9));

        // cumulative table is rebuilt, not trusted from storage
        assert_eq!(restored.route, Route::new(route));
    }

    #[test]
    fn test_restore_out_and_back_keeps_return_leg() {
        let mut store = MemoryProgressStore::new();
        let a = GpsPoint::new(0.0, 0.0);
        let b = GpsPoint::new(0.0, 0.01);
        let route = vec![a, b, a];
        let returning = interpolate(&b, &a, 0.75);
        store.save(&route, &[a, b, returning], 5.0).unwrap();

        let restored = store.restore(&WalkConfig::default()).unwrap().unwrap();
        assert_eq!(restored.cursor.segment_index, 1);
        let leg = restored.route.segment_length(1);
        assert!(approx_eq(
            restored.route.remaining_from(&restored.cursor),
            0.25 * leg,
            1e-6
        ));

        let pos = restored.position().unwrap();
        assert!(approx_eq(pos.longitude, returning.longitude, 1e-9));
    }

    #[test]
    fn test_restore_without_history_starts_at_first_point() {
        let mut store = MemoryProgressStore::new();
        store.save(&sample_route(), &[], 0.0).unwrap();

        let config = WalkConfig::default();
        let restored = store.restore(&config).unwrap().unwrap();
        assert_eq!(restored.cursor, Cursor::default());
        assert_eq!(restored.speed_kmh, config.default_speed_kmh);
    }

    #[test]
    fn test_restore_at_final_vertex_is_complete() {
        let mut store = MemoryProgressStore::new();
        let route = sample_route();
        store.save(&route, &[route[0], route[1], route[2]], 5.0).unwrap();

        let restored = store.restore(&WalkConfig::default()).unwrap().unwrap();
        assert!(restored.is_complete());
        assert_eq!(restored.cursor, Cursor::at_vertex(2));
    }

    #[test]
    fn test_restore_rejects_degenerate_route() {
        let mut store = MemoryProgressStore::new();
        store.save(&[GpsPoint::new(0.0, 0.0)], &[], 5.0).unwrap();
        assert!(matches!(
            store.restore(&WalkConfig::default()),
            Err(WalkSimError::InvalidRoute { point_count: 1, .. })
        ));
    }

    #[test]
    fn test_restore_empty_store() {
        let store = MemoryProgressStore::new();
        assert_eq!(store.restore(&WalkConfig::default()).unwrap(), None);
    }

    #[cfg(feature = "persistence")]
    #[test]
    fn test_sqlite_store_lifecycle() {
        exercise_lifecycle(&mut SqliteProgressStore::in_memory().unwrap());
    }

    #[cfg(feature = "persistence")]
    #[test]
    fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walk.db");
        let path = path.to_str().unwrap();
        let route = sample_route();

        {
            let mut store = SqliteProgressStore::new(path).unwrap();
            store.save(&route, &[route[0]], 6.5).unwrap();
            store.append_to_path(GpsPoint::new(0.0, 0.004)).unwrap();
        }

        let store = SqliteProgressStore::new(path).unwrap();
        let restored = store.restore(&WalkConfig::default()).unwrap().unwrap();
        assert_eq!(restored.route.points(), &route[..]);
        assert_eq!(restored.path_history.len(), 2);
        assert_eq!(restored.speed_kmh, 6.5);
        assert_eq!(restored.cursor.segment_index, 0);
        assert!(approx_eq(
            restored.route.distance_along(&restored.cursor),
            0.4 * restored.route.segment_length(0),
            1e-6
        ));
    }
}
