//! # Coverage Engine
//!
//! Stateful street-coverage engine for one city session. All coverage state
//! lives in Rust; mobile code pushes fixes through thin FFI calls and pulls
//! derived geometry back as JSON.
//!
//! ## Architecture
//!
//! The engine owns:
//! - An arena of [`SegmentCoverage`] entries addressed by way id
//! - An R-tree over street envelopes for candidate lookup
//! - The validated set and the unlocked badge set
//! - The badge presentation queue
//! - The save scheduler and (optionally) a background snapshot writer
//!
//! Each fix runs to completion (match, coverage, validation, milestones,
//! scheduling) before any observer can read state.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::coverage::SegmentCoverage;
use crate::error::{OptionExt, Result};
use crate::map_matching::{match_among, StreetIndex};
use crate::milestones::{BadgeQueue, BadgeUnlock, MilestoneEvaluator};
use crate::persistence::{
    ExplorationSnapshot, PersistenceScheduler, RestoreSnapshot, SnapshotWriter,
};
use crate::{CoverageConfig, GpsPoint, Street, StreetGeometry};

// ============================================================================
// Outcomes
// ============================================================================

/// What a single fix did to the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixOutcome {
    /// Non-finite or out-of-range coordinates
    Invalid,
    /// No coverable streets are loaded
    NoStreets,
    /// No street envelope lies within the match ceiling
    Unmatched,
    /// Nearest street is farther than the match ceiling
    OutOfRange { distance_meters: f64 },
    /// Nearest street is already validated
    AlreadyValidated { way_id: i64 },
    /// Matched, but every sample in range was already covered
    NoNewCoverage { way_id: i64 },
    /// New samples covered, street not yet validated
    Progressed { way_id: i64, ratio: f64 },
    /// Street crossed the validation threshold on this fix
    Validated {
        way_id: i64,
        unlocked: Vec<BadgeUnlock>,
    },
}

/// Result of applying a restore snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct RestoreSummary {
    /// Way ids newly added to the validated set
    pub restored_streets: u32,
    /// Unknown or degenerate way ids
    pub skipped_streets: u32,
    pub restored_badges: u32,
    /// Badges implied by the restored count but missing from the snapshot
    pub reconciled_badges: Vec<BadgeUnlock>,
}

/// Engine statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct EngineStats {
    pub street_count: u32,
    pub coverable_count: u32,
    pub validated_count: u32,
    pub in_progress_count: u32,
    pub unlocked_badge_count: u32,
    pub pending_badge_count: u32,
    pub fixes_processed: u64,
    pub fixes_rejected: u64,
    /// Great-circle length of all validated streets
    pub explored_meters: f64,
    pub persistence_failures: u32,
}

// ============================================================================
// Coverage Engine
// ============================================================================

/// The main stateful coverage engine.
pub struct CoverageEngine {
    // Dataset
    coverages: Vec<SegmentCoverage>,
    index_by_way: HashMap<i64, usize>,
    spatial_index: StreetIndex,

    // Session state
    user_id: String,
    city: String,
    validated: BTreeSet<i64>,
    milestones: MilestoneEvaluator,
    badge_queue: BadgeQueue,

    // Persistence
    scheduler: PersistenceScheduler,
    pending_saves: Vec<ExplorationSnapshot>,
    writer: Option<SnapshotWriter>,
    retired_writer_failures: u32,

    // Cached derived geometry
    progress_cache: Vec<StreetGeometry>,
    progress_dirty: bool,

    // Counters
    fixes_processed: u64,
    fixes_rejected: u64,

    config: CoverageConfig,
}

impl CoverageEngine {
    /// Create a new engine with default configuration.
    pub fn new() -> Self {
        Self::from_valid_config(CoverageConfig::default())
    }

    /// Create a new engine with custom configuration.
    ///
    /// Returns [`crate::CoverageError::ConfigError`] if the config fails
    /// [`CoverageConfig::validate`].
    pub fn with_config(config: CoverageConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    fn from_valid_config(config: CoverageConfig) -> Self {
        Self {
            coverages: Vec::new(),
            index_by_way: HashMap::new(),
            spatial_index: StreetIndex::default(),
            user_id: String::new(),
            city: String::new(),
            validated: BTreeSet::new(),
            milestones: MilestoneEvaluator::default(),
            badge_queue: BadgeQueue::new(),
            scheduler: PersistenceScheduler::new(config.save_batch_size as usize),
            pending_saves: Vec::new(),
            writer: None,
            retired_writer_failures: 0,
            progress_cache: Vec::new(),
            progress_dirty: false,
            fixes_processed: 0,
            fixes_rejected: 0,
            config,
        }
    }

    // ========================================================================
    // Dataset
    // ========================================================================

    /// Replace the street dataset (city change).
    ///
    /// Clears coverage, validated and badge state, queued badges and the
    /// save scheduler. The session identity is kept. Duplicate way ids keep
    /// their first occurrence.
    pub fn load_streets(&mut self, streets: Vec<Street>) {
        self.reset_session_state();

        let mut degenerate = 0usize;
        for street in &streets {
            if self.index_by_way.contains_key(&street.way_id) {
                warn!(
                    "[CoverageEngine] Duplicate way {} in dataset, keeping first",
                    street.way_id
                );
                continue;
            }
            let coverage = build_coverage(street, self.config.sample_step_meters);
            if !coverage.is_coverable() {
                degenerate += 1;
            }
            self.index_by_way.insert(street.way_id, self.coverages.len());
            self.coverages.push(coverage);
        }

        self.spatial_index = StreetIndex::build(&self.coverages);

        info!(
            "[CoverageEngine] Loaded {} streets ({} coverable, {} degenerate)",
            self.coverages.len(),
            self.spatial_index.len(),
            degenerate
        );
    }

    /// Replace the dataset from flat buffers.
    ///
    /// `coords` is `[lon0, lat0, lon1, lat1, ...]` across all streets;
    /// `offsets[i]` is the index of street `i`'s first point (in pairs).
    pub fn load_streets_flat(&mut self, way_ids: &[i64], coords: &[f64], offsets: &[u32]) {
        let point_count = coords.len() / 2;
        let mut streets = Vec::with_capacity(way_ids.len());

        for (i, &way_id) in way_ids.iter().enumerate() {
            let Some(&start) = offsets.get(i) else {
                warn!("[CoverageEngine] Way {} has no offset, skipping", way_id);
                continue;
            };
            let start = (start as usize).min(point_count);
            let end = offsets
                .get(i + 1)
                .map(|&o| o as usize)
                .unwrap_or(point_count)
                .clamp(start, point_count);

            streets.push(Street::from_flat_lon_lat(
                way_id,
                &coords[start * 2..end * 2],
            ));
        }

        self.load_streets(streets);
    }

    fn reset_session_state(&mut self) {
        self.coverages.clear();
        self.index_by_way.clear();
        self.spatial_index = StreetIndex::default();
        self.validated.clear();
        self.milestones.clear();
        self.badge_queue.clear();
        self.scheduler = PersistenceScheduler::new(self.config.save_batch_size as usize);
        self.pending_saves.clear();
        self.progress_cache.clear();
        self.progress_dirty = false;
    }

    /// Set the identity used to key saved snapshots.
    pub fn set_session(&mut self, user_id: &str, city: &str) {
        self.user_id = user_id.to_string();
        self.city = city.to_string();
        info!("[CoverageEngine] Session {}/{}", user_id, city);
    }

    pub fn street_count(&self) -> usize {
        self.coverages.len()
    }

    pub fn coverage(&self, way_id: i64) -> Option<&SegmentCoverage> {
        self.index_by_way
            .get(&way_id)
            .and_then(|&idx| self.coverages.get(idx))
    }

    /// Fraction of samples covered for a street.
    pub fn coverage_ratio(&self, way_id: i64) -> Result<f64> {
        self.coverage(way_id)
            .map(|c| c.validation_ratio())
            .ok_or_unknown_street(way_id)
    }

    // ========================================================================
    // Restore
    // ========================================================================

    /// Seed the session from saved state.
    ///
    /// Every known way id is forced validated; unknown and degenerate ids are
    /// skipped individually. Ids that are already validated, or repeated in
    /// the snapshot, count once. Entries not named are left untouched. Badges
    /// implied by the restored count but absent from the snapshot are
    /// unlocked and queued. Applying the same snapshot twice is a no-op.
    pub fn restore(&mut self, snapshot: &RestoreSnapshot) -> RestoreSummary {
        let mut summary = RestoreSummary::default();

        for &way_id in &snapshot.validated_way_ids {
            let applied = match self.index_by_way.get(&way_id) {
                Some(&idx) => self
                    .coverages
                    .get_mut(idx)
                    .map(|c| c.force_validated())
                    .unwrap_or(false),
                None => false,
            };
            if applied {
                if self.validated.insert(way_id) {
                    summary.restored_streets += 1;
                }
            } else {
                warn!("[CoverageEngine] Skipping unknown way {} in restore", way_id);
                summary.skipped_streets += 1;
            }
        }

        summary.restored_badges = self.milestones.restore(&snapshot.unlocked_badge_ids) as u32;
        summary.reconciled_badges = self.milestones.evaluate(self.validated.len());
        self.badge_queue
            .extend(summary.reconciled_badges.iter().cloned());

        // Only the restored ids are already persisted; earlier in-session
        // validations still need saving.
        let persisted = self.scheduler.last_saved_count() + summary.restored_streets as usize;
        self.scheduler.mark_saved(persisted);
        self.progress_dirty = true;

        info!(
            "[CoverageEngine] Restored {} streets ({} skipped), {} badges ({} reconciled)",
            summary.restored_streets,
            summary.skipped_streets,
            summary.restored_badges,
            summary.reconciled_badges.len()
        );
        summary
    }

    // ========================================================================
    // Fix Processing
    // ========================================================================

    /// Apply one GPS fix.
    pub fn process_fix(&mut self, longitude: f64, latitude: f64) -> FixOutcome {
        self.fixes_processed += 1;
        let point = GpsPoint::new(latitude, longitude);

        if !point.is_valid() {
            self.fixes_rejected += 1;
            debug!("[CoverageEngine] Rejected invalid fix ({}, {})", latitude, longitude);
            return FixOutcome::Invalid;
        }
        if self.spatial_index.is_empty() {
            return FixOutcome::NoStreets;
        }

        let ceiling = self.config.match_ceiling_meters;
        let candidates = self.spatial_index.candidates(&point, ceiling);
        let Some(matched) = match_among(&point, &self.coverages, &candidates) else {
            self.fixes_rejected += 1;
            debug!("[CoverageEngine] No street near ({}, {})", latitude, longitude);
            return FixOutcome::Unmatched;
        };

        if matched.distance_meters > ceiling {
            self.fixes_rejected += 1;
            debug!(
                "[CoverageEngine] Nearest way {} is {:.1}m away, beyond {:.0}m ceiling",
                matched.way_id, matched.distance_meters, ceiling
            );
            return FixOutcome::OutOfRange {
                distance_meters: matched.distance_meters,
            };
        }

        let radius = self.config.coverage_radius_meters;
        let threshold = self.config.validation_threshold;
        let Some(coverage) = self.coverages.get_mut(matched.index) else {
            return FixOutcome::Unmatched;
        };

        if coverage.is_validated() {
            return FixOutcome::AlreadyValidated {
                way_id: matched.way_id,
            };
        }
        if !coverage.apply_fix(&matched.snapped, radius) {
            return FixOutcome::NoNewCoverage {
                way_id: matched.way_id,
            };
        }
        self.progress_dirty = true;

        let validated_now = coverage.try_validate(threshold);
        let ratio = coverage.validation_ratio();

        if validated_now {
            let unlocked = self.on_validated(matched.way_id);
            return FixOutcome::Validated {
                way_id: matched.way_id,
                unlocked,
            };
        }

        debug!(
            "[CoverageEngine] Way {} at {:.0}% ({:.1}m off)",
            matched.way_id,
            ratio * 100.0,
            matched.distance_meters
        );
        FixOutcome::Progressed {
            way_id: matched.way_id,
            ratio,
        }
    }

    fn on_validated(&mut self, way_id: i64) -> Vec<BadgeUnlock> {
        self.validated.insert(way_id);
        let count = self.validated.len();
        info!("[CoverageEngine] Validated way {} ({} total)", way_id, count);

        let unlocked = self.milestones.evaluate(count);
        for badge in &unlocked {
            info!("[CoverageEngine] Badge unlocked: {} ({})", badge.name, badge.id);
        }
        self.badge_queue.extend(unlocked.iter().cloned());

        if self.scheduler.on_validation(count) {
            self.emit_save();
        }
        unlocked
    }

    // ========================================================================
    // Geometry
    // ========================================================================

    fn ensure_progress(&mut self) {
        if !self.progress_dirty {
            return;
        }
        self.progress_cache = self
            .coverages
            .iter()
            .filter_map(|c| {
                c.extract_progress().map(|points| StreetGeometry {
                    way_id: c.way_id(),
                    points,
                })
            })
            .collect();
        self.progress_dirty = false;
    }

    /// Covered stretch of every in-progress street.
    pub fn progress_geometry(&mut self) -> &[StreetGeometry] {
        self.ensure_progress();
        &self.progress_cache
    }

    /// Full polyline of every validated street, ordered by way id.
    pub fn validated_geometry(&self) -> Vec<StreetGeometry> {
        self.validated
            .iter()
            .filter_map(|way_id| {
                self.coverage(*way_id).map(|c| StreetGeometry {
                    way_id: *way_id,
                    points: c.coords().to_vec(),
                })
            })
            .collect()
    }

    pub fn validated_way_ids(&self) -> Vec<i64> {
        self.validated.iter().copied().collect()
    }

    pub fn validated_count(&self) -> usize {
        self.validated.len()
    }

    /// Progress geometry as JSON for FFI.
    pub fn progress_geometry_json(&mut self) -> String {
        serde_json::to_string(self.progress_geometry()).unwrap_or_else(|_| "[]".to_string())
    }

    /// Validated geometry as JSON for FFI.
    pub fn validated_geometry_json(&self) -> String {
        serde_json::to_string(&self.validated_geometry()).unwrap_or_else(|_| "[]".to_string())
    }

    // ========================================================================
    // Badges
    // ========================================================================

    pub fn badge_queue_mut(&mut self) -> &mut BadgeQueue {
        &mut self.badge_queue
    }

    /// Unlocked badge ids, sorted.
    pub fn unlocked_badges(&self) -> Vec<String> {
        self.milestones.unlocked_ids()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Full-state snapshot of the current session.
    pub fn snapshot(&self) -> ExplorationSnapshot {
        ExplorationSnapshot {
            user_id: self.user_id.clone(),
            city: self.city.clone(),
            validated_way_ids: self.validated.clone(),
            total_ways: self.coverages.len() as u32,
            unlocked_badge_ids: self.milestones.unlocked_ids().into_iter().collect(),
        }
    }

    /// Route save requests to a background writer instead of the pending
    /// list. Replaces (and drains) any previous writer.
    pub fn attach_writer(&mut self, writer: SnapshotWriter) {
        self.retire_writer();
        self.writer = Some(writer);
    }

    fn retire_writer(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown();
            self.retired_writer_failures += writer.failures();
        }
    }

    fn emit_save(&mut self) {
        let snapshot = self.snapshot();
        info!(
            "[CoverageEngine] Save requested: {} validated",
            snapshot.validated_way_ids.len()
        );
        match &self.writer {
            Some(writer) => {
                if !writer.submit(snapshot.clone()) {
                    warn!("[CoverageEngine] Writer unavailable, keeping save pending");
                    self.pending_saves.push(snapshot);
                }
            }
            None => self.pending_saves.push(snapshot),
        }
    }

    /// Drain save requests not handed to a writer.
    pub fn take_save_requests(&mut self) -> Vec<ExplorationSnapshot> {
        std::mem::take(&mut self.pending_saves)
    }

    /// Pending save requests as JSON for FFI (drains them).
    pub fn take_save_requests_json(&mut self) -> String {
        serde_json::to_string(&self.take_save_requests()).unwrap_or_else(|_| "[]".to_string())
    }

    /// End the session: flush unsaved validations and drain the writer.
    ///
    /// Returns whether a final save was emitted. Coverage state stays
    /// readable afterwards.
    pub fn teardown(&mut self) -> bool {
        let flushed = self.scheduler.on_teardown(self.validated.len());
        if flushed {
            self.emit_save();
        }
        self.retire_writer();
        info!(
            "[CoverageEngine] Teardown: {} validated, final save {}",
            self.validated.len(),
            if flushed { "emitted" } else { "not needed" }
        );
        flushed
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Replace the configuration and re-sample the loaded dataset.
    ///
    /// Validated streets stay validated; partial progress on other streets
    /// is discarded because samples no longer line up.
    pub fn set_config(&mut self, config: CoverageConfig) -> Result<()> {
        config.validate()?;

        let lost = self.coverages.iter().filter(|c| c.is_in_progress()).count();
        let resampled: Vec<SegmentCoverage> = self
            .coverages
            .iter()
            .map(|old| {
                let street = Street::new(old.way_id(), old.coords().to_vec());
                let mut coverage = build_coverage(&street, config.sample_step_meters);
                if old.is_validated() {
                    coverage.force_validated();
                }
                coverage
            })
            .collect();

        let last_saved = self.scheduler.last_saved_count();
        self.scheduler = PersistenceScheduler::new(config.save_batch_size as usize);
        self.scheduler.mark_saved(last_saved);

        self.coverages = resampled;
        self.spatial_index = StreetIndex::build(&self.coverages);
        self.config = config;
        self.progress_dirty = true;

        if lost > 0 {
            info!(
                "[CoverageEngine] Config changed, discarded progress on {} streets",
                lost
            );
        }
        Ok(())
    }

    pub fn config(&self) -> &CoverageConfig {
        &self.config
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> EngineStats {
        let explored_meters: f64 = self
            .validated
            .iter()
            .filter_map(|id| self.coverage(*id))
            .map(|c| c.length_meters())
            .sum();

        let writer_failures = self.writer.as_ref().map(|w| w.failures()).unwrap_or(0);

        EngineStats {
            street_count: self.coverages.len() as u32,
            coverable_count: self.spatial_index.len() as u32,
            validated_count: self.validated.len() as u32,
            in_progress_count: self.coverages.iter().filter(|c| c.is_in_progress()).count()
                as u32,
            unlocked_badge_count: self.milestones.unlocked_count() as u32,
            pending_badge_count: self.badge_queue.len() as u32,
            fixes_processed: self.fixes_processed,
            fixes_rejected: self.fixes_rejected,
            explored_meters,
            persistence_failures: self.retired_writer_failures + writer_failures,
        }
    }

    /// Statistics as JSON for FFI.
    pub fn stats_json(&self) -> String {
        serde_json::to_string(&self.stats()).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for CoverageEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Coverage entry for one dataset street. Streets with rejected geometry
/// stay in the dataset as uncoverable entries.
fn build_coverage(street: &Street, step_meters: f64) -> SegmentCoverage {
    match street.check_geometry() {
        Ok(()) => {
            let coverage = SegmentCoverage::new(street, step_meters);
            if !coverage.is_coverable() {
                debug!(
                    "[CoverageEngine] Way {} is degenerate ({} vertices), not coverable",
                    street.way_id,
                    street.vertices.len()
                );
            }
            coverage
        }
        Err(e) => {
            debug!("[CoverageEngine] {}, not coverable", e);
            SegmentCoverage::uncoverable(street)
        }
    }
}

// ============================================================================
// Global Singleton
// ============================================================================

/// Global engine instance.
///
/// Lets FFI calls share one engine without passing state across the
/// boundary.
pub static ENGINE: Lazy<Mutex<CoverageEngine>> = Lazy::new(|| Mutex::new(CoverageEngine::new()));

/// Get a lock on the global engine.
pub fn with_engine<F, R>(f: F) -> R
where
    F: FnOnce(&mut CoverageEngine) -> R,
{
    let mut engine = ENGINE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut engine)
}

// ============================================================================
// FFI Exports
// ============================================================================

#[cfg(feature = "ffi")]
pub mod engine_ffi {
    use super::*;
    use log::{error, info};

    /// Initialize the engine (call once at app startup).
    #[uniffi::export]
    pub fn engine_init() {
        crate::init_logging();
        info!("[CoverageEngine] Initialized");
    }

    /// Load a city dataset from flat buffers (`[lon, lat, ...]`).
    #[uniffi::export]
    pub fn engine_load_streets(way_ids: Vec<i64>, coords: Vec<f64>, offsets: Vec<u32>) {
        info!(
            "[CoverageEngine] Loading {} streets ({} coords)",
            way_ids.len(),
            coords.len() / 2
        );
        with_engine(|e| e.load_streets_flat(&way_ids, &coords, &offsets));
    }

    /// Set the user/city pair used to key snapshots.
    #[uniffi::export]
    pub fn engine_set_session(user_id: String, city: String) {
        with_engine(|e| e.set_session(&user_id, &city));
    }

    /// Apply a saved exploration.
    #[uniffi::export]
    pub fn engine_restore(snapshot: RestoreSnapshot) -> RestoreSummary {
        with_engine(|e| e.restore(&snapshot))
    }

    /// Process one GPS fix.
    #[uniffi::export]
    pub fn engine_process_fix(longitude: f64, latitude: f64) -> FixOutcome {
        with_engine(|e| e.process_fix(longitude, latitude))
    }

    /// Progress polylines as JSON: `[{"way_id": 1, "points": [...]}, ...]`.
    #[uniffi::export]
    pub fn engine_progress_geometry_json() -> String {
        with_engine(|e| e.progress_geometry_json())
    }

    /// Validated polylines as JSON.
    #[uniffi::export]
    pub fn engine_validated_geometry_json() -> String {
        with_engine(|e| e.validated_geometry_json())
    }

    /// Next queued badge unlock, if any.
    #[uniffi::export]
    pub fn engine_next_badge() -> Option<BadgeUnlock> {
        with_engine(|e| e.badge_queue_mut().pop_or_none())
    }

    /// Drain pending snapshot-save requests as JSON.
    #[uniffi::export]
    pub fn engine_take_save_requests_json() -> String {
        with_engine(|e| e.take_save_requests_json())
    }

    /// End the session. Returns whether a final save was emitted.
    #[uniffi::export]
    pub fn engine_teardown() -> bool {
        with_engine(|e| e.teardown())
    }

    /// Get engine statistics.
    #[uniffi::export]
    pub fn engine_get_stats() -> EngineStats {
        with_engine(|e| e.stats())
    }

    /// Replace the configuration. Returns false if it was rejected.
    #[uniffi::export]
    pub fn engine_set_config(config: crate::CoverageConfig) -> bool {
        match with_engine(|e| e.set_config(config)) {
            Ok(()) => true,
            Err(e) => {
                error!("[CoverageEngine] {}", e);
                false
            }
        }
    }

    /// Write snapshots to a SQLite database in the background.
    #[cfg(feature = "persistence")]
    #[uniffi::export]
    pub fn engine_attach_store(db_path: String) -> bool {
        match crate::persistence::SqliteSnapshotStore::new(&db_path) {
            Ok(store) => {
                with_engine(|e| e.attach_writer(SnapshotWriter::spawn(store)));
                true
            }
            Err(e) => {
                error!("[CoverageEngine] Failed to open store {}: {}", db_path, e);
                false
            }
        }
    }

    /// Load the saved exploration for the current session from SQLite.
    #[cfg(feature = "persistence")]
    #[uniffi::export]
    pub fn engine_load_saved(db_path: String) -> Option<RestoreSnapshot> {
        use crate::persistence::SnapshotStore;

        let (user_id, city) = with_engine(|e| (e.user_id.clone(), e.city.clone()));
        let loaded = crate::persistence::SqliteSnapshotStore::new(&db_path)
            .and_then(|store| store.load(&user_id, &city));
        match loaded {
            Ok(snapshot) => snapshot.map(|s| s.to_restore()),
            Err(e) => {
                error!("[CoverageEngine] Failed to load {}/{}: {}", user_id, city, e);
                None
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemorySnapshotStore, SnapshotStore};
    use crate::CoverageError;

    const M: f64 = 1.0 / 111_000.0;

    /// ~111 m north-south street at `lon`
    fn street(way_id: i64, lon: f64) -> Street {
        Street::new(
            way_id,
            vec![GpsPoint::new(0.0, lon), GpsPoint::new(0.001, lon)],
        )
    }

    fn engine_with(streets: Vec<Street>) -> CoverageEngine {
        let mut engine = CoverageEngine::new();
        engine.set_session("user-1", "Testville");
        engine.load_streets(streets);
        engine
    }

    /// Walk the street at `lon` from 0 to 110 m in 10 m steps.
    fn walk(engine: &mut CoverageEngine, lon: f64) -> Vec<FixOutcome> {
        (0..=11)
            .map(|i| engine.process_fix(lon, i as f64 * 10.0 * M))
            .collect()
    }

    #[test]
    fn test_load_streets() {
        let engine = engine_with(vec![
            street(1, 0.0),
            street(2, 0.01),
            Street::new(3, vec![GpsPoint::new(0.0, 0.02)]),
        ]);
        let stats = engine.stats();
        assert_eq!(stats.street_count, 3);
        assert_eq!(stats.coverable_count, 2);
        assert_eq!(stats.validated_count, 0);
    }

    #[test]
    fn test_load_streets_duplicate_keeps_first() {
        let engine = engine_with(vec![street(1, 0.0), street(1, 0.05)]);
        assert_eq!(engine.street_count(), 1);
        assert_eq!(engine.coverage(1).unwrap().coords()[0].longitude, 0.0);
    }

    #[test]
    fn test_load_streets_flat() {
        let mut engine = CoverageEngine::new();
        // Street 10: 2 points, street 11: 3 points
        let coords = vec![
            0.0, 0.0, 0.0, 0.001, 0.01, 0.0, 0.01, 0.0005, 0.01, 0.001,
        ];
        engine.load_streets_flat(&[10, 11], &coords, &[0, 2]);

        assert_eq!(engine.street_count(), 2);
        assert_eq!(engine.coverage(11).unwrap().coords().len(), 3);
        assert_eq!(
            engine.coverage(10).unwrap().coords()[1],
            GpsPoint::new(0.001, 0.0)
        );
    }

    #[test]
    fn test_fix_with_no_streets() {
        let mut engine = CoverageEngine::new();
        assert_eq!(engine.process_fix(0.0, 0.0), FixOutcome::NoStreets);
    }

    #[test]
    fn test_invalid_fix_rejected() {
        let mut engine = engine_with(vec![street(1, 0.0)]);
        assert_eq!(engine.process_fix(f64::NAN, 0.0), FixOutcome::Invalid);
        assert_eq!(engine.process_fix(0.0, 120.0), FixOutcome::Invalid);
        assert_eq!(engine.stats().fixes_rejected, 2);
    }

    #[test]
    fn test_fix_beyond_ceiling_is_noop() {
        let mut engine = engine_with(vec![street(1, 0.0)]);
        // 60 m east of the street
        let outcome = engine.process_fix(60.0 * M, 0.0005);
        match outcome {
            FixOutcome::OutOfRange { distance_meters } => {
                assert!((distance_meters - 60.0).abs() < 1e-6)
            }
            FixOutcome::Unmatched => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(engine.coverage(1).unwrap().covered_count(), 0);
        assert!(engine.progress_geometry().is_empty());

        // Far away: no envelope in range at all
        assert_eq!(engine.process_fix(1.0, 1.0), FixOutcome::Unmatched);
    }

    #[test]
    fn test_fix_progresses_then_no_new_coverage() {
        let mut engine = engine_with(vec![street(1, 0.0)]);
        let outcome = engine.process_fix(0.0, 0.0005);
        assert!(matches!(outcome, FixOutcome::Progressed { way_id: 1, .. }));
        assert_eq!(
            engine.process_fix(0.0, 0.0005),
            FixOutcome::NoNewCoverage { way_id: 1 }
        );

        let progress = engine.progress_geometry();
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].way_id, 1);
    }

    #[test]
    fn test_walk_validates_and_unlocks_first_step_once() {
        let mut engine = engine_with(vec![street(1, 0.0)]);
        let outcomes = walk(&mut engine, 0.0);

        let validated: Vec<&FixOutcome> = outcomes
            .iter()
            .filter(|o| matches!(o, FixOutcome::Validated { .. }))
            .collect();
        assert_eq!(validated.len(), 1);
        match validated[0] {
            FixOutcome::Validated { way_id, unlocked } => {
                assert_eq!(*way_id, 1);
                assert_eq!(unlocked.len(), 1);
                assert_eq!(unlocked[0].id, "first_step");
            }
            _ => unreachable!(),
        }

        // Validation happens before the far end of the street
        let idx = outcomes
            .iter()
            .position(|o| matches!(o, FixOutcome::Validated { .. }))
            .unwrap();
        assert!(idx < 11);
        assert!(matches!(outcomes[11], FixOutcome::AlreadyValidated { way_id: 1 }));

        assert_eq!(engine.validated_way_ids(), vec![1]);
        assert_eq!(engine.unlocked_badges(), vec!["first_step".to_string()]);
        assert!(engine.progress_geometry().is_empty());
        assert_eq!(engine.validated_geometry()[0].points, street(1, 0.0).vertices);

        let queue = engine.badge_queue_mut();
        assert_eq!(queue.pop_or_none().unwrap().id, "first_step");
        assert!(queue.pop_or_none().is_none());
    }

    #[test]
    fn test_validated_street_not_mutated() {
        let mut engine = engine_with(vec![street(1, 0.0)]);
        walk(&mut engine, 0.0);
        let before = engine.coverage(1).unwrap().covered_count();
        walk(&mut engine, 0.0);
        assert_eq!(engine.coverage(1).unwrap().covered_count(), before);
        assert_eq!(engine.validated_count(), 1);
        assert_eq!(engine.unlocked_badges().len(), 1);
    }

    #[test]
    fn test_restore_forces_validated() {
        let mut engine = engine_with(vec![street(1, 0.0), street(2, 0.01), street(3, 0.02)]);
        let summary = engine.restore(&RestoreSnapshot {
            validated_way_ids: vec![1, 2, 999],
            unlocked_badge_ids: vec!["first_step".to_string(), "nope".to_string()],
        });

        assert_eq!(summary.restored_streets, 2);
        assert_eq!(summary.skipped_streets, 1);
        assert_eq!(summary.restored_badges, 1);
        assert!(summary.reconciled_badges.is_empty());

        assert_eq!(engine.validated_way_ids(), vec![1, 2]);
        let restored = engine.coverage(1).unwrap();
        assert_eq!(restored.validation_ratio(), 1.0);
        assert_eq!(restored.min_covered_t(), 0.0);
        assert_eq!(restored.max_covered_t(), 1.0);
        assert_eq!(engine.coverage(3).unwrap().covered_count(), 0);

        // Restored count is already durable
        assert!(!engine.teardown());
    }

    #[test]
    fn test_restore_is_idempotent() {
        let mut engine = engine_with(vec![street(1, 0.0), street(2, 0.01)]);
        let snapshot = RestoreSnapshot {
            validated_way_ids: vec![2],
            unlocked_badge_ids: vec![],
        };
        let first = engine.restore(&snapshot);
        assert_eq!(first.reconciled_badges.len(), 1);

        let second = engine.restore(&snapshot);
        assert_eq!(second.restored_streets, 0);
        assert_eq!(second.skipped_streets, 0);
        assert_eq!(second.restored_badges, 0);
        assert!(second.reconciled_badges.is_empty());
        assert_eq!(engine.validated_way_ids(), vec![2]);
        assert_eq!(engine.badge_queue_mut().len(), 1);
    }

    #[test]
    fn test_restore_counts_each_way_once() {
        let mut engine = engine_with(vec![street(1, 0.0), street(2, 0.01)]);
        walk(&mut engine, 0.0);

        let summary = engine.restore(&RestoreSnapshot {
            validated_way_ids: vec![1, 2, 2],
            unlocked_badge_ids: vec![],
        });
        assert_eq!(summary.restored_streets, 1);
        assert_eq!(summary.skipped_streets, 0);
        assert_eq!(engine.validated_way_ids(), vec![1, 2]);
    }

    #[test]
    fn test_restore_keeps_unsaved_session_progress() {
        let mut engine = engine_with(vec![street(1, 0.0), street(2, 0.01)]);
        walk(&mut engine, 0.0);
        assert_eq!(engine.validated_way_ids(), vec![1]);
        assert!(engine.take_save_requests().is_empty());

        engine.restore(&RestoreSnapshot {
            validated_way_ids: vec![2],
            unlocked_badge_ids: vec![],
        });

        assert!(engine.teardown());
        let saves = engine.take_save_requests();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].validated_way_ids, BTreeSet::from([1, 2]));
    }

    #[test]
    fn test_with_config_validates() {
        let bad = CoverageConfig {
            sample_step_meters: 0.0,
            ..CoverageConfig::default()
        };
        assert!(matches!(
            CoverageEngine::with_config(bad),
            Err(CoverageError::ConfigError { .. })
        ));

        let good = CoverageConfig {
            sample_step_meters: 2.0,
            ..CoverageConfig::default()
        };
        let engine = CoverageEngine::with_config(good).unwrap();
        assert_eq!(engine.config().sample_step_meters, 2.0);
    }

    #[test]
    fn test_non_finite_vertex_is_uncoverable() {
        let broken = Street::new(
            7,
            vec![GpsPoint::new(0.0, 0.0), GpsPoint::new(0.0, f64::INFINITY)],
        );
        let mut engine = engine_with(vec![broken, street(1, 0.01)]);

        let stats = engine.stats();
        assert_eq!(stats.street_count, 2);
        assert_eq!(stats.coverable_count, 1);
        assert!(!engine.coverage(7).unwrap().is_coverable());

        assert_eq!(engine.process_fix(0.0, 0.0), FixOutcome::Unmatched);
        walk(&mut engine, 0.01);
        assert_eq!(engine.validated_way_ids(), vec![1]);

        let summary = engine.restore(&RestoreSnapshot {
            validated_way_ids: vec![7],
            unlocked_badge_ids: vec![],
        });
        assert_eq!(summary.skipped_streets, 1);
        assert!(!engine.coverage(7).unwrap().is_validated());
    }

    #[test]
    fn test_batched_saves_and_teardown_flush() {
        let streets: Vec<Street> = (0..12).map(|i| street(i, i as f64 * 0.01)).collect();
        let mut engine = engine_with(streets);

        for i in 0..9 {
            walk(&mut engine, i as f64 * 0.01);
        }
        assert!(engine.take_save_requests().is_empty());

        walk(&mut engine, 0.09);
        let saves = engine.take_save_requests();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].validated_way_ids.len(), 10);
        assert_eq!(saves[0].user_id, "user-1");
        assert_eq!(saves[0].city, "Testville");
        assert_eq!(saves[0].total_ways, 12);

        walk(&mut engine, 0.10);
        assert!(engine.take_save_requests().is_empty());
        assert!(engine.teardown());
        let saves = engine.take_save_requests();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].validated_way_ids.len(), 11);
        assert!(!engine.teardown());
    }

    #[test]
    fn test_writer_receives_saves() {
        let store = MemorySnapshotStore::new();
        let mut engine = engine_with(vec![street(1, 0.0), street(2, 0.01)]);
        engine.attach_writer(SnapshotWriter::spawn(store.clone()));

        walk(&mut engine, 0.0);
        assert!(engine.teardown());
        assert!(engine.take_save_requests().is_empty());

        let saved = store.load("user-1", "Testville").unwrap().unwrap();
        assert_eq!(saved.validated_way_ids.len(), 1);
        assert_eq!(saved.unlocked_badge_ids.len(), 1);
        assert_eq!(engine.stats().persistence_failures, 0);
    }

    #[test]
    fn test_load_streets_resets_session() {
        let mut engine = engine_with(vec![street(1, 0.0)]);
        walk(&mut engine, 0.0);
        assert_eq!(engine.validated_count(), 1);

        engine.load_streets(vec![street(5, 0.0)]);
        assert_eq!(engine.validated_count(), 0);
        assert!(engine.unlocked_badges().is_empty());
        assert!(engine.badge_queue_mut().is_empty());
        assert!(engine.coverage(1).is_none());
    }

    #[test]
    fn test_set_config_keeps_validated() {
        let mut engine = engine_with(vec![street(1, 0.0), street(2, 0.01)]);
        walk(&mut engine, 0.0);
        engine.process_fix(0.01, 0.0005);
        assert_eq!(engine.stats().in_progress_count, 1);

        let config = CoverageConfig {
            sample_step_meters: 2.0,
            ..CoverageConfig::default()
        };
        engine.set_config(config).unwrap();

        assert_eq!(engine.config().sample_step_meters, 2.0);
        assert_eq!(engine.validated_way_ids(), vec![1]);
        assert!(engine.coverage(1).unwrap().is_validated());
        assert_eq!(engine.coverage(2).unwrap().covered_count(), 0);
        assert_eq!(engine.stats().in_progress_count, 0);
    }

    #[test]
    fn test_set_config_rejects_invalid() {
        let mut engine = CoverageEngine::new();
        let config = CoverageConfig {
            validation_threshold: 0.0,
            ..CoverageConfig::default()
        };
        assert!(engine.set_config(config).is_err());
        assert_eq!(engine.config(), &CoverageConfig::default());
    }

    #[test]
    fn test_coverage_ratio_unknown_street() {
        let engine = engine_with(vec![street(1, 0.0)]);
        assert_eq!(engine.coverage_ratio(1).unwrap(), 0.0);
        assert!(engine.coverage_ratio(42).is_err());
    }

    #[test]
    fn test_stats_explored_distance() {
        let mut engine = engine_with(vec![street(1, 0.0)]);
        walk(&mut engine, 0.0);
        let stats = engine.stats();
        // Haversine length of 0.001° latitude is ~111.2 m
        assert!(stats.explored_meters > 110.0 && stats.explored_meters < 112.0);
        assert_eq!(stats.fixes_processed, 12);
    }

    #[test]
    fn test_json_accessors() {
        let mut engine = engine_with(vec![street(1, 0.0)]);
        engine.process_fix(0.0, 0.0005);

        let progress: serde_json::Value =
            serde_json::from_str(&engine.progress_geometry_json()).unwrap();
        assert_eq!(progress[0]["way_id"], 1);
        assert_eq!(engine.validated_geometry_json(), "[]");

        let stats: serde_json::Value = serde_json::from_str(&engine.stats_json()).unwrap();
        assert_eq!(stats["street_count"], 1);
    }
}
