//! # Street Coverage
//!
//! Real-time street exploration tracking for a single city session.
//!
//! A walker's GPS fixes are snapped to the nearest street, the samples of
//! that street they pass within a fixed radius are marked covered, and once
//! enough of a street is covered it is validated permanently. Validation
//! counts drive badge unlocks and batched snapshot saves.
//!
//! ## Features
//!
//! - **`parallel`** - Project fixes against candidate streets with rayon
//! - **`persistence`** - SQLite snapshot store (rusqlite + MessagePack blobs)
//! - **`ffi`** - UniFFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use street_coverage::{CoverageEngine, FixOutcome, GpsPoint, Street};
//!
//! let mut engine = CoverageEngine::new();
//! engine.load_streets(vec![Street::new(
//!     1,
//!     vec![GpsPoint::new(0.0, 0.0), GpsPoint::new(0.001, 0.0)],
//! )]);
//!
//! // Walk north along the street in 10 m steps
//! let mut validated = false;
//! for i in 0..=10 {
//!     let lat = i as f64 * 10.0 / 111_000.0;
//!     if let FixOutcome::Validated { .. } = engine.process_fix(0.0, lat) {
//!         validated = true;
//!     }
//! }
//! assert!(validated);
//! assert_eq!(engine.validated_way_ids(), vec![1]);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{CoverageError, OptionExt, Result};

// Equirectangular metric, haversine reporting, bounds
pub mod geo_utils;

// Arc-length sampling of street polylines
pub mod sampling;
pub use sampling::{sample_polyline, Sample};

// Point-to-polyline projection
pub mod projection;
pub use projection::{project_onto_polyline, Projection};

// Per-street coverage state and progress extraction
pub mod coverage;
pub use coverage::SegmentCoverage;

// Nearest-street matching and the R-tree candidate index
pub mod map_matching;
pub use map_matching::{match_nearest, MatchCandidate, StreetIndex};

// Badge thresholds and the presentation queue
pub mod milestones;
pub use milestones::{
    default_badges, newly_unlocked, BadgeDefinition, BadgeQueue, BadgeUnlock, MilestoneEvaluator,
};

// Save scheduling, snapshot stores, background writer
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteSnapshotStore;
pub use persistence::{
    ExplorationSnapshot, MemorySnapshotStore, PersistenceScheduler, RestoreSnapshot,
    SnapshotStore, SnapshotWriter,
};

// Algorithm toolbox - standalone access without the engine
pub mod algorithms;

// Stateful coverage engine (singleton for FFI)
pub mod engine;
pub use engine::{
    with_engine, CoverageEngine, EngineStats, FixOutcome, RestoreSummary, ENGINE,
};

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
pub(crate) fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("StreetCoverageRust"),
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
pub(crate) fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use street_coverage::GpsPoint;
/// let point = GpsPoint::new(48.2082, 16.3738); // Vienna
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

/// A street from the loaded city dataset.
///
/// Immutable once loaded. Streets with fewer than 2 vertices, zero total
/// length or out-of-range coordinates are kept in the dataset but can never
/// be covered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Street {
    /// OpenStreetMap way id
    pub way_id: i64,
    pub vertices: Vec<GpsPoint>,
}

impl Street {
    pub fn new(way_id: i64, vertices: Vec<GpsPoint>) -> Self {
        Self { way_id, vertices }
    }

    /// Build from a flat `[lon0, lat0, lon1, lat1, ...]` buffer.
    pub fn from_flat_lon_lat(way_id: i64, flat_coords: &[f64]) -> Self {
        let vertices = flat_coords
            .chunks_exact(2)
            .map(|chunk| GpsPoint::new(chunk[1], chunk[0]))
            .collect();
        Self { way_id, vertices }
    }

    /// Check geometry is usable for sampling and projection.
    pub fn check_geometry(&self) -> Result<()> {
        if self.vertices.len() < 2 {
            return Err(CoverageError::InsufficientPoints {
                way_id: self.way_id,
                point_count: self.vertices.len(),
                minimum_required: 2,
            });
        }
        if let Some(bad) = self.vertices.iter().find(|p| !p.is_valid()) {
            return Err(CoverageError::InvalidCoordinates {
                message: format!(
                    "way {} has vertex ({}, {})",
                    self.way_id, bad.latitude, bad.longitude
                ),
            });
        }
        Ok(())
    }
}

/// Polyline for one street, as handed to the map layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct StreetGeometry {
    pub way_id: i64,
    pub points: Vec<GpsPoint>,
}

/// Tuning for sampling, matching, validation and save batching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
#[serde(default)]
pub struct CoverageConfig {
    /// Arc-length spacing of street samples.
    /// Default: 5.0 meters
    pub sample_step_meters: f64,

    /// Samples within this distance of a snapped fix are covered.
    /// Default: 15.0 meters
    pub coverage_radius_meters: f64,

    /// Fixes farther than this from every street are ignored.
    /// Default: 50.0 meters
    pub match_ceiling_meters: f64,

    /// Covered fraction of samples required to validate a street.
    /// Default: 0.80
    pub validation_threshold: f64,

    /// Validations between snapshot saves.
    /// Default: 10
    pub save_batch_size: u32,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            sample_step_meters: 5.0,
            coverage_radius_meters: 15.0,
            match_ceiling_meters: 50.0,
            validation_threshold: 0.80,
            save_batch_size: 10,
        }
    }
}

impl CoverageConfig {
    /// Parse a (possibly partial) JSON config. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| CoverageError::ConfigError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("sample_step_meters", self.sample_step_meters),
            ("coverage_radius_meters", self.coverage_radius_meters),
            ("match_ceiling_meters", self.match_ceiling_meters),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(CoverageError::ConfigError {
                    message: format!("{} must be positive, got {}", name, value),
                });
            }
        }
        if !(self.validation_threshold > 0.0 && self.validation_threshold <= 1.0) {
            return Err(CoverageError::ConfigError {
                message: format!(
                    "validation_threshold must be in (0, 1], got {}",
                    self.validation_threshold
                ),
            });
        }
        if self.save_batch_size == 0 {
            return Err(CoverageError::ConfigError {
                message: "save_batch_size must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
