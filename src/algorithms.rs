//! # Algorithm Toolbox
//!
//! Direct access to the coverage algorithms without the stateful engine.
//! Use these to integrate sampling, projection or matching into your own
//! systems.
//!
//! ## Core Algorithms
//!
//! - **Sampling**: Arc-length samples every N meters along a street
//! - **Projection**: Nearest point on a polyline and its normalized position
//! - **Matching**: Nearest street for a fix, with an R-tree prefilter
//! - **Coverage**: Per-street covered samples, validation, progress extraction
//! - **Milestones**: Badge unlocks from a validated-street count
//!
//! ## Geographic Utilities
//!
//! - **Local Metric**: Equirectangular degree-to-meter conversion
//! - **Haversine Distance**: Great-circle distance between GPS points
//! - **Polyline Length**: Total distance along a path
//! - **Bounds Computation**: Bounding box for GPS tracks
//!
//! # Example
//!
//! ```rust
//! use street_coverage::algorithms::{
//!     project_onto_polyline, sample_polyline, GpsPoint,
//! };
//!
//! let street = vec![GpsPoint::new(0.0, 0.0), GpsPoint::new(0.001, 0.0)];
//! let samples = sample_polyline(&street, 5.0);
//! assert_eq!(samples.last().unwrap().t, 1.0);
//!
//! let p = project_onto_polyline(&GpsPoint::new(0.00025, 0.0), &street).unwrap();
//! assert!((p.t - 0.25).abs() < 1e-9);
//! ```

// =============================================================================
// Core Types (re-exported from lib)
// =============================================================================

pub use crate::{Bounds, CoverageConfig, GpsPoint, Street, StreetGeometry};

// =============================================================================
// Geographic Utilities
// =============================================================================

pub use crate::geo_utils::{
    compute_bounds, haversine_distance, meters_to_degrees, polyline_length, to_local_meters,
    LocalMetric, METERS_PER_DEGREE,
};

// =============================================================================
// Sampling & Projection
// =============================================================================

pub use crate::projection::{project_onto_polyline, project_with_metric, Projection};
pub use crate::sampling::{sample_polyline, Sample};

// =============================================================================
// Matching & Coverage
// =============================================================================

pub use crate::coverage::{sub_polyline, SegmentCoverage};
pub use crate::map_matching::{match_among, match_nearest, MatchCandidate, StreetIndex};

/// Nearest street within `ceiling_meters`, using an R-tree prefilter.
///
/// Equivalent to [`match_nearest`] followed by ceiling rejection.
///
/// # Example
/// ```
/// use street_coverage::algorithms::{match_within, GpsPoint, SegmentCoverage, Street, StreetIndex};
///
/// let coverages = vec![SegmentCoverage::new(
///     &Street::new(7, vec![GpsPoint::new(0.0, 0.0), GpsPoint::new(0.001, 0.0)]),
///     5.0,
/// )];
/// let index = StreetIndex::build(&coverages);
///
/// let near = match_within(&GpsPoint::new(0.0005, 0.0001), &coverages, &index, 50.0);
/// assert_eq!(near.unwrap().way_id, 7);
///
/// let far = match_within(&GpsPoint::new(0.0005, 0.01), &coverages, &index, 50.0);
/// assert!(far.is_none());
/// ```
pub fn match_within(
    point: &GpsPoint,
    coverages: &[SegmentCoverage],
    index: &StreetIndex,
    ceiling_meters: f64,
) -> Option<MatchCandidate> {
    let candidates = index.candidates(point, ceiling_meters);
    match_among(point, coverages, &candidates).filter(|m| m.distance_meters <= ceiling_meters)
}

// =============================================================================
// Milestones & Persistence
// =============================================================================

pub use crate::milestones::{default_badges, newly_unlocked, BadgeDefinition, BadgeUnlock};
pub use crate::persistence::PersistenceScheduler;
