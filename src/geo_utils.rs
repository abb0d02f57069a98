//! # Geographic Utilities
//!
//! Coordinate-metric conversion used by every distance computation in the
//! coverage engine.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`to_local_meters`] | Degree delta to planar meters (equirectangular) |
//! | [`LocalMetric`] | Per-polyline planar frame with a cached `cos(ref_lat)` |
//! | [`haversine_distance`] | Great-circle distance between two GPS points |
//! | [`polyline_length`] | Great-circle length of a GPS track in meters |
//! | [`meters_to_degrees`] | Convert meters to approximate degrees at a latitude |
//! | [`compute_bounds`] | Bounding box of a GPS track |
//!
//! ## Algorithm Notes
//!
//! Matching and sampling use an equirectangular approximation:
//! `x = Δlon · 111000 · cos(ref_lat)`, `y = Δlat · 111000`. It is only valid
//! over city-scale distances, and the reference latitude must be taken per
//! polyline rather than once for the whole dataset.
//!
//! Haversine is used only for reporting (explored distance), where the
//! planar error would accumulate across a whole city.

use crate::{Bounds, GpsPoint};
use geo::{Distance, Haversine, Point};

/// Meters per degree of latitude used by the planar approximation.
pub const METERS_PER_DEGREE: f64 = 111_000.0;

/// Convert a geographic delta to planar meters around `ref_lat`.
///
/// Returns `(x, y)` where `x` is east-west and `y` is north-south.
///
/// # Example
///
/// ```rust
/// use street_coverage::geo_utils::to_local_meters;
///
/// let (x, y) = to_local_meters(0.0, 0.0, 0.001);
/// assert!(x.abs() < 1e-9);
/// assert!((y - 111.0).abs() < 1e-9);
/// ```
#[inline]
pub fn to_local_meters(ref_lat: f64, d_lon: f64, d_lat: f64) -> (f64, f64) {
    let cos_ref = ref_lat.to_radians().cos();
    (
        d_lon * METERS_PER_DEGREE * cos_ref,
        d_lat * METERS_PER_DEGREE,
    )
}

/// Planar frame for one polyline.
///
/// Caches `cos(ref_lat)` and an origin so repeated conversions along the
/// same street don't recompute the trig.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalMetric {
    origin: GpsPoint,
    cos_ref: f64,
}

impl LocalMetric {
    /// Frame anchored at `origin`, using its latitude as reference.
    pub fn new(origin: GpsPoint) -> Self {
        Self {
            origin,
            cos_ref: origin.latitude.to_radians().cos(),
        }
    }

    /// Frame for a polyline, anchored at its first vertex.
    pub fn for_polyline(coords: &[GpsPoint]) -> Option<Self> {
        coords.first().map(|p| Self::new(*p))
    }

    /// Planar position of `point` relative to the frame origin.
    #[inline]
    pub fn to_xy(&self, point: &GpsPoint) -> (f64, f64) {
        self.delta_to_xy(
            point.longitude - self.origin.longitude,
            point.latitude - self.origin.latitude,
        )
    }

    /// Planar conversion of a raw degree delta.
    #[inline]
    pub fn delta_to_xy(&self, d_lon: f64, d_lat: f64) -> (f64, f64) {
        (
            d_lon * METERS_PER_DEGREE * self.cos_ref,
            d_lat * METERS_PER_DEGREE,
        )
    }

    /// Planar distance in meters between two points.
    #[inline]
    pub fn distance(&self, a: &GpsPoint, b: &GpsPoint) -> f64 {
        let (dx, dy) = self.delta_to_xy(b.longitude - a.longitude, b.latitude - a.latitude);
        (dx * dx + dy * dy).sqrt()
    }

    /// Planar length of every segment of `coords`.
    pub fn segment_lengths(&self, coords: &[GpsPoint]) -> Vec<f64> {
        coords
            .windows(2)
            .map(|w| self.distance(&w[0], &w[1]))
            .collect()
    }

    /// Cumulative planar length at each vertex; first entry is 0.
    pub fn cumulative_lengths(&self, coords: &[GpsPoint]) -> Vec<f64> {
        let mut cumulative = Vec::with_capacity(coords.len());
        let mut total = 0.0;
        if !coords.is_empty() {
            cumulative.push(0.0);
        }
        for len in self.segment_lengths(coords) {
            total += len;
            cumulative.push(total);
        }
        cumulative
    }
}

/// Great-circle distance between two GPS points in meters.
///
/// ```rust
/// use street_coverage::{GpsPoint, geo_utils};
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
///
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0);
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Great-circle length of a polyline in meters. Empty or single-point
/// input returns 0.0.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

/// Convert meters to approximate degrees at a given latitude.
///
/// Uses the longitude scale (the smaller meters-per-degree), so the result
/// is a conservative radius usable in both axes for envelope queries.
#[inline]
pub fn meters_to_degrees(meters: f64, latitude: f64) -> f64 {
    let lat_rad = latitude.to_radians();
    let meters_per_degree = METERS_PER_DEGREE * lat_rad.cos().max(0.1);
    meters / meters_per_degree
}

/// Compute the bounding box of a GPS track.
///
/// For empty input, returns a bounds with MIN/MAX values that will fail any
/// overlap check.
pub fn compute_bounds(points: &[GpsPoint]) -> Bounds {
    let mut min_lat = f64::MAX;
    let mut max_lat = f64::MIN;
    let mut min_lng = f64::MAX;
    let mut max_lng = f64::MIN;

    for p in points {
        min_lat = min_lat.min(p.latitude);
        max_lat = max_lat.max(p.latitude);
        min_lng = min_lng.min(p.longitude);
        max_lng = max_lng.max(p.longitude);
    }

    Bounds {
        min_lat,
        max_lat,
        min_lng,
        max_lng,
    }
}
