//! Map matching: snap a raw fix to the nearest street.
//!
//! [`match_nearest`] is the brute-force reference: project against every
//! coverable street and keep the global minimum. [`StreetIndex`] narrows the
//! candidate set with an R-tree over street envelopes so the engine only
//! projects against streets that could lie within the match ceiling. Any
//! street within the ceiling is always a candidate, so both paths agree on
//! every match the engine would accept.

use rstar::{RTree, RTreeObject, AABB};
use serde::Serialize;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::coverage::SegmentCoverage;
use crate::geo_utils::{compute_bounds, meters_to_degrees};
use crate::GpsPoint;

/// Best street for a fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchCandidate {
    /// Arena index of the matched coverage entry
    pub index: usize,
    pub way_id: i64,
    /// Normalized arc-length position of the snapped point
    pub t: f64,
    pub snapped: GpsPoint,
    pub distance_meters: f64,
}

fn project_candidate(
    index: usize,
    coverage: &SegmentCoverage,
    point: &GpsPoint,
) -> Option<MatchCandidate> {
    if !coverage.is_coverable() {
        return None;
    }
    let projection = coverage.project(point)?;
    Some(MatchCandidate {
        index,
        way_id: coverage.way_id(),
        t: projection.t,
        snapped: projection.point(),
        distance_meters: projection.distance_meters,
    })
}

/// Nearest coverable street to `point` across all coverages.
///
/// Validated streets are still considered so a fix on a completed street
/// doesn't get snapped onto a neighbouring one. Returns `None` when nothing
/// is coverable. Ties keep the lowest index.
pub fn match_nearest(point: &GpsPoint, coverages: &[SegmentCoverage]) -> Option<MatchCandidate> {
    let mut best: Option<MatchCandidate> = None;
    for (index, coverage) in coverages.iter().enumerate() {
        if let Some(candidate) = project_candidate(index, coverage, point) {
            let is_better = match &best {
                Some(current) => candidate.distance_meters < current.distance_meters,
                None => true,
            };
            if is_better {
                best = Some(candidate);
            }
        }
    }
    best
}

/// Nearest street among a pre-filtered set of arena indices.
///
/// Indices must be ascending for the lowest-index tie-break to hold.
pub fn match_among(
    point: &GpsPoint,
    coverages: &[SegmentCoverage],
    candidates: &[usize],
) -> Option<MatchCandidate> {
    #[cfg(feature = "parallel")]
    {
        candidates
            .par_iter()
            .filter_map(|&i| coverages.get(i).and_then(|c| project_candidate(i, c, point)))
            .min_by(|a, b| {
                a.distance_meters
                    .total_cmp(&b.distance_meters)
                    .then(a.index.cmp(&b.index))
            })
    }

    #[cfg(not(feature = "parallel"))]
    {
        let mut best: Option<MatchCandidate> = None;
        for &index in candidates {
            let Some(coverage) = coverages.get(index) else {
                continue;
            };
            if let Some(candidate) = project_candidate(index, coverage, point) {
                let is_better = match &best {
                    Some(current) => candidate.distance_meters < current.distance_meters,
                    None => true,
                };
                if is_better {
                    best = Some(candidate);
                }
            }
        }
        best
    }
}

/// Street envelope for R-tree spatial indexing.
#[derive(Debug, Clone)]
pub struct StreetEnvelope {
    pub index: usize,
    pub way_id: i64,
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl RTreeObject for StreetEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners([self.min_lng, self.min_lat], [self.max_lng, self.max_lat])
    }
}

/// R-tree of coverable street envelopes, keyed by arena index.
#[derive(Debug)]
pub struct StreetIndex {
    tree: RTree<StreetEnvelope>,
}

impl Default for StreetIndex {
    fn default() -> Self {
        Self { tree: RTree::new() }
    }
}

impl StreetIndex {
    /// Bulk-load envelopes for every coverable street.
    pub fn build(coverages: &[SegmentCoverage]) -> Self {
        let envelopes: Vec<StreetEnvelope> = coverages
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_coverable())
            .map(|(index, c)| {
                let b = compute_bounds(c.coords());
                StreetEnvelope {
                    index,
                    way_id: c.way_id(),
                    min_lat: b.min_lat,
                    max_lat: b.max_lat,
                    min_lng: b.min_lng,
                    max_lng: b.max_lng,
                }
            })
            .collect();

        Self {
            tree: RTree::bulk_load(envelopes),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Arena indices of streets whose envelope lies within `radius_meters`
    /// of `point`, ascending.
    pub fn candidates(&self, point: &GpsPoint, radius_meters: f64) -> Vec<usize> {
        let radius_deg = meters_to_degrees(radius_meters, point.latitude);
        let search = AABB::from_corners(
            [point.longitude - radius_deg, point.latitude - radius_deg],
            [point.longitude + radius_deg, point.latitude + radius_deg],
        );

        let mut indices: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&search)
            .map(|e| e.index)
            .collect();
        indices.sort_unstable();
        indices
    }
}
