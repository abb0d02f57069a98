//! Per-street coverage state.
//!
//! A [`SegmentCoverage`] tracks which samples of one street have been
//! walked, decides when enough of it has been covered to count as
//! validated, and extracts the covered stretch for progress display.
//!
//! Validation is a one-way transition: a validated entry is never mutated
//! again.

use crate::geo_utils::{polyline_length, LocalMetric};
use crate::projection::{project_with_metric, Projection};
use crate::sampling::{sample_polyline, Sample};
use crate::{GpsPoint, Street};

/// Coverage state for a single street.
#[derive(Debug, Clone)]
pub struct SegmentCoverage {
    way_id: i64,
    coords: Vec<GpsPoint>,
    metric: Option<LocalMetric>,
    samples: Vec<Sample>,
    /// Index-aligned with `samples`
    covered: Vec<bool>,
    covered_count: usize,
    /// Sentinel (1.0, 0.0) until the first sample is covered
    min_covered_t: f64,
    max_covered_t: f64,
    validated: bool,
    length_meters: f64,
}

impl SegmentCoverage {
    /// Build coverage state for a street, sampling it every `step_meters`.
    pub fn new(street: &Street, step_meters: f64) -> Self {
        let samples = sample_polyline(&street.vertices, step_meters);
        let covered = vec![false; samples.len()];
        Self {
            way_id: street.way_id,
            coords: street.vertices.clone(),
            metric: LocalMetric::for_polyline(&street.vertices),
            samples,
            covered,
            covered_count: 0,
            min_covered_t: 1.0,
            max_covered_t: 0.0,
            validated: false,
            length_meters: polyline_length(&street.vertices),
        }
    }

    /// Placeholder entry for a street whose geometry was rejected. It keeps
    /// the raw vertices but has no samples, so it is never matched.
    pub fn uncoverable(street: &Street) -> Self {
        Self {
            way_id: street.way_id,
            coords: street.vertices.clone(),
            metric: None,
            samples: Vec::new(),
            covered: Vec::new(),
            covered_count: 0,
            min_covered_t: 1.0,
            max_covered_t: 0.0,
            validated: false,
            length_meters: 0.0,
        }
    }

    pub fn way_id(&self) -> i64 {
        self.way_id
    }

    pub fn coords(&self) -> &[GpsPoint] {
        &self.coords
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn covered(&self) -> &[bool] {
        &self.covered
    }

    pub fn covered_count(&self) -> usize {
        self.covered_count
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn min_covered_t(&self) -> f64 {
        self.min_covered_t
    }

    pub fn max_covered_t(&self) -> f64 {
        self.max_covered_t
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    /// Great-circle length of the street in meters.
    pub fn length_meters(&self) -> f64 {
        self.length_meters
    }

    /// Streets without samples (degenerate geometry) can never be covered
    /// and are excluded from matching.
    pub fn is_coverable(&self) -> bool {
        !self.samples.is_empty()
    }

    /// True once at least one sample is covered and the entry is not yet
    /// validated.
    pub fn is_in_progress(&self) -> bool {
        !self.validated && self.covered_count > 0
    }

    /// Project a point onto this street in its own planar frame.
    pub fn project(&self, point: &GpsPoint) -> Option<Projection> {
        let metric = self.metric.as_ref()?;
        project_with_metric(metric, point, &self.coords)
    }

    fn cover_sample(&mut self, idx: usize) -> bool {
        if self.covered[idx] {
            return false;
        }
        self.covered[idx] = true;
        self.covered_count += 1;
        let t = self.samples[idx].t;
        self.min_covered_t = self.min_covered_t.min(t);
        self.max_covered_t = self.max_covered_t.max(t);
        true
    }

    /// Mark every uncovered sample within `radius_meters` of the snapped
    /// position as covered.
    ///
    /// Returns whether at least one new sample was touched. Validated and
    /// uncoverable entries always return false.
    pub fn apply_fix(&mut self, snapped: &GpsPoint, radius_meters: f64) -> bool {
        if self.validated {
            return false;
        }
        let Some(metric) = self.metric else {
            return false;
        };

        let mut touched_any = false;
        for idx in 0..self.samples.len() {
            if self.covered[idx] {
                continue;
            }
            let sample = self.samples[idx].point();
            if metric.distance(&sample, snapped) <= radius_meters {
                touched_any |= self.cover_sample(idx);
            }
        }
        touched_any
    }

    /// Fraction of samples covered; 0.0 for uncoverable streets.
    pub fn validation_ratio(&self) -> f64 {
        if self.covered.is_empty() {
            return 0.0;
        }
        self.covered_count as f64 / self.covered.len() as f64
    }

    /// Validate the street if its ratio reaches `threshold`.
    ///
    /// Returns true only on the transition. Calling again on a validated
    /// entry is a no-op returning false.
    pub fn try_validate(&mut self, threshold: f64) -> bool {
        if self.validated || !self.is_coverable() {
            return false;
        }
        if self.validation_ratio() >= threshold {
            self.validated = true;
            return true;
        }
        false
    }

    /// Force the entry into its validated state, bypassing sampling and the
    /// threshold. Used when restoring a saved exploration.
    ///
    /// Returns false for uncoverable streets, which are left untouched.
    pub fn force_validated(&mut self) -> bool {
        if !self.is_coverable() {
            return false;
        }
        self.covered.iter_mut().for_each(|c| *c = true);
        self.covered_count = self.covered.len();
        self.min_covered_t = 0.0;
        self.max_covered_t = 1.0;
        self.validated = true;
        true
    }

    /// The covered stretch of an in-progress street, following the street's
    /// own bends between `min_covered_t` and `max_covered_t`.
    ///
    /// Returns `None` for validated or untouched entries, when the covered
    /// range is empty (`t0 >= t1`), or when the street has zero length.
    pub fn extract_progress(&self) -> Option<Vec<GpsPoint>> {
        if !self.is_in_progress() {
            return None;
        }
        sub_polyline(&self.coords, self.min_covered_t, self.max_covered_t)
    }
}

/// Sub-polyline of `coords` between normalized positions `t0` and `t1`.
///
/// Both endpoints are interpolated on the original segments and every
/// original vertex strictly between them is kept.
pub fn sub_polyline(coords: &[GpsPoint], t0: f64, t1: f64) -> Option<Vec<GpsPoint>> {
    if t0 >= t1 || coords.len() < 2 {
        return None;
    }
    let metric = LocalMetric::for_polyline(coords)?;
    let cumulative = metric.cumulative_lengths(coords);
    let total = *cumulative.last()?;
    if !(total > 0.0) {
        return None;
    }

    let start_dist = t0.clamp(0.0, 1.0) * total;
    let end_dist = t1.clamp(0.0, 1.0) * total;

    let mut result = Vec::with_capacity(coords.len() + 2);
    result.push(point_at_distance(coords, &cumulative, start_dist));
    result.extend(
        coords
            .iter()
            .zip(&cumulative)
            .filter(|&(_, &d)| d > start_dist && d < end_dist)
            .map(|(p, _)| *p),
    );
    result.push(point_at_distance(coords, &cumulative, end_dist));
    Some(result)
}

/// Linearly interpolated point at arc-length `dist` along `coords`.
fn point_at_distance(coords: &[GpsPoint], cumulative: &[f64], dist: f64) -> GpsPoint {
    for i in 0..coords.len() - 1 {
        let seg_len = cumulative[i + 1] - cumulative[i];
        if seg_len > 0.0 && dist <= cumulative[i + 1] {
            let frac = ((dist - cumulative[i]) / seg_len).clamp(0.0, 1.0);
            let a = &coords[i];
            let b = &coords[i + 1];
            if frac >= 1.0 {
                return *b;
            }
            return GpsPoint::new(
                a.latitude + frac * (b.latitude - a.latitude),
                a.longitude + frac * (b.longitude - a.longitude),
            );
        }
    }
    coords[coords.len() - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight_street() -> Street {
        Street::new(1, vec![GpsPoint::new(0.0, 0.0), GpsPoint::new(0.001, 0.0)])
    }

    fn bent_street() -> Street {
        Street::new(
            2,
            vec![
                GpsPoint::new(0.0, 0.0),
                GpsPoint::new(0.001, 0.0),
                GpsPoint::new(0.001, 0.001),
                GpsPoint::new(0.002, 0.001),
            ],
        )
    }

    #[test]
    fn test_new_coverage_is_empty() {
        let coverage = SegmentCoverage::new(&straight_street(), 5.0);
        assert_eq!(coverage.sample_count(), 24);
        assert_eq!(coverage.covered_count(), 0);
        assert_eq!(coverage.min_covered_t(), 1.0);
        assert_eq!(coverage.max_covered_t(), 0.0);
        assert!(!coverage.is_validated());
        assert!(coverage.extract_progress().is_none());
    }

    #[test]
    fn test_apply_fix_covers_within_radius() {
        let mut coverage = SegmentCoverage::new(&straight_street(), 5.0);
        let touched = coverage.apply_fix(&GpsPoint::new(0.0005, 0.0), 15.0);
        assert!(touched);

        // Samples every ~4.83 m, radius 15 m around the midpoint
        let metric = LocalMetric::new(GpsPoint::new(0.0, 0.0));
        for (sample, &covered) in coverage.samples().iter().zip(coverage.covered()) {
            let d = metric.distance(&sample.point(), &GpsPoint::new(0.0005, 0.0));
            assert_eq!(covered, d <= 15.0);
        }
        assert!(coverage.min_covered_t() < 0.5 && coverage.max_covered_t() > 0.5);
    }

    #[test]
    fn test_repeated_fix_is_noop() {
        let mut coverage = SegmentCoverage::new(&straight_street(), 5.0);
        assert!(coverage.apply_fix(&GpsPoint::new(0.0005, 0.0), 15.0));
        let count = coverage.covered_count();
        assert!(!coverage.apply_fix(&GpsPoint::new(0.0005, 0.0), 15.0));
        assert_eq!(coverage.covered_count(), count);
    }

    #[test]
    fn test_threshold_boundary() {
        let mut coverage = SegmentCoverage::new(&straight_street(), 5.0);
        let n = coverage.sample_count();
        let required = (4 * n + 4) / 5; // ceil(0.8 * n)

        for idx in 0..required - 1 {
            coverage.cover_sample(idx);
        }
        assert!(!coverage.try_validate(0.80));
        assert!(!coverage.is_validated());

        coverage.cover_sample(required - 1);
        assert!(coverage.try_validate(0.80));
        assert!(coverage.is_validated());
    }

    #[test]
    fn test_threshold_boundary_exact_ratio() {
        // 42 m street: 9 segment samples + end = 10; exactly 8 covered is 0.8
        let street = Street::new(
            3,
            vec![GpsPoint::new(0.0, 0.0), GpsPoint::new(42.0 / 111_000.0, 0.0)],
        );
        let mut coverage = SegmentCoverage::new(&street, 5.0);
        assert_eq!(coverage.sample_count(), 10);

        for idx in 0..7 {
            coverage.cover_sample(idx);
        }
        assert!(!coverage.try_validate(0.80));
        coverage.cover_sample(7);
        assert!(coverage.try_validate(0.80));
    }

    #[test]
    fn test_try_validate_idempotent() {
        let mut coverage = SegmentCoverage::new(&straight_street(), 5.0);
        for idx in 0..coverage.sample_count() {
            coverage.cover_sample(idx);
        }
        assert!(coverage.try_validate(0.80));
        assert!(!coverage.try_validate(0.80));
        assert!(coverage.is_validated());
    }

    #[test]
    fn test_validated_entry_is_terminal() {
        let mut coverage = SegmentCoverage::new(&straight_street(), 5.0);
        for idx in 0..20 {
            coverage.cover_sample(idx);
        }
        assert!(coverage.try_validate(0.80));

        let before = coverage.covered_count();
        assert!(!coverage.apply_fix(&GpsPoint::new(0.001, 0.0), 15.0));
        assert_eq!(coverage.covered_count(), before);
        assert!(coverage.extract_progress().is_none());
    }

    #[test]
    fn test_degenerate_street_never_validates() {
        let mut coverage =
            SegmentCoverage::new(&Street::new(4, vec![GpsPoint::new(1.0, 1.0)]), 5.0);
        assert!(!coverage.is_coverable());
        assert!(!coverage.apply_fix(&GpsPoint::new(1.0, 1.0), 15.0));
        assert_eq!(coverage.validation_ratio(), 0.0);
        assert!(!coverage.try_validate(0.0));
        assert!(!coverage.force_validated());
        assert!(!coverage.is_validated());
    }

    #[test]
    fn test_force_validated() {
        let mut coverage = SegmentCoverage::new(&straight_street(), 5.0);
        assert!(coverage.force_validated());
        assert!(coverage.is_validated());
        assert_eq!(coverage.validation_ratio(), 1.0);
        assert_eq!(coverage.min_covered_t(), 0.0);
        assert_eq!(coverage.max_covered_t(), 1.0);
        assert!(!coverage.try_validate(0.80));
    }

    #[test]
    fn test_uncoverable_entry_is_inert() {
        let street = straight_street();
        let mut coverage = SegmentCoverage::uncoverable(&street);
        assert_eq!(coverage.coords(), street.vertices.as_slice());
        assert!(!coverage.is_coverable());
        assert!(coverage.project(&GpsPoint::new(0.0005, 0.0)).is_none());
        assert!(!coverage.apply_fix(&GpsPoint::new(0.0005, 0.0), 15.0));
        assert!(!coverage.force_validated());
        assert_eq!(coverage.length_meters(), 0.0);
    }

    #[test]
    fn test_single_sample_has_no_progress_geometry() {
        let mut coverage = SegmentCoverage::new(&straight_street(), 5.0);
        coverage.cover_sample(3);
        assert!(coverage.is_in_progress());
        assert!(coverage.extract_progress().is_none());
    }

    #[test]
    fn test_extract_progress_follows_bends() {
        let street = bent_street();
        let mut coverage = SegmentCoverage::new(&street, 5.0);

        // Walk from the middle of the first leg to the middle of the last
        let walk = [
            GpsPoint::new(0.0005, 0.0),
            GpsPoint::new(0.001, 0.0),
            GpsPoint::new(0.001, 0.0005),
            GpsPoint::new(0.001, 0.001),
            GpsPoint::new(0.0015, 0.001),
        ];
        for fix in &walk {
            coverage.apply_fix(fix, 3.0);
        }
        assert!(!coverage.try_validate(0.80));

        let progress = coverage.extract_progress().unwrap();
        // Start, both corner vertices, end
        assert_eq!(progress.len(), 4);
        assert_eq!(progress[1], street.vertices[1]);
        assert_eq!(progress[2], street.vertices[2]);

        for endpoint in [progress[0], progress[3]] {
            let p = coverage.project(&endpoint).unwrap();
            assert!(p.distance_meters < 1e-6);
        }
        let start = coverage.project(&progress[0]).unwrap();
        let end = coverage.project(&progress[3]).unwrap();
        assert!((start.t - coverage.min_covered_t()).abs() < 1e-9);
        assert!((end.t - coverage.max_covered_t()).abs() < 1e-9);
    }

    #[test]
    fn test_sub_polyline_rejects_empty_range() {
        let street = straight_street();
        assert!(sub_polyline(&street.vertices, 0.5, 0.5).is_none());
        assert!(sub_polyline(&street.vertices, 0.7, 0.2).is_none());
        let zero = vec![GpsPoint::new(1.0, 1.0), GpsPoint::new(1.0, 1.0)];
        assert!(sub_polyline(&zero, 0.0, 1.0).is_none());
    }

    #[test]
    fn test_sub_polyline_full_range_is_original() {
        let street = bent_street();
        let full = sub_polyline(&street.vertices, 0.0, 1.0).unwrap();
        assert_eq!(full, street.vertices);
    }
}
