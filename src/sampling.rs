//! Arc-length sampling of street polylines.
//!
//! Each street is turned into a dense set of coverage samples once, at
//! dataset load. A sample is the discrete unit of "has this bit of street
//! been walked".

use serde::{Deserialize, Serialize};

use crate::geo_utils::LocalMetric;
use crate::GpsPoint;

/// A point on a street at normalized arc-length position `t`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub longitude: f64,
    pub latitude: f64,
    /// Normalized arc-length position in [0, 1]
    pub t: f64,
}

impl Sample {
    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// Sample a polyline every `step_meters` along its length.
///
/// Every segment emits `ceil(len / step)` evenly spaced samples starting at
/// its first vertex, and one final sample is always appended at the last
/// vertex with `t = 1.0` exactly, so the end of the street is coverable
/// regardless of step rounding.
///
/// Returns an empty vector for fewer than 2 vertices, a zero-length
/// polyline, or a non-positive step. Such streets are uncoverable.
///
/// # Example
/// ```
/// use street_coverage::GpsPoint;
/// use street_coverage::sampling::sample_polyline;
///
/// let street = vec![GpsPoint::new(0.0, 0.0), GpsPoint::new(0.001, 0.0)];
/// let samples = sample_polyline(&street, 5.0);
/// assert_eq!(samples.first().unwrap().t, 0.0);
/// assert_eq!(samples.last().unwrap().t, 1.0);
/// ```
pub fn sample_polyline(coords: &[GpsPoint], step_meters: f64) -> Vec<Sample> {
    if coords.len() < 2 || !(step_meters.is_finite() && step_meters > 0.0) {
        return Vec::new();
    }
    let Some(metric) = LocalMetric::for_polyline(coords) else {
        return Vec::new();
    };

    let segment_lengths = metric.segment_lengths(coords);
    let total: f64 = segment_lengths.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return Vec::new();
    }

    let estimated = (total / step_meters).ceil() as usize + coords.len();
    let mut samples = Vec::with_capacity(estimated);
    let mut cumulative = 0.0;

    for (i, &seg_len) in segment_lengths.iter().enumerate() {
        if seg_len > 0.0 {
            let a = &coords[i];
            let b = &coords[i + 1];
            let steps = (seg_len / step_meters).ceil() as usize;
            for j in 0..steps {
                let local_t = j as f64 / steps as f64;
                samples.push(Sample {
                    longitude: a.longitude + local_t * (b.longitude - a.longitude),
                    latitude: a.latitude + local_t * (b.latitude - a.latitude),
                    t: (cumulative + local_t * seg_len) / total,
                });
            }
        }
        cumulative += seg_len;
    }

    // Exact end sample, independent of accumulated rounding
    let last = coords[coords.len() - 1];
    samples.push(Sample {
        longitude: last.longitude,
        latitude: last.latitude,
        t: 1.0,
    });

    samples
}
