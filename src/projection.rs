//! Point-to-polyline projection.
//!
//! Finds the nearest point on a street to an arbitrary position, in the
//! street's own planar frame, and reports where along the street it lies.

use serde::Serialize;

use crate::geo_utils::LocalMetric;
use crate::GpsPoint;

/// Result of projecting a point onto a polyline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Projection {
    /// Normalized arc-length position of the nearest point
    pub t: f64,
    pub longitude: f64,
    pub latitude: f64,
    /// Planar distance from the input point to the nearest point
    pub distance_meters: f64,
}

impl Projection {
    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// Project `point` onto the polyline `coords`.
///
/// Each segment is projected with `local_t = clamp01(dot(P−A, B−A) / |B−A|²)`
/// in planar meters (0 for zero-length segments). The closest segment wins;
/// on exact ties the first one encountered is kept.
///
/// Returns `None` for fewer than 2 vertices.
///
/// # Example
/// ```
/// use street_coverage::GpsPoint;
/// use street_coverage::projection::project_onto_polyline;
///
/// let street = vec![GpsPoint::new(0.0, 0.0), GpsPoint::new(0.001, 0.0)];
/// let p = project_onto_polyline(&GpsPoint::new(0.0005, 0.0001), &street).unwrap();
/// assert!((p.t - 0.5).abs() < 1e-9);
/// assert!(p.distance_meters > 10.0 && p.distance_meters < 12.0);
/// ```
pub fn project_onto_polyline(point: &GpsPoint, coords: &[GpsPoint]) -> Option<Projection> {
    if coords.len() < 2 {
        return None;
    }
    let metric = LocalMetric::for_polyline(coords)?;
    project_with_metric(&metric, point, coords)
}

/// Same as [`project_onto_polyline`] with a caller-supplied frame.
///
/// Coverage entries cache their frame so matching doesn't recompute it per fix.
pub fn project_with_metric(
    metric: &LocalMetric,
    point: &GpsPoint,
    coords: &[GpsPoint],
) -> Option<Projection> {
    if coords.len() < 2 {
        return None;
    }

    let (px, py) = metric.to_xy(point);
    let segment_lengths = metric.segment_lengths(coords);
    let total: f64 = segment_lengths.iter().sum();

    let mut best: Option<Projection> = None;
    let mut cumulative = 0.0;

    for (i, &seg_len) in segment_lengths.iter().enumerate() {
        let a = &coords[i];
        let b = &coords[i + 1];
        let (ax, ay) = metric.to_xy(a);
        let (bx, by) = metric.to_xy(b);
        let (dx, dy) = (bx - ax, by - ay);
        let len_sq = dx * dx + dy * dy;

        let local_t = if len_sq > 0.0 {
            (((px - ax) * dx + (py - ay) * dy) / len_sq).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let qx = ax + local_t * dx;
        let qy = ay + local_t * dy;
        let distance = ((px - qx).powi(2) + (py - qy).powi(2)).sqrt();

        let is_better = match &best {
            Some(current) => distance < current.distance_meters,
            None => true,
        };

        if is_better {
            let t = if total > 0.0 {
                ((cumulative + local_t * seg_len) / total).clamp(0.0, 1.0)
            } else {
                0.0
            };
            best = Some(Projection {
                t,
                longitude: a.longitude + local_t * (b.longitude - a.longitude),
                latitude: a.latitude + local_t * (b.latitude - a.latitude),
                distance_meters: distance,
            });
        }

        cumulative += seg_len;
    }

    best
}
