use serde::Serialize;

use super::{OpacityEncoding, PointCloud, reencode_opacity};

/// Outcome counters of a [`clean`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CleanReport {
    pub total: usize,
    pub dropped: usize,
}

impl CleanReport {
    pub fn kept(&self) -> usize {
        self.total - self.dropped
    }

    /// Fraction of input points that were discarded, `0.0` for an empty cloud.
    pub fn dropped_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.dropped as f64 / self.total as f64
        }
    }
}

/// Drop corrupt points and bring the rest into renderer range.
///
/// A record carrying NaN or infinity in any field is discarded rather than
/// failing the file. Survivors get a linear opacity in `[0, 1]` and a unit
/// quaternion. The returned cloud is always linear-encoded; its
/// `source_opacity` is kept so PLY output can restore the original convention.
pub fn clean(cloud: PointCloud) -> (PointCloud, CleanReport) {
    let total = cloud.records.len();
    let from = cloud.opacity;

    let records: Vec<_> = cloud
        .records
        .into_iter()
        .filter(|r| r.is_finite())
        .map(|mut r| {
            r.opacity = reencode_opacity(r.opacity, from, OpacityEncoding::Linear).clamp(0.0, 1.0);
            r.rotation = normalize_quaternion(r.rotation);
            r
        })
        .collect();

    let report = CleanReport {
        total,
        dropped: total - records.len(),
    };
    let cleaned = PointCloud {
        records,
        opacity: OpacityEncoding::Linear,
        source_opacity: cloud.source_opacity,
    };
    (cleaned, report)
}

fn normalize_quaternion(q: [f32; 4]) -> [f32; 4] {
    let norm = q.iter().map(|v| f64::from(*v).powi(2)).sum::<f64>().sqrt();
    if norm <= f64::EPSILON {
        return [1.0, 0.0, 0.0, 0.0];
    }
    q.map(|v| (f64::from(v) / norm) as f32)
}
