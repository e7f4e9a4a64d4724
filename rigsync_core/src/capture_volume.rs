//! Immutable snapshot of the rig and what it has captured.

use crate::camera_array::CameraArray;
use crate::packets::CameraId;
use crate::point_history::PointHistory;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
}

impl BoundingBox {
    pub fn from_point(p: Vector3<f64>) -> Self {
        Self { min: p, max: p }
    }

    pub fn include(&mut self, p: &Vector3<f64>) {
        self.min = self.min.inf(p);
        self.max = self.max.sup(p);
    }

    pub fn extent(&self) -> Vector3<f64> {
        self.max - self.min
    }

    pub fn center(&self) -> Vector3<f64> {
        (self.min + self.max) * 0.5
    }

    pub fn contains(&self, p: &Vector3<f64>) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }
}

/// Camera geometry plus the bounds of every resolved point.
///
/// Built, never mutated. Rebuild when the history or calibration changes.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureVolume {
    array: Arc<CameraArray>,

    /// `None` when nothing has been resolved
    pub bounds: Option<BoundingBox>,

    /// Points with at least one sample
    pub trajectory_count: usize,

    pub resolved_count: usize,

    pub mean_reprojection_error: Option<f64>,
}

impl CaptureVolume {
    pub fn build(array: Arc<CameraArray>, history: &PointHistory) -> Self {
        let mut bounds: Option<BoundingBox> = None;
        let mut error_sum = 0.0;
        let mut resolved_count = 0usize;

        // rows() is sync ordered, so the float sums are reproducible
        for row in history.rows() {
            let Some(point) = row.result.point() else {
                continue;
            };
            bounds = Some(match bounds {
                Some(mut b) => {
                    b.include(&point.position);
                    b
                }
                None => BoundingBox::from_point(point.position),
            });
            error_sum += point.reprojection_error;
            resolved_count += 1;
        }

        Self {
            array,
            bounds,
            trajectory_count: history.point_ids().len(),
            resolved_count,
            mean_reprojection_error: (resolved_count > 0).then(|| error_sum / resolved_count as f64),
        }
    }

    pub fn camera_array(&self) -> &Arc<CameraArray> {
        &self.array
    }

    /// Optical centers of the posed cameras.
    pub fn camera_centers(&self) -> Vec<(CameraId, Vector3<f64>)> {
        self.array
            .cameras()
            .filter(|c| c.is_posed())
            .filter_map(|c| c.center().map(|center| (c.camera_id, center)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_none()
    }
}
