//! JSON trajectory exporter.
//!
//! Exports truth and estimates side by side per sync index, for plotting.

use crate::session::SimOutcome;
use nalgebra::Vector3;
use rigsync_core::{CameraId, PointId, PointResult, SyncIndex};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Position of a marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerPosition {
    pub point_id: PointId,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl MarkerPosition {
    pub fn new(point_id: PointId, pos: Vector3<f64>) -> Self {
        Self {
            point_id,
            x: pos.x,
            y: pos.y,
            z: pos.z,
        }
    }
}

/// One estimate; `reason` is set for unresolved points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateEntry {
    pub point_id: PointId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reprojection_error: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One sync index of the export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportFrame {
    pub sync_index: SyncIndex,

    /// Nominal capture time in seconds
    pub time_sec: f64,
    pub truth: Vec<MarkerPosition>,
    pub estimates: Vec<EstimateEntry>,
}

/// Complete session export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryExport {
    pub seed: u64,
    pub fps: f64,
    pub frames: Vec<ExportFrame>,
    pub dropped_cameras: Vec<CameraId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rms_error: Option<f64>,
}

impl TrajectoryExport {
    pub fn from_outcome(outcome: &SimOutcome) -> Self {
        let frame_of_sync = outcome.frame_of_sync();
        let frames = frame_of_sync
            .iter()
            .map(|(&sync_index, &frame_index)| {
                let time_sec = frame_index as f64 / outcome.fps;
                let truth = outcome
                    .oracle
                    .positions(time_sec)
                    .into_iter()
                    .map(|(id, p)| MarkerPosition::new(id, p))
                    .collect();
                let estimates = outcome
                    .history
                    .snapshot(sync_index)
                    .into_iter()
                    .map(|e| match e.result {
                        PointResult::Resolved(p) => EstimateEntry {
                            position: Some([p.position.x, p.position.y, p.position.z]),
                            point_id: e.point_id,
                            reprojection_error: Some(p.reprojection_error),
                            reason: None,
                        },
                        PointResult::Unresolved(reason) => EstimateEntry {
                            position: None,
                            point_id: e.point_id,
                            reprojection_error: None,
                            reason: Some(reason.to_string()),
                        },
                    })
                    .collect();
                ExportFrame {
                    sync_index,
                    time_sec,
                    truth,
                    estimates,
                }
            })
            .collect();

        Self {
            seed: outcome.seed,
            fps: outcome.fps,
            frames,
            dropped_cameras: outcome.summary.dropped_cameras.clone(),
            rms_error: outcome.error.rms,
        }
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
