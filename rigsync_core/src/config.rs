//! Session configuration.
//!
//! One JSON document supplies the camera array and all tuning. It is read
//! once at session start; an external calibration tool may rewrite it
//! between sessions, the core never does.

use crate::array_triangulator::TriangulationConfig;
use crate::camera_array::{CameraArray, CameraData, Distortion, Extrinsics};
use crate::error::ConfigurationError;
use crate::packets::CameraId;
use crate::synchronizer::SyncConfig;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Serialized form of one camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub camera_id: CameraId,

    /// [width, height]
    pub size: [u32; 2],

    /// Row-major intrinsic matrix
    pub matrix: [[f64; 3]; 3],

    /// Brown–Conrady [k1, k2, p1, p2, k3] (k3 optional)
    pub distortions: Vec<f64>,

    /// Row-major world→camera rotation
    #[serde(default)]
    pub rotation: Option<[[f64; 3]; 3]>,

    /// World→camera translation
    #[serde(default)]
    pub translation: Option<[f64; 3]>,

    #[serde(default)]
    pub ignore: bool,
}

impl CameraConfig {
    /// Convert to a validated [`CameraData`].
    pub fn to_camera(&self) -> Result<CameraData, ConfigurationError> {
        let distortion = Distortion::from_coefficients(&self.distortions).ok_or_else(|| {
            ConfigurationError::camera(
                self.camera_id,
                format!("expected 4 or 5 distortion coefficients, got {}", self.distortions.len()),
            )
        })?;

        let extrinsics = match (self.rotation, self.translation) {
            (Some(r), Some(t)) => Some(Extrinsics {
                rotation: matrix_from_rows(&r),
                translation: Vector3::new(t[0], t[1], t[2]),
            }),
            (None, None) => None,
            _ => {
                return Err(ConfigurationError::camera(
                    self.camera_id,
                    "rotation and translation must be given together",
                ))
            }
        };

        let camera = CameraData {
            camera_id: self.camera_id,
            size: self.size,
            matrix: matrix_from_rows(&self.matrix),
            distortion,
            extrinsics,
            ignore: self.ignore,
        };
        camera.validate()?;
        Ok(camera)
    }

    /// Serialized form of a camera (used when writing rig files).
    pub fn from_camera(camera: &CameraData) -> Self {
        Self {
            camera_id: camera.camera_id,
            size: camera.size,
            matrix: rows_from_matrix(&camera.matrix),
            distortions: camera.distortion.coefficients().to_vec(),
            rotation: camera.extrinsics.map(|e| rows_from_matrix(&e.rotation)),
            translation: camera
                .extrinsics
                .map(|e| [e.translation.x, e.translation.y, e.translation.z]),
            ignore: camera.ignore,
        }
    }
}

/// Full session configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub cameras: Vec<CameraConfig>,

    /// Explicit stereo pairs; all posed pairs when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stereo_pairs: Option<Vec<[CameraId; 2]>>,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub triangulation: TriangulationConfig,
}

impl SessionConfig {
    /// Describe an existing camera array with default tuning.
    pub fn from_camera_array(array: &CameraArray) -> Self {
        Self {
            cameras: array.cameras().map(CameraConfig::from_camera).collect(),
            stereo_pairs: None,
            sync: SyncConfig::default(),
            triangulation: TriangulationConfig::default(),
        }
    }

    /// Parse and validate a configuration document.
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let config: Self = serde_json::from_str(json)?;
        config.sync.validate()?;
        config.triangulation.validate()?;
        Ok(config)
    }

    /// Read and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json)?;
        info!("Loaded session config from {} ({} cameras)", path.display(), config.cameras.len());
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigurationError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Build the immutable camera array snapshot.
    pub fn camera_array(&self) -> Result<CameraArray, ConfigurationError> {
        let cameras = self
            .cameras
            .iter()
            .map(CameraConfig::to_camera)
            .collect::<Result<Vec<_>, _>>()?;
        CameraArray::with_pairs(cameras, self.stereo_pairs.as_deref())
    }
}

fn matrix_from_rows(rows: &[[f64; 3]; 3]) -> Matrix3<f64> {
    Matrix3::new(
        rows[0][0], rows[0][1], rows[0][2],
        rows[1][0], rows[1][1], rows[1][2],
        rows[2][0], rows[2][1], rows[2][2],
    )
}

fn rows_from_matrix(m: &Matrix3<f64>) -> [[f64; 3]; 3] {
    [
        [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
        [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
        [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
    ]
}
