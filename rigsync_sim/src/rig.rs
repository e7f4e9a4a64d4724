//! Synthetic camera rigs.
//!
//! Cameras sit on a horizontal ring and all look at the rig center, which is
//! the usual layout of a small motion-capture volume.

use nalgebra::{Matrix3, Vector3};
use rigsync_core::{CameraArray, CameraData, ConfigurationError, Distortion, Extrinsics};
use serde::{Deserialize, Serialize};

/// Parameters of a ring rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingRig {
    /// Number of cameras (default: 4)
    pub cameras: u32,

    /// Ring radius in meters (default: 3.0)
    pub radius: f64,

    /// Camera height above the floor in meters (default: 1.5)
    pub height: f64,

    /// Height of the point the cameras aim at (default: 0.5)
    pub target_height: f64,

    /// Focal length in pixels (default: 900)
    pub focal: f64,

    /// Image [width, height] (default: 1280x720)
    pub size: [u32; 2],

    /// Brown–Conrady coefficients shared by every camera
    pub distortion: [f64; 5],
}

impl Default for RingRig {
    fn default() -> Self {
        Self {
            cameras: 4,
            radius: 3.0,
            height: 1.5,
            target_height: 0.5,
            focal: 900.0,
            size: [1280, 720],
            distortion: [-0.05, 0.01, 0.0, 0.0, 0.0],
        }
    }
}

impl RingRig {
    pub fn with_cameras(cameras: u32) -> Self {
        Self {
            cameras,
            ..Self::default()
        }
    }

    pub fn target(&self) -> Vector3<f64> {
        Vector3::new(0.0, 0.0, self.target_height)
    }

    /// Camera `i` of the ring.
    pub fn camera(&self, camera_id: u32) -> CameraData {
        let angle = std::f64::consts::TAU * camera_id as f64 / self.cameras.max(1) as f64;
        let center = Vector3::new(self.radius * angle.cos(), self.radius * angle.sin(), self.height);

        let forward = (self.target() - center).normalize();
        let right = forward.cross(&Vector3::z()).normalize();
        let down = forward.cross(&right);
        let rotation = Matrix3::from_rows(&[right.transpose(), down.transpose(), forward.transpose()]);

        let [w, h] = self.size;
        CameraData {
            camera_id,
            size: self.size,
            matrix: Matrix3::new(
                self.focal, 0.0, w as f64 / 2.0,
                0.0, self.focal, h as f64 / 2.0,
                0.0, 0.0, 1.0,
            ),
            distortion: Distortion::from_coefficients(&self.distortion).unwrap_or_default(),
            extrinsics: Some(Extrinsics {
                rotation,
                translation: -(rotation * center),
            }),
            ignore: false,
        }
    }

    pub fn build(&self) -> Result<CameraArray, ConfigurationError> {
        CameraArray::new((0..self.cameras).map(|i| self.camera(i)).collect())
    }
}

/// True if `pixel` lies inside the image of `camera`.
pub fn in_image(camera: &CameraData, pixel: &nalgebra::Vector2<f64>) -> bool {
    let [w, h] = camera.size;
    pixel.x >= 0.0 && pixel.y >= 0.0 && pixel.x < w as f64 && pixel.y < h as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_ring() {
        let rig = RingRig::default();
        let array = rig.build().unwrap();
        assert_eq!(array.len(), 4);
        assert_eq!(array.stereo_pairs().len(), 6);

        // Every camera images the target at the principal point
        for cam in array.cameras() {
            let xy = cam.project(&rig.target()).unwrap();
            assert!((xy.x - 640.0).abs() < 1e-9);
            assert!((xy.y - 360.0).abs() < 1e-9);
        }
    }

    proptest! {
        #[test]
        fn prop_ring_sees_its_center(cameras in 2u32..9, radius in 1.5f64..6.0) {
            let rig = RingRig { cameras, radius, ..RingRig::default() };
            let array = rig.build().unwrap();
            let n = cameras as usize;
            prop_assert_eq!(array.stereo_pairs().len(), n * (n - 1) / 2);
            for cam in array.cameras() {
                let xy = cam.project_distorted(&Vector3::new(0.1, -0.1, 0.3)).unwrap();
                prop_assert!(in_image(cam, &xy));
            }
        }
    }
}
