//! The calibrated camera rig.
//!
//! A [`CameraArray`] is an immutable snapshot: it is built once from the
//! session configuration and shared as `Arc<CameraArray>`. Recalibration
//! builds a new array (see [`crate::CalibrationSlot`]).
//!
//! Conventions:
//! - Extrinsics map world to camera: `x_cam = R * x_world + t`
//! - Distortion coefficients are Brown–Conrady `[k1, k2, p1, p2, k3]`
//! - "Undistorted pixels" are normalized coordinates mapped back through `K`

use crate::error::ConfigurationError;
use crate::packets::CameraId;
use nalgebra::{Matrix3, Matrix3x4, Vector2, Vector3};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Fixed-point iterations used to invert the distortion model.
const UNDISTORT_ITERS: usize = 20;

/// Tolerance for the orthonormality check on rotations.
const ROTATION_TOLERANCE: f64 = 1e-6;

/// Brown–Conrady radial/tangential distortion.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    /// Build from OpenCV ordering. Accepts 4 (k3 = 0) or 5 coefficients.
    pub fn from_coefficients(coeffs: &[f64]) -> Option<Self> {
        match coeffs {
            [k1, k2, p1, p2] => Some(Self { k1: *k1, k2: *k2, p1: *p1, p2: *p2, k3: 0.0 }),
            [k1, k2, p1, p2, k3] => Some(Self { k1: *k1, k2: *k2, p1: *p1, p2: *p2, k3: *k3 }),
            _ => None,
        }
    }

    pub fn coefficients(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn is_identity(&self) -> bool {
        self.coefficients().iter().all(|c| *c == 0.0)
    }

    /// Apply distortion to a normalized point.
    pub fn distort(&self, n: &Vector2<f64>) -> Vector2<f64> {
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;

        let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
        let x_tan = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let y_tan = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;

        Vector2::new(x * radial + x_tan, y * radial + y_tan)
    }

    /// Invert distortion by fixed-point iteration.
    pub fn undistort(&self, d: &Vector2<f64>) -> Vector2<f64> {
        if self.is_identity() {
            return *d;
        }
        let mut n = *d;
        for _ in 0..UNDISTORT_ITERS {
            let err = self.distort(&n) - d;
            n -= err;
        }
        n
    }
}

/// World-to-camera pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extrinsics {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Extrinsics {
    /// Camera center in world coordinates: `-Rᵀ t`.
    pub fn center(&self) -> Vector3<f64> {
        -(self.rotation.transpose() * self.translation)
    }

    /// `[R | t]`
    pub fn matrix(&self) -> Matrix3x4<f64> {
        let mut m = Matrix3x4::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }
}

// ============================================================================
// CAMERA
// ============================================================================

/// One calibrated camera.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraData {
    pub camera_id: CameraId,

    /// Image size [width, height]
    pub size: [u32; 2],

    /// Intrinsic matrix K
    pub matrix: Matrix3<f64>,

    pub distortion: Distortion,

    /// `None` for cameras that have not been posed yet
    pub extrinsics: Option<Extrinsics>,

    /// Excluded from stereo pairs even when posed
    pub ignore: bool,
}

impl CameraData {
    /// True if this camera can take part in triangulation.
    pub fn is_posed(&self) -> bool {
        self.extrinsics.is_some() && !self.ignore
    }

    pub fn center(&self) -> Option<Vector3<f64>> {
        self.extrinsics.as_ref().map(Extrinsics::center)
    }

    /// Distorted pixel → undistorted normalized coordinates.
    pub fn undistort_to_normalized(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        let fx = self.matrix[(0, 0)];
        let fy = self.matrix[(1, 1)];
        let cx = self.matrix[(0, 2)];
        let cy = self.matrix[(1, 2)];
        let skew = self.matrix[(0, 1)];

        let y = (pixel.y - cy) / fy;
        let x = (pixel.x - cx - skew * y) / fx;
        self.distortion.undistort(&Vector2::new(x, y))
    }

    /// Normalized coordinates → undistorted pixel.
    pub fn normalized_to_pixel(&self, n: &Vector2<f64>) -> Vector2<f64> {
        let h = self.matrix * Vector3::new(n.x, n.y, 1.0);
        Vector2::new(h.x / h.z, h.y / h.z)
    }

    /// Distorted pixel → undistorted pixel.
    pub fn undistort_pixel(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        self.normalized_to_pixel(&self.undistort_to_normalized(pixel))
    }

    /// Project a world point to undistorted pixels. `None` if unposed or
    /// the point is not in front of the camera.
    pub fn project(&self, world: &Vector3<f64>) -> Option<Vector2<f64>> {
        let n = self.project_normalized(world)?;
        Some(self.normalized_to_pixel(&n))
    }

    /// Project a world point to distorted pixels, as a real sensor sees it.
    pub fn project_distorted(&self, world: &Vector3<f64>) -> Option<Vector2<f64>> {
        let n = self.project_normalized(world)?;
        Some(self.normalized_to_pixel(&self.distortion.distort(&n)))
    }

    fn project_normalized(&self, world: &Vector3<f64>) -> Option<Vector2<f64>> {
        let ext = self.extrinsics.as_ref()?;
        let cam = ext.rotation * world + ext.translation;
        if cam.z <= f64::EPSILON {
            return None;
        }
        Some(Vector2::new(cam.x / cam.z, cam.y / cam.z))
    }

    /// Check the intrinsics and pose are usable.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let id = self.camera_id;
        if self.matrix.iter().any(|v| !v.is_finite()) {
            return Err(ConfigurationError::camera(id, "intrinsic matrix has non-finite entries"));
        }
        if self.matrix[(0, 0)] <= 0.0 || self.matrix[(1, 1)] <= 0.0 {
            return Err(ConfigurationError::camera(id, "focal lengths must be positive"));
        }
        if self.matrix[(1, 0)] != 0.0
            || self.matrix[(2, 0)] != 0.0
            || self.matrix[(2, 1)] != 0.0
            || (self.matrix[(2, 2)] - 1.0).abs() > 1e-12
        {
            return Err(ConfigurationError::camera(id, "intrinsic matrix is not upper triangular with K[2][2] = 1"));
        }
        if self.distortion.coefficients().iter().any(|v| !v.is_finite()) {
            return Err(ConfigurationError::camera(id, "distortion has non-finite coefficients"));
        }
        if let Some(ext) = &self.extrinsics {
            if ext.rotation.iter().chain(ext.translation.iter()).any(|v| !v.is_finite()) {
                return Err(ConfigurationError::camera(id, "extrinsics have non-finite entries"));
            }
            let orthogonality = (ext.rotation * ext.rotation.transpose() - Matrix3::identity()).norm();
            if orthogonality > ROTATION_TOLERANCE || ext.rotation.determinant() <= 0.0 {
                return Err(ConfigurationError::camera(id, "rotation is not orthonormal"));
            }
        }
        Ok(())
    }
}

// ============================================================================
// STEREO PAIR
// ============================================================================

/// Two posed cameras with their relative pose (camera_a frame → camera_b frame).
#[derive(Debug, Clone, PartialEq)]
pub struct StereoPair {
    pub camera_a: CameraId,
    pub camera_b: CameraId,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl StereoPair {
    fn between(a: &CameraData, b: &CameraData) -> Option<Self> {
        let ea = a.extrinsics.as_ref()?;
        let eb = b.extrinsics.as_ref()?;
        let rotation = eb.rotation * ea.rotation.transpose();
        let translation = eb.translation - rotation * ea.translation;
        Some(Self {
            camera_a: a.camera_id,
            camera_b: b.camera_id,
            rotation,
            translation,
        })
    }

    /// Distance between the two optical centers.
    pub fn baseline(&self) -> f64 {
        self.translation.norm()
    }

    pub fn key(&self) -> (CameraId, CameraId) {
        (self.camera_a, self.camera_b)
    }
}

// ============================================================================
// CAMERA ARRAY
// ============================================================================

/// Immutable, calibrated set of cameras plus the derived stereo pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraArray {
    cameras: BTreeMap<CameraId, CameraData>,
    pairs: Vec<StereoPair>,
}

impl CameraArray {
    /// Build an array, deriving every posed pair `(a < b)`.
    pub fn new(cameras: Vec<CameraData>) -> Result<Self, ConfigurationError> {
        Self::with_pairs(cameras, None)
    }

    /// Build an array with an optional explicit stereo pair list.
    pub fn with_pairs(
        cameras: Vec<CameraData>,
        explicit_pairs: Option<&[[CameraId; 2]]>,
    ) -> Result<Self, ConfigurationError> {
        let mut by_id = BTreeMap::new();
        for camera in cameras {
            camera.validate()?;
            let id = camera.camera_id;
            if by_id.insert(id, camera).is_some() {
                return Err(ConfigurationError::DuplicateCamera(id));
            }
        }

        let posed: Vec<CameraId> = by_id
            .values()
            .filter(|c| c.is_posed())
            .map(|c| c.camera_id)
            .collect();
        if posed.len() < 2 {
            return Err(ConfigurationError::InsufficientPosedCameras { found: posed });
        }

        let keys: Vec<(CameraId, CameraId)> = match explicit_pairs {
            Some(list) => {
                let mut keys = BTreeSet::new();
                for [a, b] in list {
                    let (a, b) = if a <= b { (*a, *b) } else { (*b, *a) };
                    if a == b || !posed.contains(&a) || !posed.contains(&b) {
                        return Err(ConfigurationError::InvalidStereoPair(a, b));
                    }
                    keys.insert((a, b));
                }
                keys.into_iter().collect()
            }
            None => {
                let mut keys = Vec::new();
                for (i, a) in posed.iter().enumerate() {
                    for b in &posed[i + 1..] {
                        keys.push((*a, *b));
                    }
                }
                keys
            }
        };

        let mut pairs = Vec::with_capacity(keys.len());
        for (a, b) in keys {
            let pair = StereoPair::between(&by_id[&a], &by_id[&b])
                .ok_or(ConfigurationError::InvalidStereoPair(a, b))?;
            if pair.baseline() <= f64::EPSILON {
                return Err(ConfigurationError::InvalidStereoPair(a, b));
            }
            pairs.push(pair);
        }

        debug!("Camera array: {} cameras, {} stereo pairs", by_id.len(), pairs.len());

        Ok(Self {
            cameras: by_id,
            pairs,
        })
    }

    pub fn camera(&self, id: CameraId) -> Option<&CameraData> {
        self.cameras.get(&id)
    }

    pub fn contains(&self, id: CameraId) -> bool {
        self.cameras.contains_key(&id)
    }

    /// All cameras, ascending by id.
    pub fn cameras(&self) -> impl Iterator<Item = &CameraData> {
        self.cameras.values()
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.cameras.keys().copied().collect()
    }

    pub fn posed_camera_ids(&self) -> Vec<CameraId> {
        self.cameras.values().filter(|c| c.is_posed()).map(|c| c.camera_id).collect()
    }

    /// Stereo pairs, ascending by `(camera_a, camera_b)`.
    pub fn stereo_pairs(&self) -> &[StereoPair] {
        &self.pairs
    }

    pub fn stereo_pair(&self, a: CameraId, b: CameraId) -> Option<&StereoPair> {
        let key = if a <= b { (a, b) } else { (b, a) };
        self.pairs.iter().find(|p| p.key() == key)
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Rotation3, Unit};

    /// Camera at `center` looking at the world origin, y-down image convention.
    pub(crate) fn looking_at_origin(camera_id: CameraId, center: Vector3<f64>) -> CameraData {
        let forward = (-center).normalize();
        let up_hint = if forward.z.abs() > 0.9 { Vector3::y() } else { Vector3::z() };
        let right = forward.cross(&up_hint).normalize();
        let down = forward.cross(&right);
        // Rows are the camera axes expressed in world coordinates
        let rotation = Matrix3::from_rows(&[right.transpose(), down.transpose(), forward.transpose()]);
        let translation = -(rotation * center);

        CameraData {
            camera_id,
            size: [1280, 720],
            matrix: Matrix3::new(800.0, 0.0, 640.0, 0.0, 800.0, 360.0, 0.0, 0.0, 1.0),
            distortion: Distortion::default(),
            extrinsics: Some(Extrinsics { rotation, translation }),
            ignore: false,
        }
    }

    pub(crate) fn three_camera_array() -> CameraArray {
        CameraArray::new(vec![
            looking_at_origin(0, Vector3::new(3.0, 0.0, 0.5)),
            looking_at_origin(1, Vector3::new(0.0, 3.0, 0.5)),
            looking_at_origin(2, Vector3::new(-3.0, 0.2, 0.5)),
        ])
        .unwrap()
    }

    #[test]
    fn test_pairs_are_derived_in_order() {
        let array = three_camera_array();
        let keys: Vec<_> = array.stereo_pairs().iter().map(|p| p.key()).collect();
        assert_eq!(keys, vec![(0, 1), (0, 2), (1, 2)]);
        assert!(array.stereo_pair(2, 1).is_some());
    }

    #[test]
    fn test_explicit_pairs_are_validated() {
        let cams = vec![
            looking_at_origin(0, Vector3::new(3.0, 0.0, 0.5)),
            looking_at_origin(1, Vector3::new(0.0, 3.0, 0.5)),
            looking_at_origin(2, Vector3::new(-3.0, 0.2, 0.5)),
        ];
        let array = CameraArray::with_pairs(cams.clone(), Some(&[[2, 0]])).unwrap();
        assert_eq!(array.stereo_pairs().len(), 1);
        assert_eq!(array.stereo_pairs()[0].key(), (0, 2));

        let err = CameraArray::with_pairs(cams, Some(&[[0, 9]])).unwrap_err();
        assert_eq!(err.camera_ids(), vec![0, 9]);
    }

    #[test]
    fn test_relative_pose_maps_a_to_b() {
        let array = three_camera_array();
        let pair = array.stereo_pair(0, 1).unwrap();
        let a = array.camera(0).unwrap().extrinsics.unwrap();
        let b = array.camera(1).unwrap().extrinsics.unwrap();

        let world = Vector3::new(0.2, -0.1, 0.3);
        let in_a = a.rotation * world + a.translation;
        let in_b = b.rotation * world + b.translation;
        let mapped = pair.rotation * in_a + pair.translation;
        assert_relative_eq!(mapped, in_b, epsilon = 1e-12);
    }

    #[test]
    fn test_duplicate_and_unposed_rejected() {
        let dup = CameraArray::new(vec![
            looking_at_origin(0, Vector3::new(3.0, 0.0, 0.0)),
            looking_at_origin(0, Vector3::new(0.0, 3.0, 0.0)),
        ]);
        assert!(matches!(dup, Err(ConfigurationError::DuplicateCamera(0))));

        let mut unposed = looking_at_origin(1, Vector3::new(0.0, 3.0, 0.0));
        unposed.extrinsics = None;
        let err = CameraArray::new(vec![looking_at_origin(0, Vector3::new(3.0, 0.0, 0.0)), unposed]).unwrap_err();
        assert_eq!(err.camera_ids(), vec![0]);
    }

    #[test]
    fn test_rotation_must_be_orthonormal() {
        let mut cam = looking_at_origin(3, Vector3::new(3.0, 0.0, 0.0));
        if let Some(ext) = cam.extrinsics.as_mut() {
            ext.rotation *= 1.01;
        }
        let err = cam.validate().unwrap_err();
        assert!(err.to_string().contains("orthonormal"));
    }

    #[test]
    fn test_undistort_inverts_distort() {
        let mut cam = looking_at_origin(0, Vector3::new(3.0, 0.0, 0.0));
        cam.distortion = Distortion::from_coefficients(&[-0.12, 0.03, 0.001, -0.0005, 0.0]).unwrap();

        let world = Vector3::new(0.3, 0.2, -0.1);
        let distorted = cam.project_distorted(&world).unwrap();
        let ideal = cam.project(&world).unwrap();
        assert_relative_eq!(cam.undistort_pixel(&distorted), ideal, epsilon = 1e-6);
    }

    #[test]
    fn test_center_round_trip() {
        let axis = Unit::new_normalize(Vector3::new(0.3, 1.0, 0.2));
        let rotation = Rotation3::from_axis_angle(&axis, 0.7).into_inner();
        let center = Vector3::new(1.0, -2.0, 0.5);
        let ext = Extrinsics { rotation, translation: -(rotation * center) };
        assert_relative_eq!(ext.center(), center, epsilon = 1e-12);
    }

    #[test]
    fn test_point_behind_camera_does_not_project() {
        let cam = looking_at_origin(0, Vector3::new(3.0, 0.0, 0.0));
        assert!(cam.project(&Vector3::new(6.0, 0.0, 0.0)).is_none());
        assert!(cam.project(&Vector3::zeros()).is_some());
    }
}
