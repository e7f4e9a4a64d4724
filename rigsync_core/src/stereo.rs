//! Pairwise stereo candidates.
//!
//! [`StereoPointsBuilder`] selects, per stereo pair, the points both cameras
//! saw at one sync index. [`StereoTriangulator`] turns each shared
//! observation into a 3D candidate with a direct linear transform and scores
//! it by reprojection error. Both are pure and deterministic.

use crate::camera_array::{CameraArray, CameraData, StereoPair};
use crate::packets::{CameraId, ObservationSet, PointId};
use nalgebra::{Matrix3x4, Matrix4, Vector2, Vector3};
use tracing::trace;

/// Homogeneous scale below which a DLT solution is treated as a point at infinity.
const MIN_HOMOGENEOUS_SCALE: f64 = 1e-12;

// ============================================================================
// SHARED OBSERVATIONS
// ============================================================================

/// One point seen by both cameras of a pair, in distorted pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SharedObservation {
    pub point_id: PointId,
    pub xy_a: Vector2<f64>,
    pub xy_b: Vector2<f64>,
}

/// Every point shared by one stereo pair, ascending by point id.
#[derive(Debug, Clone, PartialEq)]
pub struct PairObservations {
    pub camera_a: CameraId,
    pub camera_b: CameraId,
    pub points: Vec<SharedObservation>,
}

/// Extracts shared observations for each stereo pair of a camera array.
pub struct StereoPointsBuilder<'a> {
    pairs: &'a [StereoPair],
}

impl<'a> StereoPointsBuilder<'a> {
    pub fn new(array: &'a CameraArray) -> Self {
        Self {
            pairs: array.stereo_pairs(),
        }
    }

    /// Shared points per pair, in pair order. Pairs with nothing in common
    /// are left out.
    pub fn build(&self, observations: &ObservationSet) -> Vec<PairObservations> {
        self.pairs
            .iter()
            .filter_map(|pair| Self::shared(pair, observations))
            .collect()
    }

    fn shared(pair: &StereoPair, observations: &ObservationSet) -> Option<PairObservations> {
        let seen_a = observations.camera(pair.camera_a)?;
        let seen_b = observations.camera(pair.camera_b)?;

        let points: Vec<SharedObservation> = seen_a
            .iter()
            .filter_map(|(point_id, xy_a)| {
                seen_b.get(point_id).map(|xy_b| SharedObservation {
                    point_id: *point_id,
                    xy_a: *xy_a,
                    xy_b: *xy_b,
                })
            })
            .collect();

        if points.is_empty() {
            return None;
        }
        Some(PairObservations {
            camera_a: pair.camera_a,
            camera_b: pair.camera_b,
            points,
        })
    }
}

// ============================================================================
// TRIANGULATION
// ============================================================================

/// Pairwise 3D estimate for one point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoCandidate {
    pub point_id: PointId,
    pub camera_a: CameraId,
    pub camera_b: CameraId,
    pub position: Vector3<f64>,

    /// Reprojection error in camera a, undistorted pixels
    pub error_a: f64,

    /// Reprojection error in camera b, undistorted pixels
    pub error_b: f64,
}

impl StereoCandidate {
    /// Mean of the two per-view errors.
    pub fn reprojection_error(&self) -> f64 {
        0.5 * (self.error_a + self.error_b)
    }

    pub fn pair(&self) -> (CameraId, CameraId) {
        (self.camera_a, self.camera_b)
    }
}

/// Linear two-view triangulation for one camera pair.
pub struct StereoTriangulator<'a> {
    camera_a: &'a CameraData,
    camera_b: &'a CameraData,
    proj_a: Matrix3x4<f64>,
    proj_b: Matrix3x4<f64>,
}

impl<'a> StereoTriangulator<'a> {
    /// `None` unless both cameras are posed.
    pub fn new(camera_a: &'a CameraData, camera_b: &'a CameraData) -> Option<Self> {
        let proj_a = camera_a.extrinsics.as_ref()?.matrix();
        let proj_b = camera_b.extrinsics.as_ref()?.matrix();
        Some(Self {
            camera_a,
            camera_b,
            proj_a,
            proj_b,
        })
    }

    /// Triangulator for a pair of `array`.
    pub fn for_pair(array: &'a CameraArray, camera_a: CameraId, camera_b: CameraId) -> Option<Self> {
        Self::new(array.camera(camera_a)?, array.camera(camera_b)?)
    }

    /// Estimate one point from its two distorted pixel observations.
    ///
    /// Returns `None` for points at infinity or behind either camera.
    pub fn triangulate(&self, point_id: PointId, xy_a: &Vector2<f64>, xy_b: &Vector2<f64>) -> Option<StereoCandidate> {
        let na = self.camera_a.undistort_to_normalized(xy_a);
        let nb = self.camera_b.undistort_to_normalized(xy_b);
        let position = dlt_two_view(&self.proj_a, &na, &self.proj_b, &nb)?;

        // project() is None behind the camera
        let reproj_a = self.camera_a.project(&position)?;
        let reproj_b = self.camera_b.project(&position)?;

        let error_a = (reproj_a - self.camera_a.normalized_to_pixel(&na)).norm();
        let error_b = (reproj_b - self.camera_b.normalized_to_pixel(&nb)).norm();

        Some(StereoCandidate {
            point_id,
            camera_a: self.camera_a.camera_id,
            camera_b: self.camera_b.camera_id,
            position,
            error_a,
            error_b,
        })
    }

    /// Candidates for every shared point of a pair; failed points are skipped.
    pub fn triangulate_pair(&self, shared: &PairObservations) -> Vec<StereoCandidate> {
        shared
            .points
            .iter()
            .filter_map(|obs| {
                let candidate = self.triangulate(obs.point_id, &obs.xy_a, &obs.xy_b);
                if candidate.is_none() {
                    trace!(
                        "Pair ({}, {}) point {}: no valid DLT solution",
                        shared.camera_a,
                        shared.camera_b,
                        obs.point_id
                    );
                }
                candidate
            })
            .collect()
    }
}

/// Solve `A X = 0` for the two projection matrices and normalized points.
///
/// Takes the right singular vector of the smallest singular value; the
/// singular values of nalgebra's SVD are not guaranteed to be sorted.
pub fn dlt_two_view(
    proj_a: &Matrix3x4<f64>,
    na: &Vector2<f64>,
    proj_b: &Matrix3x4<f64>,
    nb: &Vector2<f64>,
) -> Option<Vector3<f64>> {
    let a = Matrix4::from_rows(&[
        na.x * proj_a.row(2) - proj_a.row(0),
        na.y * proj_a.row(2) - proj_a.row(1),
        nb.x * proj_b.row(2) - proj_b.row(0),
        nb.y * proj_b.row(2) - proj_b.row(1),
    ]);
    if a.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let x_h = v_t.row(svd.singular_values.imin());

    let w = x_h[3];
    if w.abs() <= MIN_HOMOGENEOUS_SCALE {
        return None;
    }
    Some(Vector3::new(x_h[0] / w, x_h[1] / w, x_h[2] / w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_array::tests::{looking_at_origin, three_camera_array};
    use crate::camera_array::Distortion;
    use approx::assert_relative_eq;

    fn observe(array: &CameraArray, sync_index: u64, points: &[(PointId, Vector3<f64>)], cams: &[CameraId]) -> ObservationSet {
        let mut set = ObservationSet::new(sync_index);
        for cam in cams {
            let camera = array.camera(*cam).unwrap();
            for (id, world) in points {
                let xy = camera.project_distorted(world).unwrap();
                set.insert(*cam, *id, [xy.x, xy.y]);
            }
        }
        set
    }

    #[test]
    fn test_builder_selects_shared_points() {
        let array = three_camera_array();
        let mut set = ObservationSet::new(0);
        set.insert(0, 1, [600.0, 300.0]);
        set.insert(0, 2, [610.0, 310.0]);
        set.insert(1, 2, [620.0, 320.0]);
        set.insert(2, 9, [630.0, 330.0]);

        let shared = StereoPointsBuilder::new(&array).build(&set);
        // (0, 2) and (1, 2) share nothing
        assert_eq!(shared.len(), 1);
        assert_eq!((shared[0].camera_a, shared[0].camera_b), (0, 1));
        assert_eq!(shared[0].points.len(), 1);
        assert_eq!(shared[0].points[0].point_id, 2);
    }

    #[test]
    fn test_noiseless_point_is_recovered() {
        let array = three_camera_array();
        let world = Vector3::new(0.1, -0.2, 0.3);
        let set = observe(&array, 0, &[(4, world)], &[0, 1]);

        let shared = StereoPointsBuilder::new(&array).build(&set);
        let triangulator = StereoTriangulator::for_pair(&array, 0, 1).unwrap();
        let candidates = triangulator.triangulate_pair(&shared[0]);

        assert_eq!(candidates.len(), 1);
        assert_relative_eq!(candidates[0].position, world, epsilon = 1e-6);
        assert!(candidates[0].reprojection_error() < 1e-6);
    }

    #[test]
    fn test_distorted_observations_are_undistorted() {
        let distortion = Distortion::from_coefficients(&[-0.1, 0.02, 0.0005, -0.0003, 0.0]).unwrap();
        let mut a = looking_at_origin(0, Vector3::new(3.0, 0.0, 0.5));
        let mut b = looking_at_origin(1, Vector3::new(0.0, 3.0, 0.5));
        a.distortion = distortion;
        b.distortion = distortion;

        let world = Vector3::new(-0.3, 0.25, 0.1);
        let xy_a = a.project_distorted(&world).unwrap();
        let xy_b = b.project_distorted(&world).unwrap();

        let candidate = StereoTriangulator::new(&a, &b).unwrap().triangulate(0, &xy_a, &xy_b).unwrap();
        assert_relative_eq!(candidate.position, world, epsilon = 1e-6);
    }

    #[test]
    fn test_noise_shows_up_as_reprojection_error() {
        let array = three_camera_array();
        let world = Vector3::new(0.0, 0.0, 0.2);
        let cam_a = array.camera(0).unwrap();
        let cam_b = array.camera(1).unwrap();
        let xy_a = cam_a.project(&world).unwrap() + Vector2::new(3.0, 0.0);
        let xy_b = cam_b.project(&world).unwrap();

        let candidate = StereoTriangulator::new(cam_a, cam_b).unwrap().triangulate(0, &xy_a, &xy_b).unwrap();
        assert!(candidate.reprojection_error() > 0.1);
        assert!(candidate.reprojection_error() < 3.0);
    }

    #[test]
    fn test_point_behind_cameras_rejected() {
        let array = three_camera_array();
        let cam_a = array.camera(0).unwrap();
        let cam_b = array.camera(1).unwrap();

        // Pinhole images of a point behind both cameras
        let behind = Vector3::new(6.0, 6.0, 0.5);
        let image = |cam: &CameraData| {
            let ext = cam.extrinsics.unwrap();
            let c = ext.rotation * behind + ext.translation;
            assert!(c.z < 0.0);
            cam.normalized_to_pixel(&Vector2::new(c.x / c.z, c.y / c.z))
        };
        let xy_a = image(cam_a);
        let xy_b = image(cam_b);

        let na = cam_a.undistort_to_normalized(&xy_a);
        let nb = cam_b.undistort_to_normalized(&xy_b);
        let solved = dlt_two_view(
            &cam_a.extrinsics.unwrap().matrix(),
            &na,
            &cam_b.extrinsics.unwrap().matrix(),
            &nb,
        )
        .unwrap();
        assert_relative_eq!(solved, behind, epsilon = 1e-6);

        let triangulator = StereoTriangulator::new(cam_a, cam_b).unwrap();
        assert!(triangulator.triangulate(0, &xy_a, &xy_b).is_none());
    }

    #[test]
    fn test_unposed_camera_has_no_triangulator() {
        let a = looking_at_origin(0, Vector3::new(3.0, 0.0, 0.5));
        let mut b = looking_at_origin(1, Vector3::new(0.0, 3.0, 0.5));
        b.extrinsics = None;
        assert!(StereoTriangulator::new(&a, &b).is_none());
    }

    #[test]
    fn test_deterministic() {
        let array = three_camera_array();
        let world = Vector3::new(0.4, 0.1, -0.2);
        let set = observe(&array, 3, &[(1, world)], &[0, 1, 2]);
        let run = || {
            StereoPointsBuilder::new(&array)
                .build(&set)
                .iter()
                .flat_map(|p| StereoTriangulator::for_pair(&array, p.camera_a, p.camera_b).unwrap().triangulate_pair(p))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
