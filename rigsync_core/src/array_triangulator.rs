//! Array-wide triangulation.
//!
//! Every stereo pair that saw a point contributes one [`StereoCandidate`].
//! Candidates above the reprojection threshold are discarded and the rest
//! are merged by a weighted average. A point that cannot be resolved is
//! reported as [`PointResult::Unresolved`] with the reason; no position is
//! ever invented for it.

use crate::camera_array::CameraArray;
use crate::error::ConfigurationError;
use crate::packets::{CameraId, ObservationSet, PointId, SyncIndex};
use crate::stereo::{StereoCandidate, StereoPointsBuilder, StereoTriangulator};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// How surviving candidates are weighted in the average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingPolicy {
    /// `w = 1 / (error + epsilon)`
    InverseError { epsilon: f64 },
    /// Plain mean
    Uniform,
}

impl Default for WeightingPolicy {
    fn default() -> Self {
        Self::InverseError { epsilon: 1e-6 }
    }
}

impl WeightingPolicy {
    pub fn weight(&self, reprojection_error: f64) -> f64 {
        match self {
            Self::InverseError { epsilon } => 1.0 / (reprojection_error + epsilon),
            Self::Uniform => 1.0,
        }
    }
}

/// Triangulation tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationConfig {
    /// Candidates with a larger mean reprojection error (undistorted pixels)
    /// are discarded (default: 4.0)
    pub max_reprojection_error: f64,

    pub weighting: WeightingPolicy,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            max_reprojection_error: 4.0,
            weighting: WeightingPolicy::default(),
        }
    }
}

impl TriangulationConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.max_reprojection_error.is_finite() || self.max_reprojection_error <= 0.0 {
            return Err(ConfigurationError::InvalidTuning(format!(
                "max_reprojection_error must be positive, got {}",
                self.max_reprojection_error
            )));
        }
        if let WeightingPolicy::InverseError { epsilon } = self.weighting {
            if !epsilon.is_finite() || epsilon <= 0.0 {
                return Err(ConfigurationError::InvalidTuning(format!(
                    "weighting epsilon must be positive, got {epsilon}"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// Why a point has no estimate at a sync index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// Seen by fewer than two cameras
    SingleView,
    /// Seen by several cameras, none of which form a stereo pair
    NoStereoPair,
    /// Every candidate exceeded the reprojection threshold
    AllCandidatesRejected,
    /// No pair produced a finite point in front of both cameras
    Degenerate,
}

impl UnresolvedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleView => "single_view",
            Self::NoStereoPair => "no_stereo_pair",
            Self::AllCandidatesRejected => "all_candidates_rejected",
            Self::Degenerate => "degenerate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "single_view" => Some(Self::SingleView),
            "no_stereo_pair" => Some(Self::NoStereoPair),
            "all_candidates_rejected" => Some(Self::AllCandidatesRejected),
            "degenerate" => Some(Self::Degenerate),
            _ => None,
        }
    }
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved 3D position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point3D {
    pub position: Vector3<f64>,

    /// Mean reprojection error of `position` over the observing cameras
    pub reprojection_error: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointResult {
    Resolved(Point3D),
    Unresolved(UnresolvedReason),
}

impl PointResult {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    pub fn point(&self) -> Option<&Point3D> {
        match self {
            Self::Resolved(p) => Some(p),
            Self::Unresolved(_) => None,
        }
    }
}

/// Outcome for one point at one sync index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointEstimate {
    pub sync_index: SyncIndex,
    pub point_id: PointId,
    pub result: PointResult,
}

// ============================================================================
// ARRAY TRIANGULATOR
// ============================================================================

/// Reduces pairwise candidates into one estimate per point.
#[derive(Debug, Clone, Default)]
pub struct ArrayTriangulator {
    config: TriangulationConfig,
}

impl ArrayTriangulator {
    pub fn new(config: TriangulationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TriangulationConfig {
        &self.config
    }

    /// Filter and average the candidates of one point.
    ///
    /// The sum runs in ascending `(camera_a, camera_b)` order whatever the
    /// input order, so the result is bit-for-bit reproducible.
    pub fn reduce(&self, candidates: &[StereoCandidate]) -> Result<Vector3<f64>, UnresolvedReason> {
        if candidates.is_empty() {
            return Err(UnresolvedReason::Degenerate);
        }

        let mut survivors: Vec<&StereoCandidate> = candidates
            .iter()
            .filter(|c| c.reprojection_error() <= self.config.max_reprojection_error)
            .collect();
        if survivors.is_empty() {
            return Err(UnresolvedReason::AllCandidatesRejected);
        }
        survivors.sort_by_key(|c| c.pair());

        let mut weighted = Vector3::zeros();
        let mut total = 0.0;
        for candidate in survivors {
            let w = self.config.weighting.weight(candidate.reprojection_error());
            weighted += candidate.position * w;
            total += w;
        }
        Ok(weighted / total)
    }

    /// Estimate every point of one sync index, ascending by point id.
    pub fn triangulate(&self, array: &CameraArray, observations: &ObservationSet) -> Vec<PointEstimate> {
        let foreign = foreign_cameras(array, observations);
        if !foreign.is_empty() {
            warn!(
                "Sync {}: ignoring views from cameras {:?} outside the array",
                observations.sync_index, foreign
            );
        }

        let mut candidates: BTreeMap<PointId, Vec<StereoCandidate>> = BTreeMap::new();
        for shared in StereoPointsBuilder::new(array).build(observations) {
            let Some(triangulator) = StereoTriangulator::for_pair(array, shared.camera_a, shared.camera_b) else {
                continue;
            };
            for candidate in triangulator.triangulate_pair(&shared) {
                candidates.entry(candidate.point_id).or_default().push(candidate);
            }
        }

        observations
            .point_ids()
            .into_iter()
            .map(|point_id| {
                let result = self.resolve(array, observations, point_id, candidates.get(&point_id));
                if let PointResult::Unresolved(reason) = result {
                    debug!(
                        "Sync {} point {}: unresolved ({})",
                        observations.sync_index, point_id, reason
                    );
                }
                PointEstimate {
                    sync_index: observations.sync_index,
                    point_id,
                    result,
                }
            })
            .collect()
    }

    fn resolve(
        &self,
        array: &CameraArray,
        observations: &ObservationSet,
        point_id: PointId,
        candidates: Option<&Vec<StereoCandidate>>,
    ) -> PointResult {
        let observing: Vec<_> = observations
            .cameras_observing(point_id)
            .into_iter()
            .filter(|id| array.contains(*id))
            .collect();
        if observing.len() < 2 {
            return PointResult::Unresolved(UnresolvedReason::SingleView);
        }

        let has_pair = observing
            .iter()
            .enumerate()
            .any(|(i, a)| observing[i + 1..].iter().any(|b| array.stereo_pair(*a, *b).is_some()));
        if !has_pair {
            return PointResult::Unresolved(UnresolvedReason::NoStereoPair);
        }

        let position = match self.reduce(candidates.map(Vec::as_slice).unwrap_or(&[])) {
            Ok(p) => p,
            Err(reason) => return PointResult::Unresolved(reason),
        };

        // Aggregate error over every posed camera that saw the point
        let mut error_sum = 0.0;
        let mut views = 0usize;
        for camera_id in &observing {
            let Some(camera) = array.camera(*camera_id).filter(|c| c.is_posed()) else {
                continue;
            };
            let (Some(observed), Some(projected)) = (
                observations.camera(*camera_id).and_then(|pts| pts.get(&point_id)),
                camera.project(&position),
            ) else {
                continue;
            };
            error_sum += (projected - camera.undistort_pixel(observed)).norm();
            views += 1;
        }
        if views == 0 {
            return PointResult::Unresolved(UnresolvedReason::Degenerate);
        }

        PointResult::Resolved(Point3D {
            position,
            reprojection_error: error_sum / views as f64,
        })
    }
}

/// Cameras with views in `observations` that `array` does not contain.
pub fn foreign_cameras(array: &CameraArray, observations: &ObservationSet) -> Vec<CameraId> {
    observations.camera_ids().filter(|id| !array.contains(*id)).collect()
}

/// Triangulate one sync index. Shared by the live worker and log replay.
pub fn triangulate_observations(
    array: &CameraArray,
    observations: &ObservationSet,
    config: &TriangulationConfig,
) -> Vec<PointEstimate> {
    ArrayTriangulator::new(config.clone()).triangulate(array, observations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_array::tests::{looking_at_origin, three_camera_array};
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn observe(array: &CameraArray, set: &mut ObservationSet, point_id: PointId, world: &Vector3<f64>, cams: &[CameraId]) {
        for cam in cams {
            let xy = array.camera(*cam).unwrap().project_distorted(world).unwrap();
            set.insert(*cam, point_id, [xy.x, xy.y]);
        }
    }

    fn two_camera_array() -> CameraArray {
        CameraArray::new(vec![
            looking_at_origin(0, Vector3::new(3.0, 0.0, 0.5)),
            looking_at_origin(1, Vector3::new(0.0, 3.0, 0.5)),
        ])
        .unwrap()
    }

    fn candidate(a: CameraId, b: CameraId, position: [f64; 3], error: f64) -> StereoCandidate {
        StereoCandidate {
            point_id: 0,
            camera_a: a,
            camera_b: b,
            position: Vector3::new(position[0], position[1], position[2]),
            error_a: error,
            error_b: error,
        }
    }

    #[test]
    fn test_two_cameras_recover_noiseless_point() {
        let array = two_camera_array();
        let world = Vector3::new(0.1, -0.2, 0.3);
        let mut set = ObservationSet::new(0);
        observe(&array, &mut set, 7, &world, &[0, 1]);

        let estimates = triangulate_observations(&array, &set, &TriangulationConfig::default());
        assert_eq!(estimates.len(), 1);
        let point = estimates[0].result.point().unwrap();
        assert_relative_eq!(point.position, world, epsilon = 1e-6);
        assert!(point.reprojection_error < 1e-6);
    }

    #[test]
    fn test_one_of_three_is_unresolved_two_of_three_matches_reference() {
        let world = Vector3::new(0.1, -0.2, 0.3);
        let config = TriangulationConfig::default();

        let reference_array = two_camera_array();
        let mut reference_set = ObservationSet::new(0);
        observe(&reference_array, &mut reference_set, 7, &world, &[0, 1]);
        let reference = triangulate_observations(&reference_array, &reference_set, &config);

        let array = three_camera_array();
        let mut single = ObservationSet::new(0);
        observe(&array, &mut single, 7, &world, &[2]);
        let estimates = triangulate_observations(&array, &single, &config);
        assert_eq!(estimates[0].result, PointResult::Unresolved(UnresolvedReason::SingleView));

        let mut pair = ObservationSet::new(0);
        observe(&array, &mut pair, 7, &world, &[0, 1]);
        let estimates = triangulate_observations(&array, &pair, &config);
        assert_eq!(estimates, reference);
    }

    #[test]
    fn test_three_views_agree() {
        let array = three_camera_array();
        let world = Vector3::new(-0.3, 0.4, 0.0);
        let mut set = ObservationSet::new(5);
        observe(&array, &mut set, 1, &world, &[0, 1, 2]);

        let estimates = triangulate_observations(&array, &set, &TriangulationConfig::default());
        let point = estimates[0].result.point().unwrap();
        assert_eq!(estimates[0].sync_index, 5);
        assert_relative_eq!(point.position, world, epsilon = 1e-6);
    }

    #[test]
    fn test_views_from_unknown_cameras_are_ignored() {
        let array = three_camera_array();
        let world = Vector3::new(0.2, -0.1, 0.3);
        let mut set = ObservationSet::new(2);
        observe(&array, &mut set, 1, &world, &[0, 1]);
        set.insert(9, 1, [10.0, 20.0]);
        // Seen by one array camera only
        set.insert(9, 2, [30.0, 40.0]);
        set.insert(0, 2, [300.0, 200.0]);

        assert_eq!(foreign_cameras(&array, &set), vec![9]);

        let estimates = triangulate_observations(&array, &set, &TriangulationConfig::default());
        assert_eq!(estimates.len(), 2);
        assert_relative_eq!(estimates[0].result.point().unwrap().position, world, epsilon = 1e-6);
        assert_eq!(estimates[1].result, PointResult::Unresolved(UnresolvedReason::SingleView));
    }

    #[test]
    fn test_outlier_view_rejected_by_threshold() {
        let array = three_camera_array();
        let world = Vector3::new(0.0, 0.0, 0.0);
        let mut set = ObservationSet::new(0);
        observe(&array, &mut set, 1, &world, &[0, 1]);
        let bad = array.camera(2).unwrap().project(&world).unwrap();
        set.insert(2, 1, [bad.x + 40.0, bad.y - 30.0]);

        let estimates = triangulate_observations(&array, &set, &TriangulationConfig::default());
        let point = estimates[0].result.point().unwrap();
        // Pair (0, 1) is exact and dominates
        assert_relative_eq!(point.position, world, epsilon = 1e-3);

        let strict = TriangulationConfig {
            max_reprojection_error: 1e-9,
            weighting: WeightingPolicy::Uniform,
        };
        let mut noisy = ObservationSet::new(0);
        let a = array.camera(0).unwrap().project(&world).unwrap();
        noisy.insert(0, 1, [a.x + 5.0, a.y]);
        observe(&array, &mut noisy, 1, &world, &[1]);
        let estimates = triangulate_observations(&array, &noisy, &strict);
        assert_eq!(
            estimates[0].result,
            PointResult::Unresolved(UnresolvedReason::AllCandidatesRejected)
        );
    }

    #[test]
    fn test_no_stereo_pair() {
        let cams = vec![
            looking_at_origin(0, Vector3::new(3.0, 0.0, 0.5)),
            looking_at_origin(1, Vector3::new(0.0, 3.0, 0.5)),
            looking_at_origin(2, Vector3::new(-3.0, 0.2, 0.5)),
        ];
        let array = CameraArray::with_pairs(cams, Some(&[[0, 1]])).unwrap();
        let mut set = ObservationSet::new(0);
        observe(&array, &mut set, 3, &Vector3::zeros(), &[1, 2]);

        let estimates = triangulate_observations(&array, &set, &TriangulationConfig::default());
        assert_eq!(estimates[0].result, PointResult::Unresolved(UnresolvedReason::NoStereoPair));
    }

    #[test]
    fn test_repeated_runs_are_identical() {
        let array = three_camera_array();
        let mut set = ObservationSet::new(2);
        observe(&array, &mut set, 1, &Vector3::new(0.2, 0.1, 0.0), &[0, 1, 2]);
        observe(&array, &mut set, 2, &Vector3::new(-0.1, 0.3, 0.4), &[0, 2]);
        let config = TriangulationConfig::default();

        let first = triangulate_observations(&array, &set, &config);
        for _ in 0..5 {
            assert_eq!(triangulate_observations(&array, &set, &config), first);
        }
    }

    #[test]
    fn test_inverse_error_favours_better_candidate() {
        let triangulator = ArrayTriangulator::default();
        let merged = triangulator
            .reduce(&[
                candidate(0, 1, [0.0, 0.0, 0.0], 0.1),
                candidate(0, 2, [1.0, 0.0, 0.0], 0.9),
            ])
            .unwrap();
        assert!(merged.x > 0.0 && merged.x < 0.2);

        let uniform = ArrayTriangulator::new(TriangulationConfig {
            weighting: WeightingPolicy::Uniform,
            ..TriangulationConfig::default()
        });
        let merged = uniform
            .reduce(&[
                candidate(0, 1, [0.0, 0.0, 0.0], 0.1),
                candidate(0, 2, [1.0, 0.0, 0.0], 0.9),
            ])
            .unwrap();
        assert_relative_eq!(merged.x, 0.5);
    }

    #[test]
    fn test_weighting_serde_shape() {
        let json = serde_json::to_string(&WeightingPolicy::default()).unwrap();
        assert!(json.starts_with(r#"{"inverse_error":{"epsilon":"#));
        let parsed: WeightingPolicy = serde_json::from_str(r#"{"inverse_error":{"epsilon":0.01}}"#).unwrap();
        assert_eq!(parsed, WeightingPolicy::InverseError { epsilon: 0.01 });
        let uniform: WeightingPolicy = serde_json::from_str(r#""uniform""#).unwrap();
        assert_eq!(uniform, WeightingPolicy::Uniform);
    }

    proptest! {
        #[test]
        fn prop_reduce_is_order_independent(
            (candidates, shuffled) in proptest::collection::vec(
                ((-2.0f64..2.0, -2.0f64..2.0, -2.0f64..2.0), 0.0f64..3.0),
                1..10,
            )
            .prop_map(|raw| {
                raw.into_iter()
                    .enumerate()
                    .map(|(i, ((x, y, z), e))| candidate(i as CameraId, 100, [x, y, z], e))
                    .collect::<Vec<_>>()
            })
            .prop_flat_map(|candidates| (Just(candidates.clone()), Just(candidates).prop_shuffle())),
        ) {
            let triangulator = ArrayTriangulator::default();
            let expected = triangulator.reduce(&candidates).unwrap();
            prop_assert_eq!(triangulator.reduce(&shuffled).unwrap(), expected);
        }
    }
}
