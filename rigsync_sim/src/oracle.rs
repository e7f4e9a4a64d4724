//! Ground truth oracle for simulation.
//!
//! The Oracle knows where every marker really is at any instant. Markers
//! follow closed orbits around the rig target, so sessions of any length
//! stay inside the capture volume. All randomness comes from the seed.

use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rigsync_core::PointId;
use serde::{Deserialize, Serialize};

/// A marker moving on a tilted circle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub point_id: PointId,

    /// Orbit center in meters
    pub center: Vector3<f64>,

    /// Orbit radius in meters
    pub radius: f64,

    /// Angular speed in rad/s
    pub angular_speed: f64,

    pub phase: f64,

    /// Vertical bob amplitude in meters
    pub bob: f64,
}

impl Marker {
    pub fn position(&self, t: f64) -> Vector3<f64> {
        let a = self.phase + self.angular_speed * t;
        self.center + Vector3::new(self.radius * a.cos(), self.radius * a.sin(), self.bob * (2.0 * a).sin())
    }
}

/// The Oracle - maintains ground truth trajectories.
#[derive(Debug, Clone)]
pub struct Oracle {
    seed: u64,
    markers: Vec<Marker>,
}

impl Oracle {
    /// Spawn `count` markers around `target` within `spread` meters.
    pub fn new(seed: u64, count: u32, target: Vector3<f64>, spread: f64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let markers = (0..count)
            .map(|point_id| Marker {
                point_id,
                center: target
                    + Vector3::new(
                        rng.gen_range(-0.3..0.3) * spread,
                        rng.gen_range(-0.3..0.3) * spread,
                        rng.gen_range(-0.2..0.2) * spread,
                    ),
                radius: rng.gen_range(0.2..0.6) * spread,
                angular_speed: rng.gen_range(0.5..2.0),
                phase: rng.gen_range(0.0..std::f64::consts::TAU),
                bob: rng.gen_range(0.0..0.2) * spread,
            })
            .collect();
        Self { seed, markers }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    /// True positions of every marker at time `t`.
    pub fn positions(&self, t: f64) -> Vec<(PointId, Vector3<f64>)> {
        self.markers.iter().map(|m| (m.point_id, m.position(t))).collect()
    }

    pub fn position(&self, point_id: PointId, t: f64) -> Option<Vector3<f64>> {
        self.markers
            .iter()
            .find(|m| m.point_id == point_id)
            .map(|m| m.position(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oracle_is_seeded() {
        let a = Oracle::new(42, 5, Vector3::zeros(), 1.0);
        let b = Oracle::new(42, 5, Vector3::zeros(), 1.0);
        let c = Oracle::new(43, 5, Vector3::zeros(), 1.0);
        assert_eq!(a.markers(), b.markers());
        assert_ne!(a.markers(), c.markers());
    }

    #[test]
    fn test_markers_stay_near_target() {
        let target = Vector3::new(0.0, 0.0, 0.5);
        let oracle = Oracle::new(7, 8, target, 1.0);
        for step in 0..300 {
            for (_, p) in oracle.positions(step as f64 / 30.0) {
                assert!((p - target).norm() < 1.2);
            }
        }
        assert!(oracle.position(3, 0.0).is_some());
        assert!(oracle.position(99, 0.0).is_none());
    }
}
