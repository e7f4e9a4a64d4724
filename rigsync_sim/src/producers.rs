//! Simulated camera producers.
//!
//! Each producer plays one camera: it stamps frames with jittered capture
//! times, projects the oracle's markers through its (distorted) lens, adds
//! pixel noise, and occasionally loses a frame. A producer can also stall,
//! keeping its stream open but silent.

use crate::oracle::Oracle;
use crate::rig::in_image;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use rigsync_core::{CameraData, CameraFeed, PointId};
use rigsync_env::EnvError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Imperfections of one camera stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerProfile {
    /// Standard deviation of the capture time jitter in seconds (default: 1ms)
    pub jitter_std: f64,

    /// Jitter is clamped to this magnitude in seconds (default: 3ms)
    pub max_jitter: f64,

    /// Probability that a frame never arrives (default: 0.02)
    pub frame_loss: f64,

    /// Standard deviation of detection noise in pixels (default: 0.2)
    pub pixel_noise: f64,
}

impl Default for ProducerProfile {
    fn default() -> Self {
        Self {
            jitter_std: 0.001,
            max_jitter: 0.003,
            frame_loss: 0.02,
            pixel_noise: 0.2,
        }
    }
}

impl ProducerProfile {
    /// No jitter, loss, or noise.
    pub fn ideal() -> Self {
        Self {
            jitter_std: 0.0,
            max_jitter: 0.0,
            frame_loss: 0.0,
            pixel_noise: 0.0,
        }
    }
}

/// Silence a camera after `after_frame`, keeping its stream open for `hold_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stall {
    pub camera_id: u32,
    pub after_frame: u64,
    pub hold_ms: u64,
}

/// Drives one camera feed.
pub struct CameraProducer {
    camera: CameraData,
    oracle: Arc<Oracle>,
    profile: ProducerProfile,
    rng: ChaCha8Rng,
    stall: Option<Stall>,
}

impl CameraProducer {
    pub fn new(camera: CameraData, oracle: Arc<Oracle>, profile: ProducerProfile, seed: u64) -> Self {
        // One stream per camera, independent of the others
        let rng = ChaCha8Rng::seed_from_u64(seed ^ (camera.camera_id as u64).wrapping_mul(0x9e3779b97f4a7c15));
        Self {
            camera,
            oracle,
            profile,
            rng,
            stall: None,
        }
    }

    pub fn with_stall(mut self, stall: Option<Stall>) -> Self {
        self.stall = stall.filter(|s| s.camera_id == self.camera.camera_id);
        self
    }

    /// Detections of every visible marker at nominal time `t`.
    pub fn detect(&mut self, t: f64) -> Vec<(PointId, [f64; 2])> {
        let noise = Normal::new(0.0, self.profile.pixel_noise.max(0.0)).ok();
        let mut points = Vec::new();
        for (point_id, world) in self.oracle.positions(t) {
            let Some(xy) = self.camera.project_distorted(&world) else {
                continue;
            };
            if !in_image(&self.camera, &xy) {
                continue;
            }
            let (dx, dy) = match &noise {
                Some(n) if self.profile.pixel_noise > 0.0 => (n.sample(&mut self.rng), n.sample(&mut self.rng)),
                _ => (0.0, 0.0),
            };
            points.push((point_id, [xy.x + dx, xy.y + dy]));
        }
        points
    }

    fn jitter(&mut self) -> f64 {
        if self.profile.jitter_std <= 0.0 {
            return 0.0;
        }
        let Ok(normal) = Normal::new(0.0, self.profile.jitter_std) else {
            return 0.0;
        };
        let j: f64 = normal.sample(&mut self.rng);
        j.clamp(-self.profile.max_jitter, self.profile.max_jitter)
    }

    /// Produce `frames` frames at `fps`. Returns the number actually sent.
    pub async fn run(mut self, feed: CameraFeed, frames: u64, fps: f64) -> Result<u64, EnvError> {
        let mut sent = 0;
        for frame_index in 0..frames {
            if let Some(stall) = self.stall {
                if frame_index > stall.after_frame {
                    debug!("Camera {} stalling after frame {}", self.camera.camera_id, stall.after_frame);
                    tokio::time::sleep(Duration::from_millis(stall.hold_ms)).await;
                    break;
                }
            }

            let t = frame_index as f64 / fps;
            let jitter = self.jitter();
            let lost = self.profile.frame_loss > 0.0 && self.rng.gen_bool(self.profile.frame_loss.min(1.0));
            // Detection runs even for lost frames so the noise stream stays aligned
            let points = self.detect(t);
            if lost {
                continue;
            }

            feed.send_frame(frame_index, t + jitter).await?;
            feed.send_points(frame_index, points).await?;
            sent += 1;
        }
        Ok(sent)
    }
}
