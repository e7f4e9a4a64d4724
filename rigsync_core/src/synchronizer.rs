//! The "SYNC" Engine - temporal alignment of per-camera streams
//!
//! Merges independently jittered per-camera streams into one strictly ordered
//! sequence of [`SyncPacket`]s. The engine is sans-IO: records are pushed in,
//! packets are polled out, and every stall decision is made against an
//! instant supplied by the caller. [`crate::SyncRuntime`] drives it from
//! bounded queues.
//!
//! Emission rule for the next sync index:
//! 1. A live camera with an empty buffer blocks until it delivers, or until it
//!    has been silent for longer than `stall_timeout` (then it is dropped for
//!    every later index).
//! 2. With every live camera holding a head frame, `t_ref` is the earliest
//!    head timestamp. Heads within `drift_tolerance` of `t_ref` are taken;
//!    heads further ahead leave their camera absent for this index. When a
//!    camera buffers several frames within tolerance, the one nearest `t_ref`
//!    (its head) is taken and the rest wait for later indices.
//! 3. A taken head must be *ready*: its points have arrived, the stream is
//!    exhausted, the lookahead buffer is saturated, or the camera has been
//!    silent past `stall_timeout` (the head then leaves without points and
//!    the empty lane is dropped on the next index).

use crate::error::{AlignmentWarning, ConfigurationError, SyncError};
use crate::packets::{CameraId, CameraSlot, FramePacket, PointPacket, StreamRecord, SyncIndex, SyncPacket};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Synchronizer tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum offset (seconds) between a frame and the reference time for
    /// the frame to share a sync index (default: 8ms, half a 60fps period)
    pub drift_tolerance: f64,

    /// Silence after which a camera is dropped (default: 2000ms)
    pub stall_timeout_ms: u64,

    /// Per-camera lookahead buffer capacity in frames (default: 8)
    pub lookahead: usize,

    /// Per-camera inbound queue and per-consumer outbound queue depth (default: 32)
    pub queue_depth: usize,

    /// Wait for each frame's point packet before emitting it (default: true)
    pub require_points: bool,

    /// Idle sleep of the runtime loop (default: 2ms)
    pub poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            drift_tolerance: 0.008,
            stall_timeout_ms: 2000,
            lookahead: 8,
            queue_depth: 32,
            require_points: true,
            poll_interval_ms: 2,
        }
    }
}

impl SyncConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.drift_tolerance.is_finite() || self.drift_tolerance < 0.0 {
            return Err(ConfigurationError::InvalidTuning(format!(
                "drift_tolerance must be a non-negative number, got {}",
                self.drift_tolerance
            )));
        }
        if self.lookahead == 0 {
            return Err(ConfigurationError::InvalidTuning("lookahead must be at least 1".into()));
        }
        if self.queue_depth == 0 {
            return Err(ConfigurationError::InvalidTuning("queue_depth must be at least 1".into()));
        }
        if self.stall_timeout_ms == 0 {
            return Err(ConfigurationError::InvalidTuning("stall_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

// ============================================================================
// PER-CAMERA STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraStatus {
    /// Still delivering
    Live,
    /// Stream closed; buffered frames are still emitted
    Exhausted,
    /// Stalled past the timeout; absent for every later index
    Dropped,
}

#[derive(Debug)]
struct CameraLane {
    status: CameraStatus,
    frames: VecDeque<FramePacket>,
    pending_points: BTreeMap<u64, PointPacket>,
    last_frame_index: Option<u64>,
    last_emitted_index: Option<u64>,
    points_watermark: Option<u64>,
    last_activity: Duration,
}

impl CameraLane {
    fn new(now: Duration) -> Self {
        Self {
            status: CameraStatus::Live,
            frames: VecDeque::new(),
            pending_points: BTreeMap::new(),
            last_frame_index: None,
            last_emitted_index: None,
            points_watermark: None,
            last_activity: now,
        }
    }

    /// Live, or exhausted with frames still buffered.
    fn contributes(&self) -> bool {
        match self.status {
            CameraStatus::Live => true,
            CameraStatus::Exhausted => !self.frames.is_empty(),
            CameraStatus::Dropped => false,
        }
    }

    fn is_silent(&self, now: Duration, timeout: Duration) -> bool {
        self.status == CameraStatus::Live && now.saturating_sub(self.last_activity) > timeout
    }

    fn head_ready(&self, config: &SyncConfig, now: Duration) -> bool {
        let Some(head) = self.frames.front() else {
            return false;
        };
        !config.require_points
            || self.status == CameraStatus::Exhausted
            || self.frames.len() >= config.lookahead
            || self.points_watermark.is_some_and(|w| w >= head.frame_index)
            || self.is_silent(now, config.stall_timeout())
    }
}

/// Outcome of [`SyncEngine::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncPoll {
    /// The next packet in sync order
    Ready(SyncPacket),
    /// More input (or time) is needed
    Pending,
    /// Every remaining camera is exhausted and drained
    Finished,
}

// ============================================================================
// SYNC ENGINE
// ============================================================================

/// Sans-IO alignment state machine for one session.
pub struct SyncEngine {
    config: SyncConfig,
    lanes: BTreeMap<CameraId, CameraLane>,
    next_index: SyncIndex,
    warnings: Vec<AlignmentWarning>,
}

impl SyncEngine {
    /// Start a session over `camera_ids` at time `now`.
    pub fn new(
        camera_ids: &[CameraId],
        config: SyncConfig,
        now: Duration,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let lanes: BTreeMap<CameraId, CameraLane> = camera_ids
            .iter()
            .map(|id| (*id, CameraLane::new(now)))
            .collect();
        if lanes.len() < 2 {
            return Err(ConfigurationError::InsufficientActiveCameras {
                active: lanes.keys().copied().collect(),
                dropped: Vec::new(),
            });
        }
        info!("Sync session started with cameras {:?}", lanes.keys().collect::<Vec<_>>());
        Ok(Self {
            config,
            lanes,
            next_index: 0,
            warnings: Vec::new(),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Index the next emitted packet will carry.
    pub fn next_index(&self) -> SyncIndex {
        self.next_index
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.lanes.keys().copied().collect()
    }

    pub fn status(&self, camera_id: CameraId) -> Option<CameraStatus> {
        self.lanes.get(&camera_id).map(|l| l.status)
    }

    pub fn dropped_cameras(&self) -> Vec<CameraId> {
        self.lanes
            .iter()
            .filter(|(_, l)| l.status == CameraStatus::Dropped)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of frames buffered for a camera.
    pub fn buffered(&self, camera_id: CameraId) -> usize {
        self.lanes.get(&camera_id).map_or(0, |l| l.frames.len())
    }

    /// Whether the runtime may read another record for this camera.
    pub fn has_capacity(&self, camera_id: CameraId) -> bool {
        self.lanes.get(&camera_id).is_some_and(|l| {
            l.status == CameraStatus::Live && l.frames.len() < self.config.lookahead
        })
    }

    /// Take the warnings raised since the last call.
    pub fn drain_warnings(&mut self) -> Vec<AlignmentWarning> {
        std::mem::take(&mut self.warnings)
    }

    fn raise(&mut self, warning: AlignmentWarning) {
        warn!("Alignment warning: {:?}", warning);
        self.warnings.push(warning);
    }

    /// Accept one record from a camera stream.
    pub fn push(&mut self, record: StreamRecord, now: Duration) -> Result<(), SyncError> {
        let camera_id = record.camera_id();
        let lane = self
            .lanes
            .get_mut(&camera_id)
            .ok_or(SyncError::UnknownCamera(camera_id))?;

        if lane.status == CameraStatus::Dropped {
            debug!("Discarding record from dropped camera {}", camera_id);
            return Ok(());
        }
        // Unusable frames do not count as activity
        if let StreamRecord::Frame(frame) = &record {
            if !frame.timestamp.is_finite() {
                let warning = AlignmentWarning::NonFiniteTimestamp {
                    camera_id,
                    frame_index: frame.frame_index,
                };
                self.raise(warning);
                return Ok(());
            }
        }
        lane.last_activity = now;

        match record {
            StreamRecord::Frame(frame) => {
                if let Some(last) = lane.last_frame_index {
                    if frame.frame_index < last {
                        let warning = AlignmentWarning::OutOfOrderFrame {
                            camera_id,
                            frame_index: frame.frame_index,
                            last_frame_index: last,
                        };
                        self.raise(warning);
                        return Ok(());
                    }
                }
                lane.last_frame_index = Some(frame.frame_index);
                lane.frames.push_back(frame);
            }
            StreamRecord::Points(points) => {
                let frame_index = points.frame_index;
                lane.points_watermark = Some(lane.points_watermark.map_or(frame_index, |w| w.max(frame_index)));
                if lane.last_emitted_index.is_some_and(|e| frame_index <= e) {
                    let warning = AlignmentWarning::LatePoints { camera_id, frame_index };
                    self.raise(warning);
                    return Ok(());
                }
                lane.pending_points.entry(frame_index).or_insert(points);
            }
        }
        Ok(())
    }

    /// Mark a camera's stream as closed.
    pub fn close(&mut self, camera_id: CameraId) {
        if let Some(lane) = self.lanes.get_mut(&camera_id) {
            if lane.status == CameraStatus::Live {
                debug!("Camera {} stream exhausted", camera_id);
                lane.status = CameraStatus::Exhausted;
            }
        }
    }

    /// Try to emit the next sync index.
    pub fn poll(&mut self, now: Duration) -> Result<SyncPoll, ConfigurationError> {
        self.drop_stalled(now);
        self.check_active()?;

        let contributing: Vec<CameraId> = self
            .lanes
            .iter()
            .filter(|(_, l)| l.contributes())
            .map(|(id, _)| *id)
            .collect();

        if contributing.is_empty() {
            return Ok(SyncPoll::Finished);
        }

        // Rule 1: every live camera must show its hand
        if contributing.iter().any(|id| self.lanes[id].frames.is_empty()) {
            return Ok(SyncPoll::Pending);
        }

        // Rule 2: reference time is the earliest head
        let t_ref = contributing
            .iter()
            .filter_map(|id| self.lanes[id].frames.front().map(|f| f.timestamp))
            .fold(f64::INFINITY, f64::min);

        let tolerance = self.config.drift_tolerance;
        let mut matched = Vec::new();
        let mut ahead = Vec::new();
        for id in &contributing {
            let lane = &self.lanes[id];
            let Some(head) = lane.frames.front() else {
                continue;
            };
            let offset = head.timestamp - t_ref;
            if offset <= tolerance {
                // Rule 3: a matched head must be complete
                if !lane.head_ready(&self.config, now) {
                    return Ok(SyncPoll::Pending);
                }
                matched.push(*id);
            } else {
                ahead.push((*id, offset));
            }
        }

        // Only reachable with a non-finite head, which push never buffers
        if matched.is_empty() {
            return Ok(SyncPoll::Pending);
        }

        let sync_index = self.next_index;
        for (camera_id, offset) in ahead {
            self.raise(AlignmentWarning::DriftExceeded {
                camera_id,
                sync_index,
                offset,
            });
        }

        let packet = self.assemble(sync_index, &matched);
        self.next_index += 1;
        Ok(SyncPoll::Ready(packet))
    }

    fn assemble(&mut self, sync_index: SyncIndex, matched: &[CameraId]) -> SyncPacket {
        let mut cameras = BTreeMap::new();
        let mut timestamp_sum = 0.0;
        let mut missing = Vec::new();

        for (camera_id, lane) in self.lanes.iter_mut() {
            if !matched.contains(camera_id) {
                cameras.insert(*camera_id, None);
                continue;
            }
            let Some(frame) = lane.frames.pop_front() else {
                cameras.insert(*camera_id, None);
                continue;
            };

            // Points for frames that never arrived are stale
            let points = lane.pending_points.remove(&frame.frame_index);
            lane.pending_points.retain(|idx, _| *idx > frame.frame_index);
            lane.last_emitted_index = Some(frame.frame_index);

            if points.is_none() && self.config.require_points {
                missing.push((*camera_id, frame.frame_index));
            }

            timestamp_sum += frame.timestamp;
            cameras.insert(*camera_id, Some(CameraSlot { frame, points }));
        }

        for (camera_id, frame_index) in missing {
            self.raise(AlignmentWarning::PointsMissing { camera_id, frame_index });
        }

        let timestamp = timestamp_sum / matched.len() as f64;

        SyncPacket {
            sync_index,
            timestamp,
            cameras,
            dropped: self.dropped_cameras(),
        }
    }

    fn drop_stalled(&mut self, now: Duration) {
        let timeout = self.config.stall_timeout();
        let from_index = self.next_index;
        let mut stalled = Vec::new();
        for (id, lane) in self.lanes.iter_mut() {
            // A silent lane still holding frames first emits them without points
            if !lane.frames.is_empty() {
                continue;
            }
            if lane.is_silent(now, timeout) {
                let silent = now.saturating_sub(lane.last_activity);
                lane.status = CameraStatus::Dropped;
                lane.pending_points.clear();
                stalled.push((*id, silent));
            }
        }
        for (camera_id, silent) in stalled {
            self.raise(AlignmentWarning::CameraDropped {
                camera_id,
                from_index,
                silent_ms: silent.as_millis() as u64,
            });
        }
    }

    fn check_active(&self) -> Result<(), ConfigurationError> {
        let (active, dropped): (Vec<_>, Vec<_>) = self
            .lanes
            .iter()
            .partition(|(_, l)| l.status != CameraStatus::Dropped);
        if active.len() < 2 {
            return Err(ConfigurationError::InsufficientActiveCameras {
                active: active.into_iter().map(|(id, _)| *id).collect(),
                dropped: dropped.into_iter().map(|(id, _)| *id).collect(),
            });
        }
        Ok(())
    }
}
