//! Packet types flowing from the camera producers through the synchronizer.
//!
//! ```text
//! camera producer ──► StreamRecord::Frame / StreamRecord::Points ──► SyncEngine
//!                                                                    │
//!                                         Arc<SyncPacket> ◄──────────┘
//!                                               │
//!                                   ObservationSet (per sync index)
//! ```

use nalgebra::Vector2;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Camera identifier (the capture port).
pub type CameraId = u32;

/// Stable point identity assigned by the upstream detector.
pub type PointId = u32;

/// Global synchronized index. Starts at zero each session.
pub type SyncIndex = u64;

// ============================================================================
// PRODUCER RECORDS
// ============================================================================

/// A single captured frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FramePacket {
    pub camera_id: CameraId,

    /// Monotonic per camera
    pub frame_index: u64,

    /// Capture time in seconds on the shared rig clock
    pub timestamp: f64,

    /// Opaque image payload; never inspected by the core
    pub payload: Arc<[u8]>,
}

impl FramePacket {
    /// Create a frame without payload bytes.
    pub fn new(camera_id: CameraId, frame_index: u64, timestamp: f64) -> Self {
        Self {
            camera_id,
            frame_index,
            timestamp,
            payload: Arc::from(Vec::new()),
        }
    }

    /// Attach payload bytes.
    pub fn with_payload(mut self, payload: impl Into<Arc<[u8]>>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// Detector output for one frame. An empty `points` list means the detector
/// ran and found nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct PointPacket {
    pub camera_id: CameraId,
    pub frame_index: u64,

    /// `(point_id, [x, y])` in distorted pixel coordinates
    pub points: Vec<(PointId, [f64; 2])>,
}

impl PointPacket {
    pub fn new(camera_id: CameraId, frame_index: u64, points: Vec<(PointId, [f64; 2])>) -> Self {
        Self {
            camera_id,
            frame_index,
            points,
        }
    }

    /// Points keyed by id. On duplicate ids the first occurrence wins.
    pub fn unique_points(&self) -> BTreeMap<PointId, [f64; 2]> {
        let mut unique = BTreeMap::new();
        for (id, xy) in &self.points {
            if unique.contains_key(id) {
                debug!(
                    "Camera {} frame {}: duplicate point id {} ignored",
                    self.camera_id, self.frame_index, id
                );
                continue;
            }
            unique.insert(*id, *xy);
        }
        unique
    }
}

/// One item of a per-camera stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRecord {
    Frame(FramePacket),
    Points(PointPacket),
}

impl StreamRecord {
    pub fn camera_id(&self) -> CameraId {
        match self {
            Self::Frame(f) => f.camera_id,
            Self::Points(p) => p.camera_id,
        }
    }

    pub fn frame_index(&self) -> u64 {
        match self {
            Self::Frame(f) => f.frame_index,
            Self::Points(p) => p.frame_index,
        }
    }
}

// ============================================================================
// SYNCHRONIZED OUTPUT
// ============================================================================

/// A camera's contribution to one sync index.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSlot {
    pub frame: FramePacket,
    pub points: Option<PointPacket>,
}

/// Cross-camera aligned record for one sync index.
///
/// Every session camera has an entry in `cameras`; `None` marks it absent.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPacket {
    pub sync_index: SyncIndex,

    /// Mean capture timestamp of the present frames
    pub timestamp: f64,

    pub cameras: BTreeMap<CameraId, Option<CameraSlot>>,

    /// Cameras that are dropped as of this index
    pub dropped: Vec<CameraId>,
}

impl SyncPacket {
    /// Slot for a camera, if it was present.
    pub fn slot(&self, camera_id: CameraId) -> Option<&CameraSlot> {
        self.cameras.get(&camera_id).and_then(|s| s.as_ref())
    }

    /// Cameras that contributed a frame.
    pub fn present_cameras(&self) -> Vec<CameraId> {
        self.cameras
            .iter()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| *id))
            .collect()
    }

    /// Cameras recorded as absent.
    pub fn absent_cameras(&self) -> Vec<CameraId> {
        self.cameras
            .iter()
            .filter_map(|(id, slot)| if slot.is_none() { Some(*id) } else { None })
            .collect()
    }

    /// Aggregate the point observations of this packet.
    pub fn observations(&self) -> ObservationSet {
        let mut set = ObservationSet::new(self.sync_index);
        for (camera_id, slot) in &self.cameras {
            let Some(points) = slot.as_ref().and_then(|s| s.points.as_ref()) else {
                continue;
            };
            for (point_id, xy) in points.unique_points() {
                set.insert(*camera_id, point_id, xy);
            }
        }
        set
    }
}

// ============================================================================
// OBSERVATIONS
// ============================================================================

/// All 2D observations for one sync index: camera → point → pixel.
///
/// Ordered maps keep iteration, and therefore the floating point reduction
/// order downstream, identical between live and replayed sessions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationSet {
    pub sync_index: SyncIndex,
    cameras: BTreeMap<CameraId, BTreeMap<PointId, Vector2<f64>>>,
}

impl ObservationSet {
    pub fn new(sync_index: SyncIndex) -> Self {
        Self {
            sync_index,
            cameras: BTreeMap::new(),
        }
    }

    /// Record an observation. Returns `false` if the camera already had
    /// this point (first observation wins).
    pub fn insert(&mut self, camera_id: CameraId, point_id: PointId, xy: [f64; 2]) -> bool {
        let per_camera = self.cameras.entry(camera_id).or_default();
        if per_camera.contains_key(&point_id) {
            return false;
        }
        per_camera.insert(point_id, Vector2::new(xy[0], xy[1]));
        true
    }

    /// Observations of a single camera.
    pub fn camera(&self, camera_id: CameraId) -> Option<&BTreeMap<PointId, Vector2<f64>>> {
        self.cameras.get(&camera_id)
    }

    pub fn camera_ids(&self) -> impl Iterator<Item = CameraId> + '_ {
        self.cameras.keys().copied()
    }

    /// Every point id seen by at least one camera, ascending.
    pub fn point_ids(&self) -> Vec<PointId> {
        let mut ids: Vec<PointId> = self
            .cameras
            .values()
            .flat_map(|points| points.keys().copied())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Cameras that observed `point_id`, ascending.
    pub fn cameras_observing(&self, point_id: PointId) -> Vec<CameraId> {
        self.cameras
            .iter()
            .filter(|(_, points)| points.contains_key(&point_id))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Flattened `(camera_id, point_id, xy)` rows in canonical order.
    pub fn rows(&self) -> impl Iterator<Item = (CameraId, PointId, Vector2<f64>)> + '_ {
        self.cameras.iter().flat_map(|(camera_id, points)| {
            points
                .iter()
                .map(move |(point_id, xy)| (*camera_id, *point_id, *xy))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.values().all(|p| p.is_empty())
    }

    /// Total number of observations.
    pub fn len(&self) -> usize {
        self.cameras.values().map(|p| p.len()).sum()
    }
}
