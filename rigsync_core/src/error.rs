//! Session error taxonomy.
//!
//! Only [`ConfigurationError`] aborts a session. Drift, stalls and slow
//! consumers are reported as [`SessionWarning`] values and the session keeps
//! going; a point that cannot be triangulated is a result state, not an error.

use crate::packets::{CameraId, PointId, SyncIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// FATAL
// ============================================================================

/// Fatal configuration problems. Always names the cameras involved.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Camera {camera_id}: {reason}")]
    InvalidCamera { camera_id: CameraId, reason: String },

    #[error("Camera {0} is defined more than once")]
    DuplicateCamera(CameraId),

    #[error("Stereo pair ({0}, {1}) references a camera that is missing or unposed")]
    InvalidStereoPair(CameraId, CameraId),

    #[error("At least two posed cameras are required, found {found:?}")]
    InsufficientPosedCameras { found: Vec<CameraId> },

    #[error("Fewer than two active cameras remain (active: {active:?}, dropped: {dropped:?})")]
    InsufficientActiveCameras {
        active: Vec<CameraId>,
        dropped: Vec<CameraId>,
    },

    #[error("Invalid tuning value: {0}")]
    InvalidTuning(String),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigurationError {
    /// Creates an invalid-camera error.
    pub fn camera(camera_id: CameraId, reason: impl Into<String>) -> Self {
        Self::InvalidCamera {
            camera_id,
            reason: reason.into(),
        }
    }

    /// Camera ids named by this error, for diagnosis.
    pub fn camera_ids(&self) -> Vec<CameraId> {
        match self {
            Self::InvalidCamera { camera_id, .. } => vec![*camera_id],
            Self::DuplicateCamera(id) => vec![*id],
            Self::InvalidStereoPair(a, b) => vec![*a, *b],
            Self::InsufficientPosedCameras { found } => found.clone(),
            Self::InsufficientActiveCameras { active, dropped } => {
                let mut ids: Vec<CameraId> = active.iter().chain(dropped).copied().collect();
                ids.sort_unstable();
                ids
            }
            Self::InvalidTuning(_) | Self::Io(_) | Self::Parse(_) => Vec::new(),
        }
    }
}

/// Errors surfaced by the synchronizer.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Record for camera {0}, which is not part of this session")]
    UnknownCamera(CameraId),

    #[error("Session cancelled after sync index {0:?}")]
    Cancelled(Option<SyncIndex>),
}

/// Errors raised by [`crate::PointHistory::append`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("Point {point_id}: sync index {sync_index} is not after last appended index {last}")]
    OutOfOrder {
        point_id: PointId,
        sync_index: SyncIndex,
        last: SyncIndex,
    },
}

/// Errors reading or writing the tabular logs.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("Unexpected header: {0:?}")]
    Header(String),
}

// ============================================================================
// RECOVERABLE
// ============================================================================

/// Recoverable alignment conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AlignmentWarning {
    /// Camera exceeded the stall timeout and is absent from `from_index` on.
    CameraDropped {
        camera_id: CameraId,
        from_index: SyncIndex,
        silent_ms: u64,
    },
    /// Camera head frame was ahead of the reference time by more than the
    /// drift tolerance; the camera is absent at `sync_index`.
    DriftExceeded {
        camera_id: CameraId,
        sync_index: SyncIndex,
        offset: f64,
    },
    /// Frame index went backwards; the frame was discarded.
    OutOfOrderFrame {
        camera_id: CameraId,
        frame_index: u64,
        last_frame_index: u64,
    },
    /// Frame emitted before its points arrived (lookahead saturated).
    PointsMissing { camera_id: CameraId, frame_index: u64 },
    /// Points arrived after their frame had been emitted.
    LatePoints { camera_id: CameraId, frame_index: u64 },
    /// Frame timestamp was NaN or infinite; the frame was discarded.
    NonFiniteTimestamp { camera_id: CameraId, frame_index: u64 },
    /// A record on one camera's feed named another camera; it was discarded.
    MisroutedRecord { feed: CameraId, record_camera_id: CameraId },
}

/// Recoverable consumer backpressure conditions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackpressureWarning {
    /// A blocking consumer's queue was full; emission waited.
    QueueFull { consumer: String, sync_index: SyncIndex },
    /// A drop-oldest consumer skipped packets.
    DroppedOldest { consumer: String, skipped: u64 },
}

/// Any recoverable condition reported upstream during a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionWarning {
    Alignment(AlignmentWarning),
    Backpressure(BackpressureWarning),
}

impl From<AlignmentWarning> for SessionWarning {
    fn from(w: AlignmentWarning) -> Self {
        Self::Alignment(w)
    }
}

impl From<BackpressureWarning> for SessionWarning {
    fn from(w: BackpressureWarning) -> Self {
        Self::Backpressure(w)
    }
}
