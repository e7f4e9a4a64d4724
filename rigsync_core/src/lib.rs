//! rigsync Core - Multi-Camera Synchronization and Array Triangulation
//!
//! This library solves the two hard problems of a calibrated capture rig:
//! 1. **Alignment**: independently jittered per-camera streams become one
//!    strictly ordered sequence of sync packets, with drift, stalls and
//!    missing detections reported instead of hidden
//! 2. **Triangulation**: pairwise DLT candidates from every stereo pair are
//!    filtered and merged into one array-wide 3D estimate per point, or an
//!    explicit unresolved marker
//!
//! ```text
//! producers ─► SyncRuntime(SyncEngine) ─► Arc<SyncPacket> ─┬─► TriangulationWorker ─► PointHistory ─► CaptureVolume
//!                                                          ├─► ObservationRecorder (xy log) ─► replay_observations
//!                                                          └─► FrameTimeLedger
//! ```

pub mod array_triangulator;
pub mod calibration;
pub mod camera_array;
pub mod capture_volume;
pub mod config;
pub mod error;
pub mod observation_log;
pub mod packets;
pub mod point_history;
pub mod recorder;
pub mod session_runtime;
pub mod stereo;
pub mod synchronizer;
pub mod worker;

// Re-export key types for convenience
pub use array_triangulator::{
    foreign_cameras, triangulate_observations, ArrayTriangulator, Point3D, PointEstimate, PointResult, TriangulationConfig,
    UnresolvedReason, WeightingPolicy,
};
pub use calibration::{CalibrationLease, CalibrationSlot};
pub use camera_array::{CameraArray, CameraData, Distortion, Extrinsics, StereoPair};
pub use capture_volume::{BoundingBox, CaptureVolume};
pub use config::{CameraConfig, SessionConfig};
pub use error::{
    AlignmentWarning, BackpressureWarning, ConfigurationError, HistoryError, LogError, SessionWarning, SyncError,
};
pub use observation_log::{
    load_observations, read_observations, replay_observations, ObservationLogWriter, ObservationRecorder,
};
pub use packets::{CameraId, CameraSlot, FramePacket, ObservationSet, PointId, PointPacket, StreamRecord, SyncIndex, SyncPacket};
pub use point_history::{PointHistory, TrajectorySample};
pub use recorder::{read_frame_times, FrameTimeLedger, FrameTimeRow};
pub use session_runtime::{CameraFeed, ConsumerPolicy, SessionSummary, Subscription, SyncRuntime};
pub use stereo::{PairObservations, SharedObservation, StereoCandidate, StereoPointsBuilder, StereoTriangulator};
pub use synchronizer::{CameraStatus, SyncConfig, SyncEngine, SyncPoll};
pub use worker::{TriangulationWorker, WorkerOutcome};
