//! Synthetic session runner - the full async pipeline against ground truth.
//!
//! ```text
//! Oracle ─► CameraProducer × N ─► SyncRuntime ─┬─► TriangulationWorker ─► PointHistory
//!                                              ├─► ObservationRecorder (xy.csv)
//!                                              └─► FrameTimeLedger (frame_time_history.csv)
//! ```

use crate::error::SimError;
use crate::oracle::Oracle;
use crate::producers::{CameraProducer, ProducerProfile, Stall};
use crate::rig::RingRig;
use rigsync_core::{
    read_frame_times, CalibrationSlot, CameraArray, ConsumerPolicy, FrameTimeLedger, FrameTimeRow,
    ObservationRecorder, PointHistory, PointResult, SessionConfig, SessionSummary, SessionWarning, SyncConfig,
    SyncIndex, SyncRuntime, TriangulationConfig, TriangulationWorker,
};
use rigsync_env::{SessionId, TokioClock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const XY_FILE: &str = "xy.csv";
pub const XYZ_FILE: &str = "xyz.csv";
pub const FRAME_TIME_FILE: &str = "frame_time_history.csv";
pub const CONFIG_FILE: &str = "config.json";

/// Configuration of a synthetic session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Master seed (default: 42)
    pub seed: u64,

    pub rig: RingRig,

    /// Number of moving markers (default: 6)
    pub markers: u32,

    /// Marker spread around the rig target in meters (default: 0.5)
    pub spread: f64,

    /// Frames per camera (default: 120)
    pub frames: u64,

    /// Nominal frame rate (default: 30)
    pub fps: f64,

    pub profile: ProducerProfile,

    /// Optional camera stall
    pub stall: Option<Stall>,

    pub sync: SyncConfig,

    pub triangulation: TriangulationConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            rig: RingRig::default(),
            markers: 6,
            spread: 0.5,
            frames: 120,
            fps: 30.0,
            profile: ProducerProfile::default(),
            stall: None,
            sync: SyncConfig {
                stall_timeout_ms: 250,
                ..SyncConfig::default()
            },
            triangulation: TriangulationConfig::default(),
        }
    }
}

/// Accuracy against ground truth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub resolved: usize,
    pub unresolved: usize,

    /// RMS 3D error in meters over resolved samples
    pub rms: Option<f64>,
    pub max: Option<f64>,
}

/// Everything a synthetic session produced.
#[derive(Debug, Clone)]
pub struct SimOutcome {
    pub seed: u64,
    pub fps: f64,
    pub array: Arc<CameraArray>,
    pub oracle: Oracle,
    pub summary: SessionSummary,
    pub history: PointHistory,
    pub frame_times: Vec<FrameTimeRow>,
    pub warnings: Vec<SessionWarning>,
    pub error: ErrorStats,
    pub session_config: SessionConfig,
    observation_log: Vec<u8>,
    frame_time_log: Vec<u8>,
}

impl SimOutcome {
    /// Frame index of each sync index, from the frame-timing ledger.
    pub fn frame_of_sync(&self) -> BTreeMap<SyncIndex, u64> {
        let mut map = BTreeMap::new();
        for row in &self.frame_times {
            map.entry(row.sync_index).or_insert(row.frame_index);
        }
        map
    }

    pub fn observation_log(&self) -> &[u8] {
        &self.observation_log
    }

    /// Write the recording directory layout used by `rigsync batch`.
    pub fn write_recording(&self, dir: impl AsRef<Path>) -> Result<(), SimError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.session_config.save(dir.join(CONFIG_FILE))?;
        std::fs::write(dir.join(XY_FILE), &self.observation_log)?;
        std::fs::write(dir.join(FRAME_TIME_FILE), &self.frame_time_log)?;
        self.history.save_csv(dir.join(XYZ_FILE))?;
        info!("Recording written to {}", dir.display());
        Ok(())
    }
}

/// Run one synthetic session through the live pipeline.
pub async fn run_session(config: &SimConfig) -> Result<SimOutcome, SimError> {
    let array = Arc::new(config.rig.build()?);
    let oracle = Arc::new(Oracle::new(config.seed, config.markers, config.rig.target(), config.spread));
    info!(
        "Simulating seed={} cameras={} markers={} frames={}",
        config.seed,
        array.len(),
        config.markers,
        config.frames
    );

    let (mut runtime, feeds) =
        SyncRuntime::new(TokioClock::shared(), SessionId(config.seed), &array.camera_ids(), config.sync.clone())?;
    let worker_sub = runtime.subscribe("triangulation", ConsumerPolicy::Block);
    let log_sub = runtime.subscribe("xy-log", ConsumerPolicy::Block);
    let ledger_sub = runtime.subscribe("frame-times", ConsumerPolicy::Block);
    let mut warnings_rx = runtime.warnings().ok_or_else(|| SimError::Task("warning channel taken".into()))?;

    let (_stop, shutdown) = watch::channel(false);
    let slot = CalibrationSlot::shared(array.clone());
    let worker = tokio::spawn(
        TriangulationWorker::new(slot, config.triangulation.clone()).run(worker_sub, shutdown.clone()),
    );
    let recorder = tokio::spawn(ObservationRecorder::new(Vec::new())?.run(log_sub));
    let ledger = tokio::spawn(FrameTimeLedger::new(Vec::new())?.run(ledger_sub));
    let warnings = tokio::spawn(async move {
        let mut all = Vec::new();
        while let Some(w) = warnings_rx.recv().await {
            all.push(w);
        }
        all
    });
    let session = tokio::spawn(runtime.run(shutdown));

    let mut producers = Vec::new();
    for feed in feeds {
        let Some(camera) = array.camera(feed.camera_id()).cloned() else {
            continue;
        };
        let producer = CameraProducer::new(camera, oracle.clone(), config.profile.clone(), config.seed)
            .with_stall(config.stall);
        producers.push(tokio::spawn(producer.run(feed, config.frames, config.fps)));
    }

    let summary = session.await??;
    for producer in producers {
        match producer.await? {
            Ok(sent) => debug!("Producer finished, {} frames sent", sent),
            // Stalled producers may outlive the session
            Err(e) => warn!("Producer stopped early: {}", e),
        }
    }

    let outcome = worker.await??;
    let (observation_log, _) = recorder.await??;
    let (frame_time_log, _) = ledger.await??;
    let warnings = warnings.await?;
    let frame_times = read_frame_times(Cursor::new(&frame_time_log))?;

    let mut session_config = SessionConfig::from_camera_array(&array);
    session_config.sync = config.sync.clone();
    session_config.triangulation = config.triangulation.clone();

    let mut result = SimOutcome {
        seed: config.seed,
        fps: config.fps,
        array,
        oracle: oracle.as_ref().clone(),
        summary,
        history: outcome.history,
        frame_times,
        warnings,
        error: ErrorStats::default(),
        session_config,
        observation_log,
        frame_time_log,
    };
    result.error = score(&result);
    info!(
        "Session done: {} packets, {} resolved, {} unresolved, rms={:?}",
        result.summary.packets_emitted, result.error.resolved, result.error.unresolved, result.error.rms
    );
    Ok(result)
}

/// Compare every resolved sample with the oracle.
pub fn score(outcome: &SimOutcome) -> ErrorStats {
    let frames = outcome.frame_of_sync();
    let mut stats = ErrorStats::default();
    let mut sum_sq = 0.0;
    let mut max: f64 = 0.0;

    for row in outcome.history.rows() {
        let PointResult::Resolved(point) = row.result else {
            stats.unresolved += 1;
            continue;
        };
        let Some(frame) = frames.get(&row.sync_index) else {
            continue;
        };
        let Some(truth) = outcome.oracle.position(row.point_id, *frame as f64 / outcome.fps) else {
            continue;
        };
        let err = (point.position - truth).norm();
        sum_sq += err * err;
        max = max.max(err);
        stats.resolved += 1;
    }

    if stats.resolved > 0 {
        stats.rms = Some((sum_sq / stats.resolved as f64).sqrt());
        stats.max = Some(max);
    }
    stats
}
