//! Offline batch processing of recording directories.
//!
//! A workspace holds one directory per recording under `recordings/`. Each
//! directory with an observation log (`xy.csv`) and no trajectory
//! (`xyz.csv`) is replayed through the array triangulator. One bad recording
//! never stops the batch.

use crate::error::SimError;
use crate::session::{CONFIG_FILE, XYZ_FILE, XY_FILE};
use rigsync_core::{load_observations, replay_observations, PointHistory, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Replay one recording and return its trajectory.
///
/// The recording's own `config.json` wins over `fallback`.
pub fn replay_recording(dir: &Path, fallback: Option<&SessionConfig>) -> Result<PointHistory, SimError> {
    let config_path = dir.join(CONFIG_FILE);
    let config = if config_path.exists() {
        SessionConfig::load(&config_path)?
    } else if let Some(config) = fallback {
        config.clone()
    } else {
        return Err(SimError::MissingConfig(dir.to_path_buf()));
    };

    let array = config.camera_array()?;
    let sets = load_observations(dir.join(XY_FILE))?;
    let history = replay_observations(&array, &sets, &config.triangulation)?;
    Ok(history)
}

/// Replay one recording and write `xyz.csv` next to its log.
pub fn process_recording(dir: &Path, fallback: Option<&SessionConfig>) -> Result<PointHistory, SimError> {
    let history = replay_recording(dir, fallback)?;
    history.save_csv(dir.join(XYZ_FILE))?;
    info!(
        "{}: {} samples, {} resolved",
        dir.display(),
        history.len(),
        history.resolved_count()
    );
    Ok(history)
}

/// Result of one batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub processed: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl BatchReport {
    /// Fraction of attempted recordings that succeeded.
    pub fn success_ratio(&self) -> f64 {
        let attempted = self.processed.len() + self.failed.len();
        if attempted == 0 {
            return 1.0;
        }
        self.processed.len() as f64 / attempted as f64
    }
}

pub const RECORDINGS_DIR: &str = "recordings";

/// Process every recording directory under `workspace/recordings`.
pub fn process_workspace(workspace: &Path, fallback: Option<&SessionConfig>) -> Result<BatchReport, SimError> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(workspace.join(RECORDINGS_DIR))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    let mut report = BatchReport::default();
    for dir in dirs {
        if !dir.join(XY_FILE).exists() || dir.join(XYZ_FILE).exists() {
            report.skipped.push(dir);
            continue;
        }

        match process_recording(&dir, fallback) {
            Ok(_) => report.processed.push(dir),
            Err(e) => {
                error!("{}: {}", dir.display(), e);
                report.failed.push((dir, e.to_string()));
            }
        }
    }

    if report.failed.is_empty() {
        info!(
            "Batch done: {} processed, {} skipped",
            report.processed.len(),
            report.skipped.len()
        );
    } else {
        warn!(
            "Batch done: {} processed, {} skipped, {} failed (success ratio {:.2})",
            report.processed.len(),
            report.skipped.len(),
            report.failed.len(),
            report.success_ratio()
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_ratio() {
        let mut report = BatchReport::default();
        assert_eq!(report.success_ratio(), 1.0);
        report.processed.push(PathBuf::from("a"));
        report.failed.push((PathBuf::from("b"), "bad".into()));
        assert_eq!(report.success_ratio(), 0.5);
    }

    #[test]
    fn test_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(XY_FILE), "sync_index,camera_id,point_id,img_x,img_y\n").unwrap();
        let err = replay_recording(dir.path(), None).unwrap_err();
        assert!(matches!(err, SimError::MissingConfig(_)));
    }
}
