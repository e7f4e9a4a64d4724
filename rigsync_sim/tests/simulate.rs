//! End-to-end runs of the synthetic rig through the live pipeline.

use rigsync_core::{AlignmentWarning, SessionWarning, SyncConfig};
use rigsync_sim::batch::{process_workspace, RECORDINGS_DIR};
use rigsync_sim::session::{XYZ_FILE, XY_FILE};
use rigsync_sim::{replay_recording, run_session, ProducerProfile, RingRig, SimConfig, Stall, TrajectoryExport};

fn ideal_config(seed: u64, frames: u64) -> SimConfig {
    SimConfig {
        seed,
        rig: RingRig::with_cameras(4),
        markers: 5,
        frames,
        profile: ProducerProfile::ideal(),
        sync: SyncConfig {
            stall_timeout_ms: 2000,
            ..SyncConfig::default()
        },
        ..SimConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ideal_session_recovers_ground_truth() {
    let outcome = run_session(&ideal_config(7, 60)).await.unwrap();

    assert_eq!(outcome.summary.packets_emitted, 60);
    assert!(outcome.summary.dropped_cameras.is_empty());
    assert_eq!(outcome.history.len(), 60 * 5);
    assert_eq!(outcome.error.unresolved, 0);
    assert_eq!(outcome.error.resolved, 300);
    assert!(outcome.error.rms.unwrap() < 1e-6, "rms = {:?}", outcome.error.rms);

    // One ledger row per camera and index
    assert_eq!(outcome.frame_times.len(), 60 * 4);
    for (sync_index, frame_index) in outcome.frame_of_sync() {
        assert_eq!(sync_index, frame_index);
    }

    let export = TrajectoryExport::from_outcome(&outcome);
    assert_eq!(export.frames.len(), 60);
    assert_eq!(export.frames[10].truth.len(), 5);
    assert!(export.frames[10].estimates.iter().all(|e| e.position.is_some()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_noisy_session_stays_accurate() {
    let config = SimConfig {
        seed: 11,
        frames: 90,
        sync: SyncConfig {
            stall_timeout_ms: 2000,
            ..SyncConfig::default()
        },
        ..SimConfig::default()
    };
    let outcome = run_session(&config).await.unwrap();

    assert!(outcome.summary.packets_emitted >= 85);
    assert!(outcome.summary.dropped_cameras.is_empty());
    let rms = outcome.error.rms.unwrap();
    assert!(rms < 0.01, "rms = {}", rms);

    // Same seed, same observations
    let again = run_session(&config).await.unwrap();
    assert_eq!(outcome.observation_log(), again.observation_log());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stalled_camera_is_dropped_and_session_continues() {
    let config = SimConfig {
        seed: 3,
        frames: 90,
        stall: Some(Stall {
            camera_id: 1,
            after_frame: 20,
            hold_ms: 1500,
        }),
        sync: SyncConfig {
            stall_timeout_ms: 500,
            ..SyncConfig::default()
        },
        ..ideal_config(3, 90)
    };
    let outcome = run_session(&config).await.unwrap();

    assert_eq!(outcome.summary.dropped_cameras, vec![1]);
    assert_eq!(outcome.summary.packets_emitted, 90);

    let from_index = outcome
        .warnings
        .iter()
        .find_map(|w| match w {
            SessionWarning::Alignment(AlignmentWarning::CameraDropped {
                camera_id: 1,
                from_index,
                ..
            }) => Some(*from_index),
            _ => None,
        })
        .expect("camera 1 reported as dropped");
    assert_eq!(from_index, 21);

    // Camera 1 is absent from the drop on, the others keep resolving
    assert!(outcome
        .frame_times
        .iter()
        .all(|row| row.camera_id != 1 || row.sync_index < from_index));
    assert_eq!(outcome.error.unresolved, 0);
    assert!(outcome.error.rms.unwrap() < 1e-6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recording_replays_to_live_history() {
    let outcome = run_session(&ideal_config(5, 30)).await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    outcome.write_recording(dir.path()).unwrap();

    let replayed = replay_recording(dir.path(), None).unwrap();
    assert_eq!(replayed, outcome.history);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_processes_skips_and_survives_failures() {
    let outcome = run_session(&ideal_config(9, 20)).await.unwrap();
    let workspace = tempfile::tempdir().unwrap();
    let recordings = workspace.path().join(RECORDINGS_DIR);

    // fresh: log without output
    let fresh = recordings.join("a_fresh");
    outcome.write_recording(&fresh).unwrap();
    std::fs::remove_file(fresh.join(XYZ_FILE)).unwrap();

    // done: already has output
    let done = recordings.join("b_done");
    outcome.write_recording(&done).unwrap();

    // broken: malformed log
    let broken = recordings.join("c_broken");
    outcome.write_recording(&broken).unwrap();
    std::fs::remove_file(broken.join(XYZ_FILE)).unwrap();
    std::fs::write(broken.join(XY_FILE), "sync_index,camera_id,point_id,img_x,img_y\n0,0,0,not-a-number,1\n").unwrap();

    // empty: nothing to do
    std::fs::create_dir_all(recordings.join("d_empty")).unwrap();

    let report = process_workspace(workspace.path(), None).unwrap();
    assert_eq!(report.processed, vec![fresh.clone()]);
    assert_eq!(report.skipped, vec![done.clone(), recordings.join("d_empty")]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, broken);
    assert_eq!(report.success_ratio(), 0.5);

    let mut expected = Vec::new();
    outcome.history.write_csv(&mut expected).unwrap();
    assert_eq!(std::fs::read(fresh.join(XYZ_FILE)).unwrap(), expected);

    // Second run only retries the broken recording
    let rerun = process_workspace(workspace.path(), None).unwrap();
    assert!(rerun.processed.is_empty());
    assert_eq!(rerun.skipped.len(), 3);
    assert_eq!(rerun.failed.len(), 1);
}
