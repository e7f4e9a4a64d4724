//! rigsync Simulation Harness
//!
//! A seeded synthetic rig that drives the full rigsync pipeline and scores it
//! against ground truth, plus the offline batch processor behind the
//! `rigsync` CLI.
//!
//! # Core Principle: Seeded Everything
//!
//! Marker motion, capture jitter, frame loss and pixel noise all derive from
//! one 64-bit seed, so a failing run can be reproduced from its seed alone.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        run_session                           │
//! │  ┌────────┐   ┌──────────────┐        ┌──────────────────┐   │
//! │  │ Oracle ├──►│ Producer × N ├─feeds─►│   SyncRuntime    │   │
//! │  └────────┘   └──────────────┘        └────────┬─────────┘   │
//! │                                                │ packets     │
//! │         ┌──────────────────────┬───────────────┴──────┐      │
//! │         ▼                      ▼                      ▼      │
//! │  TriangulationWorker   ObservationRecorder    FrameTimeLedger│
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use rigsync_sim::{run_session, SimConfig};
//!
//! let outcome = run_session(&SimConfig { seed: 7, ..Default::default() }).await?;
//! println!("rms = {:?}", outcome.error.rms);
//! ```

pub mod batch;
mod error;
pub mod exporter;
mod oracle;
mod producers;
mod rig;
pub mod session;

pub use batch::{process_recording, process_workspace, replay_recording, BatchReport};
pub use error::SimError;
pub use exporter::TrajectoryExport;
pub use oracle::{Marker, Oracle};
pub use producers::{CameraProducer, ProducerProfile, Stall};
pub use rig::{in_image, RingRig};
pub use session::{run_session, score, ErrorStats, SimConfig, SimOutcome};
