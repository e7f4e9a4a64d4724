//! rigsync Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the synchronizer run
//! against either the **wall clock** (tokio) or a **virtual clock** that only
//! advances when told to.
//!
//! # Core Concept
//!
//! The alignment engine never reads time on its own. Every stall decision is
//! made against an instant handed in by a [`SessionClock`]:
//! - Production: [`TokioClock`] wraps `tokio::time`
//! - Replay / tests: [`ManualClock`] is advanced explicitly (or by `sleep`)
//!
//! # Example
//!
//! ```ignore
//! use rigsync_env::{SessionClock, TokioClock};
//!
//! async fn idle<C: SessionClock>(clock: &C) {
//!     let before = clock.now();
//!     clock.sleep(Duration::from_millis(2)).await;
//!     assert!(clock.now() >= before);
//! }
//! ```

mod clock;
mod error;
mod manual;
mod tokio_impl;
mod types;

pub use clock::SessionClock;
pub use error::EnvError;
pub use manual::ManualClock;
pub use tokio_impl::TokioClock;
pub use types::SessionId;
