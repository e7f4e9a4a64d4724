//! Live triangulation consumer.

use crate::array_triangulator::{ArrayTriangulator, TriangulationConfig};
use crate::calibration::CalibrationSlot;
use crate::error::HistoryError;
use crate::point_history::PointHistory;
use crate::session_runtime::Subscription;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// What a worker leaves behind.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOutcome {
    pub history: PointHistory,
    pub packets: u64,
    pub cancelled: bool,
}

/// Triangulates each packet of a subscription into a [`PointHistory`].
pub struct TriangulationWorker {
    calibration: Arc<CalibrationSlot>,
    triangulator: ArrayTriangulator,
    history: PointHistory,
}

impl TriangulationWorker {
    pub fn new(calibration: Arc<CalibrationSlot>, config: TriangulationConfig) -> Self {
        Self {
            calibration,
            triangulator: ArrayTriangulator::new(config),
            history: PointHistory::new(),
        }
    }

    /// Continue an existing history.
    pub fn with_history(mut self, history: PointHistory) -> Self {
        self.history = history;
        self
    }

    /// Consume packets until the session ends or `shutdown` is raised.
    ///
    /// Each sync index is appended whole or not at all, so a cancelled
    /// worker still returns a consistent history.
    pub async fn run(
        mut self,
        mut subscription: Subscription,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WorkerOutcome, HistoryError> {
        let mut packets = 0u64;
        let mut cancelled = false;
        let mut shutdown_open = true;

        loop {
            if *shutdown.borrow() {
                cancelled = true;
                break;
            }
            let packet = if shutdown_open {
                tokio::select! {
                    packet = subscription.recv() => packet,
                    changed = shutdown.changed() => {
                        // Sender gone: nobody can cancel any more
                        shutdown_open = changed.is_ok();
                        continue;
                    }
                }
            } else {
                subscription.recv().await
            };
            let Some(packet) = packet else {
                break;
            };
            packets += 1;

            let observations = packet.observations();
            if observations.is_empty() {
                continue;
            }

            let estimates = {
                let lease = self.calibration.lease().await;
                self.triangulator.triangulate(lease.array(), &observations)
            };
            self.history.append_all(&estimates)?;
        }

        if cancelled {
            info!("Triangulation worker cancelled after {} packets", packets);
        } else {
            debug!("Triangulation worker done: {} packets, {} samples", packets, self.history.len());
        }
        Ok(WorkerOutcome {
            history: self.history,
            packets,
            cancelled,
        })
    }
}
