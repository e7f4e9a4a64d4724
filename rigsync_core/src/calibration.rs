//! Active calibration of a session.
//!
//! Triangulation reads the camera array through a lease held for one sync
//! index. A recalibration waits for every outstanding lease, then swaps in
//! the new snapshot; the old array is never touched.

use crate::camera_array::CameraArray;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::info;

/// Shared holder of the active `Arc<CameraArray>`.
#[derive(Debug)]
pub struct CalibrationSlot {
    active: RwLock<Arc<CameraArray>>,
    generation: AtomicU64,
}

/// Read access to the array for the duration of one unit of work.
pub struct CalibrationLease<'a> {
    guard: RwLockReadGuard<'a, Arc<CameraArray>>,
    generation: u64,
}

impl CalibrationLease<'_> {
    pub fn array(&self) -> &CameraArray {
        &self.guard
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl CalibrationSlot {
    pub fn new(array: Arc<CameraArray>) -> Self {
        Self {
            active: RwLock::new(array),
            generation: AtomicU64::new(0),
        }
    }

    pub fn shared(array: Arc<CameraArray>) -> Arc<Self> {
        Arc::new(Self::new(array))
    }

    /// Hold the current array until the lease is dropped.
    pub async fn lease(&self) -> CalibrationLease<'_> {
        let guard = self.active.read().await;
        // Read under the lock so it matches the array in the guard
        let generation = self.generation.load(Ordering::Acquire);
        CalibrationLease { guard, generation }
    }

    /// Current snapshot, without holding it against recalibration.
    pub async fn snapshot(&self) -> Arc<CameraArray> {
        self.active.read().await.clone()
    }

    /// Swap in a new array once in-flight leases are released.
    /// Returns the new generation.
    pub async fn replace(&self, array: Arc<CameraArray>) -> u64 {
        let mut guard = self.active.write().await;
        *guard = array;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!("Calibration replaced, generation {}", generation);
        generation
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}
