//! Session Runtime - drives the [`SyncEngine`] from per-camera queues.
//!
//! # Architecture
//!
//! ```text
//!  camera 0 producer ──► CameraFeed ──► mpsc(queue_depth) ──┐
//!  camera 1 producer ──► CameraFeed ──► mpsc(queue_depth) ──┤
//!  camera N producer ──► CameraFeed ──► mpsc(queue_depth) ──┤
//!                                                            ▼
//!                                   ┌─────────────────────────────────┐
//!                                   │ SyncRuntime (one cooperative    │
//!                                   │ loop: ingest, poll, emit, idle) │
//!                                   └─────────────────────────────────┘
//!                                        │ Arc<SyncPacket>
//!                      ┌─────────────────┼──────────────────┐
//!                      ▼                 ▼                  ▼
//!              Subscription(Block) Subscription(DropOldest) ...
//! ```
//!
//! Alignment happens on a single task so packets leave strictly ordered.
//! Producers and consumers run wherever the caller spawns them.
//!
//! # Usage
//!
//! ```ignore
//! let (mut runtime, feeds) = SyncRuntime::new(TokioClock::shared(), SessionId(0), &[0, 1], SyncConfig::default())?;
//! let mut sub = runtime.subscribe("triangulation", ConsumerPolicy::Block);
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! tokio::spawn(runtime.run(shutdown));
//! ```

use crate::error::{AlignmentWarning, BackpressureWarning, SessionWarning, SyncError};
use crate::packets::{CameraId, FramePacket, PointId, PointPacket, StreamRecord, SyncIndex, SyncPacket};
use crate::synchronizer::{CameraStatus, SyncConfig, SyncEngine, SyncPoll};
use rigsync_env::{EnvError, SessionClock, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

// ============================================================================
// PRODUCER SIDE
// ============================================================================

/// Sending half of one camera's bounded queue. Dropping every clone of a
/// feed marks the camera's stream as exhausted.
#[derive(Debug, Clone)]
pub struct CameraFeed {
    camera_id: CameraId,
    tx: mpsc::Sender<StreamRecord>,
}

impl CameraFeed {
    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    /// Queue a record, waiting while the queue is full.
    pub async fn send(&self, record: StreamRecord) -> Result<(), EnvError> {
        self.tx
            .send(record)
            .await
            .map_err(|_| EnvError::closed(format!("camera {} feed", self.camera_id)))
    }

    pub async fn send_frame(&self, frame_index: u64, timestamp: f64) -> Result<(), EnvError> {
        self.send(StreamRecord::Frame(FramePacket::new(self.camera_id, frame_index, timestamp)))
            .await
    }

    pub async fn send_points(&self, frame_index: u64, points: Vec<(PointId, [f64; 2])>) -> Result<(), EnvError> {
        self.send(StreamRecord::Points(PointPacket::new(self.camera_id, frame_index, points)))
            .await
    }
}

// ============================================================================
// CONSUMER SIDE
// ============================================================================

/// What happens when a consumer falls `queue_depth` packets behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerPolicy {
    /// Emission waits for the consumer (after a `QueueFull` warning)
    Block,
    /// The consumer skips its oldest packets
    DropOldest,
}

enum Outlet {
    Block {
        name: String,
        tx: mpsc::Sender<Arc<SyncPacket>>,
    },
    DropOldest {
        tx: broadcast::Sender<Arc<SyncPacket>>,
    },
}

enum Inlet {
    Block(mpsc::Receiver<Arc<SyncPacket>>),
    DropOldest(broadcast::Receiver<Arc<SyncPacket>>),
}

/// Receiving half of a consumer's queue.
pub struct Subscription {
    name: String,
    inlet: Inlet,
    skipped: u64,
    warnings: mpsc::UnboundedSender<SessionWarning>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Packets this consumer has lost to the drop-oldest policy.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Next packet, or `None` once the session has ended and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<Arc<SyncPacket>> {
        match &mut self.inlet {
            Inlet::Block(rx) => rx.recv().await,
            Inlet::DropOldest(rx) => loop {
                match rx.recv().await {
                    Ok(packet) => return Some(packet),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        self.skipped += skipped;
                        let warning = BackpressureWarning::DroppedOldest {
                            consumer: self.name.clone(),
                            skipped,
                        };
                        warn!("Backpressure warning: {:?}", warning);
                        // The session may already be gone
                        let _ = self.warnings.send(warning.into());
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }
}

// ============================================================================
// SUMMARY
// ============================================================================

/// Outcome of a completed session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session: Option<SessionId>,
    pub packets_emitted: u64,
    pub last_sync_index: Option<SyncIndex>,
    pub dropped_cameras: Vec<CameraId>,

    /// Counted by the runtime; consumer-side `DroppedOldest` warnings only
    /// go to the warning channel
    pub alignment_warnings: u64,
    pub backpressure_warnings: u64,
}

struct WarningSink {
    tx: mpsc::UnboundedSender<SessionWarning>,
    alignment: u64,
    backpressure: u64,
}

impl WarningSink {
    fn report(&mut self, warning: SessionWarning) {
        match &warning {
            SessionWarning::Alignment(_) => self.alignment += 1,
            SessionWarning::Backpressure(w) => {
                warn!("Backpressure warning: {:?}", w);
                self.backpressure += 1;
            }
        }
        // Nobody listening is fine
        let _ = self.tx.send(warning);
    }
}

// ============================================================================
// RUNTIME
// ============================================================================

/// Owns one session's alignment loop.
pub struct SyncRuntime<C: SessionClock> {
    clock: Arc<C>,
    session: SessionId,
    engine: SyncEngine,
    inputs: BTreeMap<CameraId, mpsc::Receiver<StreamRecord>>,
    outlets: Vec<Outlet>,
    sink: WarningSink,
    warnings_rx: Option<mpsc::UnboundedReceiver<SessionWarning>>,
}

impl<C: SessionClock> SyncRuntime<C> {
    /// Create a session and one feed per camera.
    pub fn new(
        clock: Arc<C>,
        session: SessionId,
        camera_ids: &[CameraId],
        config: SyncConfig,
    ) -> Result<(Self, Vec<CameraFeed>), SyncError> {
        let engine = SyncEngine::new(camera_ids, config, clock.now())?;
        let depth = engine.config().queue_depth;

        let mut inputs = BTreeMap::new();
        let mut feeds = Vec::new();
        for camera_id in engine.camera_ids() {
            let (tx, rx) = mpsc::channel(depth);
            inputs.insert(camera_id, rx);
            feeds.push(CameraFeed { camera_id, tx });
        }

        let (warn_tx, warn_rx) = mpsc::unbounded_channel();
        info!("{}: runtime created for {} cameras", session, feeds.len());

        Ok((
            Self {
                clock,
                session,
                engine,
                inputs,
                outlets: Vec::new(),
                sink: WarningSink {
                    tx: warn_tx,
                    alignment: 0,
                    backpressure: 0,
                },
                warnings_rx: Some(warn_rx),
            },
            feeds,
        ))
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Register a consumer. Must happen before [`run`](Self::run).
    pub fn subscribe(&mut self, name: impl Into<String>, policy: ConsumerPolicy) -> Subscription {
        let name = name.into();
        let depth = self.engine.config().queue_depth;
        let inlet = match policy {
            ConsumerPolicy::Block => {
                let (tx, rx) = mpsc::channel(depth);
                self.outlets.push(Outlet::Block { name: name.clone(), tx });
                Inlet::Block(rx)
            }
            ConsumerPolicy::DropOldest => {
                let (tx, rx) = broadcast::channel(depth);
                self.outlets.push(Outlet::DropOldest { tx });
                Inlet::DropOldest(rx)
            }
        };
        debug!("{}: consumer '{}' subscribed ({:?})", self.session, name, policy);
        Subscription {
            name,
            inlet,
            skipped: 0,
            warnings: self.sink.tx.clone(),
        }
    }

    /// The warning channel. Can be taken once.
    pub fn warnings(&mut self) -> Option<mpsc::UnboundedReceiver<SessionWarning>> {
        self.warnings_rx.take()
    }

    /// Run until every stream is exhausted, the session fails, or shutdown
    /// is signalled. Shutdown is checked between sync indices.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<SessionSummary, SyncError> {
        let poll_interval = self.engine.config().poll_interval();
        let mut summary = SessionSummary {
            session: Some(self.session),
            ..SessionSummary::default()
        };
        info!("{}: sync loop started", self.session);

        loop {
            if *shutdown.borrow() {
                info!("{}: cancelled after {:?}", self.session, summary.last_sync_index);
                return Err(SyncError::Cancelled(summary.last_sync_index));
            }

            let now = self.clock.now();
            let mut progressed = self.ingest(now)?;

            loop {
                let poll = self.engine.poll(now);
                self.forward_alignment_warnings();
                match poll? {
                    SyncPoll::Ready(packet) => {
                        let packet = Arc::new(packet);
                        summary.last_sync_index = Some(packet.sync_index);
                        summary.packets_emitted += 1;
                        progressed = true;

                        if !self.emit(packet, &mut shutdown).await {
                            info!("{}: cancelled while delivering {:?}", self.session, summary.last_sync_index);
                            return Err(SyncError::Cancelled(summary.last_sync_index));
                        }

                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    SyncPoll::Pending => break,
                    SyncPoll::Finished => {
                        summary.dropped_cameras = self.engine.dropped_cameras();
                        summary.alignment_warnings = self.sink.alignment;
                        summary.backpressure_warnings = self.sink.backpressure;
                        info!(
                            "{}: finished, {} packets, dropped cameras {:?}",
                            self.session, summary.packets_emitted, summary.dropped_cameras
                        );
                        return Ok(summary);
                    }
                }
            }

            if !progressed {
                self.clock.sleep(poll_interval).await;
            }
        }
    }

    /// Move queued records into the engine while it has lookahead room.
    fn ingest(&mut self, now: std::time::Duration) -> Result<bool, SyncError> {
        let mut progressed = false;
        let mut closed = Vec::new();

        for (camera_id, rx) in self.inputs.iter_mut() {
            let dropped = self.engine.status(*camera_id) == Some(CameraStatus::Dropped);
            while dropped || self.engine.has_capacity(*camera_id) {
                match rx.try_recv() {
                    Ok(record) if record.camera_id() != *camera_id => {
                        let warning = AlignmentWarning::MisroutedRecord {
                            feed: *camera_id,
                            record_camera_id: record.camera_id(),
                        };
                        warn!("Alignment warning: {:?}", warning);
                        self.sink.report(warning.into());
                        progressed = true;
                    }
                    // Records of a dropped camera are read only to unblock its producer
                    Ok(record) => {
                        self.engine.push(record, now)?;
                        progressed = true;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        closed.push(*camera_id);
                        break;
                    }
                }
            }
        }

        for camera_id in closed {
            self.inputs.remove(&camera_id);
            self.engine.close(camera_id);
            progressed = true;
        }
        Ok(progressed)
    }

    /// Deliver to every consumer. Returns `false` if shutdown was raised
    /// while waiting on a blocking consumer.
    async fn emit(&mut self, packet: Arc<SyncPacket>, shutdown: &mut watch::Receiver<bool>) -> bool {
        for outlet in &self.outlets {
            match outlet {
                Outlet::Block { name, tx } => match tx.try_send(packet.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(packet)) => {
                        self.sink.report(
                            BackpressureWarning::QueueFull {
                                consumer: name.clone(),
                                sync_index: packet.sync_index,
                            }
                            .into(),
                        );
                        let send = tx.send(packet);
                        tokio::pin!(send);
                        let mut shutdown_open = true;
                        loop {
                            tokio::select! {
                                sent = &mut send => {
                                    if sent.is_err() {
                                        debug!("Consumer '{}' went away", name);
                                    }
                                    break;
                                }
                                changed = shutdown.changed(), if shutdown_open => {
                                    // Sender gone: nobody can cancel any more
                                    shutdown_open = changed.is_ok();
                                    if *shutdown.borrow() {
                                        return false;
                                    }
                                }
                            }
                        }
                    }
                    Err(TrySendError::Closed(_)) => {}
                },
                Outlet::DropOldest { tx } => {
                    // No receiver left is not an error
                    let _ = tx.send(packet.clone());
                }
            }
        }
        true
    }

    fn forward_alignment_warnings(&mut self) {
        for warning in self.engine.drain_warnings() {
            self.sink.report(warning.into());
        }
    }
}
