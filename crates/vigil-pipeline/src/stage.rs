//! Stage execution engine.
//!
//! # Architecture
//!
//! Every stage owns two long-lived tasks connected by a completion channel:
//!
//! ```text
//!            bounded input            completion channel
//! upstream ──────────────► worker ─────────────────────► collector ──► successors
//!                            │  per-object inference tasks  ▲
//!                            └───────► (request pool) ──────┘
//! ```
//!
//! The **worker** blocks only on its input queue and on request-pool
//! acquisition.  For each dequeued frame it snapshots the object list into a
//! fixed pending set and dispatches every object without waiting for
//! inference: transform → acquire slot → spawn the backend call.  Degraded
//! objects (bad geometry, transform failure) are completed on the spot.
//!
//! The **collector** consumes completion messages `(frame, object index,
//! slot, result)`, parses results through the stage kind, releases the pool
//! slot, and evaluates the join.  Whichever context observes the last object
//! flip to Done disposes the frame: forward downstream if any result objects
//! survived, otherwise release the buffer and drop it.  A frame is disposed
//! exactly once, and frames leave in join-completion order — not arrival
//! order.
//!
//! # Shutdown
//!
//! A flush sentinel makes the worker stop consuming; the collector forwards
//! the sentinel only after the completion channel drains, so every in-flight
//! object is accounted before downstream is told to wind down.  Cancellation
//! (stop) discards queued frames, releases their buffers, and still drains
//! in-flight completions before the collector exits.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vigil_core::{
    Frame, FrameTransform, MediaBuffer, ModelSession, ObjectRecord, ObjectStatus, Result,
    ResultTensor,
};

use crate::kinds::StageLogic;
use crate::request_pool::RequestPool;

// ─── Frame queues ───────────────────────────────────────────────────────────

/// Work item carried between stages.
#[derive(Debug)]
pub(crate) enum FramePayload {
    Frame(Frame),
    /// Drain-and-terminate sentinel.  Propagated downstream after in-flight
    /// work settles; unblocks a consumer waiting on the output side.
    Flush,
}

/// Bounded sender half with a depth gauge shared with the receiver.
#[derive(Clone)]
pub(crate) struct FrameQueue {
    tx: mpsc::Sender<FramePayload>,
    depth: Arc<AtomicUsize>,
}

pub(crate) struct FrameReceiver {
    rx: mpsc::Receiver<FramePayload>,
    depth: Arc<AtomicUsize>,
}

pub(crate) fn frame_channel(capacity: usize) -> (FrameQueue, FrameReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    (
        FrameQueue {
            tx,
            depth: depth.clone(),
        },
        FrameReceiver { rx, depth },
    )
}

impl FrameQueue {
    pub(crate) async fn send(&self, payload: FramePayload) -> Result<()> {
        self.depth.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(payload).await.is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(vigil_core::PipelineError::ChannelClosed);
        }
        Ok(())
    }

    pub(crate) fn try_send(&self, payload: FramePayload) -> Result<()> {
        self.depth.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                Err(vigil_core::PipelineError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                Err(vigil_core::PipelineError::ChannelClosed)
            }
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

impl FrameReceiver {
    pub(crate) async fn recv(&mut self) -> Option<FramePayload> {
        let payload = self.rx.recv().await;
        if payload.is_some() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        payload
    }

    pub(crate) fn try_recv(&mut self) -> Option<FramePayload> {
        let payload = self.rx.try_recv().ok();
        if payload.is_some() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        payload
    }
}

// ─── Stage phase ────────────────────────────────────────────────────────────

/// Lifecycle of one stage instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug)]
pub(crate) struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(StagePhase::Idle as u8))
    }

    pub(crate) fn set(&self, phase: StagePhase) {
        self.0.store(phase as u8, Ordering::Release);
    }

    pub(crate) fn get(&self) -> StagePhase {
        match self.0.load(Ordering::Acquire) {
            0 => StagePhase::Idle,
            1 => StagePhase::Running,
            2 => StagePhase::Stopping,
            _ => StagePhase::Stopped,
        }
    }
}

// ─── Metrics ────────────────────────────────────────────────────────────────

/// Atomic per-stage counters.  Observability only — the join protocol never
/// reads these.
#[derive(Debug, Default)]
pub struct StageMetrics {
    pub frames_processed: AtomicU64,
    pub frames_forwarded: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub transform_total_us: AtomicU64,
    pub dispatch_total_us: AtomicU64,
    pub inferences_total: AtomicU64,
    pub inferences_in_flight: AtomicU64,
    pub objects_degraded: AtomicU64,
}

/// Point-in-time copy of [`StageMetrics`].
#[derive(Clone, Copy, Debug, Serialize)]
pub struct StageMetricsSnapshot {
    pub frames_processed: u64,
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
    pub transform_total_us: u64,
    pub dispatch_total_us: u64,
    pub inferences_total: u64,
    pub inferences_in_flight: u64,
    pub objects_degraded: u64,
}

impl StageMetrics {
    pub fn snapshot(&self) -> StageMetricsSnapshot {
        StageMetricsSnapshot {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            transform_total_us: self.transform_total_us.load(Ordering::Relaxed),
            dispatch_total_us: self.dispatch_total_us.load(Ordering::Relaxed),
            inferences_total: self.inferences_total.load(Ordering::Relaxed),
            inferences_in_flight: self.inferences_in_flight.load(Ordering::Relaxed),
            objects_degraded: self.objects_degraded.load(Ordering::Relaxed),
        }
    }
}

// ─── Per-frame join ─────────────────────────────────────────────────────────

struct JoinState {
    buffer: Option<MediaBuffer>,
    /// Snapshot captured at dispatch.  Cardinality is fixed; completion
    /// accounting runs against this count, never the live result list.
    pending: Vec<ObjectRecord>,
    /// Stage output.  Insertion order is completion order.
    results: Vec<ObjectRecord>,
    done: usize,
}

/// A frame whose objects are being processed by one stage.
///
/// Shared between the dispatcher and every in-flight completion; the
/// exactly-once "last one turns off the lights" transition lives in
/// [`complete`](Self::complete).
pub(crate) struct InflightFrame {
    frame_id: u64,
    pts: Option<i64>,
    state: Mutex<JoinState>,
}

impl InflightFrame {
    pub(crate) fn new(frame: Frame) -> Arc<Self> {
        let Frame {
            frame_id,
            buffer,
            pts,
            mut objects,
        } = frame;
        for object in &mut objects {
            object.status = ObjectStatus::Pending;
        }
        Arc::new(Self {
            frame_id,
            pts,
            state: Mutex::new(JoinState {
                buffer: Some(buffer),
                pending: objects,
                results: Vec::new(),
                done: 0,
            }),
        })
    }

    pub(crate) fn frame_id(&self) -> u64 {
        self.frame_id
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Clone of the snapshot object at `index` for transform/parse input.
    pub(crate) fn source_object(&self, index: usize) -> Option<ObjectRecord> {
        self.lock().pending.get(index).cloned()
    }

    /// Shared handle to the frame buffer for transform input.
    pub(crate) fn share_buffer(&self) -> Option<MediaBuffer> {
        self.lock().buffer.as_ref().map(MediaBuffer::share)
    }

    /// Mark one object done and fold its parsed output into the result
    /// list.  Returns the reassembled frame if — and only for the caller
    /// that made it so — every pending object is now done.
    pub(crate) fn complete(&self, index: usize, parsed: Vec<ObjectRecord>) -> Option<Frame> {
        let mut state = self.lock();
        let total = state.pending.len();
        let Some(object) = state.pending.get_mut(index) else {
            error!(
                frame_id = self.frame_id,
                index, "completion for unknown object index"
            );
            return None;
        };
        if object.status == ObjectStatus::Done {
            warn!(
                frame_id = self.frame_id,
                index, "duplicate completion ignored"
            );
            return None;
        }
        object.status = ObjectStatus::Done;
        state.done += 1;
        state.results.extend(parsed);
        if state.done == total {
            self.reassemble(&mut state)
        } else {
            None
        }
    }

    /// Immediate disposition for a frame that carried no objects.
    pub(crate) fn finish_empty(&self) -> Option<Frame> {
        let mut state = self.lock();
        if !state.pending.is_empty() {
            return None;
        }
        self.reassemble(&mut state)
    }

    fn reassemble(&self, state: &mut JoinState) -> Option<Frame> {
        let buffer = state.buffer.take()?;
        let mut objects = std::mem::take(&mut state.results);
        for object in &mut objects {
            object.status = ObjectStatus::Done;
        }
        Some(Frame {
            frame_id: self.frame_id,
            buffer,
            pts: self.pts,
            objects,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JoinState> {
        self.state.lock().expect("frame join lock poisoned")
    }
}

/// Message from an inference task back to the stage collector.
pub(crate) struct Completion {
    pub(crate) inflight: Arc<InflightFrame>,
    pub(crate) index: usize,
    pub(crate) slot: usize,
    pub(crate) outcome: Result<ResultTensor>,
}

// ─── Stage core ─────────────────────────────────────────────────────────────

/// State shared by a stage's worker, collector, and in-flight tasks.
pub(crate) struct StageCore {
    pub(crate) name: String,
    pub(crate) logic: Arc<dyn StageLogic>,
    pub(crate) session: Option<Arc<dyn ModelSession>>,
    pub(crate) transform: Arc<dyn FrameTransform>,
    pub(crate) pool: Arc<RequestPool>,
    pub(crate) metrics: Arc<StageMetrics>,
    pub(crate) phase: PhaseCell,
    pub(crate) successors: Vec<FrameQueue>,
    pub(crate) cancel: CancellationToken,
    flush_requested: AtomicBool,
}

impl StageCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        logic: Arc<dyn StageLogic>,
        session: Option<Arc<dyn ModelSession>>,
        transform: Arc<dyn FrameTransform>,
        pool: Arc<RequestPool>,
        successors: Vec<FrameQueue>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            logic,
            session,
            transform,
            pool,
            metrics: Arc::new(StageMetrics::default()),
            phase: PhaseCell::new(),
            successors,
            cancel,
            flush_requested: AtomicBool::new(false),
        })
    }

    /// Final disposition of a joined frame: post-process through the stage
    /// kind, then forward (fan-out shares the buffer) or release.
    async fn dispose(&self, mut frame: Frame) {
        self.logic.post_process(&mut frame);

        if frame.objects.is_empty() {
            self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                stage = %self.name,
                frame_id = frame.frame_id,
                "no surviving objects, releasing frame"
            );
            frame.buffer.release();
            return;
        }
        if self.successors.is_empty() {
            debug!(
                stage = %self.name,
                frame_id = frame.frame_id,
                "stage has no downstream, dropping completed frame"
            );
            frame.buffer.release();
            return;
        }

        self.metrics.frames_forwarded.fetch_add(1, Ordering::Relaxed);
        let last = self.successors.len() - 1;
        for queue in &self.successors[..last] {
            self.send_or_drop(queue, frame.share()).await;
        }
        let queue = &self.successors[last];
        self.send_or_drop(queue, frame).await;
    }

    /// Forward with cancellation awareness: a stopping pipeline discards
    /// the frame (buffer released by drop) instead of wedging on a full
    /// queue whose consumer is gone.
    async fn send_or_drop(&self, queue: &FrameQueue, frame: Frame) {
        let frame_id = frame.frame_id;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(stage = %self.name, frame_id, "cancelled while forwarding, frame released");
            }
            sent = queue.send(FramePayload::Frame(frame)) => {
                if sent.is_err() {
                    debug!(stage = %self.name, frame_id, "downstream closed, frame released");
                }
            }
        }
    }

    async fn complete_now(&self, inflight: &Arc<InflightFrame>, index: usize, parsed: Vec<ObjectRecord>) {
        if let Some(frame) = inflight.complete(index, parsed) {
            self.dispose(frame).await;
        }
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────────

/// Stage worker loop: dequeue frames and dispatch their objects.  Exits on
/// cancellation, a flush sentinel, or a closed-and-empty input queue.
pub(crate) async fn stage_worker(
    core: Arc<StageCore>,
    mut input: FrameReceiver,
    completions: mpsc::Sender<Completion>,
) {
    core.phase.set(StagePhase::Running);
    debug!(stage = %core.name, "worker started");

    loop {
        let payload = tokio::select! {
            biased;
            _ = core.cancel.cancelled() => {
                debug!(stage = %core.name, "worker cancelled");
                break;
            }
            payload = input.recv() => match payload {
                Some(payload) => payload,
                None => {
                    debug!(stage = %core.name, "input queue closed");
                    break;
                }
            },
        };

        match payload {
            FramePayload::Flush => {
                debug!(stage = %core.name, "flush sentinel received");
                core.flush_requested.store(true, Ordering::Release);
                break;
            }
            FramePayload::Frame(frame) => {
                dispatch_frame(&core, frame, &completions).await;
            }
        }
    }

    core.phase.set(StagePhase::Stopping);
    // Discard whatever is still queued; buffers are released on drop.
    let mut discarded = 0usize;
    while let Some(payload) = input.try_recv() {
        if let FramePayload::Frame(frame) = payload {
            frame.buffer.release();
            discarded += 1;
        }
    }
    if discarded > 0 {
        debug!(stage = %core.name, discarded, "discarded queued frames on shutdown");
    }
    // Dropping `completions` here lets the collector drain to completion.
}

/// Split a frame into per-object work and issue it.  Never waits for an
/// inference to finish — only for the input queue (caller) and the request
/// pool (here).
async fn dispatch_frame(
    core: &Arc<StageCore>,
    frame: Frame,
    completions: &mpsc::Sender<Completion>,
) {
    let frame_id = frame.frame_id;
    let inflight = InflightFrame::new(frame);
    let count = inflight.pending_count();
    debug!(stage = %core.name, frame_id, objects = count, "dispatching frame");

    if count == 0 {
        // Pass-through join: complete immediately, no backend involvement.
        if let Some(done) = inflight.finish_empty() {
            core.dispose(done).await;
        }
        core.metrics.frames_processed.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let buffer = inflight.share_buffer();

    for index in 0..count {
        let Some(object) = inflight.source_object(index) else {
            break;
        };

        if !object.region.is_valid() {
            warn!(
                stage = %core.name,
                frame_id,
                object = index,
                region = ?object.region,
                "invalid crop geometry, degrading object"
            );
            core.metrics.objects_degraded.fetch_add(1, Ordering::Relaxed);
            core.complete_now(&inflight, index, Vec::new()).await;
            continue;
        }

        if !core.logic.validate_input(&object) {
            debug!(
                stage = %core.name,
                frame_id,
                object = index,
                "object rejected by stage kind"
            );
            core.metrics.objects_degraded.fetch_add(1, Ordering::Relaxed);
            core.complete_now(&inflight, index, Vec::new()).await;
            continue;
        }

        if !core.logic.uses_inference() {
            let produced = core.logic.process_direct(&object);
            core.complete_now(&inflight, index, produced).await;
            continue;
        }

        let Some(session) = core.session.clone() else {
            error!(stage = %core.name, "inference stage has no model session");
            core.metrics.objects_degraded.fetch_add(1, Ordering::Relaxed);
            core.complete_now(&inflight, index, Vec::new()).await;
            continue;
        };
        let Some(buffer) = buffer.as_ref() else {
            // Buffer already taken — only possible after a finished join.
            error!(stage = %core.name, frame_id, "frame buffer unavailable during dispatch");
            break;
        };

        let transform_start = Instant::now();
        let sample = core.transform.transform(buffer, None, object.region);
        core.metrics.transform_total_us.fetch_add(
            transform_start.elapsed().as_micros() as u64,
            Ordering::Relaxed,
        );
        let sample = match sample.and_then(|s| core.logic.build_sample(s, &object)) {
            Ok(sample) => sample,
            Err(err) => {
                warn!(
                    stage = %core.name,
                    frame_id,
                    object = index,
                    error = %err,
                    "transform failed, degrading object"
                );
                core.metrics.objects_degraded.fetch_add(1, Ordering::Relaxed);
                core.complete_now(&inflight, index, Vec::new()).await;
                continue;
            }
        };

        let dispatch_start = Instant::now();
        let slot = tokio::select! {
            biased;
            _ = core.cancel.cancelled() => {
                debug!(stage = %core.name, frame_id, "cancelled while waiting for a request slot");
                core.complete_now(&inflight, index, Vec::new()).await;
                continue;
            }
            slot = core.pool.acquire() => match slot {
                Ok(slot) => slot,
                Err(err) => {
                    error!(stage = %core.name, error = %err, "request pool unavailable");
                    core.complete_now(&inflight, index, Vec::new()).await;
                    continue;
                }
            },
        };

        core.metrics.inferences_total.fetch_add(1, Ordering::Relaxed);
        core.metrics
            .inferences_in_flight
            .fetch_add(1, Ordering::Relaxed);

        let tx = completions.clone();
        let task_inflight = inflight.clone();
        tokio::spawn(async move {
            let outcome = session.infer(sample).await;
            // The collector owns slot release and join accounting; if it is
            // gone the stage is already torn down.
            let _ = tx
                .send(Completion {
                    inflight: task_inflight,
                    index,
                    slot,
                    outcome,
                })
                .await;
        });
        core.metrics.dispatch_total_us.fetch_add(
            dispatch_start.elapsed().as_micros() as u64,
            Ordering::Relaxed,
        );
    }

    core.metrics.frames_processed.fetch_add(1, Ordering::Relaxed);
}

// ─── Collector ──────────────────────────────────────────────────────────────

/// Completion collector: parse results, release slots, evaluate joins.
/// Runs until every completion sender (worker + in-flight tasks) is gone,
/// which is exactly the point where all in-flight work has settled.
pub(crate) async fn stage_collector(core: Arc<StageCore>, mut rx: mpsc::Receiver<Completion>) {
    while let Some(completion) = rx.recv().await {
        let frame_id = completion.inflight.frame_id();
        let parsed = match completion.outcome {
            Ok(tensor) => match completion.inflight.source_object(completion.index) {
                Some(source) => match core.logic.parse_result(&tensor, &source) {
                    Ok(objects) => objects,
                    Err(err) => {
                        warn!(
                            stage = %core.name,
                            frame_id,
                            object = completion.index,
                            error = %err,
                            "result parse failed, degrading object"
                        );
                        core.metrics.objects_degraded.fetch_add(1, Ordering::Relaxed);
                        Vec::new()
                    }
                },
                None => Vec::new(),
            },
            Err(err) => {
                warn!(
                    stage = %core.name,
                    frame_id,
                    object = completion.index,
                    error = %err,
                    "inference failed, degrading object"
                );
                core.metrics.objects_degraded.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
        };

        if let Err(err) = core.pool.release(completion.slot) {
            error!(stage = %core.name, error = %err, "request slot release failed");
        }
        core.metrics
            .inferences_in_flight
            .fetch_sub(1, Ordering::Relaxed);

        core.complete_now(&completion.inflight, completion.index, parsed)
            .await;
    }

    // All in-flight completions are accounted; now it is safe to tell
    // downstream to drain.
    if core.flush_requested.load(Ordering::Acquire) {
        for queue in &core.successors {
            let _ = queue.send(FramePayload::Flush).await;
        }
    }
    core.phase.set(StagePhase::Stopped);
    debug!(stage = %core.name, "collector drained");
}

// ─── Sink ───────────────────────────────────────────────────────────────────

/// Terminal fan-in stage: merges every terminal branch into the output
/// queue.  Exits once all upstream branches have flushed (or on cancel).
pub(crate) async fn sink_worker(
    mut input: FrameReceiver,
    out: FrameQueue,
    expected_flushes: usize,
    cancel: CancellationToken,
) {
    let mut flushes = 0usize;
    loop {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            payload = input.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        match payload {
            FramePayload::Flush => {
                flushes += 1;
                if flushes >= expected_flushes {
                    let _ = out.send(FramePayload::Flush).await;
                    info!("sink drained after {flushes} branch flush(es)");
                    break;
                }
            }
            FramePayload::Frame(frame) => {
                let frame_id = frame.frame_id;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(frame_id, "sink cancelled, frame released");
                        break;
                    }
                    sent = out.send(FramePayload::Frame(frame)) => {
                        if sent.is_err() {
                            debug!(frame_id, "output consumer gone, frame released");
                        }
                    }
                }
            }
        }
    }
    // Release anything left behind on cancellation.
    while let Some(payload) = input.try_recv() {
        if let FramePayload::Frame(frame) = payload {
            frame.buffer.release();
        }
    }
}
