//! Pipeline lifecycle façade.
//!
//! Wraps a constructed [`PipelineGraph`] with create / start / stop /
//! submit / retrieve / flush / depth operations.  Frames leave the sink in
//! join-completion order, not submission order; a consumer that needs
//! strict ordering reorders on its side.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vigil_core::{
    Frame, FrameTransform, InferenceBackend, MediaBuffer, ObjectRecord, PipelineError, Result,
};

use crate::config::PipelineSettings;
use crate::graph::PipelineGraph;
use crate::kinds::StageRegistry;
use crate::stage::{
    FramePayload, FrameReceiver, StageMetricsSnapshot, StagePhase, sink_worker, stage_collector,
    stage_worker,
};
use crate::topology::{self, StageDescriptor};

pub struct PipelineController {
    graph: PipelineGraph,
    settings: PipelineSettings,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
    stopped: AtomicBool,
    /// Set once the flush sentinel has surfaced on the output queue.
    drained: AtomicBool,
    frame_seq: AtomicU64,
    out_rx: Mutex<FrameReceiver>,
}

impl std::fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineController")
            .field("started", &self.started)
            .field("stopped", &self.stopped)
            .field("drained", &self.drained)
            .field("frame_seq", &self.frame_seq)
            .finish_non_exhaustive()
    }
}

impl PipelineController {
    /// Parse the topology, load every model, and wire the graph.  All
    /// configuration failures surface here.
    pub async fn create(
        settings: PipelineSettings,
        registry: &StageRegistry,
        backend: Arc<dyn InferenceBackend>,
        transform: Arc<dyn FrameTransform>,
    ) -> Result<Self> {
        settings.validate()?;
        let descriptors = topology::parse_description(&settings.topology, registry)?;
        let cancel = CancellationToken::new();
        let mut graph = PipelineGraph::build(
            descriptors,
            registry,
            &settings,
            backend,
            transform,
            cancel.clone(),
        )
        .await?;

        let out_rx = graph
            .out_rx
            .take()
            .ok_or_else(|| PipelineError::InvariantViolation("output queue missing".into()))?;

        Ok(Self {
            graph,
            settings,
            cancel,
            tasks: Vec::new(),
            started: false,
            stopped: AtomicBool::new(false),
            drained: AtomicBool::new(false),
            frame_seq: AtomicU64::new(0),
            out_rx: Mutex::new(out_rx),
        })
    }

    /// Construct from a prebuilt descriptor array instead of a textual
    /// description.
    pub async fn create_from_descriptors(
        descriptors: Vec<StageDescriptor>,
        settings: PipelineSettings,
        registry: &StageRegistry,
        backend: Arc<dyn InferenceBackend>,
        transform: Arc<dyn FrameTransform>,
    ) -> Result<Self> {
        settings.validate()?;
        let cancel = CancellationToken::new();
        let mut graph = PipelineGraph::build(
            descriptors,
            registry,
            &settings,
            backend,
            transform,
            cancel.clone(),
        )
        .await?;
        let out_rx = graph
            .out_rx
            .take()
            .ok_or_else(|| PipelineError::InvariantViolation("output queue missing".into()))?;
        Ok(Self {
            graph,
            settings,
            cancel,
            tasks: Vec::new(),
            started: false,
            stopped: AtomicBool::new(false),
            drained: AtomicBool::new(false),
            frame_seq: AtomicU64::new(0),
            out_rx: Mutex::new(out_rx),
        })
    }

    /// Spawn every stage worker/collector pair and the sink.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(PipelineError::InvariantViolation(
                "pipeline already started".into(),
            ));
        }

        for node in &mut self.graph.stages {
            let input_rx = node.input_rx.take().ok_or_else(|| {
                PipelineError::InvariantViolation("stage input receiver missing".into())
            })?;
            let (completion_tx, completion_rx) =
                tokio::sync::mpsc::channel(self.settings.pool_capacity.max(1));

            self.tasks
                .push(tokio::spawn(stage_worker(node.core.clone(), input_rx, completion_tx)));
            self.tasks
                .push(tokio::spawn(stage_collector(node.core.clone(), completion_rx)));
        }

        let sink_rx = self.graph.sink_rx.take().ok_or_else(|| {
            PipelineError::InvariantViolation("sink receiver missing".into())
        })?;
        self.tasks.push(tokio::spawn(sink_worker(
            sink_rx,
            self.graph.out_queue.clone(),
            self.graph.sink_fan_in,
            self.cancel.clone(),
        )));

        self.started = true;
        info!(stages = self.graph.stages.len(), "pipeline started");
        Ok(())
    }

    /// Cancel all stages, wait for in-flight completions to drain, and log
    /// the per-stage summary.  Safe to call repeatedly.
    pub async fn stop(&mut self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();

        let mut panicked = 0usize;
        for task in self.tasks.drain(..) {
            if task.await.is_err() {
                panicked += 1;
            }
        }

        // Release completed frames nobody retrieved.
        {
            let mut rx = self.out_rx.lock().await;
            let mut unclaimed = 0usize;
            while let Some(payload) = rx.try_recv() {
                if let FramePayload::Frame(frame) = payload {
                    frame.buffer.release();
                    unclaimed += 1;
                }
            }
            if unclaimed > 0 {
                info!(unclaimed, "released unretrieved output frames");
            }
        }

        for node in &self.graph.stages {
            let snapshot = node.core.metrics.snapshot();
            info!(
                stage = %node.core.name,
                frames = snapshot.frames_processed,
                forwarded = snapshot.frames_forwarded,
                dropped = snapshot.frames_dropped,
                inferences = snapshot.inferences_total,
                degraded = snapshot.objects_degraded,
                transform_us = snapshot.transform_total_us,
                dispatch_us = snapshot.dispatch_total_us,
                "stage summary"
            );
        }

        if panicked > 0 {
            warn!(panicked, "stage tasks panicked during shutdown");
            return Err(PipelineError::InvariantViolation(format!(
                "{panicked} stage task(s) panicked"
            )));
        }
        Ok(())
    }

    /// Queue one buffer for processing.  Applies backpressure by suspending
    /// when the entry queue is full.  Returns the assigned frame id.
    pub async fn submit(&self, buffer: MediaBuffer, pts: Option<i64>) -> Result<u64> {
        let frame = self.seed_frame(buffer, pts);
        let frame_id = frame.frame_id;
        self.graph
            .entry_queue()
            .send(FramePayload::Frame(frame))
            .await?;
        Ok(frame_id)
    }

    /// Non-blocking submit; rejects with `QueueFull` under backpressure.
    pub fn try_submit(&self, buffer: MediaBuffer, pts: Option<i64>) -> Result<u64> {
        let frame = self.seed_frame(buffer, pts);
        let frame_id = frame.frame_id;
        self.graph
            .entry_queue()
            .try_send(FramePayload::Frame(frame))?;
        Ok(frame_id)
    }

    fn seed_frame(&self, buffer: MediaBuffer, pts: Option<i64>) -> Frame {
        let frame_id = self.frame_seq.fetch_add(1, Ordering::AcqRel);
        let seed = ObjectRecord::full_frame(buffer.width(), buffer.height());
        Frame {
            frame_id,
            buffer,
            pts,
            objects: vec![seed],
        }
    }

    /// Enqueue the drain sentinel at the entry.  It propagates stage by
    /// stage — each waits for its in-flight objects first — until the sink
    /// posts it to the output queue, waking any blocked consumer.
    pub async fn flush(&self) -> Result<()> {
        self.graph.entry_queue().send(FramePayload::Flush).await
    }

    /// Wait for the next completed frame.  `None` once the pipeline has
    /// flushed through or shut down.
    pub async fn next_output(&self) -> Option<Frame> {
        if self.drained.load(Ordering::Acquire) {
            return None;
        }
        let mut rx = self.out_rx.lock().await;
        match rx.recv().await {
            Some(FramePayload::Frame(frame)) => Some(frame),
            Some(FramePayload::Flush) | None => {
                self.drained.store(true, Ordering::Release);
                None
            }
        }
    }

    /// Non-blocking retrieve.  `None` when nothing is ready.
    pub fn try_retrieve(&self) -> Option<Frame> {
        let mut rx = self.out_rx.try_lock().ok()?;
        match rx.try_recv() {
            Some(FramePayload::Frame(frame)) => Some(frame),
            Some(FramePayload::Flush) => {
                self.drained.store(true, Ordering::Release);
                None
            }
            None => None,
        }
    }

    /// Depth of the entry stage's input queue.
    pub fn input_queue_depth(&self) -> usize {
        self.graph.entry_queue().depth()
    }

    /// Work currently anywhere in the pipeline: every queue plus in-flight
    /// inferences.
    pub fn total_depth(&self) -> usize {
        let queued: usize = self.graph.stages.iter().map(|node| node.input.depth()).sum();
        let in_flight: usize = self
            .graph
            .stages
            .iter()
            .map(|node| node.core.pool.in_flight())
            .sum();
        queued + in_flight + self.graph.out_queue.depth()
    }

    pub fn descriptors(&self) -> &[StageDescriptor] {
        &self.graph.descriptors
    }

    pub fn stage_phase(&self, instance: &str) -> Option<StagePhase> {
        self.graph
            .stages
            .iter()
            .find(|node| node.core.name == instance)
            .map(|node| node.core.phase.get())
    }

    pub fn stage_metrics(&self) -> Vec<(String, StageMetricsSnapshot)> {
        self.graph
            .stages
            .iter()
            .map(|node| (node.core.name.clone(), node.core.metrics.snapshot()))
            .collect()
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        // Best-effort: a dropped controller must not leave workers parked
        // on queues forever.
        self.cancel.cancel();
    }
}
