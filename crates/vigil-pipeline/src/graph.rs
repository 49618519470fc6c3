//! Graph construction: allocate one stage per descriptor plus the implicit
//! sink, load models, and wire the bounded queues together.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_core::{FrameTransform, InferenceBackend, Result};

use crate::config::PipelineSettings;
use crate::kinds::StageRegistry;
use crate::request_pool::RequestPool;
use crate::stage::{FrameQueue, FrameReceiver, StageCore, frame_channel};
use crate::topology::{self, StageDescriptor, SuccessorRef};

/// One constructed stage, ready to start.
pub(crate) struct StageNode {
    pub(crate) core: Arc<StageCore>,
    pub(crate) input: FrameQueue,
    /// Taken by the controller when the worker task is spawned.
    pub(crate) input_rx: Option<FrameReceiver>,
}

/// A fully wired, not-yet-running pipeline.
pub(crate) struct PipelineGraph {
    pub(crate) descriptors: Vec<StageDescriptor>,
    pub(crate) stages: Vec<StageNode>,
    pub(crate) entry: usize,
    pub(crate) sink_rx: Option<FrameReceiver>,
    pub(crate) sink_fan_in: usize,
    pub(crate) out_queue: FrameQueue,
    pub(crate) out_rx: Option<FrameReceiver>,
}

impl PipelineGraph {
    /// Build the runtime graph.  Model loading runs here, so every
    /// configuration failure (unknown kind, missing model, unsupported
    /// device) surfaces before a single frame is accepted.
    pub(crate) async fn build(
        descriptors: Vec<StageDescriptor>,
        registry: &StageRegistry,
        settings: &PipelineSettings,
        backend: Arc<dyn InferenceBackend>,
        transform: Arc<dyn FrameTransform>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        topology::validate_descriptors(&descriptors)?;
        let entry = topology::entry_index(&descriptors)?;

        let channels: Vec<_> = descriptors
            .iter()
            .map(|_| frame_channel(settings.queue_capacity))
            .collect();
        let (sink_queue, sink_rx) = frame_channel(settings.queue_capacity);
        let (out_queue, out_rx) = frame_channel(settings.queue_capacity);

        let mut stages = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            let instance = descriptor.instance_name().to_string();
            let logic = registry.create(&descriptor.kind)?;

            let session = if logic.uses_inference() {
                let model = settings.model_for(&instance);
                let device = settings.device_for(&instance);
                let session = backend.load_model(&model, &device).await?;
                let shape = session.input_shape();
                info!(
                    stage = %instance,
                    model = %model.display(),
                    device = %device,
                    input = format!("{}x{}x{}", shape.width, shape.height, shape.channels),
                    "model loaded"
                );
                Some(session)
            } else {
                debug!(stage = %instance, "direct-processing stage, no model");
                None
            };

            let successors: Vec<FrameQueue> = descriptor
                .successors
                .iter()
                .map(|successor| match successor {
                    SuccessorRef::Stage(next) => channels[*next].0.clone(),
                    SuccessorRef::SinkSlot(_) => sink_queue.clone(),
                })
                .collect();
            if successors.is_empty() {
                warn!(stage = %instance, "stage has no successors; completed frames will be dropped");
            }

            let core = StageCore::new(
                instance,
                logic,
                session,
                transform.clone(),
                Arc::new(RequestPool::new(settings.pool_capacity)),
                successors,
                cancel.clone(),
            );
            stages.push(StageNode {
                core,
                input: channels[descriptor.id].0.clone(),
                input_rx: None,
            });
        }

        // Hand each stage its receiver (kept aside so build stays simple).
        for (node, (_, rx)) in stages.iter_mut().zip(channels) {
            node.input_rx = Some(rx);
        }

        let sink_fan_in = topology::sink_fan_in(&descriptors).max(1);
        info!(chain = %topology::chain_summary(&descriptors), "pipeline constructed");

        Ok(Self {
            descriptors,
            stages,
            entry,
            sink_rx: Some(sink_rx),
            sink_fan_in,
            out_queue,
            out_rx: Some(out_rx),
        })
    }

    pub(crate) fn entry_queue(&self) -> &FrameQueue {
        &self.stages[self.entry].input
    }
}
