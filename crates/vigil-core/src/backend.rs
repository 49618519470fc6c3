//! Inference backend contract — the asynchronous, capacity-bounded
//! collaborator that executes one model forward pass per object sample.
//!
//! The engine never sees tensors mid-flight: it hands a [`TensorSample`] to
//! [`ModelSession::infer`] and receives the completed [`ResultTensor`] (or
//! the error) as the future's output.  The backend guarantees eventual
//! completion for every accepted call; the pipeline's request pool bounds
//! how many calls are outstanding per stage.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ResultTensor, TensorSample};

/// Model input geometry as reported by the loaded network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputShape {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

/// A loaded model bound to one compute device.
#[async_trait]
pub trait ModelSession: Send + Sync {
    /// Input geometry the transform collaborator must produce.
    fn input_shape(&self) -> InputShape;

    /// Run one forward pass.  Non-blocking for the caller beyond awaiting
    /// the completion; concurrent calls up to the backend's own capacity
    /// are expected.
    async fn infer(&self, sample: TensorSample) -> Result<ResultTensor>;
}

impl std::fmt::Debug for dyn ModelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSession").finish_non_exhaustive()
    }
}

/// Factory for model sessions.
///
/// Failures here (`ModelNotFound`, `UnsupportedDevice`) are fatal at
/// pipeline construction and propagate to the caller.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn load_model(&self, model: &Path, device: &str) -> Result<Arc<dyn ModelSession>>;
}
