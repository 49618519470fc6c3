#![doc = include_str!("../README.md")]

pub mod backend;
pub mod buffer;
pub mod error;
pub mod transform;
pub mod types;

pub use backend::{InferenceBackend, InputShape, ModelSession};
pub use buffer::{BufferAudit, MediaBuffer};
pub use error::{PipelineError, Result};
pub use transform::FrameTransform;
pub use types::{CropRect, Frame, ObjectRecord, ObjectStatus, ResultTensor, TensorSample};
