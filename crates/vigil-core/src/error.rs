//! Engine-wide error taxonomy.
//!
//! Construction-time failures (topology, settings, model loading) are hard
//! errors returned to the caller.  Per-object failures during streaming are
//! *not* represented here as control flow — stages degrade the affected
//! object and continue — but the variants below name those failure causes
//! so collaborators can report them uniformly.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used across all vigil crates.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// All error conditions surfaced by the engine and its collaborators.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed topology description or descriptor set.
    #[error("topology error: {0}")]
    Topology(String),

    /// A stage kind name could not be resolved through the registry.
    #[error("unknown stage kind `{0}`")]
    UnknownStageKind(String),

    /// Invalid or inconsistent pipeline settings document.
    #[error("settings error: {0}")]
    Settings(String),

    /// Model file missing at load time.  Fatal at construction.
    #[error("model not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    /// The backend does not support the requested compute device.
    #[error("unsupported compute device `{0}`")]
    UnsupportedDevice(String),

    /// Crop rectangle fails the geometry contract (width > 0, height > 0,
    /// fully inside the source image).
    #[error("invalid crop region ({x},{y}) {width}x{height}")]
    InvalidRegion {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    /// Image transform collaborator failed for one object.
    #[error("transform failed: {0}")]
    Transform(String),

    /// The transform or inference backend is not reachable.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Inference call failed for one object.
    #[error("inference failed: {0}")]
    Inference(String),

    /// A result tensor did not match the shape the stage kind expects.
    #[error("malformed result tensor: {0}")]
    MalformedTensor(String),

    /// A request-pool slot was released while already free.
    #[error("request slot {0} released while free")]
    SlotNotAcquired(usize),

    /// An inter-stage or output channel closed underneath a send.
    #[error("channel closed")]
    ChannelClosed,

    /// Non-blocking submit found the input queue full.
    #[error("input queue full")]
    QueueFull,

    /// An internal consistency check failed.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
