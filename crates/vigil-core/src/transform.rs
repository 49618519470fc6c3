//! Image transform contract — the colorspace/crop collaborator that turns a
//! region of a raw media buffer into a backend-ready sample.

use crate::buffer::MediaBuffer;
use crate::error::Result;
use crate::types::{CropRect, TensorSample};

/// Crop + colorspace conversion boundary.
///
/// `secondary` carries an auxiliary plane/buffer when the source format
/// splits frames across two allocations; most sources pass `None`.
/// Expected failure modes are `InvalidRegion` and `BackendUnavailable`;
/// both degrade only the object being dispatched.
pub trait FrameTransform: Send + Sync {
    fn transform(
        &self,
        buffer: &MediaBuffer,
        secondary: Option<&MediaBuffer>,
        crop: CropRect,
    ) -> Result<TensorSample>;
}
