//! Frame and object data model.
//!
//! A [`Frame`] is the unit of pipeline work: one media buffer plus the
//! object list produced by the stages it has passed so far.  Stages snapshot
//! the object list at dispatch time; the list carried here is always the
//! *output* of the previous stage.

use serde::{Deserialize, Serialize};

use crate::buffer::MediaBuffer;

/// Axis-aligned crop rectangle in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Geometry contract: a dispatchable region has non-zero extent.
    /// Origin coordinates are unsigned by construction.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Completion state of one object within a frame pass.
///
/// Flips to `Done` exactly once, by whichever context finishes the object
/// (completion collector, or the dispatcher for degraded objects).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ObjectStatus {
    #[default]
    Pending,
    Done,
}

/// One detected/tracked entity within a frame.
#[derive(Clone, Debug)]
pub struct ObjectRecord {
    /// Region of the source image this object occupies.
    pub region: CropRect,
    pub label: String,
    pub score: f32,
    /// Identity assigned by a tracking or re-identification stage.
    pub identity: Option<u64>,
    /// Owned feature payload (e.g. a re-id descriptor), held until the
    /// consuming stage takes and clears it.
    pub descriptor: Option<Vec<f32>>,
    pub status: ObjectStatus,
}

impl ObjectRecord {
    pub fn new(region: CropRect) -> Self {
        Self {
            region,
            label: String::new(),
            score: 0.0,
            identity: None,
            descriptor: None,
            status: ObjectStatus::Pending,
        }
    }

    /// Seed object covering the whole frame, queued with every submitted
    /// buffer so the first stage has one work item to run on.
    pub fn full_frame(width: u32, height: u32) -> Self {
        Self::new(CropRect::new(0, 0, width, height))
    }
}

/// One unit of pipeline work.
#[derive(Debug)]
pub struct Frame {
    /// Monotonically increasing id assigned at submit time.
    pub frame_id: u64,
    /// Exclusively owned media handle.  Released exactly once — either by
    /// forwarding the frame out of the pipeline or by dropping it.
    pub buffer: MediaBuffer,
    /// Optional presentation timestamp in microseconds.
    pub pts: Option<i64>,
    /// Objects produced by the stage this frame last completed.
    pub objects: Vec<ObjectRecord>,
}

impl Frame {
    /// Duplicate this frame for tree fan-out.  The object list is cloned;
    /// the media buffer is *shared* through its explicit ref-counted
    /// wrapper, never duplicated.
    pub fn share(&self) -> Frame {
        Frame {
            frame_id: self.frame_id,
            buffer: self.buffer.share(),
            pts: self.pts,
            objects: self.objects.clone(),
        }
    }
}

/// A transformed, backend-ready sample for one object crop.
#[derive(Clone, Debug)]
pub struct TensorSample {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

/// Raw inference output for one sample.  Stage kinds own the interpretation.
#[derive(Clone, Debug)]
pub struct ResultTensor {
    pub values: Vec<f32>,
}

impl ResultTensor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferAudit;

    #[test]
    fn zero_extent_regions_are_invalid() {
        assert!(!CropRect::new(0, 0, 0, 10).is_valid());
        assert!(!CropRect::new(5, 5, 10, 0).is_valid());
        assert!(CropRect::new(5, 5, 1, 1).is_valid());
    }

    #[test]
    fn full_frame_seed_covers_buffer_extent() {
        let obj = ObjectRecord::full_frame(640, 480);
        assert_eq!(obj.region, CropRect::new(0, 0, 640, 480));
        assert_eq!(obj.status, ObjectStatus::Pending);
    }

    #[test]
    fn shared_frames_reference_one_buffer() {
        let audit = BufferAudit::new();
        let frame = Frame {
            frame_id: 7,
            buffer: MediaBuffer::audited(16, 16, vec![0; 384], audit.clone()),
            pts: Some(40_000),
            objects: vec![ObjectRecord::full_frame(16, 16)],
        };
        let copy = frame.share();
        assert_eq!(copy.frame_id, 7);
        assert_eq!(audit.created(), 1);
        drop(frame);
        assert_eq!(audit.live(), 1, "shared handle keeps the buffer alive");
        drop(copy);
        assert_eq!(audit.live(), 0);
    }
}
