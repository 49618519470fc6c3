//! Re-identification kind.
//!
//! Each object crop produces a 256-float appearance descriptor; the
//! post-join pass matches descriptors through the stage's
//! [`IdentityMatcher`] and applies the visibility filter.
//!
//! The filter is frame-wide on purpose: if *any* object in the frame fails
//! the stability gate, the whole result set is cleared, and a frame whose
//! every identity has already been surfaced is cleared as well.  Downstream
//! consumers rely on this all-or-nothing behavior; do not weaken it to
//! per-object filtering.

use std::sync::Mutex;

use tracing::debug;

use vigil_core::{Frame, ObjectRecord, PipelineError, Result, ResultTensor};

use super::StageLogic;
use crate::identity::{DESCRIPTOR_LEN, IdentityMatcher};

/// An identity must accrue this many hits before its objects surface.
pub const MIN_HITS_TO_SHOW: u32 = 10;

/// An identity with more total misses than this is considered unstable.
pub const MAX_MISSES_TO_SHOW: u32 = 15;

/// Minimum match similarity for a surfaced object.
pub const MIN_MATCH_CONFIDENCE: f32 = 0.95;

pub struct ReidLogic {
    matcher: Mutex<IdentityMatcher>,
    /// Frame-wide stability filter.  On by default; disabled only by tests
    /// that exercise raw matching.
    filter_unstable: bool,
}

impl ReidLogic {
    pub fn new() -> Self {
        Self {
            matcher: Mutex::new(IdentityMatcher::new()),
            filter_unstable: true,
        }
    }

    pub fn without_filter() -> Self {
        Self {
            matcher: Mutex::new(IdentityMatcher::new()),
            filter_unstable: false,
        }
    }

    pub fn identity_count(&self) -> usize {
        self.matcher.lock().expect("matcher lock poisoned").len()
    }
}

impl Default for ReidLogic {
    fn default() -> Self {
        Self::new()
    }
}

impl StageLogic for ReidLogic {
    fn kind(&self) -> &'static str {
        "reid"
    }

    fn parse_result(&self, tensor: &ResultTensor, source: &ObjectRecord) -> Result<Vec<ObjectRecord>> {
        if tensor.len() != DESCRIPTOR_LEN {
            return Err(PipelineError::MalformedTensor(format!(
                "descriptor length {} != {DESCRIPTOR_LEN}",
                tensor.len()
            )));
        }
        let mut object = source.clone();
        object.descriptor = Some(tensor.values.clone());
        Ok(vec![object])
    }

    fn post_process(&self, frame: &mut Frame) {
        let mut matcher = self.matcher.lock().expect("matcher lock poisoned");
        let frame_id = frame.frame_id;
        let frame_width = frame.buffer.width();
        let frame_height = frame.buffer.height();

        let mut filter_out = false;
        frame.objects.retain_mut(|object| {
            // The descriptor is consumed here; an object that somehow
            // arrived without one is removed outright.
            let Some(descriptor) = object.descriptor.take() else {
                debug!(frame_id, "object without descriptor removed");
                return false;
            };

            let outcome = matcher.match_descriptor(object.region, &descriptor);
            object.identity = Some(outcome.id);
            object.label = format!("id={}", outcome.id);
            object.score = outcome.similarity;

            if self.filter_unstable {
                if outcome.newly_created {
                    filter_out = true;
                } else if let Some(identity) = matcher.get(outcome.id) {
                    if identity.hit_count < MIN_HITS_TO_SHOW
                        || identity.miss_count > MAX_MISSES_TO_SHOW
                    {
                        filter_out = true;
                    }
                    if identity.rect.width < frame_width / 10
                        || identity.rect.height < frame_height / 4
                    {
                        filter_out = true;
                    }
                    if outcome.similarity < MIN_MATCH_CONFIDENCE {
                        filter_out = true;
                    }
                }
            }
            true
        });

        if self.filter_unstable {
            if filter_out {
                frame.objects.clear();
            } else {
                let mut all_shown = true;
                for object in &frame.objects {
                    if let Some(id) = object.identity {
                        all_shown &= matcher.is_shown(id);
                        matcher.mark_shown(id);
                    }
                }
                if all_shown {
                    frame.objects.clear();
                }
            }
        }

        matcher.age_step();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{BufferAudit, CropRect, MediaBuffer};

    fn descriptor(axis: usize) -> Vec<f32> {
        let mut d = vec![0.0f32; DESCRIPTOR_LEN];
        d[axis] = 1.0;
        d
    }

    fn frame_with(objects: Vec<ObjectRecord>) -> Frame {
        Frame {
            frame_id: 0,
            buffer: MediaBuffer::audited(640, 480, vec![0; 64], BufferAudit::new()),
            pts: None,
            objects,
        }
    }

    fn stable_object(axis: usize) -> ObjectRecord {
        // Big enough to clear the frame-fraction gate: >64 wide, >120 tall.
        let mut object = ObjectRecord::new(CropRect::new(100, 100, 200, 300));
        object.descriptor = Some(descriptor(axis));
        object
    }

    /// Run enough frames for an identity to clear the hit gate.
    fn warm_up(logic: &ReidLogic, axis: usize, frames: usize) {
        for _ in 0..frames {
            let mut frame = frame_with(vec![stable_object(axis)]);
            logic.post_process(&mut frame);
        }
    }

    #[test]
    fn parse_attaches_descriptor() {
        let logic = ReidLogic::new();
        let source = ObjectRecord::new(CropRect::new(0, 0, 10, 10));
        let parsed = logic
            .parse_result(&ResultTensor::new(descriptor(0)), &source)
            .unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].descriptor.as_ref().unwrap().len(), DESCRIPTOR_LEN);
    }

    #[test]
    fn wrong_descriptor_length_is_malformed() {
        let logic = ReidLogic::new();
        let source = ObjectRecord::new(CropRect::new(0, 0, 10, 10));
        let err = logic
            .parse_result(&ResultTensor::new(vec![0.0; 64]), &source)
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedTensor(_)));
    }

    #[test]
    fn new_identity_clears_the_whole_frame() {
        let logic = ReidLogic::new();
        let mut frame = frame_with(vec![stable_object(0)]);
        logic.post_process(&mut frame);
        assert!(frame.objects.is_empty(), "first sighting is filtered");
        assert_eq!(logic.identity_count(), 1, "but the identity is tracked");
    }

    #[test]
    fn one_unstable_object_clears_all_results() {
        let logic = ReidLogic::new();
        // Nine filtered sightings leave identity 0 one hit short of the
        // gate; the tenth would surface it.
        warm_up(&logic, 0, MIN_HITS_TO_SHOW as usize - 1);

        // A stable, known object plus a brand-new one in the same frame.
        let mut frame = frame_with(vec![stable_object(0), stable_object(128)]);
        logic.post_process(&mut frame);
        assert!(
            frame.objects.is_empty(),
            "the new identity must clear the stable one too"
        );
    }

    #[test]
    fn stable_identity_surfaces_then_suppresses_when_shown() {
        let logic = ReidLogic::new();
        warm_up(&logic, 0, MIN_HITS_TO_SHOW as usize - 1);

        let mut frame = frame_with(vec![stable_object(0)]);
        logic.post_process(&mut frame);
        assert_eq!(frame.objects.len(), 1, "stable identity surfaces");
        assert_eq!(frame.objects[0].label, "id=0");
        assert!(frame.objects[0].descriptor.is_none(), "descriptor consumed");

        let mut again = frame_with(vec![stable_object(0)]);
        logic.post_process(&mut again);
        assert!(
            again.objects.is_empty(),
            "an all-shown frame is cleared"
        );
    }

    #[test]
    fn missing_descriptor_removes_only_that_object() {
        let logic = ReidLogic::without_filter();
        let bare = ObjectRecord::new(CropRect::new(0, 0, 100, 200));
        let mut frame = frame_with(vec![bare, stable_object(0)]);
        logic.post_process(&mut frame);
        assert_eq!(frame.objects.len(), 1);
        assert_eq!(frame.objects[0].identity, Some(0));
    }

    #[test]
    fn small_objects_are_filtered_even_when_stable() {
        let logic = ReidLogic::new();
        // Warm up with a rect below the frame-fraction gate (height < 120).
        for _ in 0..MIN_HITS_TO_SHOW as usize + 2 {
            let mut object = ObjectRecord::new(CropRect::new(0, 0, 30, 40));
            object.descriptor = Some(descriptor(0));
            let mut frame = frame_with(vec![object]);
            logic.post_process(&mut frame);
            assert!(frame.objects.is_empty());
        }
    }
}
