//! Object detection kind.
//!
//! Consumes one full-frame (or region) sample and fans it out into zero or
//! more detections.  The result tensor layout is row-major
//! `[class, score, x, y, w, h]` with box coordinates normalized to the
//! source region.

use vigil_core::{CropRect, ObjectRecord, PipelineError, Result, ResultTensor};

use super::StageLogic;

const ROW_LEN: usize = 6;

/// Class labels for the compact analytics model.  Out-of-range class ids
/// fall back to a numbered label.
const LABELS: [&str; 4] = ["person", "vehicle", "bicycle", "animal"];

pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;

pub struct DetectLogic {
    score_threshold: f32,
}

impl DetectLogic {
    pub fn new() -> Self {
        Self {
            score_threshold: DEFAULT_SCORE_THRESHOLD,
        }
    }

    pub fn with_threshold(score_threshold: f32) -> Self {
        Self { score_threshold }
    }
}

impl Default for DetectLogic {
    fn default() -> Self {
        Self::new()
    }
}

impl StageLogic for DetectLogic {
    fn kind(&self) -> &'static str {
        "detect"
    }

    fn parse_result(&self, tensor: &ResultTensor, source: &ObjectRecord) -> Result<Vec<ObjectRecord>> {
        if tensor.len() % ROW_LEN != 0 {
            return Err(PipelineError::MalformedTensor(format!(
                "detection tensor length {} is not a multiple of {ROW_LEN}",
                tensor.len()
            )));
        }

        let region = source.region;
        let mut detections = Vec::new();
        for row in tensor.values.chunks_exact(ROW_LEN) {
            let (class, score) = (row[0], row[1]);
            if score < self.score_threshold {
                continue;
            }
            let rect = denormalize(region, row[2], row[3], row[4], row[5]);
            if !rect.is_valid() {
                continue;
            }
            let mut object = ObjectRecord::new(rect);
            object.label = label_for(class as usize);
            object.score = score;
            detections.push(object);
        }
        Ok(detections)
    }
}

fn label_for(class: usize) -> String {
    LABELS
        .get(class)
        .map(|label| (*label).to_string())
        .unwrap_or_else(|| format!("class{class}"))
}

/// Map a normalized box back into absolute pixel coordinates, clamped to
/// the source region.
fn denormalize(region: CropRect, x: f32, y: f32, w: f32, h: f32) -> CropRect {
    let clamp01 = |v: f32| v.clamp(0.0, 1.0);
    let abs_x = region.x + (clamp01(x) * region.width as f32) as u32;
    let abs_y = region.y + (clamp01(y) * region.height as f32) as u32;
    let max_w = region.width.saturating_sub(abs_x - region.x);
    let max_h = region.height.saturating_sub(abs_y - region.y);
    CropRect::new(
        abs_x,
        abs_y,
        ((clamp01(w) * region.width as f32) as u32).min(max_w),
        ((clamp01(h) * region.height as f32) as u32).min(max_h),
    )
}
