//! Classification kind.
//!
//! Runs one inference per object crop and rewrites the object's label and
//! confidence from the highest-scoring class.

use vigil_core::{ObjectRecord, PipelineError, Result, ResultTensor};

use super::StageLogic;

/// Class labels for the compact attribute model.
const LABELS: [&str; 6] = ["adult", "child", "car", "bus", "truck", "motorbike"];

pub struct ClassifyLogic {
    labels: Vec<String>,
}

impl ClassifyLogic {
    pub fn new() -> Self {
        Self {
            labels: LABELS.iter().map(|label| (*label).to_string()).collect(),
        }
    }

    pub fn with_labels(labels: Vec<String>) -> Self {
        Self { labels }
    }
}

impl Default for ClassifyLogic {
    fn default() -> Self {
        Self::new()
    }
}

impl StageLogic for ClassifyLogic {
    fn kind(&self) -> &'static str {
        "classify"
    }

    fn parse_result(&self, tensor: &ResultTensor, source: &ObjectRecord) -> Result<Vec<ObjectRecord>> {
        if tensor.is_empty() {
            return Err(PipelineError::MalformedTensor(
                "classification tensor is empty".into(),
            ));
        }

        let mut best = 0usize;
        for (index, value) in tensor.values.iter().enumerate() {
            if *value > tensor.values[best] {
                best = index;
            }
        }

        let mut object = source.clone();
        object.label = self
            .labels
            .get(best)
            .cloned()
            .unwrap_or_else(|| format!("class{best}"));
        object.score = tensor.values[best];
        Ok(vec![object])
    }
}
