//! Deterministic synthetic collaborators.
//!
//! Stand-ins for the real transform and inference backend, used by the CLI
//! demo runner and the integration tests.  Outputs are seeded from an
//! FNV-1a hash of the sample so runs are reproducible without any model
//! files or devices.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use vigil_core::{
    BufferAudit, CropRect, FrameTransform, InferenceBackend, InputShape, MediaBuffer, ModelSession,
    PipelineError, Result, ResultTensor, TensorSample,
};

use crate::identity::DESCRIPTOR_LEN;

/// Deterministic FNV-1a 64-bit hash.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Devices the synthetic backend pretends to support.
const KNOWN_DEVICES: [&str; 3] = ["cpu", "gpu", "vpu"];

// ─── Transform ──────────────────────────────────────────────────────────────

/// Crop-validating transform producing a compact deterministic sample.
pub struct SyntheticTransform;

impl FrameTransform for SyntheticTransform {
    fn transform(
        &self,
        buffer: &MediaBuffer,
        _secondary: Option<&MediaBuffer>,
        crop: CropRect,
    ) -> Result<TensorSample> {
        if !crop.is_valid()
            || crop.x + crop.width > buffer.width()
            || crop.y + crop.height > buffer.height()
        {
            return Err(PipelineError::InvalidRegion {
                x: crop.x,
                y: crop.y,
                width: crop.width,
                height: crop.height,
            });
        }

        // A real transform would convert and crop pixels; a stable
        // fingerprint of (content, crop) is enough to key inference on.
        let mut seed = buffer.data().to_vec();
        seed.extend_from_slice(&crop.x.to_le_bytes());
        seed.extend_from_slice(&crop.y.to_le_bytes());
        seed.extend_from_slice(&crop.width.to_le_bytes());
        seed.extend_from_slice(&crop.height.to_le_bytes());
        Ok(TensorSample {
            data: fnv1a(&seed).to_le_bytes().to_vec(),
            width: crop.width,
            height: crop.height,
            channels: 3,
        })
    }
}

// ─── Backend ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
enum SyntheticModel {
    Detection,
    Classification,
    Descriptor,
}

/// Backend whose sessions emit plausible deterministic tensors.
///
/// The model path's file name selects the output family: names containing
/// `reid` produce descriptors, `classify` class probabilities, anything
/// else detection rows — which lines up with the conventional
/// `models/<stage>.model` default binding.
pub struct SyntheticBackend {
    latency: Duration,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self {
            latency: Duration::from_micros(500),
        }
    }

    /// Fixed per-inference latency, for demos that want visible queueing.
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBackend for SyntheticBackend {
    async fn load_model(&self, model: &Path, device: &str) -> Result<Arc<dyn ModelSession>> {
        if !KNOWN_DEVICES.contains(&device) {
            return Err(PipelineError::UnsupportedDevice(device.to_string()));
        }
        let name = model
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let family = if name.contains("reid") {
            SyntheticModel::Descriptor
        } else if name.contains("classify") {
            SyntheticModel::Classification
        } else {
            SyntheticModel::Detection
        };
        debug!(model = %model.display(), device, ?family, "synthetic model loaded");
        Ok(Arc::new(SyntheticSession {
            family,
            latency: self.latency,
        }))
    }
}

struct SyntheticSession {
    family: SyntheticModel,
    latency: Duration,
}

#[async_trait]
impl ModelSession for SyntheticSession {
    fn input_shape(&self) -> InputShape {
        InputShape {
            width: 64,
            height: 64,
            channels: 3,
        }
    }

    async fn infer(&self, sample: TensorSample) -> Result<ResultTensor> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let seed = fnv1a(&sample.data);
        let values = match self.family {
            SyntheticModel::Detection => detection_rows(seed),
            SyntheticModel::Classification => class_probabilities(seed),
            SyntheticModel::Descriptor => unit_descriptor(seed),
        };
        Ok(ResultTensor::new(values))
    }
}

/// Simple LCG over the seed; good enough for stable pseudo-tensors.
fn next(state: &mut u64) -> f32 {
    *state = state
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    ((*state >> 33) as f32) / (u32::MAX as f32 / 2.0)
}

fn detection_rows(seed: u64) -> Vec<f32> {
    let mut state = seed;
    let count = (seed % 3 + 1) as usize;
    let mut rows = Vec::with_capacity(count * 6);
    for i in 0..count {
        let jitter = next(&mut state) * 0.05;
        rows.extend_from_slice(&[
            (seed.wrapping_add(i as u64) % 4) as f32, // class
            0.75 + jitter,                            // score
            0.1 + 0.2 * i as f32,                     // x
            0.1 + jitter,                             // y
            0.25,                                     // w
            0.5,                                      // h
        ]);
    }
    rows
}

fn class_probabilities(seed: u64) -> Vec<f32> {
    let mut state = seed;
    let mut values: Vec<f32> = (0..6).map(|_| next(&mut state) * 0.2).collect();
    values[(seed % 6) as usize] = 0.9;
    values
}

fn unit_descriptor(seed: u64) -> Vec<f32> {
    let mut state = seed;
    let mut values: Vec<f32> = (0..DESCRIPTOR_LEN).map(|_| next(&mut state) - 1.0).collect();
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut values {
            *value /= norm;
        }
    }
    values
}

// ─── Frames ─────────────────────────────────────────────────────────────────

/// Audited buffer with a deterministic per-sequence pixel pattern.
pub fn synthetic_buffer(audit: &Arc<BufferAudit>, width: u32, height: u32, seq: u64) -> MediaBuffer {
    let len = (width as usize * height as usize * 3) / 2;
    let data: Vec<u8> = (0..len)
        .map(|i| (i as u64).wrapping_add(seq.wrapping_mul(131)) as u8)
        .collect();
    MediaBuffer::audited(width, height, data, audit.clone())
}
