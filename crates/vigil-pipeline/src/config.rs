//! Pipeline settings document.
//!
//! Loaded from JSON with an explicit schema version so stale documents fail
//! loudly at construction instead of misconfiguring a running pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use vigil_core::{PipelineError, Result};

use crate::request_pool::DEFAULT_POOL_CAPACITY;

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

/// Default bound for every inter-stage queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 8;

/// Default compute device identifier handed to the inference backend.
pub const DEFAULT_DEVICE: &str = "cpu";

/// Topology used when a settings document does not name one.
pub const DEFAULT_TOPOLOGY: &str = "detect ! track ! classify";

/// Per-stage model binding, keyed by the stage's instance name.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StageSettings {
    /// Model file loaded through the inference backend.  When omitted, a
    /// conventional `models/<stage>.model` path is used — real backends
    /// will fail loudly if nothing is there.
    #[serde(default)]
    pub model: Option<PathBuf>,
    /// Target compute device identifier.
    #[serde(default)]
    pub device: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub settings_schema_version: u32,
    #[serde(default = "default_topology")]
    pub topology: String,
    #[serde(default)]
    pub stages: BTreeMap<String, StageSettings>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
}

fn default_topology() -> String {
    DEFAULT_TOPOLOGY.to_string()
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            settings_schema_version: SETTINGS_SCHEMA_VERSION,
            topology: default_topology(),
            stages: BTreeMap::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl PipelineSettings {
    /// Settings with the given topology and everything else defaulted.
    pub fn with_topology(topology: impl Into<String>) -> Self {
        Self {
            topology: topology.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(data: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(data)
            .map_err(|err| PipelineError::Settings(format!("invalid settings JSON: {err}")))?;

        let Some(version_value) = value.get("settings_schema_version") else {
            return Err(PipelineError::Settings(format!(
                "settings schema mismatch: expected {SETTINGS_SCHEMA_VERSION}, got missing"
            )));
        };
        let Some(version) = version_value.as_u64() else {
            return Err(PipelineError::Settings(format!(
                "settings schema mismatch: expected {SETTINGS_SCHEMA_VERSION}, got non-integer"
            )));
        };
        if version != SETTINGS_SCHEMA_VERSION as u64 {
            return Err(PipelineError::Settings(format!(
                "settings schema mismatch: expected {SETTINGS_SCHEMA_VERSION}, got {version}"
            )));
        }

        let settings: Self = serde_json::from_value(value)
            .map_err(|err| PipelineError::Settings(format!("invalid settings JSON: {err}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            PipelineError::Settings(format!(
                "failed to read settings from {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<()> {
        if self.topology.trim().is_empty() {
            return Err(PipelineError::Settings("topology is empty".into()));
        }
        if self.queue_capacity == 0 {
            return Err(PipelineError::Settings("queue_capacity must be > 0".into()));
        }
        if self.pool_capacity == 0 {
            return Err(PipelineError::Settings("pool_capacity must be > 0".into()));
        }
        Ok(())
    }

    /// Model path for a stage instance, falling back to the conventional
    /// location.
    pub fn model_for(&self, instance: &str) -> PathBuf {
        self.stages
            .get(instance)
            .and_then(|s| s.model.clone())
            .unwrap_or_else(|| PathBuf::from(format!("models/{instance}.model")))
    }

    /// Device identifier for a stage instance.
    pub fn device_for(&self, instance: &str) -> String {
        self.stages
            .get(instance)
            .and_then(|s| s.device.clone())
            .unwrap_or_else(|| DEFAULT_DEVICE.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = PipelineSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.topology, DEFAULT_TOPOLOGY);
        assert_eq!(settings.pool_capacity, 4);
    }

    #[test]
    fn json_round_trip() {
        let raw = format!(
            r#"{{
              "settings_schema_version": {SETTINGS_SCHEMA_VERSION},
              "topology": "detect ! reid",
              "stages": {{
                "detect": {{ "model": "models/det.onnx", "device": "vpu" }},
                "reid": {{ "model": "models/reid.onnx" }}
              }},
              "queue_capacity": 4,
              "pool_capacity": 2
            }}"#
        );
        let settings = PipelineSettings::from_json_str(&raw).unwrap();
        assert_eq!(settings.topology, "detect ! reid");
        assert_eq!(settings.queue_capacity, 4);
        assert_eq!(settings.model_for("detect"), PathBuf::from("models/det.onnx"));
        assert_eq!(settings.device_for("detect"), "vpu");
        assert_eq!(settings.device_for("reid"), DEFAULT_DEVICE);
    }

    #[test]
    fn missing_schema_version_fails() {
        let err = PipelineSettings::from_json_str(r#"{"topology": "detect"}"#).unwrap_err();
        assert!(err.to_string().contains("schema mismatch"));
    }

    #[test]
    fn schema_version_mismatch_fails() {
        let raw = format!(
            r#"{{"settings_schema_version": {}}}"#,
            SETTINGS_SCHEMA_VERSION + 1
        );
        let err = PipelineSettings::from_json_str(&raw).unwrap_err();
        assert!(err.to_string().contains("schema mismatch"));
    }

    #[test]
    fn zero_capacities_fail_validation() {
        let raw = format!(
            r#"{{"settings_schema_version": {SETTINGS_SCHEMA_VERSION}, "queue_capacity": 0}}"#
        );
        assert!(PipelineSettings::from_json_str(&raw).is_err());
    }

    #[test]
    fn unbound_stage_falls_back_to_conventional_model_path() {
        let settings = PipelineSettings::default();
        assert_eq!(
            settings.model_for("classify"),
            PathBuf::from("models/classify.model")
        );
    }
}
