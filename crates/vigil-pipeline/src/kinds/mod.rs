//! Stage kinds and the name→kind registry.
//!
//! The generic dispatch/join engine in [`crate::stage`] is shared by every
//! stage; what differs per kind — input validation, sample preparation,
//! result interpretation, and the post-join pass — lives behind
//! [`StageLogic`].  Kinds are resolved by name at construction time through
//! an explicit [`StageRegistry`] value passed into the graph builder; there
//! is no global registrar.

use std::collections::BTreeMap;
use std::sync::Arc;

use vigil_core::{Frame, ObjectRecord, PipelineError, Result, ResultTensor, TensorSample};

mod classify;
mod detect;
mod reid;
mod track;

pub use classify::ClassifyLogic;
pub use detect::DetectLogic;
pub use reid::ReidLogic;
pub use track::TrackLogic;

/// Behavior supplied by one stage kind.  All methods may be called from the
/// stage worker or its completion collector concurrently with other frames,
/// so implementations guard their own state.
impl std::fmt::Debug for dyn StageLogic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageLogic")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

pub trait StageLogic: Send + Sync {
    /// Registry name of this kind.
    fn kind(&self) -> &'static str;

    /// Whether objects of this stage run a backend inference.  Kinds that
    /// return `false` are processed synchronously on the worker via
    /// [`process_direct`](Self::process_direct).
    fn uses_inference(&self) -> bool {
        true
    }

    /// Kind-specific gate evaluated after the geometry check.  Rejected
    /// objects are degraded (marked done with no result), not errors.
    fn validate_input(&self, _object: &ObjectRecord) -> bool {
        true
    }

    /// Last touch on a transformed sample before it is handed to the
    /// backend.
    fn build_sample(&self, sample: TensorSample, _object: &ObjectRecord) -> Result<TensorSample> {
        Ok(sample)
    }

    /// Interpret one inference result.  May emit zero, one, or many
    /// objects (a detector fans a full-frame sample out into detections).
    fn parse_result(&self, _tensor: &ResultTensor, _source: &ObjectRecord) -> Result<Vec<ObjectRecord>> {
        Err(PipelineError::InvariantViolation(format!(
            "stage kind `{}` does not consume inference results",
            self.kind()
        )))
    }

    /// Synchronous per-object processing for non-inference kinds.
    fn process_direct(&self, _object: &ObjectRecord) -> Vec<ObjectRecord> {
        Vec::new()
    }

    /// Runs once per frame after the join completes, before the frame is
    /// forwarded or released.  May rewrite or clear the result list.
    fn post_process(&self, _frame: &mut Frame) {}
}

type KindFactory = dyn Fn() -> Arc<dyn StageLogic> + Send + Sync;

/// Explicit name→kind factory table.
///
/// Factories rather than instances: stateful kinds (tracking,
/// re-identification) need a fresh state per stage node.
pub struct StageRegistry {
    factories: BTreeMap<String, Box<KindFactory>>,
}

impl StageRegistry {
    /// Empty registry, for callers wiring a fully custom kind set.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry preloaded with the built-in kinds.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("detect", || Arc::new(DetectLogic::new()));
        registry.register("track", || Arc::new(TrackLogic::new()));
        registry.register("classify", || Arc::new(ClassifyLogic::new()));
        registry.register("reid", || Arc::new(ReidLogic::new()));
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn StageLogic> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate a kind; unresolvable names are a construction error.
    pub fn create(&self, name: &str) -> Result<Arc<dyn StageLogic>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| PipelineError::UnknownStageKind(name.to_string()))
    }

    pub fn kind_names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_kinds_resolve() {
        let registry = StageRegistry::with_builtins();
        for kind in ["detect", "track", "classify", "reid"] {
            assert!(registry.contains(kind));
            assert_eq!(registry.create(kind).unwrap().kind(), kind);
        }
    }

    #[test]
    fn unknown_kind_is_a_hard_error() {
        let registry = StageRegistry::with_builtins();
        let err = registry.create("segment").unwrap_err();
        assert!(matches!(err, PipelineError::UnknownStageKind(name) if name == "segment"));
    }

    #[test]
    fn custom_registration_shadows_nothing() {
        let mut registry = StageRegistry::with_builtins();
        registry.register("blur", || Arc::new(TrackLogic::new()));
        assert!(registry.contains("blur"));
        assert_eq!(registry.kind_names().len(), 5);
    }
}
