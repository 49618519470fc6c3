#![doc = include_str!("../README.md")]

pub mod config;
pub mod controller;
pub mod identity;
pub mod kinds;
pub mod request_pool;
pub mod synthetic;
pub mod topology;

mod graph;
mod stage;

pub use config::{PipelineSettings, SETTINGS_SCHEMA_VERSION, StageSettings};
pub use controller::PipelineController;
pub use identity::{DESCRIPTOR_LEN, Identity, IdentityMatcher, MatchOutcome};
pub use kinds::{StageLogic, StageRegistry};
pub use request_pool::{DEFAULT_POOL_CAPACITY, RequestPool};
pub use stage::{StageMetrics, StageMetricsSnapshot, StagePhase};
pub use topology::{
    Predecessor, StageDescriptor, SuccessorRef, chain_summary, parse_description,
};
