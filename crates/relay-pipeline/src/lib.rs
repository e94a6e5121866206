//! Relay Pipeline - the seven-step request/response transformation chain
//!
//! A request entering the executor passes through a fixed chain: protocol
//! switch, workflow, and compatibility transforms on the way in, the
//! provider call in the middle, and the mirrored transforms on the way out.
//! Each step is timed, recorded, and bounded by a timeout; the provider step
//! alone reports its outcome to the health store. The registry owns module
//! instances behind a typed factory table, and assemblies are validated with
//! a topological walk before anything is wired.

use std::time::Duration;

pub mod assembly;
pub mod executor;
pub mod modules;
pub mod registry;
pub mod stream;

pub use assembly::{Connection, ModuleNode, PipelineAssembly, WiredPipeline};
pub use executor::{PipelineExecutor, PipelineOutcome, StepRecord};
pub use modules::{BufferingWorkflow, FieldMap, FieldMapCompatibility, StandardSwitch};
pub use registry::{register_builtin_factories, ModuleConfig, ModuleFactory, ModuleRegistry};
pub use stream::StepMarker;

/// Executor timing configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Budget for each non-provider step.
    pub step_timeout: Duration,
    /// Budget for the provider call.
    pub provider_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(10),
            provider_timeout: Duration::from_secs(30),
        }
    }
}
