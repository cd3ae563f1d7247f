//! The track execution engine: stage, track, and region executors

pub mod output;
pub mod region;
pub mod stage;
pub mod track;

use std::sync::Arc;

use crate::config::DeployConfig;
use crate::status::sink::StatusSink;

pub use output::{ExecutedStep, ExecutionOutput, RegionExecution, Stage, TrackOutput, TrackState};
pub use stage::StageExecutor;

/// Collaborators threaded through every executor task
#[derive(Clone)]
pub(crate) struct EngineContext {
    pub cfg: Arc<DeployConfig>,
    pub sink: Arc<dyn StatusSink>,
}
