//! High-level deployment API.
//!
//! This module provides the public interface that wires together discovery,
//! the status sink, and the stage executor. It is the primary entry point
//! for external users and for the CLI.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use uuid::Uuid;

use crate::discovery::tracker::DirectoryTracker;
use crate::engine::stage::StageExecutor;

pub use crate::config::{DeployConfig, DeployConfigBuilder, RegionDeployType};
pub use crate::discovery::plan::{Plan, Step, Track};
pub use crate::engine::output::{
    ExecutedStep, ExecutionOutput, RegionExecution, Stage, TrackOutput, TrackState,
};
pub use crate::status::sink::{ExecutionRecord, InMemoryStatusSink, StatusSink};
pub use crate::steps::runner::{
    ExecContext, Runner, StepOutput, StepStatus, StepTestOutput, VariableMap,
};

/// Arguments for running one deployment stage
#[derive(Debug, Clone)]
pub struct DeployArgs {
    /// Root of the deployment repository.
    pub root: PathBuf,
    /// Project name, used in stable step identifiers.
    pub project: String,
    /// The single region for primary executions.
    pub primary_region: String,
    /// Regions for regional executions.
    pub regional_regions: Vec<String>,
    /// Step identifiers to target; empty targets nothing unless
    /// `target_all` is set.
    pub steps: Vec<String>,
    pub target_all: bool,
    /// Destroy everything after a successful deploy pass.
    pub self_destroy: bool,
    /// Plan only: disables step tests and the destroy pass.
    pub dry_run: bool,
}

/// Run one deployment stage with the specified arguments.
///
/// Discovers tracks under `<root>/tracks/`, deploys the pre-track first,
/// fans the remaining tracks out in parallel, and (when requested) runs the
/// symmetric destroy pass.
///
/// # Example
///
/// ```no_run
/// use iac_track_runner::runner::{run_deploy, DeployArgs};
///
/// # async fn example() -> anyhow::Result<()> {
/// let stage = run_deploy(DeployArgs {
///     root: ".".into(),
///     project: "payments".to_string(),
///     primary_region: "us-east-1".to_string(),
///     regional_regions: vec!["us-east-2".to_string(), "us-west-2".to_string()],
///     steps: Vec::new(),
///     target_all: true,
///     self_destroy: false,
///     dry_run: false,
/// })
/// .await?;
/// assert!(!stage.has_failures());
/// # Ok(())
/// # }
/// ```
pub async fn run_deploy(args: DeployArgs) -> Result<Stage> {
    let cfg = DeployConfigBuilder::default()
        .project(args.project)
        .primary_region(args.primary_region)
        .regional_regions(args.regional_regions)
        .step_whitelist(args.steps)
        .target_all(args.target_all)
        .self_destroy(args.self_destroy)
        .dry_run(args.dry_run)
        .build()?;

    let run_id = Uuid::new_v4();
    info!(%run_id, project = %cfg.project, "starting deployment stage");

    let sink = Arc::new(InMemoryStatusSink::new());
    let tracker = DirectoryTracker::new(args.root);
    let executor = StageExecutor::new(Arc::new(cfg), sink, tracker);

    let stage = executor.execute_tracks().await?;
    info!(%run_id, "deployment stage complete");
    Ok(stage)
}
