use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::config::RegionDeployType;

/// Output variables across steps: step-key -> (variable name -> value).
///
/// Keys are the plain step name for primary outputs, `<step>-regional` for
/// regional outputs, and `pretrack-<stepKey>` for pre-track injections, so
/// the namespaces never collide.
pub type VariableMap = HashMap<String, HashMap<String, String>>;

/// Terminal status of one step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepStatus {
    Success,
    Fail,
    /// Not run because of an earlier failure in this region, in the paired
    /// primary region, or during destroy.
    Skipped,
    /// A regional execution of a step that declares no regional resources.
    NotApplicable,
}

/// Result emitted by a runner for one step execution.
///
/// Immutable after emission: errors are carried as messages inside the
/// output rather than thrown across task boundaries, and the engine only
/// ever references a finished output.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutput {
    pub status: StepStatus,
    pub step_name: String,
    pub region: String,
    pub region_deploy_type: RegionDeployType,
    pub stream_output: String,
    pub error: Option<String>,
    pub output_variables: HashMap<String, String>,
}

impl StepOutput {
    pub fn success(
        step_name: &str,
        region: &str,
        region_deploy_type: RegionDeployType,
        stream_output: String,
        output_variables: HashMap<String, String>,
    ) -> Self {
        Self {
            status: StepStatus::Success,
            step_name: step_name.to_string(),
            region: region.to_string(),
            region_deploy_type,
            stream_output,
            error: None,
            output_variables,
        }
    }

    pub fn fail(
        step_name: &str,
        region: &str,
        region_deploy_type: RegionDeployType,
        error: String,
    ) -> Self {
        Self {
            status: StepStatus::Fail,
            step_name: step_name.to_string(),
            region: region.to_string(),
            region_deploy_type,
            stream_output: String::new(),
            error: Some(error),
            output_variables: HashMap::new(),
        }
    }

    pub fn skipped(step_name: &str, region: &str, region_deploy_type: RegionDeployType) -> Self {
        Self {
            status: StepStatus::Skipped,
            step_name: step_name.to_string(),
            region: region.to_string(),
            region_deploy_type,
            stream_output: String::new(),
            error: None,
            output_variables: HashMap::new(),
        }
    }

    pub fn not_applicable(
        step_name: &str,
        region: &str,
        region_deploy_type: RegionDeployType,
    ) -> Self {
        Self {
            status: StepStatus::NotApplicable,
            step_name: step_name.to_string(),
            region: region.to_string(),
            region_deploy_type,
            stream_output: String::new(),
            error: None,
            output_variables: HashMap::new(),
        }
    }

    /// Whether this output counts as a failure for progression gating.
    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.status == StepStatus::Fail
    }
}

/// Result of one step test run.
///
/// A skipped test run emits the default value: the empty step name attaches
/// to no step in the execution aggregate but still satisfies the test drain.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepTestOutput {
    pub step_name: String,
    pub stream_output: String,
    pub error: Option<String>,
}

impl StepTestOutput {
    pub fn skipped() -> Self {
        Self::default()
    }
}

/// Context handed to a runner for one step invocation
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub project: String,
    pub track_name: String,
    pub step_name: String,
    pub step_dir: PathBuf,
    pub progression_level: u32,
    pub region: String,
    pub region_deploy_type: RegionDeployType,
    pub dry_run: bool,
    /// Output variables published by earlier steps, the paired primary
    /// execution, and the pre-track.
    pub output_variables: VariableMap,
}

/// Capability set the engine requires from a step backend.
///
/// Runners may touch external systems but are pure with respect to engine
/// state: they return results rather than mutating engine structures. A
/// runner that fails during `pre_execute` surfaces as a `Fail` step output;
/// the engine does not retry.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Prepare the step working directory (e.g. backend init, variable
    /// injection). Returns the possibly-amended context for execution.
    async fn pre_execute(&self, ctx: ExecContext) -> Result<ExecContext>;

    /// Deploy the step and report its terminal output.
    async fn execute(&self, ctx: ExecContext) -> StepOutput;

    /// Destroy the step's resources and report the terminal output.
    async fn execute_destroy(&self, ctx: ExecContext) -> StepOutput;

    /// Run the step's test suite and report its output.
    async fn execute_tests(&self, ctx: ExecContext) -> StepTestOutput;
}
