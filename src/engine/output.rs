//! Execution aggregates rolled up from step outputs
//!
//! Variable-map ownership rule: a `RegionExecution`'s maps are written only
//! by the region executor that owns it, inside its own task. Copies handed
//! to regional executions are deep copies, so a regional execution can
//! never write back into the primary's map.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::config::RegionDeployType;
use crate::discovery::plan::{Step, Track};
use crate::steps::runner::{StepOutput, StepTestOutput, VariableMap};

/// A step paired with its terminal deploy (or destroy) output and, when
/// tests ran, its test output.
#[derive(Debug, Clone)]
pub struct ExecutedStep {
    pub step: Step,
    pub output: StepOutput,
    pub test_output: Option<StepTestOutput>,
}

/// Rolling aggregate of one region execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    pub track_name: String,
    pub track_dir: PathBuf,
    pub executed_count: usize,
    pub skipped_count: usize,
    pub not_applicable_count: usize,
    pub failure_count: usize,
    pub failed_test_count: usize,
    pub steps: HashMap<String, ExecutedStep>,
    pub failed_steps: Vec<ExecutedStep>,
    /// Cumulative output variables across all completed steps, keyed by the
    /// step-key rule (`<step>` for primary, `<step>-regional` for regional).
    pub step_output_variables: VariableMap,
}

/// One (track, region, deploy type) run
#[derive(Debug, Clone)]
pub struct RegionExecution {
    pub track_name: String,
    pub track_dir: PathBuf,
    pub track_step_progressions_count: u32,
    pub track_steps_with_tests_count: usize,
    pub track_ordered_steps: BTreeMap<u32, Vec<Step>>,
    pub region: String,
    pub region_deploy_type: RegionDeployType,
    pub output: ExecutionOutput,
    /// Final primary aggregate; set only for regional executions, so a
    /// primary failure short-circuits the regional siblings.
    pub primary_output: Option<ExecutionOutput>,
    /// Seed variables: pre-seeded outputs, primary outputs for regional
    /// executions, and pre-track injections.
    pub default_step_output_variables: VariableMap,
}

impl RegionExecution {
    /// Build an execution for one region of a track. Regional executions
    /// use the regional-tests subcount for their test drain.
    pub fn for_track(
        track: &Track,
        region: impl Into<String>,
        region_deploy_type: RegionDeployType,
    ) -> Self {
        let track_steps_with_tests_count = match region_deploy_type {
            RegionDeployType::Primary => track.steps_with_tests_count,
            RegionDeployType::Regional => track.steps_with_regional_tests_count,
        };

        Self {
            track_name: track.name.clone(),
            track_dir: track.dir.clone(),
            track_step_progressions_count: track.step_progressions_count,
            track_steps_with_tests_count,
            track_ordered_steps: track.ordered_steps.clone(),
            region: region.into(),
            region_deploy_type,
            output: ExecutionOutput::default(),
            primary_output: None,
            default_step_output_variables: VariableMap::new(),
        }
    }
}

/// Output of one track across all of its region executions
#[derive(Debug, Clone, Default)]
pub struct TrackOutput {
    pub name: String,
    /// The primary region's final variables, hoisted to the track level for
    /// downstream consumers (the pre-track channel).
    pub primary_step_output_variables: VariableMap,
    pub executions: Vec<RegionExecution>,
}

/// Deploy and destroy results of one track within a stage
#[derive(Debug, Clone)]
pub struct TrackState {
    pub track: Track,
    /// Set when the pre-track failed and this track never ran.
    pub skipped: bool,
    pub output: Option<TrackOutput>,
    pub destroy_output: Option<TrackOutput>,
}

/// The outputs of all tracks of one stage
#[derive(Debug, Default)]
pub struct Stage {
    pub tracks: HashMap<String, TrackState>,
}

impl Stage {
    /// Whether any step or step test failed in any deploy or destroy pass.
    pub fn has_failures(&self) -> bool {
        self.tracks.values().any(|state| {
            [&state.output, &state.destroy_output]
                .into_iter()
                .flatten()
                .flat_map(|o| &o.executions)
                .any(|e| e.output.failure_count > 0 || e.output.failed_test_count > 0)
        })
    }
}

/// The step-key under which a step's outputs are published: the plain step
/// name for primary outputs, `<step>-regional` for regional outputs.
pub(crate) fn step_output_key(output: &StepOutput) -> String {
    match output.region_deploy_type {
        RegionDeployType::Primary => output.step_name.clone(),
        RegionDeployType::Regional => {
            format!("{}-{}", output.step_name, RegionDeployType::Regional)
        }
    }
}

/// Merge a finished step's output variables into the cumulative map.
pub(crate) fn append_step_output(variables: &mut VariableMap, output: &StepOutput) {
    let entry = variables.entry(step_output_key(output)).or_default();
    for (name, value) in &output.output_variables {
        entry.insert(name.clone(), value.clone());
    }
}

/// Inject the pre-track's published variables for a matching (deploy type,
/// region) execution under the `pretrack-` key prefix.
pub(crate) fn append_pre_track_outputs(
    variables: &mut VariableMap,
    pre_track: &TrackOutput,
    region_deploy_type: RegionDeployType,
    region: &str,
) {
    for execution in &pre_track.executions {
        if execution.region_deploy_type != region_deploy_type || execution.region != region {
            continue;
        }
        for (step_key, step_vars) in &execution.output.step_output_variables {
            let entry = variables
                .entry(format!("pretrack-{step_key}"))
                .or_default();
            for (name, value) in step_vars {
                entry.insert(name.clone(), value.clone());
            }
        }
    }
}
