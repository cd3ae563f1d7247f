//! Region executor: runs all progressions of one track in one region
//!
//! Steps inside a progression run concurrently and are drained to
//! exhaustion before the next progression starts. Step tests run decoupled:
//! a triggered test overlaps later progressions, and the execution is
//! emitted only after every triggered test has been drained.

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::output::{append_step_output, ExecutedStep, ExecutionOutput, RegionExecution};
use super::EngineContext;
use crate::config::RegionDeployType;
use crate::discovery::plan::Step;
use crate::steps::runner::{ExecContext, StepOutput, StepStatus, StepTestOutput, VariableMap};

/// Run one region execution in the deploy direction and return the
/// finished execution.
pub(crate) async fn deploy_region(
    ctx: EngineContext,
    mut execution: RegionExecution,
) -> RegionExecution {
    info!(
        track = %execution.track_name,
        region = %execution.region,
        deploy_type = %execution.region_deploy_type,
        "starting region deployment"
    );

    execution.output = ExecutionOutput {
        track_name: execution.track_name.clone(),
        track_dir: execution.track_dir.clone(),
        step_output_variables: execution.default_step_output_variables.clone(),
        ..ExecutionOutput::default()
    };

    let (test_tx, mut test_rx) = mpsc::unbounded_channel::<StepTestOutput>();

    for level in 1..=execution.track_step_progressions_count {
        let steps = execution
            .track_ordered_steps
            .get(&level)
            .cloned()
            .unwrap_or_default();

        let mut in_flight: JoinSet<ExecutedStep> = JoinSet::new();
        for step in steps {
            let region = execution.region.clone();
            let deploy_type = execution.region_deploy_type;

            if deploy_type == RegionDeployType::Regional && !step.regional_resources_exist {
                in_flight.spawn(async move {
                    finished(step, |s| StepOutput::not_applicable(&s.name, &region, deploy_type))
                });
            } else if level > 1 && execution.output.failure_count > 0 {
                warn!(
                    step = %step.name,
                    "skipping step due to earlier step failures in this region"
                );
                in_flight.spawn(async move {
                    finished(step, |s| StepOutput::skipped(&s.name, &region, deploy_type))
                });
            } else if execution
                .primary_output
                .as_ref()
                .is_some_and(|p| p.failure_count > 0)
            {
                warn!(
                    step = %step.name,
                    "skipping step due to failures in the primary region deployment"
                );
                in_flight.spawn(async move {
                    finished(step, |s| StepOutput::skipped(&s.name, &region, deploy_type))
                });
            } else {
                let variables = execution.output.step_output_variables.clone();
                let step_ctx = ctx.clone();
                in_flight.spawn(async move {
                    execute_step(step_ctx, region, deploy_type, variables, step, false).await
                });
            }
        }

        // Drain every step at this level before advancing; the merge below
        // is what later progressions and triggered tests read from.
        while let Some(joined) = in_flight.join_next().await {
            let executed = match joined {
                Ok(executed) => executed,
                Err(e) => {
                    error!("step task panicked: {e:#}");
                    continue;
                }
            };

            match executed.output.status {
                StepStatus::Skipped => execution.output.skipped_count += 1,
                StepStatus::NotApplicable => execution.output.not_applicable_count += 1,
                _ => execution.output.executed_count += 1,
            }

            append_step_output(&mut execution.output.step_output_variables, &executed.output);

            if executed.output.is_failure() {
                execution.output.failure_count += 1;
                execution.output.failed_steps.push(executed.clone());
            }

            // Trigger tests for every finished step whose flag matches,
            // failed or not; the test task decides whether to skip. The
            // trigger count therefore always matches the drain below.
            let wants_tests = match execution.region_deploy_type {
                RegionDeployType::Primary => executed.step.tests_exist,
                RegionDeployType::Regional => executed.step.regional_tests_exist,
            };
            if wants_tests {
                debug!(step = %executed.step.name, "triggering step tests");
                let variables = execution.output.step_output_variables.clone();
                tokio::spawn(run_step_test(
                    ctx.clone(),
                    execution.region.clone(),
                    execution.region_deploy_type,
                    variables,
                    executed.clone(),
                    test_tx.clone(),
                ));
            }

            execution
                .output
                .steps
                .insert(executed.step.name.clone(), executed);
        }
    }
    drop(test_tx);

    // Drain exactly as many test results as the track has steps with tests
    // for this deploy type; the channel closing guards a short count.
    for _ in 0..execution.track_steps_with_tests_count {
        let Some(test_output) = test_rx.recv().await else {
            break;
        };

        if test_output.error.is_some() {
            execution.output.failed_test_count += 1;
        }

        // Skipped tests carry an empty step name and attach to nothing.
        for failed in execution.output.failed_steps.iter_mut() {
            if failed.step.name == test_output.step_name {
                failed.test_output = Some(test_output.clone());
            }
        }
        if let Some(executed) = execution.output.steps.get_mut(&test_output.step_name) {
            executed.test_output = Some(test_output);
        }
    }

    info!(
        track = %execution.track_name,
        region = %execution.region,
        deploy_type = %execution.region_deploy_type,
        executed = execution.output.executed_count,
        skipped = execution.output.skipped_count,
        failures = execution.output.failure_count,
        "region deployment finished"
    );
    execution
}

/// Run one region execution in the destroy direction: progressions iterate
/// from the highest level down, and no tests run.
pub(crate) async fn destroy_region(
    ctx: EngineContext,
    mut execution: RegionExecution,
) -> RegionExecution {
    info!(
        track = %execution.track_name,
        region = %execution.region,
        deploy_type = %execution.region_deploy_type,
        "starting region destroy"
    );

    execution.output = ExecutionOutput {
        track_name: execution.track_name.clone(),
        track_dir: execution.track_dir.clone(),
        step_output_variables: execution.default_step_output_variables.clone(),
        ..ExecutionOutput::default()
    };

    for level in (1..=execution.track_step_progressions_count).rev() {
        let steps = execution
            .track_ordered_steps
            .get(&level)
            .cloned()
            .unwrap_or_default();

        let mut in_flight: JoinSet<ExecutedStep> = JoinSet::new();
        for step in steps {
            let region = execution.region.clone();
            let deploy_type = execution.region_deploy_type;

            let no_regional_resources =
                deploy_type == RegionDeployType::Regional && !step.regional_resources_exist;
            if no_regional_resources || (level > 1 && execution.output.failure_count > 0) {
                in_flight.spawn(async move {
                    finished(step, |s| StepOutput::skipped(&s.name, &region, deploy_type))
                });
            } else {
                let variables = execution.output.step_output_variables.clone();
                let step_ctx = ctx.clone();
                in_flight.spawn(async move {
                    execute_step(step_ctx, region, deploy_type, variables, step, true).await
                });
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            let executed = match joined {
                Ok(executed) => executed,
                Err(e) => {
                    error!("step task panicked: {e:#}");
                    continue;
                }
            };

            if executed.output.status == StepStatus::Skipped {
                execution.output.skipped_count += 1;
            } else {
                execution.output.executed_count += 1;
            }

            if executed.output.is_failure() {
                execution.output.failure_count += 1;
                execution.output.failed_steps.push(executed.clone());
            }

            execution
                .output
                .steps
                .insert(executed.step.name.clone(), executed);
        }
    }

    execution
}

fn finished(step: Step, output: impl FnOnce(&Step) -> StepOutput) -> ExecutedStep {
    let output = output(&step);
    ExecutedStep {
        step,
        output,
        test_output: None,
    }
}

/// Execute one step through its runner, recording start and outcome in the
/// status sink. Initialization failures surface as a `Fail` output; nothing
/// is retried and no error crosses the task boundary.
async fn execute_step(
    ctx: EngineContext,
    region: String,
    region_deploy_type: RegionDeployType,
    variables: VariableMap,
    step: Step,
    destroy: bool,
) -> ExecutedStep {
    ctx.sink
        .record_step_start(&step.track_name, &step.name, &step.id, region_deploy_type, &region);

    let exec_ctx = init_context(&ctx, &region, region_deploy_type, variables, &step);
    let exec_ctx = match step.runner.pre_execute(exec_ctx).await {
        Ok(exec_ctx) => exec_ctx,
        Err(e) => {
            let output = StepOutput::fail(
                &step.name,
                &region,
                region_deploy_type,
                format!("failed to initialize step execution: {e:#}"),
            );
            ctx.sink.record_step_fail(
                &step.track_name,
                &step.name,
                &step.id,
                region_deploy_type,
                &region,
                output.error.as_deref().unwrap_or_default(),
            );
            return ExecutedStep {
                step,
                output,
                test_output: None,
            };
        }
    };

    let output = if destroy {
        step.runner.execute_destroy(exec_ctx).await
    } else {
        step.runner.execute(exec_ctx).await
    };

    if output.is_failure() {
        ctx.sink.record_step_fail(
            &step.track_name,
            &step.name,
            &step.id,
            region_deploy_type,
            &region,
            output.error.as_deref().unwrap_or_default(),
        );
    } else {
        ctx.sink.record_step_success(
            &step.track_name,
            &step.name,
            &step.id,
            region_deploy_type,
            &region,
        );
    }

    ExecutedStep {
        step,
        output,
        test_output: None,
    }
}

/// Run a finished step's test suite, skipping when the deploy errored, was
/// skipped, or this is a dry run. Always reports exactly one result so the
/// region's test drain terminates.
async fn run_step_test(
    ctx: EngineContext,
    region: String,
    region_deploy_type: RegionDeployType,
    variables: VariableMap,
    executed: ExecutedStep,
    out: mpsc::UnboundedSender<StepTestOutput>,
) {
    let step = &executed.step;
    info!(
        step = %step.name,
        progression = step.progression_level,
        "starting step tests"
    );

    let result = if executed.output.is_failure() {
        warn!(step = %step.name, "skipping tests due to deployment error");
        StepTestOutput::skipped()
    } else if ctx.cfg.dry_run {
        info!(step = %step.name, "skipping tests for dry run");
        StepTestOutput::skipped()
    } else if executed.output.status == StepStatus::Skipped {
        warn!(step = %step.name, "skipping tests because the step was skipped");
        StepTestOutput::skipped()
    } else {
        let exec_ctx = init_context(&ctx, &region, region_deploy_type, variables, step);
        let test_output = step.runner.execute_tests(exec_ctx).await;
        if let Some(err) = &test_output.error {
            error!(step = %step.name, error = %err, "error executing tests for step");
        }
        test_output
    };

    let _ = out.send(result);
}

fn init_context(
    ctx: &EngineContext,
    region: &str,
    region_deploy_type: RegionDeployType,
    variables: VariableMap,
    step: &Step,
) -> ExecContext {
    ExecContext {
        project: ctx.cfg.project.clone(),
        track_name: step.track_name.clone(),
        step_name: step.name.clone(),
        step_dir: step.dir.clone(),
        progression_level: step.progression_level,
        region: region.to_string(),
        region_deploy_type,
        dry_run: ctx.cfg.dry_run,
        output_variables: variables,
    }
}
