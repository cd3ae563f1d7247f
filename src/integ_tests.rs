//! Integration tests for the stage, track, and region executors
//!
//! These tests run the engine against hand-built plans with a scripted mock
//! runner that records every invocation, covering the end-to-end scenarios
//! and the ordering/isolation guarantees of the progression model.

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use anyhow::Result;
    use async_trait::async_trait;

    use crate::config::{DeployConfig, DeployConfigBuilder, RegionDeployType};
    use crate::discovery::plan::{Plan, Step, Track};
    use crate::discovery::tracker::DirectoryTracker;
    use crate::engine::output::Stage;
    use crate::engine::stage::StageExecutor;
    use crate::status::sink::InMemoryStatusSink;
    use crate::steps::runner::{
        ExecContext, Runner, StepOutput, StepStatus, StepTestOutput, VariableMap,
    };

    // ============ Mock runner ============

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum MockEvent {
        Deploy {
            step: String,
            level: u32,
            region: String,
            deploy_type: RegionDeployType,
        },
        Destroy {
            step: String,
            level: u32,
            region: String,
        },
        Test {
            step: String,
            region: String,
        },
    }

    #[derive(Default)]
    struct MockState {
        events: Vec<MockEvent>,
        // "<step>/<deployType>/<region>" -> variables visible at execute time
        seen_variables: HashMap<String, VariableMap>,
    }

    /// Scripted step backend: per-step failures, published outputs, and
    /// test results, with a shared log of every invocation.
    #[derive(Default)]
    struct MockRunner {
        fail_steps: HashSet<String>,
        outputs: HashMap<String, HashMap<String, String>>,
        failing_tests: HashSet<String>,
        state: Mutex<MockState>,
    }

    impl MockRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn failing(steps: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                fail_steps: steps.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            })
        }

        fn with_output(step: &str, vars: &[(&str, &str)]) -> Arc<Self> {
            let vars = vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            Arc::new(Self {
                outputs: HashMap::from([(step.to_string(), vars)]),
                ..Self::default()
            })
        }

        fn with_failing_test(step: &str) -> Arc<Self> {
            Arc::new(Self {
                failing_tests: HashSet::from([step.to_string()]),
                ..Self::default()
            })
        }

        fn events(&self) -> Vec<MockEvent> {
            self.state.lock().unwrap().events.clone()
        }

        fn deploys(&self) -> Vec<MockEvent> {
            self.events()
                .into_iter()
                .filter(|e| matches!(e, MockEvent::Deploy { .. }))
                .collect()
        }

        fn destroys(&self) -> Vec<MockEvent> {
            self.events()
                .into_iter()
                .filter(|e| matches!(e, MockEvent::Destroy { .. }))
                .collect()
        }

        /// Variables the runner observed when deploying the given step.
        fn seen(
            &self,
            step: &str,
            deploy_type: RegionDeployType,
            region: &str,
        ) -> Option<VariableMap> {
            self.state
                .lock()
                .unwrap()
                .seen_variables
                .get(&format!("{step}/{deploy_type}/{region}"))
                .cloned()
        }
    }

    #[async_trait]
    impl Runner for MockRunner {
        async fn pre_execute(&self, ctx: ExecContext) -> Result<ExecContext> {
            Ok(ctx)
        }

        async fn execute(&self, ctx: ExecContext) -> StepOutput {
            {
                let mut state = self.state.lock().unwrap();
                state.events.push(MockEvent::Deploy {
                    step: ctx.step_name.clone(),
                    level: ctx.progression_level,
                    region: ctx.region.clone(),
                    deploy_type: ctx.region_deploy_type,
                });
                state.seen_variables.insert(
                    format!(
                        "{}/{}/{}",
                        ctx.step_name, ctx.region_deploy_type, ctx.region
                    ),
                    ctx.output_variables.clone(),
                );
            }

            if self.fail_steps.contains(&ctx.step_name) {
                return StepOutput::fail(
                    &ctx.step_name,
                    &ctx.region,
                    ctx.region_deploy_type,
                    "scripted failure".to_string(),
                );
            }
            let vars = self.outputs.get(&ctx.step_name).cloned().unwrap_or_default();
            StepOutput::success(
                &ctx.step_name,
                &ctx.region,
                ctx.region_deploy_type,
                String::new(),
                vars,
            )
        }

        async fn execute_destroy(&self, ctx: ExecContext) -> StepOutput {
            self.state.lock().unwrap().events.push(MockEvent::Destroy {
                step: ctx.step_name.clone(),
                level: ctx.progression_level,
                region: ctx.region.clone(),
            });
            StepOutput::success(
                &ctx.step_name,
                &ctx.region,
                ctx.region_deploy_type,
                String::new(),
                HashMap::new(),
            )
        }

        async fn execute_tests(&self, ctx: ExecContext) -> StepTestOutput {
            self.state.lock().unwrap().events.push(MockEvent::Test {
                step: ctx.step_name.clone(),
                region: ctx.region.clone(),
            });
            StepTestOutput {
                step_name: ctx.step_name.clone(),
                stream_output: String::new(),
                error: self
                    .failing_tests
                    .contains(&ctx.step_name)
                    .then(|| "scripted test failure".to_string()),
            }
        }
    }

    // ============ Plan helpers ============

    fn step(runner: &Arc<MockRunner>, track: &str, name: &str, level: u32) -> Step {
        Step {
            name: name.to_string(),
            id: format!("#proj#{track}#{name}"),
            dir: PathBuf::from(format!("/plan/{track}/step{level}_{name}")),
            track_name: track.to_string(),
            progression_level: level,
            tests_exist: false,
            regional_resources_exist: false,
            regional_tests_exist: false,
            runner: runner.clone(),
        }
    }

    fn track(name: &str, steps: Vec<Step>) -> Track {
        let mut ordered_steps: BTreeMap<u32, Vec<Step>> = BTreeMap::new();
        let mut track = Track {
            name: name.to_string(),
            dir: PathBuf::from(format!("/plan/{name}")),
            is_pre_track: name == crate::config::PRE_TRACK_NAME,
            is_default_track: name == crate::config::DEFAULT_TRACK_NAME,
            ..Track::default()
        };

        for s in steps {
            track.steps_count += 1;
            track.step_progressions_count = track.step_progressions_count.max(s.progression_level);
            track.regional_deployment |= s.regional_resources_exist;
            track.steps_with_tests_count += usize::from(s.tests_exist);
            track.steps_with_regional_tests_count += usize::from(s.regional_tests_exist);
            ordered_steps.entry(s.progression_level).or_default().push(s);
        }
        track.ordered_steps = ordered_steps;
        track
    }

    fn config(regional_regions: &[&str], self_destroy: bool, dry_run: bool) -> DeployConfig {
        DeployConfigBuilder::default()
            .project("proj")
            .primary_region("r1")
            .regional_regions(
                regional_regions
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>(),
            )
            .target_all(true)
            .self_destroy(self_destroy)
            .dry_run(dry_run)
            .build()
            .unwrap()
    }

    async fn run_plan(cfg: DeployConfig, tracks: Vec<Track>) -> Stage {
        let executor = StageExecutor::new(
            Arc::new(cfg),
            Arc::new(InMemoryStatusSink::new()),
            DirectoryTracker::new("."),
        );
        executor.execute_plan(Plan { tracks }).await
    }

    fn deploy_output<'a>(stage: &'a Stage, track: &str) -> &'a crate::engine::output::TrackOutput {
        stage.tracks[track]
            .output
            .as_ref()
            .expect("track should have a deploy output")
    }

    // ============ End-to-end scenarios ============

    #[tokio::test]
    async fn test_happy_path_single_region() {
        let runner = MockRunner::new();
        let stage = run_plan(
            config(&[], false, false),
            vec![track(
                "foo",
                vec![step(&runner, "foo", "a", 1), step(&runner, "foo", "b", 2)],
            )],
        )
        .await;

        let output = deploy_output(&stage, "foo");
        assert_eq!(output.executions.len(), 1, "no regional executions expected");

        let execution = &output.executions[0];
        assert_eq!(execution.region, "r1");
        assert_eq!(execution.region_deploy_type, RegionDeployType::Primary);
        assert_eq!(execution.output.executed_count, 2);
        assert_eq!(execution.output.failure_count, 0);
        assert_eq!(execution.output.steps["a"].output.status, StepStatus::Success);
        assert_eq!(execution.output.steps["b"].output.status, StepStatus::Success);
        assert!(!stage.has_failures());
    }

    #[tokio::test]
    async fn test_progression_gating_on_failure() {
        let runner = MockRunner::failing(&["a"]);
        let stage = run_plan(
            config(&[], false, false),
            vec![track(
                "foo",
                vec![step(&runner, "foo", "a", 1), step(&runner, "foo", "b", 2)],
            )],
        )
        .await;

        let execution = &deploy_output(&stage, "foo").executions[0];
        assert_eq!(execution.output.steps["a"].output.status, StepStatus::Fail);
        assert_eq!(execution.output.steps["b"].output.status, StepStatus::Skipped);
        assert_eq!(execution.output.failure_count, 1);
        assert_eq!(execution.output.executed_count, 1);
        assert_eq!(execution.output.skipped_count, 1);
        assert_eq!(execution.output.failed_steps.len(), 1);

        // the runner was never invoked for the gated step
        assert_eq!(runner.deploys().len(), 1);
    }

    #[tokio::test]
    async fn test_primary_outputs_propagate_to_regions() {
        let runner = MockRunner::with_output("a", &[("k", "v")]);
        let mut a = step(&runner, "foo", "a", 1);
        a.regional_resources_exist = true;

        let stage = run_plan(config(&["r2", "r3"], false, false), vec![track("foo", vec![a])]).await;

        let output = deploy_output(&stage, "foo");
        assert_eq!(output.executions.len(), 3);

        // both regional executions observed the primary's published variable
        // under the primary step key
        for region in ["r2", "r3"] {
            let seen = runner
                .seen("a", RegionDeployType::Regional, region)
                .unwrap_or_else(|| panic!("step a should have deployed in {region}"));
            assert_eq!(seen["a"]["k"], "v");
        }

        // regional merges never leak back into the primary's map
        let primary = &output.executions[0];
        assert_eq!(primary.region_deploy_type, RegionDeployType::Primary);
        assert!(primary.output.step_output_variables.contains_key("a"));
        assert!(!primary.output.step_output_variables.contains_key("a-regional"));

        for execution in &output.executions[1..] {
            assert_eq!(execution.region_deploy_type, RegionDeployType::Regional);
            assert!(execution.output.step_output_variables.contains_key("a-regional"));
        }
    }

    #[tokio::test]
    async fn test_regional_short_circuit_on_primary_failure() {
        let runner = MockRunner::failing(&["a"]);
        let mut a = step(&runner, "foo", "a", 1);
        a.regional_resources_exist = true;

        let stage = run_plan(config(&["r2", "r3"], false, false), vec![track("foo", vec![a])]).await;

        let output = deploy_output(&stage, "foo");
        assert_eq!(output.executions.len(), 3);

        for execution in &output.executions[1..] {
            assert_eq!(execution.region_deploy_type, RegionDeployType::Regional);
            assert_eq!(execution.output.steps["a"].output.status, StepStatus::Skipped);
            assert_eq!(execution.output.failure_count, 0, "skip is not a local failure");
            assert_eq!(execution.output.executed_count, 0);
            assert_eq!(execution.output.skipped_count, 1);
        }

        // only the primary deploy ever reached the runner
        assert_eq!(runner.deploys().len(), 1);
    }

    #[tokio::test]
    async fn test_pre_track_gate() {
        let runner = MockRunner::failing(&["x"]);
        let stage = run_plan(
            config(&[], false, false),
            vec![
                track("_pretrack", vec![step(&runner, "_pretrack", "x", 1)]),
                track("foo", vec![step(&runner, "foo", "a", 1)]),
            ],
        )
        .await;

        assert!(stage.tracks["foo"].skipped);
        assert!(stage.tracks["foo"].output.is_none());
        assert!(!stage.tracks["_pretrack"].skipped);
        assert!(stage.tracks["_pretrack"].output.is_some());

        // nothing beyond the pre-track was deployed
        assert_eq!(runner.deploys().len(), 1);
    }

    #[tokio::test]
    async fn test_pre_track_outputs_injected_into_parallel_tracks() {
        let runner = MockRunner::with_output("x", &[("bucket", "state-bucket")]);
        let stage = run_plan(
            config(&[], false, false),
            vec![
                track("_pretrack", vec![step(&runner, "_pretrack", "x", 1)]),
                track("foo", vec![step(&runner, "foo", "a", 1)]),
            ],
        )
        .await;

        assert!(!stage.tracks["foo"].skipped);
        let seen = runner
            .seen("a", RegionDeployType::Primary, "r1")
            .expect("step a should have deployed");
        assert_eq!(seen["pretrack-x"]["bucket"], "state-bucket");
    }

    #[tokio::test]
    async fn test_test_interleaving_and_observational_failures() {
        let runner = MockRunner::with_failing_test("a");
        let mut a = step(&runner, "foo", "a", 1);
        a.tests_exist = true;

        let stage = run_plan(
            config(&[], false, false),
            vec![track("foo", vec![a, step(&runner, "foo", "b", 2)])],
        )
        .await;

        let execution = &deploy_output(&stage, "foo").executions[0];

        // the test ran and its result was attached before the execution was emitted
        let test_output = execution.output.steps["a"]
            .test_output
            .as_ref()
            .expect("test output should be attached to the step");
        assert!(test_output.error.is_some());
        assert_eq!(execution.output.failed_test_count, 1);

        // test failures are observational: deploy counters are untouched
        assert_eq!(execution.output.failure_count, 0);
        assert_eq!(execution.output.executed_count, 2);
        assert_eq!(execution.output.steps["b"].output.status, StepStatus::Success);
        assert!(runner.events().contains(&MockEvent::Test {
            step: "a".to_string(),
            region: "r1".to_string()
        }));
    }

    #[tokio::test]
    async fn test_tests_skipped_for_failed_step() {
        let runner = MockRunner::failing(&["a"]);
        let mut a = step(&runner, "foo", "a", 1);
        a.tests_exist = true;

        let stage = run_plan(config(&[], false, false), vec![track("foo", vec![a])]).await;

        let execution = &deploy_output(&stage, "foo").executions[0];
        assert_eq!(execution.output.failed_test_count, 0);
        assert!(execution.output.steps["a"].test_output.is_none());
        assert!(
            !runner
                .events()
                .iter()
                .any(|e| matches!(e, MockEvent::Test { .. })),
            "the test capability must not run for a failed step"
        );
    }

    #[tokio::test]
    async fn test_dry_run_skips_tests_and_destroy() {
        let runner = MockRunner::new();
        let mut a = step(&runner, "foo", "a", 1);
        a.tests_exist = true;

        let stage = run_plan(config(&[], true, true), vec![track("foo", vec![a])]).await;

        assert!(stage.tracks["foo"].destroy_output.is_none());
        assert!(runner.destroys().is_empty());
        assert!(
            !runner
                .events()
                .iter()
                .any(|e| matches!(e, MockEvent::Test { .. })),
            "dry runs must not execute step tests"
        );
    }

    // ============ Ordering and accounting properties ============

    #[tokio::test]
    async fn test_progression_barrier_ordering() {
        let runner = MockRunner::new();
        let stage = run_plan(
            config(&[], false, false),
            vec![track(
                "foo",
                vec![
                    step(&runner, "foo", "a1", 1),
                    step(&runner, "foo", "a2", 1),
                    step(&runner, "foo", "b1", 2),
                    step(&runner, "foo", "b2", 2),
                    step(&runner, "foo", "c", 3),
                ],
            )],
        )
        .await;

        assert!(!stage.has_failures());
        let levels: Vec<u32> = runner
            .deploys()
            .iter()
            .map(|e| match e {
                MockEvent::Deploy { level, .. } => *level,
                _ => unreachable!(),
            })
            .collect();

        assert_eq!(levels.len(), 5);
        let mut sorted = levels.clone();
        sorted.sort_unstable();
        assert_eq!(
            levels, sorted,
            "a step of progression K must never start before progression K-1 drained: {levels:?}"
        );
    }

    #[tokio::test]
    async fn test_destroy_runs_progressions_in_reverse() {
        let runner = MockRunner::new();
        let stage = run_plan(
            config(&[], true, false),
            vec![track(
                "foo",
                vec![
                    step(&runner, "foo", "a", 1),
                    step(&runner, "foo", "b", 2),
                    step(&runner, "foo", "c", 3),
                ],
            )],
        )
        .await;

        assert!(stage.tracks["foo"].destroy_output.is_some());
        let levels: Vec<u32> = runner
            .destroys()
            .iter()
            .map(|e| match e {
                MockEvent::Destroy { level, .. } => *level,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(levels, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_self_destroy_round_trip_emission_counts() {
        let runner = MockRunner::new();
        let mut a = step(&runner, "foo", "a", 1);
        a.regional_resources_exist = true;

        let stage = run_plan(
            config(&["r2"], true, false),
            vec![track("foo", vec![a, step(&runner, "foo", "b", 2)])],
        )
        .await;

        assert!(!stage.has_failures());
        // every (track, region) deploy emission has a matching destroy emission
        assert_eq!(runner.destroys().len(), runner.deploys().len());

        let destroy_output = stage.tracks["foo"].destroy_output.as_ref().unwrap();
        assert_eq!(destroy_output.executions.len(), 2);
        // regional destroys precede the primary destroy
        assert_eq!(
            destroy_output.executions.last().unwrap().region_deploy_type,
            RegionDeployType::Primary
        );
    }

    #[tokio::test]
    async fn test_self_destroy_destroys_pre_track_last() {
        let runner = MockRunner::new();
        let stage = run_plan(
            config(&[], true, false),
            vec![
                track("_pretrack", vec![step(&runner, "_pretrack", "x", 1)]),
                track("foo", vec![step(&runner, "foo", "a", 1)]),
            ],
        )
        .await;

        assert!(stage.tracks["_pretrack"].destroy_output.is_some());
        let destroy_steps: Vec<&str> = runner
            .destroys()
            .iter()
            .map(|e| match e {
                MockEvent::Destroy { step, .. } => step.as_str(),
                _ => unreachable!(),
            })
            .map(|s| if s == "x" { "x" } else { "other" })
            .collect();
        assert_eq!(
            destroy_steps.last(),
            Some(&"x"),
            "the pre-track must be destroyed after every other track"
        );
    }

    #[tokio::test]
    async fn test_regional_counters_account_for_every_step() {
        let runner = MockRunner::new();
        let mut a = step(&runner, "foo", "a", 1);
        a.regional_resources_exist = true;
        let b = step(&runner, "foo", "b", 2); // no regional resources

        let stage = run_plan(config(&["r2"], false, false), vec![track("foo", vec![a, b])]).await;

        let output = deploy_output(&stage, "foo");
        for execution in &output.executions {
            let totals = execution.output.executed_count
                + execution.output.skipped_count
                + execution.output.not_applicable_count;
            assert_eq!(totals, 2, "every step must be accounted for exactly once");
        }

        let regional = &output.executions[1];
        assert_eq!(regional.output.not_applicable_count, 1);
        assert_eq!(
            regional.output.steps["b"].output.status,
            StepStatus::NotApplicable
        );
    }

    #[tokio::test]
    async fn test_regional_seed_is_a_superset_of_primary_variables() {
        let runner = MockRunner::with_output("a", &[("k", "v")]);
        let mut a = step(&runner, "foo", "a", 1);
        a.regional_resources_exist = true;
        let mut b = step(&runner, "foo", "b", 2);
        b.regional_resources_exist = true;

        let stage = run_plan(config(&["r2"], false, false), vec![track("foo", vec![a, b])]).await;

        let output = deploy_output(&stage, "foo");
        let primary_vars = &output.executions[0].output.step_output_variables;
        let seen = runner
            .seen("a", RegionDeployType::Regional, "r2")
            .expect("step a should have deployed regionally");

        for (step_key, vars) in primary_vars {
            let regional = seen
                .get(step_key)
                .unwrap_or_else(|| panic!("regional seed missing primary key {step_key}"));
            for (name, value) in vars {
                assert_eq!(regional.get(name), Some(value));
            }
        }
    }
}
