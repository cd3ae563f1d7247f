//! Stage orchestrator: the pre-track gate, the parallel track fan-out, and
//! the symmetric destroy pass

use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use tracing::{debug, error, info};

use super::output::{Stage, TrackOutput, TrackState};
use super::track::{deploy_track, destroy_track, seed_key, ExecutionSeeds};
use super::EngineContext;
use crate::config::{DeployConfig, PRE_TRACK_NAME};
use crate::discovery::plan::{Plan, Track};
use crate::discovery::tracker::DirectoryTracker;
use crate::status::sink::StatusSink;
use crate::steps::runner::StepStatus;

/// Orchestrates all tracks of one deployment stage
pub struct StageExecutor {
    cfg: Arc<DeployConfig>,
    sink: Arc<dyn StatusSink>,
    tracker: DirectoryTracker,
}

impl StageExecutor {
    pub fn new(cfg: Arc<DeployConfig>, sink: Arc<dyn StatusSink>, tracker: DirectoryTracker) -> Self {
        Self { cfg, sink, tracker }
    }

    /// Discover the plan and execute it: the pre-track first (gating
    /// everything else), then all other tracks in parallel, then the
    /// destroy pass when the configuration asks for it.
    pub async fn execute_tracks(&self) -> Result<Stage> {
        let plan = self.tracker.gather_tracks(&self.cfg)?;
        Ok(self.execute_plan(plan).await)
    }

    pub(crate) async fn execute_plan(&self, plan: Plan) -> Stage {
        let mut stage = Stage::default();
        let mut parallel_tracks = Vec::new();
        let mut pre_track: Option<Track> = None;

        for track in plan.tracks {
            stage.tracks.insert(
                track.name.clone(),
                TrackState {
                    track: track.clone(),
                    skipped: false,
                    output: None,
                    destroy_output: None,
                },
            );
            if track.is_pre_track {
                pre_track = Some(track);
            } else {
                parallel_tracks.push(track);
            }
        }

        let ctx = EngineContext {
            cfg: self.cfg.clone(),
            sink: self.sink.clone(),
        };

        let mut pre_track_output: Option<Arc<TrackOutput>> = None;
        if let Some(track) = &pre_track {
            debug!("pre-track execution starting");
            let output = deploy_track(
                ctx.clone(),
                track.clone(),
                None,
                Arc::new(ExecutionSeeds::new()),
            )
            .await;

            let failed = pre_track_failed(&output);
            if let Some(state) = stage.tracks.get_mut(&track.name) {
                state.output = Some(output.clone());
            }
            pre_track_output = Some(Arc::new(output));
            debug!("pre-track finished");

            if failed {
                error!("pre-track failed, subsequent tracks will not be executed");
                for (name, state) in stage.tracks.iter_mut() {
                    if name != PRE_TRACK_NAME {
                        state.skipped = true;
                    }
                }
                return stage;
            }
        }

        let mut handles = Vec::with_capacity(parallel_tracks.len());
        for track in &parallel_tracks {
            handles.push(tokio::spawn(deploy_track(
                ctx.clone(),
                track.clone(),
                pre_track_output.clone(),
                Arc::new(ExecutionSeeds::new()),
            )));
        }
        for joined in join_all(handles).await {
            match joined {
                Ok(output) => {
                    if let Some(state) = stage.tracks.get_mut(&output.name) {
                        state.output = Some(output);
                    }
                }
                Err(e) => error!("track deployment task panicked: {e:#}"),
            }
        }

        if self.cfg.self_destroy && !self.cfg.dry_run {
            info!("executing destroy");

            let mut handles = Vec::with_capacity(parallel_tracks.len());
            for track in &parallel_tracks {
                let seeds = execution_seeds(stage.tracks.get(&track.name));
                debug!(
                    track = %track.name,
                    vars = %serde_json::to_string(&seeds).unwrap_or_default(),
                    "destroy seed variables"
                );
                handles.push(tokio::spawn(destroy_track(
                    ctx.clone(),
                    track.clone(),
                    pre_track_output.clone(),
                    Arc::new(seeds),
                )));
            }
            for joined in join_all(handles).await {
                match joined {
                    Ok(output) => {
                        if let Some(state) = stage.tracks.get_mut(&output.name) {
                            state.destroy_output = Some(output);
                        }
                    }
                    Err(e) => error!("track destroy task panicked: {e:#}"),
                }
            }

            // The pre-track is destroyed last, after everything that may
            // depend on it is gone.
            if let Some(track) = &pre_track {
                debug!("pre-track destroying");
                let seeds = execution_seeds(stage.tracks.get(&track.name));
                let output = destroy_track(
                    ctx.clone(),
                    track.clone(),
                    pre_track_output.clone(),
                    Arc::new(seeds),
                )
                .await;
                if let Some(state) = stage.tracks.get_mut(&track.name) {
                    state.destroy_output = Some(output);
                }
                debug!("pre-track destroy finished");
            }
        }

        stage
    }
}

/// Any failed step in any of the pre-track's executions fails the gate.
fn pre_track_failed(output: &TrackOutput) -> bool {
    output.executions.iter().any(|execution| {
        execution
            .output
            .steps
            .values()
            .any(|s| s.output.status == StepStatus::Fail)
    })
}

/// Rebuild the per-execution seed variables from a completed deploy, keyed
/// `"<deployType>-<region>"`.
fn execution_seeds(state: Option<&TrackState>) -> ExecutionSeeds {
    let mut seeds = ExecutionSeeds::new();
    if let Some(output) = state.and_then(|s| s.output.as_ref()) {
        for execution in &output.executions {
            seeds.insert(
                seed_key(execution.region_deploy_type, &execution.region),
                execution.output.step_output_variables.clone(),
            );
        }
    }
    seeds
}
