//! Track executor: one track across its primary and regional regions
//!
//! Deploy runs the primary region to quiescence first, then fans out one
//! region executor per regional region; destroy reverses the order.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info};

use super::output::{append_pre_track_outputs, RegionExecution, TrackOutput};
use super::region::{deploy_region, destroy_region};
use super::EngineContext;
use crate::config::RegionDeployType;
use crate::discovery::plan::Track;
use crate::steps::runner::VariableMap;

/// Pre-seeded variables per execution, keyed `"<deployType>-<region>"`.
/// Deploy passes start empty; the destroy pass is seeded from the recorded
/// deploy outputs.
pub(crate) type ExecutionSeeds = HashMap<String, VariableMap>;

pub(crate) fn seed_key(region_deploy_type: RegionDeployType, region: &str) -> String {
    format!("{region_deploy_type}-{region}")
}

/// Deploy one track and return its collected output.
pub(crate) async fn deploy_track(
    ctx: EngineContext,
    track: Track,
    pre_track: Option<Arc<TrackOutput>>,
    seeds: Arc<ExecutionSeeds>,
) -> TrackOutput {
    info!(track = %track.name, action = "deploy", "starting track");

    let mut output = TrackOutput {
        name: track.name.clone(),
        ..TrackOutput::default()
    };

    let region = ctx.cfg.primary_region.clone();
    let mut primary = RegionExecution::for_track(&track, &region, RegionDeployType::Primary);
    if let Some(seed) = seeds.get(&seed_key(RegionDeployType::Primary, &region)) {
        primary.default_step_output_variables = seed.clone();
    }
    if let Some(pre) = &pre_track {
        append_pre_track_outputs(
            &mut primary.default_step_output_variables,
            pre,
            RegionDeployType::Primary,
            &region,
        );
    }

    let primary = deploy_region(ctx.clone(), primary).await;
    output.primary_step_output_variables = primary.output.step_output_variables.clone();
    let primary_output = primary.output.clone();
    output.executions.push(primary);

    if !track.regional_deployment {
        info!(track = %track.name, "track has no regional resources, completing track");
        flush_track(&ctx, &track.name);
        return output;
    }

    let target_regions = ctx.cfg.regional_regions.clone();
    info!(
        track = %track.name,
        regions = ?target_regions,
        "primary region completed, executing regional deployments"
    );

    let mut handles = Vec::with_capacity(target_regions.len());
    for region in target_regions {
        let mut regional = RegionExecution::for_track(&track, &region, RegionDeployType::Regional);
        // Each region gets its own copy of the primary's final variables so
        // in-flight regional merges never observe each other.
        regional.default_step_output_variables = primary_output.step_output_variables.clone();
        if let Some(pre) = &pre_track {
            append_pre_track_outputs(
                &mut regional.default_step_output_variables,
                pre,
                RegionDeployType::Regional,
                &region,
            );
        }
        regional.primary_output = Some(primary_output.clone());

        handles.push(tokio::spawn(deploy_region(ctx.clone(), regional)));
    }

    for joined in join_all(handles).await {
        match joined {
            Ok(execution) => output.executions.push(execution),
            Err(e) => error!("regional deployment task panicked: {e:#}"),
        }
    }

    flush_track(&ctx, &track.name);
    output
}

/// Destroy one track: regional executions concurrently first, then the
/// primary region.
pub(crate) async fn destroy_track(
    ctx: EngineContext,
    track: Track,
    pre_track: Option<Arc<TrackOutput>>,
    seeds: Arc<ExecutionSeeds>,
) -> TrackOutput {
    info!(track = %track.name, action = "destroy", "starting track");

    let mut output = TrackOutput {
        name: track.name.clone(),
        ..TrackOutput::default()
    };

    if track.regional_deployment {
        let mut handles = Vec::with_capacity(ctx.cfg.regional_regions.len());
        for region in ctx.cfg.regional_regions.clone() {
            let mut regional =
                RegionExecution::for_track(&track, &region, RegionDeployType::Regional);
            regional.default_step_output_variables = seeds
                .get(&seed_key(RegionDeployType::Regional, &region))
                .cloned()
                .unwrap_or_default();
            if let Some(pre) = &pre_track {
                append_pre_track_outputs(
                    &mut regional.default_step_output_variables,
                    pre,
                    RegionDeployType::Regional,
                    &region,
                );
            }

            handles.push(tokio::spawn(destroy_region(ctx.clone(), regional)));
        }

        for joined in join_all(handles).await {
            match joined {
                Ok(execution) => output.executions.push(execution),
                Err(e) => error!("regional destroy task panicked: {e:#}"),
            }
        }
    }

    let region = ctx.cfg.primary_region.clone();
    let mut primary = RegionExecution::for_track(&track, &region, RegionDeployType::Primary);
    primary.default_step_output_variables = seeds
        .get(&seed_key(RegionDeployType::Primary, &region))
        .cloned()
        .unwrap_or_default();
    if let Some(pre) = &pre_track {
        append_pre_track_outputs(
            &mut primary.default_step_output_variables,
            pre,
            RegionDeployType::Primary,
            &region,
        );
    }

    let primary = destroy_region(ctx.clone(), primary).await;
    output.executions.push(primary);
    output
}

/// Flush the track's accumulated status records; records are only dumped at
/// debug level.
fn flush_track(ctx: &EngineContext, track: &str) {
    match ctx.sink.flush_track(track) {
        Ok(records) => debug!(
            track,
            records = %serde_json::to_string(&records).unwrap_or_default(),
            "flushed track status records"
        ),
        Err(e) => error!(track, "failed to flush track status records: {e:#}"),
    }
}
