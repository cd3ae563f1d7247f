//! Per-step status recording
//!
//! The sink is the only process-wide state in the engine: executors record
//! step start/success/fail events as they observe them, and the track
//! executor flushes the accumulated records when a track completes.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

use crate::config::RegionDeployType;

/// Terminal result carried by a status record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordedResult {
    Started,
    Success,
    Fail,
}

/// One recorded step execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub track: String,
    pub step: String,
    pub step_id: String,
    pub region: String,
    pub region_deploy_type: RegionDeployType,
    pub result: RecordedResult,
    /// ISO 8601 timestamp of the most recent update.
    pub recorded_at: String,
    pub message: Option<String>,
}

/// Collaborator that records per-step outcomes.
///
/// One record exists per (track, step, deploy type, region): a success or
/// failure updates the record created at step start. `flush_track` removes
/// all records for the named track and returns them; a second flush of the
/// same track returns empty.
pub trait StatusSink: Send + Sync {
    fn record_step_start(
        &self,
        track: &str,
        step: &str,
        step_id: &str,
        region_deploy_type: RegionDeployType,
        region: &str,
    );

    fn record_step_success(
        &self,
        track: &str,
        step: &str,
        step_id: &str,
        region_deploy_type: RegionDeployType,
        region: &str,
    );

    fn record_step_fail(
        &self,
        track: &str,
        step: &str,
        step_id: &str,
        region_deploy_type: RegionDeployType,
        region: &str,
        message: &str,
    );

    fn flush_track(&self, track: &str) -> Result<Vec<ExecutionRecord>>;
}

/// In-process sink backed by a mutex-guarded map
#[derive(Default)]
pub struct InMemoryStatusSink {
    // track name -> record key -> record
    records: Mutex<HashMap<String, HashMap<String, ExecutionRecord>>>,
}

impl InMemoryStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_key(step: &str, region_deploy_type: RegionDeployType, region: &str) -> String {
        format!("{step}#{region_deploy_type}#{region}")
    }

    fn upsert(
        &self,
        track: &str,
        step: &str,
        step_id: &str,
        region_deploy_type: RegionDeployType,
        region: &str,
        result: RecordedResult,
        message: Option<String>,
    ) {
        let mut records = self.records.lock().expect("status sink mutex poisoned");
        records
            .entry(track.to_string())
            .or_default()
            .insert(
                Self::record_key(step, region_deploy_type, region),
                ExecutionRecord {
                    track: track.to_string(),
                    step: step.to_string(),
                    step_id: step_id.to_string(),
                    region: region.to_string(),
                    region_deploy_type,
                    result,
                    recorded_at: Utc::now().to_rfc3339(),
                    message,
                },
            );
    }
}

impl StatusSink for InMemoryStatusSink {
    fn record_step_start(
        &self,
        track: &str,
        step: &str,
        step_id: &str,
        region_deploy_type: RegionDeployType,
        region: &str,
    ) {
        self.upsert(
            track,
            step,
            step_id,
            region_deploy_type,
            region,
            RecordedResult::Started,
            None,
        );
    }

    fn record_step_success(
        &self,
        track: &str,
        step: &str,
        step_id: &str,
        region_deploy_type: RegionDeployType,
        region: &str,
    ) {
        self.upsert(
            track,
            step,
            step_id,
            region_deploy_type,
            region,
            RecordedResult::Success,
            None,
        );
    }

    fn record_step_fail(
        &self,
        track: &str,
        step: &str,
        step_id: &str,
        region_deploy_type: RegionDeployType,
        region: &str,
        message: &str,
    ) {
        self.upsert(
            track,
            step,
            step_id,
            region_deploy_type,
            region,
            RecordedResult::Fail,
            Some(message.to_string()),
        );
    }

    fn flush_track(&self, track: &str) -> Result<Vec<ExecutionRecord>> {
        let mut records = self.records.lock().expect("status sink mutex poisoned");
        let mut flushed: Vec<ExecutionRecord> = records
            .remove(track)
            .map(|m| m.into_values().collect())
            .unwrap_or_default();
        flushed.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        Ok(flushed)
    }
}
