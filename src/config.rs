//! Deployment configuration shared across the engine
//!
//! This module centralizes the configuration consumed by discovery and the
//! executors, plus the reserved track names.

use std::fmt;

use derive_builder::Builder;
use serde::Serialize;

/// Name of the directory for the pre-track; it runs before, and gates, all
/// other tracks.
pub const PRE_TRACK_NAME: &str = "_pretrack";

/// Name of the default top-level track, synthesized from a legacy layout
/// that keeps step directories next to the root IaC files.
pub const DEFAULT_TRACK_NAME: &str = "default";

/// Whether a step executes in the single primary region or in one of the
/// fanned-out regional regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RegionDeployType {
    Primary,
    Regional,
}

impl fmt::Display for RegionDeployType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionDeployType::Primary => write!(f, "primary"),
            RegionDeployType::Regional => write!(f, "regional"),
        }
    }
}

/// Configuration for one deployment stage
#[derive(Debug, Clone, Builder, Serialize)]
#[builder(setter(into))]
pub struct DeployConfig {
    /// Project name, used in stable step identifiers.
    pub project: String,

    /// The single region for primary executions.
    pub primary_region: String,

    /// Regions for regional executions of steps with regional resources.
    #[builder(default)]
    pub regional_regions: Vec<String>,

    /// Step identifiers to include (`#project#track#step`). Matching is
    /// case-insensitive. An empty whitelist with `target_all` unset deploys
    /// nothing.
    #[builder(default)]
    pub step_whitelist: Vec<String>,

    /// When true, bypass whitelist filtering and target every step.
    #[builder(default)]
    pub target_all: bool,

    /// When true (and not a dry run), destroy all deployed resources after
    /// the deploy pass completes.
    #[builder(default)]
    pub self_destroy: bool,

    /// Disables step tests and the destroy pass.
    #[builder(default)]
    pub dry_run: bool,
}

impl DeployConfig {
    /// Whether the given step identifier is targeted by this configuration.
    pub fn step_targeted(&self, step_id: &str) -> bool {
        self.target_all
            || self
                .step_whitelist
                .iter()
                .any(|w| w.eq_ignore_ascii_case(step_id))
    }
}
