//! Immutable deployment plan produced by discovery

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::steps::runner::Runner;

/// One deployable component of a track, discovered from a
/// `step<digit>_<name>` directory. Built once by discovery and read-only
/// thereafter.
#[derive(Clone)]
pub struct Step {
    pub name: String,
    /// Stable identifier: `#project#track#step`, or `#project#step` for the
    /// default track.
    pub id: String,
    pub dir: PathBuf,
    pub track_name: String,
    /// Gating level 1..9; all steps at a level run concurrently, the next
    /// level waits for all of them.
    pub progression_level: u32,
    pub tests_exist: bool,
    pub regional_resources_exist: bool,
    pub regional_tests_exist: bool,
    /// Backend selected for this step by the runner registry.
    pub runner: Arc<dyn Runner>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("dir", &self.dir)
            .field("track_name", &self.track_name)
            .field("progression_level", &self.progression_level)
            .field("tests_exist", &self.tests_exist)
            .field("regional_resources_exist", &self.regional_resources_exist)
            .field("regional_tests_exist", &self.regional_tests_exist)
            .finish_non_exhaustive()
    }
}

/// A named unit of deployment: an ordered collection of step progressions
#[derive(Debug, Clone, Default)]
pub struct Track {
    pub name: String,
    pub dir: PathBuf,
    /// Progression level -> unordered set of steps at that level.
    pub ordered_steps: BTreeMap<u32, Vec<Step>>,
    /// Highest progression level observed.
    pub step_progressions_count: u32,
    pub steps_count: usize,
    pub steps_with_tests_count: usize,
    pub steps_with_regional_tests_count: usize,
    /// At least one step deploys regional resources.
    pub regional_deployment: bool,
    /// The track named `_pretrack`; runs before, and gates, all others.
    pub is_pre_track: bool,
    /// The track named `default`, possibly synthesized from a legacy
    /// top-level layout.
    pub is_default_track: bool,
}

/// The full set of tracks to execute for one stage
#[derive(Debug, Default)]
pub struct Plan {
    pub tracks: Vec<Track>,
}
