//! Directory-based track discovery
//!
//! Walks the repository tree and produces the plan: tracks under
//! `<root>/tracks/`, steps from their `step<digit>_<name>` children, plus a
//! synthetic `default` track when IaC files sit directly at the root.
//! Discovery is pure: runners are selected but never invoked.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use super::plan::{Plan, Step, Track};
use crate::config::{DeployConfig, DEFAULT_TRACK_NAME, PRE_TRACK_NAME};
use crate::steps::registry;

const STEP_PREFIX: &str = "step";
const TRACKS_DIR: &str = "tracks";

/// Presence-only marker for a step's test suite
const TESTS_MARKER: &str = "tests/tests.test";

/// Marker directory for a step's regional resources
const REGIONAL_DIR: &str = "regional";

/// Discovers tracks from a deployment repository root
pub struct DirectoryTracker {
    root: PathBuf,
}

impl DirectoryTracker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Gather all tracks that should be executed based on the directory
    /// structure.
    pub fn gather_tracks(&self, cfg: &DeployConfig) -> Result<Plan> {
        let tracks_dir = self.root.join(TRACKS_DIR);

        // Legacy layout: IaC files at the root promote the root's step
        // directories into a synthetic default track under tracks/.
        if has_root_iac_files(&self.root) {
            if let Err(e) = self.synthesize_default_track(&tracks_dir) {
                error!("failed to set up the default track: {e:#}");
            }
        }

        let mut tracks = Vec::new();
        let mut names = match fs::read_dir(&tracks_dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| e.path().is_dir())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
            Err(_) => return Ok(Plan { tracks }),
        };
        names.sort();

        for name in names {
            let dir = tracks_dir.join(&name);
            if let Some(track) = self.read_track(cfg, &name, &dir)? {
                info!(track = %track.name, "adding track");
                tracks.push(track);
            }
        }

        if tracks.iter().any(|t| t.is_default_track) && tracks.len() > 1 {
            warn!(
                "a default track exists alongside one or more explicit tracks; \
                 migrate the default track's steps to a named track instead"
            );
        }

        Ok(Plan { tracks })
    }

    /// Copy every `stepN_*` child of the root into `tracks/default/` so the
    /// legacy single-track layout needs no special casing downstream.
    fn synthesize_default_track(&self, tracks_dir: &Path) -> Result<()> {
        let dest = tracks_dir.join(DEFAULT_TRACK_NAME);
        info!("root IaC files found, synthesizing the default track");

        fs::create_dir_all(&dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;

        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("failed to read root directory {}", self.root.display()))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == TRACKS_DIR || !name.starts_with(STEP_PREFIX) || !entry.path().is_dir() {
                continue;
            }
            copy_dir_recursive(&entry.path(), &dest.join(&name))?;
        }
        Ok(())
    }

    fn read_track(&self, cfg: &DeployConfig, name: &str, dir: &Path) -> Result<Option<Track>> {
        let mut track = Track {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            is_pre_track: name == PRE_TRACK_NAME,
            is_default_track: name == DEFAULT_TRACK_NAME,
            ..Track::default()
        };

        if track.is_pre_track {
            debug!("pre-track found");
        }

        // An empty target set deploys nothing.
        if cfg.step_whitelist.is_empty() && !cfg.target_all {
            warn!(track = name, "skipping track, no steps targeted");
            return Ok(None);
        }

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!(track = name, "failed to read track directory: {e}");
                return Ok(None);
            }
        };
        let mut folders = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(STEP_PREFIX))
            .collect::<Vec<_>>();
        folders.sort();

        let mut highest_progression_level = 0;
        for folder in folders {
            let step_dir = dir.join(&folder);
            let (progression_level, step_name) = match parse_step_folder(&folder) {
                Some(parsed) => parsed,
                None => {
                    error!(
                        folder,
                        "invalid step folder name, expected step<digit>_<name>"
                    );
                    continue;
                }
            };

            // The default track's steps drop the track segment from the id.
            let id = if track.is_default_track {
                format!("#{}#{}", cfg.project, step_name)
            } else {
                format!("#{}#{}#{}", cfg.project, track.name, step_name)
            };

            if !cfg.step_targeted(&id) {
                warn!(step = %id, "step disabled, not present in whitelist");
                continue;
            }

            let tests_exist = step_dir.join(TESTS_MARKER).is_file();
            let regional_resources_exist = exists_non_empty(&step_dir.join(REGIONAL_DIR));
            let regional_tests_exist = regional_resources_exist
                && step_dir.join(REGIONAL_DIR).join(TESTS_MARKER).is_file();
            let runner = registry::determine_runner(&step_dir);

            info!(
                step = %id,
                tests_exist,
                regional_resources_exist,
                regional_tests_exist,
                "adding step"
            );

            if regional_resources_exist {
                track.regional_deployment = true;
            }
            if tests_exist {
                track.steps_with_tests_count += 1;
            }
            if regional_tests_exist {
                track.steps_with_regional_tests_count += 1;
            }

            highest_progression_level = highest_progression_level.max(progression_level);
            track.steps_count += 1;
            track
                .ordered_steps
                .entry(progression_level)
                .or_default()
                .push(Step {
                    name: step_name,
                    id,
                    dir: step_dir,
                    track_name: track.name.clone(),
                    progression_level,
                    tests_exist,
                    regional_resources_exist,
                    regional_tests_exist,
                    runner,
                });
        }

        track.step_progressions_count = highest_progression_level;
        if track.steps_count == 0 {
            return Ok(None);
        }
        Ok(Some(track))
    }
}

/// Parse `step<digit>_<name>` into (progression level, step name). The
/// progression digit is a single strictly-positive decimal digit.
fn parse_step_folder(folder: &str) -> Option<(u32, String)> {
    let rest = folder.strip_prefix(STEP_PREFIX)?;
    let mut chars = rest.chars();
    let progression_level = chars.next()?.to_digit(10)?;
    if progression_level == 0 || chars.next()? != '_' {
        return None;
    }
    let name = chars.collect::<String>();
    if name.is_empty() {
        return None;
    }
    Some((progression_level, name))
}

fn has_root_iac_files(root: &Path) -> bool {
    fs::read_dir(root)
        .map(|entries| {
            entries.flatten().any(|e| {
                let path = e.path();
                path.is_file() && path.extension().and_then(|ext| ext.to_str()) == Some("tf")
            })
        })
        .unwrap_or(false)
}

/// Whether the path exists and is a non-empty directory or file.
fn exists_non_empty(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(md) if md.is_dir() => fs::read_dir(path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false),
        Ok(md) => md.len() > 0,
        Err(_) => false,
    }
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    let entries =
        fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))?;
    for entry in entries.flatten() {
        let target = dest.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("failed to copy {} to {}", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}
