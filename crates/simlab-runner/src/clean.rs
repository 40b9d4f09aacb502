//! Explicit removal and inspection of a run's on-disk artifacts.

use crate::checkpoint::{CheckpointStore, CheckpointSummary};
use crate::paths::RunPaths;
use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanTargets {
    pub checkpoint: bool,
    pub results: bool,
    pub seeds: bool,
    pub generated_data: bool,
    pub output: bool,
}

impl CleanTargets {
    pub fn all() -> Self {
        Self {
            checkpoint: true,
            results: true,
            seeds: true,
            generated_data: true,
            output: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Remove the selected artifacts. Returns the paths that existed and were removed.
pub fn clean(paths: &RunPaths, targets: CleanTargets) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if targets.checkpoint {
        remove_path(&paths.checkpoint(), &mut removed)?;
    }
    if targets.results {
        remove_path(&paths.results_dir(), &mut removed)?;
    }
    if targets.seeds {
        remove_path(&paths.seeds_dir(), &mut removed)?;
    }
    if targets.generated_data {
        remove_path(&paths.generated_data_dir(), &mut removed)?;
    }
    if targets.output {
        remove_path(&paths.output(), &mut removed)?;
    }
    Ok(removed)
}

fn remove_path(path: &Path, removed: &mut Vec<PathBuf>) -> Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else if path.exists() {
        fs::remove_file(path)?;
    } else {
        return Ok(());
    }
    info!(path = %path.display(), "removed");
    removed.push(path.to_path_buf());
    Ok(())
}

/// Progress recorded in the run's checkpoint, if one exists.
pub fn inspect(paths: &RunPaths) -> Result<Option<CheckpointSummary>> {
    let store = CheckpointStore::new(paths.checkpoint(), false);
    Ok(store
        .load()?
        .map(|record| CheckpointSummary::from_record(store.path(), &record)))
}

/// Every file under the results, seeds and generated-data directories, sorted.
pub fn list_artifacts(paths: &RunPaths) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for dir in [paths.results_dir(), paths.seeds_dir(), paths.generated_data_dir()] {
        if !dir.exists() {
            continue;
        }
        for entry in WalkDir::new(&dir) {
            let entry = entry?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    Ok(files)
}
