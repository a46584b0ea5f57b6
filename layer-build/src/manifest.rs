//! Manifest checkout of one layer's sources with `repo`.
//!
//! A layer work directory counts as initialised once it carries a sync
//! record, which is only written after `repo sync` succeeded and the
//! checkout was verified against the manifest.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use convenient_repo::{Manifest, ManifestError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::environment::LayerSpec;
use crate::runner::{CommandRunner, CommandSpec, RunError};

pub const SYNC_RECORD: &str = ".layer-build-synced";
const MAX_SYNC_JOBS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ManifestInitError {
    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("IO error at {0:?}: {1}")]
    Io(PathBuf, String),
}

/// Contents of the sync record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub url: String,
    pub branch: String,
    pub file: String,
    pub synced_at: DateTime<Utc>,
}

impl SyncRecord {
    fn matches(&self, spec: &LayerSpec) -> bool {
        self.url == spec.manifest_url
            && self.branch == spec.manifest_branch
            && self.file == spec.manifest_file
    }

    pub fn read(work_dir: &Path) -> Option<SyncRecord> {
        let path = work_dir.join(SYNC_RECORD);
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ignoring unreadable sync record {:?}: {}", path, e);
                None
            }
        }
    }

    fn write(&self, work_dir: &Path) -> Result<(), ManifestInitError> {
        let path = work_dir.join(SYNC_RECORD);
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| ManifestInitError::Io(path.clone(), e.to_string()))?;
        std::fs::write(&path, text).map_err(|e| ManifestInitError::Io(path, e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestOutcome {
    Skipped,
    Synced,
}

pub struct ManifestInitializer<'a> {
    runner: &'a dyn CommandRunner,
    jobs: usize,
}

impl<'a> ManifestInitializer<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        ManifestInitializer {
            runner,
            jobs: num_cpus::get().clamp(1, MAX_SYNC_JOBS),
        }
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Make sure the layer's sources are checked out below its work
    /// directory.
    pub fn ensure(&self, spec: &LayerSpec) -> Result<ManifestOutcome, ManifestInitError> {
        let work_dir = &spec.work_dir;
        if let Some(record) = SyncRecord::read(work_dir) {
            if !record.matches(spec) {
                warn!(
                    "{} was synced from {} ({}, {}), requested {} ({}, {}); keeping the existing checkout",
                    work_dir.display(),
                    record.url,
                    record.branch,
                    record.file,
                    spec.manifest_url,
                    spec.manifest_branch,
                    spec.manifest_file
                );
            }
            info!("Sources of {} already synced, skipping", spec.layer);
            return Ok(ManifestOutcome::Skipped);
        }

        std::fs::create_dir_all(work_dir)
            .map_err(|e| ManifestInitError::Io(work_dir.clone(), e.to_string()))?;

        if work_dir.join(".repo").is_dir() {
            info!(
                "Resuming interrupted checkout of {} in {}",
                spec.layer,
                work_dir.display()
            );
        } else {
            info!(
                "Initialising {} from {} ({}, {})",
                spec.layer, spec.manifest_url, spec.manifest_branch, spec.manifest_file
            );
            self.runner.check(
                &CommandSpec::new("repo")
                    .args([
                        "init",
                        "-u",
                        spec.manifest_url.as_str(),
                        "-b",
                        spec.manifest_branch.as_str(),
                        "-m",
                        spec.manifest_file.as_str(),
                        "--no-clone-bundle",
                    ])
                    .cwd(work_dir),
            )?;
        }

        info!("Syncing {} with {} jobs", spec.layer, self.jobs);
        self.runner.check(
            &CommandSpec::new("repo")
                .args(["sync", "--no-clone-bundle", "--no-tags"])
                .arg(format!("-j{}", self.jobs))
                .cwd(work_dir),
        )?;

        verify_checkout(spec)?;
        SyncRecord {
            url: spec.manifest_url.clone(),
            branch: spec.manifest_branch.clone(),
            file: spec.manifest_file.clone(),
            synced_at: Utc::now(),
        }
        .write(work_dir)?;
        info!("Sources of {} synced", spec.layer);
        Ok(ManifestOutcome::Synced)
    }
}

/// Every project of the checked out manifest and the layer's marker
/// directory have to be present.
pub fn verify_checkout(spec: &LayerSpec) -> Result<(), ManifestError> {
    let manifest_path = spec
        .work_dir
        .join(".repo/manifests")
        .join(&spec.manifest_file);
    let manifest = Manifest::from_file_with_includes(&manifest_path)?;
    debug!(
        "Verifying {} projects of {:?}",
        manifest.checkout_paths().len(),
        manifest_path
    );
    manifest.verify_checkout(&spec.work_dir, std::slice::from_ref(&spec.checkout_marker))
}
