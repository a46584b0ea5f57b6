//! Publishing of built packages into the shared feed directory.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use filetime::FileTime;
use flate2::write::GzEncoder;
use flate2::Compression;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};
use walkdir::WalkDir;

use crate::builder::BuildArtifactInfo;
use crate::environment::{FeedDescriptor, LayerSpec};
use crate::runner::{CommandRunner, CommandSpec, RunError};

pub const LOCK_FILE: &str = ".layer-build.lock";
pub const INDEX_FILE: &str = "Packages";
pub const COMPRESSED_INDEX_FILE: &str = "Packages.gz";

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("IO error at {0:?}: {1}")]
    Io(PathBuf, String),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("Deploy directory {0:?} does not exist")]
    MissingDeployDir(PathBuf),

    #[error(
        "Shared feed root is in use by `{command}` (PID {pid}, started {started_at})\n\
         If no build is running, remove the lock file:\n  {lock_path:?}"
    )]
    Locked {
        command: String,
        pid: u32,
        started_at: String,
        lock_path: PathBuf,
    },

    #[error("Shared feed root is in use (lock file {0:?} has no readable owner)")]
    LockedUnknown(PathBuf),

    #[error("Failed to lock {0:?}: {1}")]
    Lock(PathBuf, Errno),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> FeedError + '_ {
    move |e| FeedError::Io(path.to_path_buf(), e.to_string())
}

/// Owner information stored in the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMetadata {
    pub pid: u32,
    pub command: String,
    pub started_at: DateTime<Utc>,
}

/// Exclusive lock on the shared feed root, released on drop.
pub struct FeedLock {
    file: Flock<File>,
    path: PathBuf,
}

impl FeedLock {
    /// Lock `shared_feed_root` without waiting.
    pub fn acquire(shared_feed_root: &Path, command: &str) -> Result<FeedLock, FeedError> {
        std::fs::create_dir_all(shared_feed_root).map_err(io_error(shared_feed_root))?;
        let path = shared_feed_root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_error(&path))?;

        let file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(file) => file,
            Err((_, Errno::EWOULDBLOCK)) => return Err(contention_error(&path)),
            Err((_, errno)) => return Err(FeedError::Lock(path, errno)),
        };

        let metadata = LockMetadata {
            pid: std::process::id(),
            command: command.to_string(),
            started_at: Utc::now(),
        };
        let text = serde_json::to_string_pretty(&metadata)
            .map_err(|e| FeedError::Io(path.clone(), e.to_string()))?;
        let mut handle: &File = &file;
        handle.set_len(0).map_err(io_error(&path))?;
        handle.write_all(text.as_bytes()).map_err(io_error(&path))?;
        handle.flush().map_err(io_error(&path))?;

        debug!("Locked {:?} for `{}`", path, command);
        Ok(FeedLock { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> Option<LockMetadata> {
        read_metadata(&self.path)
    }

    /// Release the lock now instead of on drop.
    pub fn release(self) {
        if let Err((_, errno)) = self.file.unlock() {
            warn!("Failed to unlock {:?}: {}", self.path, errno);
        }
    }
}

fn read_metadata(path: &Path) -> Option<LockMetadata> {
    let mut text = String::new();
    File::open(path).ok()?.read_to_string(&mut text).ok()?;
    serde_json::from_str(&text).ok()
}

fn contention_error(path: &Path) -> FeedError {
    match read_metadata(path) {
        Some(owner) => FeedError::Locked {
            command: owner.command,
            pid: owner.pid,
            started_at: owner.started_at.to_rfc3339(),
            lock_path: path.to_path_buf(),
        },
        None => FeedError::LockedUnknown(path.to_path_buf()),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorStats {
    pub copied: usize,
    pub unchanged: usize,
}

/// Copy everything below `src` into `dst`.
///
/// A file is copied when it is missing in `dst` or differs in size or
/// modification time; the copy keeps the source modification time. Files
/// that only exist in `dst` are left alone.
pub fn mirror_dir(src: &Path, dst: &Path) -> Result<MirrorStats, FeedError> {
    let mut stats = MirrorStats::default();
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| FeedError::Io(src.to_path_buf(), e.to_string()))?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(io_error(&target))?;
            continue;
        }
        if !entry.file_type().is_file() {
            debug!("Skipping special file {:?}", entry.path());
            continue;
        }

        let source_meta = entry
            .metadata()
            .map_err(|e| FeedError::Io(entry.path().to_path_buf(), e.to_string()))?;
        let source_mtime = FileTime::from_last_modification_time(&source_meta);
        let up_to_date = std::fs::metadata(&target)
            .map(|m| {
                m.is_file()
                    && m.len() == source_meta.len()
                    && FileTime::from_last_modification_time(&m) == source_mtime
            })
            .unwrap_or(false);
        if up_to_date {
            stats.unchanged += 1;
            continue;
        }

        std::fs::copy(entry.path(), &target).map_err(io_error(&target))?;
        filetime::set_file_mtime(&target, source_mtime).map_err(io_error(&target))?;
        stats.copied += 1;
    }
    debug!(
        "Mirrored {:?} to {:?}: {} copied, {} unchanged",
        src, dst, stats.copied, stats.unchanged
    );
    Ok(stats)
}

/// Regenerate `Packages` and `Packages.gz` in `deploy_dir`. Returns the
/// number of packages listed.
pub fn write_index(
    runner: &dyn CommandRunner,
    index_tool: &Path,
    deploy_dir: &Path,
) -> Result<usize, FeedError> {
    let output = runner.check(
        &CommandSpec::new(index_tool.display().to_string())
            .arg(".")
            .cwd(deploy_dir)
            .capture(),
    )?;

    let index_path = deploy_dir.join(INDEX_FILE);
    std::fs::write(&index_path, &output.stdout).map_err(io_error(&index_path))?;

    let gz_path = deploy_dir.join(COMPRESSED_INDEX_FILE);
    let gz_file = File::create(&gz_path).map_err(io_error(&gz_path))?;
    let mut encoder = GzEncoder::new(gz_file, Compression::best());
    encoder
        .write_all(output.stdout.as_bytes())
        .map_err(io_error(&gz_path))?;
    encoder.finish().map_err(io_error(&gz_path))?;

    let packages = output
        .stdout
        .lines()
        .filter(|line| line.starts_with("Package:"))
        .count();
    info!("Indexed {} packages in {:?}", packages, deploy_dir);
    Ok(packages)
}

pub struct FeedPublisher<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> FeedPublisher<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        FeedPublisher { runner }
    }

    /// Publish the packages of a finished layer build into its feed.
    pub fn publish(
        &self,
        spec: &LayerSpec,
        artifacts: &BuildArtifactInfo,
    ) -> Result<FeedDescriptor, FeedError> {
        let span = info_span!("publish", layer = %spec.layer);
        let _enter = span.enter();

        let feed = spec.feed();
        std::fs::create_dir_all(&feed.path).map_err(io_error(&feed.path))?;
        if !artifacts.deploy_dir.is_dir() {
            return Err(FeedError::MissingDeployDir(artifacts.deploy_dir.clone()));
        }

        let stats = if spec.profile().generates_index {
            match &artifacts.index_tool {
                Some(tool) => {
                    write_index(self.runner, tool, &artifacts.deploy_dir)?;
                }
                None => warn!(
                    "No index tool for {}, publishing {:?} without index",
                    spec.layer, artifacts.deploy_dir
                ),
            }
            mirror_dir(&artifacts.deploy_dir, &feed.path)?
        } else {
            let arch_dir = artifacts.deploy_dir.join(&artifacts.package_arch);
            if !arch_dir.is_dir() {
                return Err(FeedError::MissingDeployDir(arch_dir));
            }
            mirror_dir(&arch_dir, &feed.path.join(&artifacts.package_arch))?
        };

        info!(
            "Published {} feed to {:?} ({} files copied, {} unchanged)",
            spec.layer, feed.path, stats.copied, stats.unchanged
        );
        Ok(feed)
    }
}
