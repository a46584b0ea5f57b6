//! Model of `repo` manifests, as far as needed to tell whether a checkout
//! of one is complete.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Errors raised while reading a repo manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read manifest {0}: {1}")]
    Read(PathBuf, String),

    #[error("Failed to parse manifest {0}: {1}")]
    Parse(PathBuf, String),

    #[error("Checkout below {0:?} is incomplete, missing: {1:?}")]
    IncompleteCheckout(PathBuf, Vec<PathBuf>),

    #[error("Manifest {0} includes itself")]
    IncludeCycle(PathBuf),
}

#[derive(Default, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename = "manifest")]
pub struct Manifest {
    pub remote: Option<Vec<Remote>>,
    pub default: Option<ManifestDefault>,
    #[serde(rename = "remove-project")]
    pub remove_project: Option<Vec<RemoveProject>>,
    pub project: Option<Vec<Project>>,
    pub include: Option<Vec<Include>>,
}

#[derive(Default, Debug, Serialize, Deserialize, PartialEq)]
pub struct Remote {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@fetch")]
    pub fetch: Option<String>,
    #[serde(rename = "@revision")]
    pub revision: Option<String>,
}

#[derive(Default, Debug, Serialize, Deserialize, PartialEq)]
pub struct ManifestDefault {
    #[serde(rename = "@remote")]
    pub remote: Option<String>,
    #[serde(rename = "@revision")]
    pub revision: Option<String>,
    #[serde(rename = "@sync-j")]
    pub sync_j: Option<String>,
}

#[derive(Default, Debug, Serialize, Deserialize, PartialEq)]
pub struct RemoveProject {
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Default, Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Project {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@path")]
    pub path: Option<String>,
    #[serde(rename = "@remote")]
    pub remote: Option<String>,
    #[serde(rename = "@groups")]
    pub groups: Option<String>,
    #[serde(rename = "@revision")]
    pub revision: Option<String>,
}

/// `<include name="..."/>`, relative to the manifests directory.
#[derive(Default, Debug, Serialize, Deserialize, PartialEq)]
pub struct Include {
    #[serde(rename = "@name")]
    pub name: String,
}

/// A manifest project with the manifest defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvenientProject {
    pub name: String,
    /// Checkout path relative to the repo client root.
    pub path: String,
    pub remote: Option<String>,
    pub revision: Option<String>,
}

pub struct ProjectsIterator<'a> {
    manifest: &'a Manifest,
    index: usize,
}

impl<'a> ProjectsIterator<'a> {
    pub fn new(manifest: &'a Manifest) -> Self {
        ProjectsIterator { manifest, index: 0 }
    }

    fn default_setting(&self, f: impl Fn(&ManifestDefault) -> Option<String>) -> Option<String> {
        self.manifest.default.as_ref().and_then(f)
    }
}

impl<'a> Iterator for ProjectsIterator<'a> {
    type Item = ConvenientProject;

    fn next(&mut self) -> Option<Self::Item> {
        let list = self.manifest.project.as_ref()?;
        let p = list.get(self.index)?;
        self.index += 1;

        Some(ConvenientProject {
            name: p.name.clone(),
            path: p.path.clone().unwrap_or_else(|| p.name.clone()),
            remote: p
                .remote
                .clone()
                .or_else(|| self.default_setting(|d| d.remote.clone())),
            revision: p
                .revision
                .clone()
                .or_else(|| self.default_setting(|d| d.revision.clone())),
        })
    }
}

impl Manifest {
    pub fn iter(&self) -> ProjectsIterator<'_> {
        ProjectsIterator::new(self)
    }

    /// Parse a manifest from its XML text.
    pub fn from_str_at(contents: &str, origin: &Path) -> Result<Self, ManifestError> {
        quick_xml::de::from_str(contents)
            .map_err(|e| ManifestError::Parse(origin.to_path_buf(), e.to_string()))
    }

    /// Read and parse a manifest file.
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ManifestError::Read(path.to_path_buf(), e.to_string()))?;
        let manifest = Self::from_str_at(&contents, path)?;
        info!(
            "Loaded repo manifest {} ({} projects)",
            path.display(),
            manifest.project.as_ref().map_or(0, Vec::len)
        );
        Ok(manifest)
    }

    /// Read a manifest and merge in everything it includes.
    ///
    /// Include names are resolved against the directory of `path`, which is
    /// how repo treats them inside `.repo/manifests`. Projects, remotes and
    /// removals of included files are appended; the first `<default>` wins.
    pub fn from_file_with_includes(path: &Path) -> Result<Self, ManifestError> {
        let manifests_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut stack = Vec::new();
        Self::load_tree(manifests_dir, path.to_path_buf(), &mut stack)
    }

    fn load_tree(
        manifests_dir: &Path,
        path: PathBuf,
        stack: &mut Vec<PathBuf>,
    ) -> Result<Self, ManifestError> {
        if stack.contains(&path) {
            return Err(ManifestError::IncludeCycle(path));
        }
        let mut manifest = Self::from_file(&path)?;
        stack.push(path);
        for include in manifest.include.take().unwrap_or_default() {
            debug!("Following include {}", include.name);
            let included_path = manifests_dir.join(&include.name);
            let included = Self::load_tree(manifests_dir, included_path, stack)?;
            manifest.merge(included);
        }
        stack.pop();
        Ok(manifest)
    }

    fn merge(&mut self, other: Manifest) {
        fn append<T>(into: &mut Option<Vec<T>>, from: Option<Vec<T>>) {
            if let Some(items) = from {
                into.get_or_insert_with(Vec::new).extend(items);
            }
        }
        append(&mut self.remote, other.remote);
        append(&mut self.remove_project, other.remove_project);
        append(&mut self.project, other.project);
        if self.default.is_none() {
            self.default = other.default;
        }
    }

    fn removed_projects(&self) -> Vec<&str> {
        self.remove_project
            .iter()
            .flatten()
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Checkout paths of all projects, relative to the repo client root.
    /// Projects named in `<remove-project>` are left out.
    pub fn checkout_paths(&self) -> Vec<PathBuf> {
        let removed = self.removed_projects();
        self.iter()
            .filter(|p| !removed.contains(&p.name.as_str()))
            .map(|p| PathBuf::from(&p.path))
            .collect()
    }

    /// Checkout paths that do not exist below `client_root`.
    pub fn missing_checkouts(&self, client_root: &Path) -> Vec<PathBuf> {
        let removed = self.removed_projects();
        let mut missing = Vec::new();
        for project in self.iter().filter(|p| !removed.contains(&p.name.as_str())) {
            if !client_root.join(&project.path).is_dir() {
                debug!(
                    "{} ({}) not checked out at {}",
                    project.name,
                    project.revision.as_deref().unwrap_or("default revision"),
                    project.path
                );
                missing.push(PathBuf::from(project.path));
            }
        }
        if !missing.is_empty() {
            warn!(
                "{} manifest projects missing below {}",
                missing.len(),
                client_root.display()
            );
        }
        missing
    }

    /// Check that every project and every `required` path exists below
    /// `client_root`.
    pub fn verify_checkout(
        &self,
        client_root: &Path,
        required: &[PathBuf],
    ) -> Result<(), ManifestError> {
        let mut missing = self.missing_checkouts(client_root);
        missing.extend(
            required
                .iter()
                .filter(|p| !client_root.join(p).is_dir())
                .cloned(),
        );
        if missing.is_empty() {
            debug!("Checkout below {} is complete", client_root.display());
            Ok(())
        } else {
            Err(ManifestError::IncompleteCheckout(
                client_root.to_path_buf(),
                missing,
            ))
        }
    }
}
