//! Build environment generation
//!
//! A [`BuildConfig`] collects whatever the user supplied (flags, a YAML
//! file, prompts). [`BuildConfig::generate`] validates it and derives the
//! immutable [`BuildEnvironment`] that every later stage receives.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::layer::{BranchSource, Layer, LayerProfile, Platform};

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error(
        "Unsupported layer {0:?}, expected one of oss, vendor, middleware, application, image-assembler"
    )]
    UnknownLayer(String),

    #[error("Missing required setting {0}")]
    Missing(String),

    #[error("Invalid value for {0}: {1}")]
    Invalid(String, String),

    #[error("Unknown target platform {0:?}, declare its machines in the configuration file")]
    UnknownPlatform(String),

    #[error("Layer {0} is not built when {1} is requested")]
    NotInChain(Layer, Layer),

    #[error("IO error at {0:?}: {1}")]
    Io(PathBuf, String),

    #[error("Failed to parse configuration {0:?}: {1}")]
    Config(PathBuf, String),
}

/// Whether downstream layers read a feed from the shared directory or from
/// the remote URL mirroring it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedSource {
    #[default]
    Local,
    Remote,
}

impl fmt::Display for FeedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedSource::Local => f.write_str("local"),
            FeedSource::Remote => f.write_str("remote"),
        }
    }
}

impl FromStr for FeedSource {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "local" => Ok(FeedSource::Local),
            "remote" => Ok(FeedSource::Remote),
            other => Err(EnvError::Invalid(
                "feed source".to_string(),
                format!("{:?} (expected local or remote)", other),
            )),
        }
    }
}

/// Per layer settings replacing the builtin profile values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayerOverride {
    pub manifest_url: Option<String>,
    pub manifest_branch: Option<String>,
    pub manifest_file: Option<String>,
    pub package: Option<String>,
    pub feed_source: Option<FeedSource>,
    pub include_dir: Option<PathBuf>,
    pub checkout_marker: Option<PathBuf>,
}

impl LayerOverride {
    fn or(self, fallback: LayerOverride) -> LayerOverride {
        LayerOverride {
            manifest_url: self.manifest_url.or(fallback.manifest_url),
            manifest_branch: self.manifest_branch.or(fallback.manifest_branch),
            manifest_file: self.manifest_file.or(fallback.manifest_file),
            package: self.package.or(fallback.package),
            feed_source: self.feed_source.or(fallback.feed_source),
            include_dir: self.include_dir.or(fallback.include_dir),
            checkout_marker: self.checkout_marker.or(fallback.checkout_marker),
        }
    }
}

/// User supplied build settings, every field optional until [`generate`]
/// checks them.
///
/// ```yaml
/// target: raspberrypi4-64
/// layer: middleware
/// manifest_branch: RDK7-1.0.0
/// oss_branch: 4.6.2-community
/// workspace: /work
/// shared_feed_root: /shared
/// layers:
///   vendor:
///     feed_source: remote
/// ```
///
/// [`generate`]: BuildConfig::generate
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub target: Option<String>,
    pub layer: Option<Layer>,
    pub manifest_branch: Option<String>,
    pub oss_branch: Option<String>,
    pub workspace: Option<PathBuf>,
    pub shared_feed_root: Option<PathBuf>,
    pub feed_base_url: Option<String>,
    pub platform: Option<Platform>,
    pub layers: BTreeMap<Layer, LayerOverride>,
}

impl BuildConfig {
    pub fn from_yaml(text: &str, origin: &Path) -> Result<BuildConfig, EnvError> {
        serde_yaml::from_str(text)
            .map_err(|e| EnvError::Config(origin.to_path_buf(), e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<BuildConfig, EnvError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EnvError::Io(path.to_path_buf(), e.to_string()))?;
        let config = Self::from_yaml(&text, path)?;
        debug!("Loaded build configuration from {:?}", path);
        Ok(config)
    }

    /// Fill every unset field from `fallback`.
    pub fn or(self, fallback: BuildConfig) -> BuildConfig {
        let mut layers = fallback.layers;
        for (layer, settings) in self.layers {
            let merged = match layers.remove(&layer) {
                Some(lower) => settings.or(lower),
                None => settings,
            };
            layers.insert(layer, merged);
        }
        BuildConfig {
            target: self.target.or(fallback.target),
            layer: self.layer.or(fallback.layer),
            manifest_branch: self.manifest_branch.or(fallback.manifest_branch),
            oss_branch: self.oss_branch.or(fallback.oss_branch),
            workspace: self.workspace.or(fallback.workspace),
            shared_feed_root: self.shared_feed_root.or(fallback.shared_feed_root),
            feed_base_url: self.feed_base_url.or(fallback.feed_base_url),
            platform: self.platform.or(fallback.platform),
            layers,
        }
    }

    /// Validate the settings and derive the environment without touching
    /// the filesystem.
    pub fn resolve(&self) -> Result<BuildEnvironment, EnvError> {
        let target = required_word("target", self.target.as_deref())?;
        let layer = self.layer.ok_or_else(|| EnvError::Missing("layer".to_string()))?;
        let manifest_branch = required_word("manifest_branch", self.manifest_branch.as_deref())?;
        let oss_branch = required_word("oss_branch", self.oss_branch.as_deref())?;
        let workspace = required_dir("workspace", self.workspace.as_deref())?;
        let shared_feed_root = required_dir("shared_feed_root", self.shared_feed_root.as_deref())?;

        let platform = match &self.platform {
            Some(platform) if platform.name == target => platform.clone(),
            Some(platform) => {
                return Err(EnvError::Invalid(
                    "platform".to_string(),
                    format!("declares {:?} but the target is {:?}", platform.name, target),
                ))
            }
            None => Platform::builtin(&target)
                .ok_or_else(|| EnvError::UnknownPlatform(target.clone()))?,
        };

        let feed_base_url = match self.feed_base_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => format!("file://{}", shared_feed_root.display()),
        };

        let mut layers = BTreeMap::new();
        for chain_layer in layer.chain() {
            let settings = self.layers.get(&chain_layer).cloned().unwrap_or_default();
            let spec = LayerSpec::derive(
                chain_layer.profile(),
                settings,
                &platform,
                &Branches {
                    manifest: &manifest_branch,
                    oss: &oss_branch,
                },
                &workspace,
                &shared_feed_root,
                &feed_base_url,
            )?;
            layers.insert(chain_layer, spec);
        }
        for configured in self.layers.keys().filter(|l| **l > layer) {
            debug!("Ignoring settings of {}, it is after {}", configured, layer);
        }

        let requested = &layers[&layer];
        Ok(BuildEnvironment {
            target,
            layer,
            manifest_branch,
            oss_branch,
            machine: requested.machine.clone(),
            workspace,
            shared_feed_root,
            feed_base_url,
            layers,
        })
    }

    /// Derive the environment and create the shared feed root.
    pub fn generate(&self) -> Result<BuildEnvironment, EnvError> {
        let env = self.resolve()?;
        if !env.shared_feed_root.is_dir() {
            std::fs::create_dir_all(&env.shared_feed_root)
                .map_err(|e| EnvError::Io(env.shared_feed_root.clone(), e.to_string()))?;
            info!("Created shared feed root {:?}", env.shared_feed_root);
        }
        info!(
            "Environment for {} on {}: {} layers",
            env.layer,
            env.target,
            env.layers.len()
        );
        Ok(env)
    }
}

struct Branches<'a> {
    manifest: &'a str,
    oss: &'a str,
}

fn required_word(field: &str, value: Option<&str>) -> Result<String, EnvError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EnvError::Missing(field.to_string()))?;
    if value.chars().any(char::is_whitespace) {
        return Err(EnvError::Invalid(
            field.to_string(),
            format!("{:?} contains whitespace", value),
        ));
    }
    Ok(value.to_string())
}

fn required_dir(field: &str, value: Option<&Path>) -> Result<PathBuf, EnvError> {
    let value = value
        .filter(|v| !v.as_os_str().is_empty())
        .ok_or_else(|| EnvError::Missing(field.to_string()))?;
    if !value.is_absolute() {
        return Err(EnvError::Invalid(
            field.to_string(),
            format!("{:?} is not an absolute path", value),
        ));
    }
    Ok(value.to_path_buf())
}

/// Resolved description of one layer of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
    pub layer: Layer,
    pub manifest_url: String,
    pub manifest_branch: String,
    pub manifest_file: String,
    pub package: String,
    pub machine: String,
    /// Build directory name, relative to the work directory.
    pub build_dir: String,
    pub work_dir: PathBuf,
    pub feed_path: PathBuf,
    pub remote_feed_url: String,
    pub feed_source: FeedSource,
    /// Relative to the work directory.
    pub include_dir: PathBuf,
    /// Relative to the work directory.
    pub checkout_marker: PathBuf,
}

impl LayerSpec {
    fn derive(
        profile: &LayerProfile,
        settings: LayerOverride,
        platform: &Platform,
        branches: &Branches<'_>,
        workspace: &Path,
        shared_feed_root: &Path,
        feed_base_url: &str,
    ) -> Result<LayerSpec, EnvError> {
        let layer = profile.layer;
        let default_branch = match profile.branch {
            BranchSource::Oss => branches.oss,
            BranchSource::Manifest => branches.manifest,
        };
        let manifest_branch = required_word(
            &format!("{}.manifest_branch", layer),
            Some(settings.manifest_branch.as_deref().unwrap_or(default_branch)),
        )?;
        let manifest_url = required_word(
            &format!("{}.manifest_url", layer),
            Some(settings.manifest_url.as_deref().unwrap_or(profile.manifest_url)),
        )?;
        let manifest_file = required_word(
            &format!("{}.manifest_file", layer),
            Some(settings.manifest_file.as_deref().unwrap_or(profile.manifest_file)),
        )?;
        let package = required_word(
            &format!("{}.package", layer),
            Some(settings.package.as_deref().unwrap_or(profile.package)),
        )?;

        let machine = platform.machine(profile.machine).to_string();
        let feed_dir = format!("{}-{}", machine, layer);
        Ok(LayerSpec {
            layer,
            build_dir: format!("build-{}", machine),
            work_dir: workspace.join(layer.name()),
            feed_path: shared_feed_root
                .join(&feed_dir)
                .join(&manifest_branch)
                .join("ipk"),
            remote_feed_url: format!("{}/{}/{}/ipk", feed_base_url, feed_dir, manifest_branch),
            feed_source: settings.feed_source.unwrap_or_default(),
            include_dir: settings
                .include_dir
                .unwrap_or_else(|| PathBuf::from(profile.include_dir)),
            checkout_marker: settings
                .checkout_marker
                .unwrap_or_else(|| PathBuf::from(profile.checkout_marker)),
            manifest_url,
            manifest_branch,
            manifest_file,
            package,
            machine,
        })
    }

    pub fn profile(&self) -> &'static LayerProfile {
        self.layer.profile()
    }

    pub fn build_path(&self) -> PathBuf {
        self.work_dir.join(&self.build_dir)
    }

    pub fn local_feed_url(&self) -> String {
        format!("file://{}", self.feed_path.display())
    }

    pub fn feed(&self) -> FeedDescriptor {
        FeedDescriptor {
            layer: self.layer,
            path: self.feed_path.clone(),
            url: match self.feed_source {
                FeedSource::Local => self.local_feed_url(),
                FeedSource::Remote => self.remote_feed_url.clone(),
            },
        }
    }
}

/// Where a layer's packages are published and how later layers refer to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedDescriptor {
    pub layer: Layer,
    pub path: PathBuf,
    pub url: String,
}

/// Everything a build run needs to know, fixed before the first stage starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEnvironment {
    pub target: String,
    pub layer: Layer,
    pub manifest_branch: String,
    pub oss_branch: String,
    /// Machine of the requested layer.
    pub machine: String,
    pub workspace: PathBuf,
    pub shared_feed_root: PathBuf,
    pub feed_base_url: String,
    /// One entry per layer of the chain, nothing after the requested layer.
    pub layers: BTreeMap<Layer, LayerSpec>,
}

impl BuildEnvironment {
    pub fn spec(&self, layer: Layer) -> Result<&LayerSpec, EnvError> {
        self.layers
            .get(&layer)
            .ok_or(EnvError::NotInChain(layer, self.layer))
    }

    /// The requested layer's specification.
    pub fn requested(&self) -> &LayerSpec {
        &self.layers[&self.layer]
    }

    pub fn chain(&self) -> impl Iterator<Item = &LayerSpec> {
        self.layers.values()
    }

    pub fn build_dir(&self) -> &str {
        &self.requested().build_dir
    }

    pub fn work_dir(&self) -> &Path {
        &self.requested().work_dir
    }

    /// Feeds of the layers strictly before `layer`.
    pub fn upstream_feeds(&self, layer: Layer) -> Vec<FeedDescriptor> {
        self.layers
            .range(..layer)
            .map(|(_, spec)| spec.feed())
            .collect()
    }
}
