use std::path::{Path, PathBuf};

use clap::Args;
use colored::Colorize;
use convenient_git::GitIdentity;
use layer_build::{BuildConfig, FeedSource, Layer, LayerOverride};
use tracing::info;

use super::{CliError, Context};
use crate::prompts::{ask, require_terminal};

pub const DEFAULT_TARGET: &str = "raspberrypi4-64";
pub const DEFAULT_SHARED_DIR: &str = "shared-feeds";

#[derive(Args, Debug, Default)]
pub struct ConfigureArgs {
    /// YAML file with build settings, overridden by the flags below
    #[arg(short, long, env = "LAYER_BUILD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Target platform [default: raspberrypi4-64]
    #[arg(short, long)]
    pub target: Option<String>,

    /// Layer to build: oss, vendor, middleware, application or image-assembler
    #[arg(short, long)]
    pub layer: Option<Layer>,

    /// Manifest branch of every layer after oss, e.g. RDK7-1.0.0
    #[arg(short, long)]
    pub manifest_branch: Option<String>,

    /// Branch of the oss layer, e.g. 4.6.2-community
    #[arg(short, long)]
    pub oss_branch: Option<String>,

    /// Directory holding one checkout per layer [default: current directory]
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// Directory the feeds are published to [default: <workspace>/shared-feeds]
    #[arg(short, long)]
    pub shared_feed_root: Option<PathBuf>,

    /// Base URL the shared feed directory is served under
    #[arg(long)]
    pub feed_base_url: Option<String>,

    /// Package to build for the requested layer
    #[arg(long)]
    pub package: Option<String>,

    /// Whether layers read upstream feeds from the shared directory or the base URL
    #[arg(long)]
    pub feed_source: Option<FeedSource>,

    /// Ask for missing settings and the git identity
    #[arg(short, long)]
    pub interactive: bool,
}

impl ConfigureArgs {
    /// The settings given as flags.
    pub fn flags(&self) -> BuildConfig {
        let mut layers = std::collections::BTreeMap::new();
        if let Some(feed_source) = self.feed_source {
            for layer in Layer::ALL {
                layers.insert(
                    layer,
                    LayerOverride {
                        feed_source: Some(feed_source),
                        ..Default::default()
                    },
                );
            }
        }
        if let (Some(layer), Some(package)) = (self.layer, &self.package) {
            layers.entry(layer).or_default().package = Some(package.clone());
        }
        BuildConfig {
            target: self.target.clone(),
            layer: self.layer,
            manifest_branch: self.manifest_branch.clone(),
            oss_branch: self.oss_branch.clone(),
            workspace: self.workspace.clone(),
            shared_feed_root: self.shared_feed_root.clone(),
            feed_base_url: self.feed_base_url.clone(),
            platform: None,
            layers,
        }
    }

    /// Flags over the configuration file.
    pub fn merged(&self, cwd: &Path) -> Result<BuildConfig, CliError> {
        let file = match &self.config {
            Some(path) => BuildConfig::from_file(&anchored(cwd, path))?,
            None => BuildConfig::default(),
        };
        Ok(self.flags().or(file))
    }
}

pub fn builtin_defaults(cwd: &Path, workspace: Option<&Path>) -> BuildConfig {
    let workspace = workspace.map_or_else(|| cwd.to_path_buf(), |w| anchored(cwd, w));
    BuildConfig {
        target: Some(DEFAULT_TARGET.to_string()),
        shared_feed_root: Some(workspace.join(DEFAULT_SHARED_DIR)),
        workspace: Some(workspace),
        ..Default::default()
    }
}

/// Relative paths are taken from the directory `configure` runs in.
fn anchored(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

fn anchor_paths(mut config: BuildConfig, cwd: &Path) -> BuildConfig {
    config.workspace = config.workspace.map(|p| anchored(cwd, &p));
    config.shared_feed_root = config.shared_feed_root.map(|p| anchored(cwd, &p));
    config
}

fn prompt_missing(config: &mut BuildConfig, defaults: &BuildConfig) -> Result<(), CliError> {
    if config.target.is_none() {
        config.target = ask("Target platform", defaults.target.as_deref())?;
    }
    if config.layer.is_none() {
        config.layer = ask(
            "Layer (oss, vendor, middleware, application, image-assembler)",
            None,
        )?
        .map(|answer| answer.parse())
        .transpose()?;
    }
    if config.manifest_branch.is_none() {
        config.manifest_branch = ask("Manifest branch", None)?;
    }
    if config.oss_branch.is_none() {
        config.oss_branch = ask("OSS branch", None)?;
    }
    if config.workspace.is_none() {
        let default = defaults.workspace.as_ref().map(|p| p.display().to_string());
        config.workspace = ask("Workspace", default.as_deref())?.map(PathBuf::from);
    }
    if config.shared_feed_root.is_none() {
        let default = defaults
            .shared_feed_root
            .as_ref()
            .map(|p| p.display().to_string());
        config.shared_feed_root =
            ask("Shared feed directory", default.as_deref())?.map(PathBuf::from);
    }
    Ok(())
}

fn prompt_identity(context: &Context) -> Result<GitIdentity, CliError> {
    let cached = GitIdentity::load(&context.state_dir())?;
    let name = ask("Git user name", cached.as_ref().map(|i| i.name.as_str()))?.unwrap_or_default();
    let email =
        ask("Git user email", cached.as_ref().map(|i| i.email.as_str()))?.unwrap_or_default();
    let identity = GitIdentity::new(&name, &email)?;
    identity.save(&context.state_dir())?;
    Ok(identity)
}

pub fn configure(context: &Context, args: &ConfigureArgs) -> Result<(), CliError> {
    if args.interactive {
        require_terminal()?;
    }
    let cwd = std::env::current_dir()?;

    let mut config = args.merged(&cwd)?;
    if args.interactive {
        let defaults = builtin_defaults(&cwd, config.workspace.as_deref());
        prompt_missing(&mut config, &defaults)?;
    }
    let defaults = builtin_defaults(&cwd, config.workspace.as_deref());
    let config = anchor_paths(config.or(defaults), &cwd);

    let env = config.generate()?;
    env.write_env_file(&context.env_file)?;

    if args.interactive {
        let identity = prompt_identity(context)?;
        identity.apply_global(&context.home)?;
    }

    info!("Configured {} for {}", env.layer, env.target);
    println!(
        "{} {} on {} ({})",
        "Configured".green().bold(),
        env.layer,
        env.target,
        env.machine
    );
    for spec in env.chain() {
        println!(
            "  {:<16} {:<20} {}",
            spec.layer.to_string(),
            spec.manifest_branch,
            spec.feed_path.display()
        );
    }
    println!("Environment written to {}", context.env_file.display());
    Ok(())
}
