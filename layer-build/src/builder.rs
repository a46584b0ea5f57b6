//! Runs BitBake for one layer.
//!
//! Every invocation sources the layer's `setup-environment` script first,
//! in the same shell, so that BitBake runs in the layer's build directory
//! with its variable scope set up.

use std::path::{Path, PathBuf};

use convenient_bitbake::{BitbakeEnv, ConfError};
use tracing::{debug, info, info_span, warn};
use walkdir::WalkDir;

use crate::environment::LayerSpec;
use crate::runner::{shell_quote, CommandOutput, CommandRunner, CommandSpec, RunError};

pub const SETUP_SCRIPT: &str = "scripts/setup-environment";
pub const INDEX_TOOL: &str = "opkg-make-index";

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Build environment setup script {0:?} not found, is the checkout complete?")]
    MissingSetupScript(PathBuf),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("Cannot locate build output: {0}")]
    Variables(#[from] ConfError),
}

/// Where a finished layer build left its packages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifactInfo {
    pub deploy_dir: PathBuf,
    pub package_arch: String,
    /// Index generator from the native tool work area, when it was built.
    pub index_tool: Option<PathBuf>,
}

pub struct LayerBuilder<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> LayerBuilder<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        LayerBuilder { runner }
    }

    /// A command running `command` after sourcing the setup script.
    pub fn session_command(
        &self,
        spec: &LayerSpec,
        command: &str,
    ) -> Result<CommandSpec, BuildError> {
        let script = spec.work_dir.join(SETUP_SCRIPT);
        if !script.is_file() {
            return Err(BuildError::MissingSetupScript(script));
        }
        let line = format!(
            "source {} {} > /dev/null && {}",
            SETUP_SCRIPT,
            shell_quote(&spec.build_dir),
            command
        );
        Ok(CommandSpec::new("bash")
            .args(["-c".to_string(), line])
            .cwd(&spec.work_dir)
            .env("MACHINE", spec.machine.as_str()))
    }

    /// Run BitBake with `args` in the layer's build session.
    pub fn bitbake(
        &self,
        spec: &LayerSpec,
        args: &[&str],
        capture: bool,
    ) -> Result<CommandOutput, BuildError> {
        let command = std::iter::once("bitbake")
            .chain(args.iter().copied())
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ");
        let mut command = self.session_command(spec, &command)?;
        if capture {
            command = command.capture();
        }
        Ok(self.runner.check(&command)?)
    }

    /// Build the layer's package. Returns where the packages went for every
    /// layer that publishes a feed.
    pub fn build(&self, spec: &LayerSpec) -> Result<Option<BuildArtifactInfo>, BuildError> {
        let span = info_span!("build", layer = %spec.layer);
        let _enter = span.enter();

        info!("Building {} for {}", spec.package, spec.machine);
        self.bitbake(spec, &[spec.package.as_str()], false)?;
        info!("Built {}", spec.package);

        if spec.profile().publishes_feed {
            self.artifact_info(spec).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Query `bitbake -e` for the location of the built packages.
    pub fn artifact_info(&self, spec: &LayerSpec) -> Result<BuildArtifactInfo, BuildError> {
        let output = self.bitbake(spec, &["-e", spec.package.as_str()], true)?;
        let vars = BitbakeEnv::parse(&output.stdout);

        let deploy_dir = PathBuf::from(vars.require("DEPLOY_DIR_IPK")?);
        let package_arch = vars.require("PACKAGE_ARCH")?.to_string();
        let index_tool = match (vars.get("TMPDIR"), vars.get("BUILD_ARCH")) {
            (Some(tmpdir), Some(build_arch)) => find_index_tool(Path::new(tmpdir), build_arch),
            _ => None,
        };
        if index_tool.is_none() && spec.profile().generates_index {
            warn!("{} not found, the {} feed will have no index", INDEX_TOOL, spec.layer);
        }

        debug!(
            "{}: deploy dir {:?}, package arch {}, index tool {:?}",
            spec.layer, deploy_dir, package_arch, index_tool
        );
        Ok(BuildArtifactInfo {
            deploy_dir,
            package_arch,
            index_tool,
        })
    }
}

/// Look for the index generator below the native opkg-utils work area.
pub fn find_index_tool(tmpdir: &Path, build_arch: &str) -> Option<PathBuf> {
    let root = tmpdir
        .join("work")
        .join(format!("{}-linux", build_arch))
        .join("opkg-utils-native");
    if !root.is_dir() {
        return None;
    }
    WalkDir::new(&root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == INDEX_TOOL)
        .map(|entry| entry.into_path())
        .min()
}
