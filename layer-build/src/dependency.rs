//! Dependency analysis of a layer's package.
//!
//! Instead of building, BitBake writes the task graph of the package and
//! lists which layer provides each recipe. Both are combined into one
//! report next to the build directory.

use std::path::{Path, PathBuf};

use convenient_bitbake::{parse_dot_file, parse_show_recipes_file, CombinedReport, ConfError};
use tracing::info;

use crate::builder::LayerBuilder;
use crate::pipeline::{Pipeline, PipelineError, RunState, StageError, Step};

pub const TASK_DEPENDS_FILE: &str = "task-depends.dot";
pub const PACKAGE_LAYERS_FILE: &str = "package-layers.txt";
pub const COMBINED_REPORT_FILE: &str = "combined_output.txt";

#[derive(Debug, Clone)]
pub struct DependencyAnalysis {
    pub dot_path: PathBuf,
    pub layers_path: PathBuf,
    pub report_path: PathBuf,
    pub report: CombinedReport,
}

/// Combine a task graph and a recipe listing into a report at `out`.
pub fn combine_files(dot: &Path, layers: &Path, out: &Path) -> Result<CombinedReport, ConfError> {
    let dependencies = parse_dot_file(dot)?;
    let package_layers = parse_show_recipes_file(layers)?;
    let report = CombinedReport::combine(&dependencies, &package_layers);
    report.write(out)?;
    Ok(report)
}

impl<'a> Pipeline<'a> {
    /// Prepare the requested layer and analyse the dependencies of its
    /// package.
    pub fn dependencies(&mut self) -> Result<DependencyAnalysis, PipelineError> {
        let lock = self.start()?;
        let env = self.env;
        let spec = env.requested();
        info!("Analysing dependencies of {} ({})", spec.package, spec.layer);

        self.prepare_layer(spec)?;
        let analysis = self.step(spec.layer, Step::AnalyseDependencies, |p| {
            let builder = LayerBuilder::new(p.runner);
            let build_path = spec.build_path();

            builder.bitbake(spec, &["-g", spec.package.as_str()], false)?;

            let listing = p
                .runner
                .check(&builder.session_command(spec, "bitbake-layers show-recipes")?.capture())
                .map_err(|e| StageError::Build(e.into()))?;
            let layers_path = build_path.join(PACKAGE_LAYERS_FILE);
            std::fs::write(&layers_path, &listing.stdout)
                .map_err(|e| ConfError::Io(layers_path.clone(), e.to_string()))?;

            let dot_path = build_path.join(TASK_DEPENDS_FILE);
            let report_path = build_path.join(COMBINED_REPORT_FILE);
            let report = combine_files(&dot_path, &layers_path, &report_path)?;
            Ok::<_, StageError>(DependencyAnalysis {
                dot_path,
                layers_path,
                report_path,
                report,
            })
        })?;

        lock.release();
        self.report.state = RunState::Done;
        info!(
            "{} packages, {} with dependencies, {} with layer information",
            analysis.report.packages.len(),
            analysis.report.with_dependencies(),
            analysis.report.with_layers()
        );
        Ok(analysis)
    }
}
