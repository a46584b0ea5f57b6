//! The layer pipeline.
//!
//! For a requested layer every layer of its chain goes through
//! `ManifestReady -> FeedConfigured -> Built -> Published`, strictly one
//! after the other. The first failure ends the run.

use std::fmt;

use serde::Serialize;
use tracing::{debug, info, info_span};

use crate::builder::{BuildError, LayerBuilder};
use crate::environment::{BuildEnvironment, FeedDescriptor, LayerSpec};
use crate::feed_config::{configure_feeds, FeedConfigError};
use crate::layer::Layer;
use crate::manifest::{ManifestInitError, ManifestInitializer, ManifestOutcome};
use crate::publisher::{FeedError, FeedLock, FeedPublisher};
use crate::runner::CommandRunner;

/// A completed step of one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    ManifestReady,
    FeedConfigured,
    Built,
    Published,
    DependenciesAnalysed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ManifestReady => "manifest ready",
            Stage::FeedConfigured => "feeds configured",
            Stage::Built => "built",
            Stage::Published => "published",
            Stage::DependenciesAnalysed => "dependencies analysed",
        };
        f.write_str(name)
    }
}

/// The step that was running when a layer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Step {
    InitialiseManifest,
    ConfigureFeeds,
    Build,
    Publish,
    AnalyseDependencies,
}

impl Step {
    /// The stage reached when this step succeeds.
    pub fn stage(self) -> Stage {
        match self {
            Step::InitialiseManifest => Stage::ManifestReady,
            Step::ConfigureFeeds => Stage::FeedConfigured,
            Step::Build => Stage::Built,
            Step::Publish => Stage::Published,
            Step::AnalyseDependencies => Stage::DependenciesAnalysed,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::InitialiseManifest => "initialising the manifest",
            Step::ConfigureFeeds => "configuring feeds",
            Step::Build => "building",
            Step::Publish => "publishing the feed",
            Step::AnalyseDependencies => "analysing dependencies",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Pending,
    /// Last stage reached by a layer.
    Running(Layer, Stage),
    Done,
    Failed(Layer, Step),
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Manifest(#[from] ManifestInitError),

    #[error(transparent)]
    FeedConfig(#[from] FeedConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Report(#[from] convenient_bitbake::ConfError),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Layer {layer} failed while {step}: {source}")]
    Stage {
        layer: Layer,
        step: Step,
        #[source]
        source: StageError,
    },

    #[error(transparent)]
    Lock(FeedError),

    #[error("Run already finished ({0:?})")]
    Finished(RunState),
}

/// What happened during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub state: RunState,
    pub transitions: Vec<(Layer, Stage)>,
    pub synced: Vec<Layer>,
    pub feeds: Vec<FeedDescriptor>,
}

impl Default for RunReport {
    fn default() -> Self {
        RunReport {
            state: RunState::Pending,
            transitions: Vec::new(),
            synced: Vec::new(),
            feeds: Vec::new(),
        }
    }
}

impl RunReport {
    fn advance(&mut self, layer: Layer, stage: Stage) {
        info!("{}: {}", layer, stage);
        self.transitions.push((layer, stage));
        self.state = RunState::Running(layer, stage);
    }

    /// Stages reached by `layer`, in order.
    pub fn stages(&self, layer: Layer) -> Vec<Stage> {
        self.transitions
            .iter()
            .filter(|(l, _)| *l == layer)
            .map(|(_, s)| *s)
            .collect()
    }
}

/// Drives the stages of a run over one build environment.
pub struct Pipeline<'a> {
    pub(crate) env: &'a BuildEnvironment,
    pub(crate) runner: &'a dyn CommandRunner,
    command: String,
    sync_jobs: Option<usize>,
    pub(crate) report: RunReport,
}

impl<'a> Pipeline<'a> {
    pub fn new(env: &'a BuildEnvironment, runner: &'a dyn CommandRunner) -> Self {
        Pipeline {
            env,
            runner,
            command: "layer-build".to_string(),
            sync_jobs: None,
            report: RunReport::default(),
        }
    }

    /// Name of the run, stored in the feed lock.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_sync_jobs(mut self, jobs: usize) -> Self {
        self.sync_jobs = Some(jobs);
        self
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    pub fn environment(&self) -> &BuildEnvironment {
        self.env
    }

    pub(crate) fn start(&mut self) -> Result<FeedLock, PipelineError> {
        if self.report.state != RunState::Pending {
            return Err(PipelineError::Finished(self.report.state));
        }
        FeedLock::acquire(&self.env.shared_feed_root, &self.command).map_err(PipelineError::Lock)
    }

    /// Run `f` as `step` of `layer`, recording the stage it reaches.
    pub(crate) fn step<T, E>(
        &mut self,
        layer: Layer,
        step: Step,
        f: impl FnOnce(&Self) -> Result<T, E>,
    ) -> Result<T, PipelineError>
    where
        E: Into<StageError>,
    {
        match f(&*self) {
            Ok(value) => {
                self.report.advance(layer, step.stage());
                Ok(value)
            }
            Err(e) => {
                let source = e.into();
                debug!("{} failed while {}: {}", layer, step, source);
                self.report.state = RunState::Failed(layer, step);
                Err(PipelineError::Stage {
                    layer,
                    step,
                    source,
                })
            }
        }
    }

    pub(crate) fn prepare_layer(&mut self, spec: &LayerSpec) -> Result<(), PipelineError> {
        let layer = spec.layer;
        let outcome = self.step(layer, Step::InitialiseManifest, |p| {
            p.manifest_initializer().ensure(spec)
        })?;
        if outcome == ManifestOutcome::Synced {
            self.report.synced.push(layer);
        }

        let upstream = self.env.upstream_feeds(layer);
        self.step(layer, Step::ConfigureFeeds, |_| {
            configure_feeds(spec, &upstream)
        })?;
        Ok(())
    }

    fn manifest_initializer(&self) -> ManifestInitializer<'a> {
        let initializer = ManifestInitializer::new(self.runner);
        match self.sync_jobs {
            Some(jobs) => initializer.with_jobs(jobs),
            None => initializer,
        }
    }

    /// Build every layer of the chain up to the requested one.
    pub fn build(&mut self) -> Result<&RunReport, PipelineError> {
        let lock = self.start()?;
        let env = self.env;
        info!(
            "Building {} for {} ({} layers)",
            env.layer,
            env.target,
            env.layers.len()
        );

        for spec in env.chain() {
            let span = info_span!("layer", layer = %spec.layer);
            let _enter = span.enter();
            let layer = spec.layer;

            self.prepare_layer(spec)?;
            let artifacts = self.step(layer, Step::Build, |p| {
                LayerBuilder::new(p.runner).build(spec)
            })?;
            if let Some(artifacts) = artifacts {
                let feed = self.step(layer, Step::Publish, |p| {
                    FeedPublisher::new(p.runner).publish(spec, &artifacts)
                })?;
                self.report.feeds.push(feed);
            }
        }

        lock.release();
        self.report.state = RunState::Done;
        info!("Build of {} done", env.layer);
        Ok(&self.report)
    }
}
