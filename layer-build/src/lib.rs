//! Layered Yocto build orchestration
//!
//! A build is split into five layers that are built one after the other.
//! Each layer is checked out from its own repo manifest, pointed at the
//! package feeds of the layers before it, built with BitBake and published
//! as a feed for the layers after it.

pub mod builder;
pub mod dependency;
pub mod env_file;
pub mod environment;
pub mod feed_config;
pub mod layer;
pub mod manifest;
pub mod pipeline;
pub mod publisher;
pub mod runner;

pub use builder::{BuildArtifactInfo, BuildError, LayerBuilder};
pub use dependency::{combine_files, DependencyAnalysis};
pub use environment::{
    BuildConfig, BuildEnvironment, EnvError, FeedDescriptor, FeedSource, LayerOverride, LayerSpec,
};
pub use feed_config::{configure_feeds, FeedConfigError};
pub use layer::{Layer, LayerProfile, Platform};
pub use manifest::{ManifestInitError, ManifestInitializer, ManifestOutcome};
pub use pipeline::{Pipeline, PipelineError, RunReport, RunState, Stage, StageError, Step};
pub use publisher::{FeedError, FeedLock, FeedPublisher};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, RunError, SystemRunner};
