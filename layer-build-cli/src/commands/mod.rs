//! Command line of `layer-build`.
//!
//! `configure` is the only command that may ask questions. Every other
//! command reads the environment file it wrote and runs unattended.

use std::path::PathBuf;

use clap::{crate_version, Args, Parser, Subcommand};
use convenient_bitbake::ConfError;
use convenient_git::{GitIdentity, IdentityError};
use graph_layers::{GraphConnection, GraphImportError};
use layer_build::{BuildEnvironment, EnvError, PipelineError, RunError};
use tracing::{debug, warn};

pub mod build;
pub mod configure;
pub mod graph;
pub mod session;

/// Below `$HOME`.
pub const STATE_DIR: &str = ".config/layer-build";
pub const ENV_FILE: &str = "build.env";

#[derive(Parser, Debug)]
#[command(
    name = "layer-build",
    version = crate_version!(),
    about = "Builds the RDK layers in order and publishes their package feeds"
)]
pub struct Cli {
    /// Print debug information
    #[arg(short, global = true)]
    pub debug: bool,

    /// Environment file written by `configure`
    /// [default: ~/.config/layer-build/build.env]
    #[arg(short, long, global = true, env = "LAYER_BUILD_ENV_FILE")]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve the build settings and write the environment file
    Configure(configure::ConfigureArgs),

    /// Build every layer up to the configured one and publish the feeds
    Build,

    /// Analyse the package dependencies of the configured layer
    Dependency {
        /// Import the combined report into Neo4j, namespaced by layer
        #[arg(long)]
        import: bool,

        #[command(flatten)]
        neo4j: Neo4jArgs,
    },

    /// Open a shell in the configured layer's work directory
    Shell,

    /// Run a command in the configured layer's work directory
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Combine a task graph and a recipe listing into one report
    Combine {
        /// Dependency graph written by `bitbake -g`
        dot: PathBuf,
        /// Output of `bitbake-layers show-recipes`
        layers: PathBuf,
        out: PathBuf,
    },

    /// Import a combined report into Neo4j
    ImportGraph(graph::ImportArgs),
}

/// Connection to the Neo4j server.
#[derive(Args, Debug, Clone)]
pub struct Neo4jArgs {
    /// The URI of the Neo4j server.
    #[arg(
        short,
        long,
        default_value = "neo4j://127.0.0.1:7687",
        env = "NEO4J_URI"
    )]
    pub uri: String,

    /// The username for authenticating with the Neo4j server.
    #[arg(short = 'r', long, default_value = "neo4j", env = "NEO4J_USER")]
    pub user: String,

    /// The password for authenticating with the Neo4j server.
    #[arg(short, long, env = "NEO4J_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// The name of the database to connect to.
    #[arg(short = 'b', long, default_value = "neo4j", env = "NEO4J_DB")]
    pub db: String,
}

impl Neo4jArgs {
    pub fn connection(&self) -> Result<GraphConnection, CliError> {
        let password = self.password.clone().ok_or(CliError::MissingPassword)?;
        Ok(GraphConnection {
            uri: self.uri.clone(),
            user: self.user.clone(),
            password,
            db: self.db.clone(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Graph(#[from] GraphImportError),

    #[error(transparent)]
    Report(#[from] ConfError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("Environment file {0:?} not found, run `layer-build configure` first")]
    MissingEnvFile(PathBuf),

    #[error("HOME is not set")]
    NoHome,

    #[error("Interactive configuration needs a terminal on stdin")]
    NotATerminal,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No Neo4j password given, use --password or NEO4J_PASSWORD")]
    MissingPassword,
}

/// Locations shared by all commands.
#[derive(Debug, Clone)]
pub struct Context {
    pub home: PathBuf,
    pub env_file: PathBuf,
}

impl Context {
    pub fn new(home: PathBuf, env_file: Option<PathBuf>) -> Context {
        let env_file = env_file.unwrap_or_else(|| home.join(STATE_DIR).join(ENV_FILE));
        Context { home, env_file }
    }

    pub fn from_env(env_file: Option<PathBuf>) -> Result<Context, CliError> {
        let home = std::env::var_os("HOME")
            .filter(|h| !h.is_empty())
            .map(PathBuf::from)
            .ok_or(CliError::NoHome)?;
        Ok(Context::new(home, env_file))
    }

    /// Cached git identity lives here.
    pub fn state_dir(&self) -> PathBuf {
        self.home.join(STATE_DIR)
    }

    /// Read the environment written by `configure`. Never prompts.
    pub fn load_environment(&self) -> Result<BuildEnvironment, CliError> {
        if !self.env_file.is_file() {
            return Err(CliError::MissingEnvFile(self.env_file.clone()));
        }
        let env = BuildEnvironment::read_env_file(&self.env_file)?;
        debug!("Loaded {} build of {} from {:?}", env.target, env.layer, self.env_file);
        self.apply_cached_identity()?;
        Ok(env)
    }

    fn apply_cached_identity(&self) -> Result<(), CliError> {
        match GitIdentity::load(&self.state_dir())? {
            Some(identity) => identity.apply_global(&self.home)?,
            None => warn!(
                "No git identity cached in {:?}, run `layer-build configure --interactive` to set one",
                self.state_dir()
            ),
        }
        Ok(())
    }
}

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let context = Context::from_env(cli.env_file)?;
    match cli.command {
        Commands::Configure(args) => configure::configure(&context, &args),
        Commands::Build => build::build(&context),
        Commands::Dependency { import, neo4j } => {
            build::dependency(&context, import.then_some(&neo4j)).await
        }
        Commands::Shell => session::shell(&context),
        Commands::Exec { command } => session::exec(&context, &command),
        Commands::Combine { dot, layers, out } => graph::combine(&dot, &layers, &out),
        Commands::ImportGraph(args) => graph::import_graph(&args).await,
    }
}
