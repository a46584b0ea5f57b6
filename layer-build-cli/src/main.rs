//! `layer-build` - builds the five RDK layers one after the other and
//! publishes their package feeds.

use std::fmt::Display;

use clap::error::ErrorKind;
use clap::Parser;
use colored::Colorize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod prompts;

use commands::Cli;

const DEFAULT_FILTER: &str = "layer_build=info,layer_build_cli=info,graph_layers=info,\
convenient_git=info,convenient_repo=warn,convenient_bitbake=warn";
const DEBUG_FILTER: &str = "layer_build=debug,layer_build_cli=debug,graph_layers=debug,\
convenient_git=debug,convenient_repo=debug,convenient_bitbake=debug";

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => fail(usage_error(&e)),
    };

    let filter = if cli.debug {
        EnvFilter::new(DEBUG_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into())
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = commands::run(cli).await {
        fail(e);
    }
}

fn fail(message: impl Display) -> ! {
    eprintln!("{} {}", "error:".red().bold(), message);
    std::process::exit(1)
}

/// First line of a clap error, without clap's own `error:` prefix.
fn usage_error(e: &clap::Error) -> String {
    if matches!(
        e.kind(),
        ErrorKind::MissingSubcommand | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
    ) {
        return "no command given, see `layer-build --help`".to_string();
    }
    let rendered = e.to_string();
    let first = rendered.lines().next().unwrap_or_default();
    first.strip_prefix("error: ").unwrap_or(first).to_string()
}
