use colored::Colorize;
use layer_build::{Pipeline, SystemRunner};

use super::graph::{import_report, print_counts, Clear};
use super::{CliError, Context, Neo4jArgs};

pub fn build(context: &Context) -> Result<(), CliError> {
    let env = context.load_environment()?;
    let runner = SystemRunner;
    let mut pipeline = Pipeline::new(&env, &runner).with_command("layer-build build");
    let report = pipeline.build()?;

    for feed in &report.feeds {
        println!("{} {:<16} {}", "published".green(), feed.layer.to_string(), feed.url);
    }
    println!("{} {} for {}", "Built".green().bold(), env.layer, env.target);
    Ok(())
}

/// Analyse the configured layer, and import the report when `neo4j` is
/// given.
pub async fn dependency(context: &Context, neo4j: Option<&Neo4jArgs>) -> Result<(), CliError> {
    let env = context.load_environment()?;
    // Fail before the long analysis when the import cannot connect.
    let connection = neo4j.map(Neo4jArgs::connection).transpose()?;

    let runner = SystemRunner;
    let analysis = Pipeline::new(&env, &runner)
        .with_command("layer-build dependency")
        .dependencies()?;

    print_counts(&analysis.report);
    println!("Report written to {}", analysis.report_path.display());

    if let Some(connection) = connection {
        import_report(&connection, &analysis.report, env.layer.name(), Clear::Namespace).await?;
    }
    Ok(())
}
