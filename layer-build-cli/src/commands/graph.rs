//! Dependency reports: combining them and importing them into Neo4j.

use std::path::{Path, PathBuf};

use clap::Args;
use colored::Colorize;
use convenient_bitbake::CombinedReport;
use graph_layers::{GraphConnection, GraphDatabase, ImportPlan};
use layer_build::combine_files;

use super::{CliError, Neo4jArgs};

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Combined report written by `dependency` or `combine`
    #[arg(required_unless_present = "list_namespaces")]
    pub report: Option<PathBuf>,

    /// Namespace for this import, e.g. oss or vendor
    #[arg(short, long, required_unless_present = "list_namespaces")]
    pub namespace: Option<String>,

    /// Delete the namespace's data before importing
    #[arg(long)]
    pub clear: bool,

    /// Delete all data before importing
    #[arg(long, conflicts_with = "clear")]
    pub clear_all: bool,

    /// List the existing namespaces and exit
    #[arg(long)]
    pub list_namespaces: bool,

    #[command(flatten)]
    pub neo4j: Neo4jArgs,
}

/// What to delete before an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clear {
    Nothing,
    Namespace,
    All,
}

impl ImportArgs {
    pub fn clear(&self) -> Clear {
        if self.clear_all {
            Clear::All
        } else if self.clear {
            Clear::Namespace
        } else {
            Clear::Nothing
        }
    }
}

pub fn print_counts(report: &CombinedReport) {
    println!("Found {} packages.", report.packages.len());
    println!("Packages with dependencies: {}", report.with_dependencies());
    println!("Packages with layer info: {}", report.with_layers());
}

pub fn combine(dot: &Path, layers: &Path, out: &Path) -> Result<(), CliError> {
    let report = combine_files(dot, layers, out)?;
    print_counts(&report);
    println!("Report written to {}", out.display());
    Ok(())
}

pub async fn import_graph(args: &ImportArgs) -> Result<(), CliError> {
    let connection = args.neo4j.connection()?;

    if args.list_namespaces {
        let database = GraphDatabase::connect(&connection).await?;
        let namespaces = database.list_namespaces().await?;
        println!("=== Existing Namespaces ===");
        if namespaces.is_empty() {
            println!("  No namespaces found");
        }
        for namespace in namespaces {
            println!("  - {}", namespace);
        }
        return Ok(());
    }

    // clap makes both present unless listing
    let (Some(path), Some(namespace)) = (&args.report, &args.namespace) else {
        return Ok(());
    };
    let report = CombinedReport::read(path)?;
    println!(
        "Found {} packages to import into namespace '{}'",
        report.packages.len(),
        namespace
    );
    import_report(&connection, &report, namespace, args.clear()).await
}

pub async fn import_report(
    connection: &GraphConnection,
    report: &CombinedReport,
    namespace: &str,
    clear: Clear,
) -> Result<(), CliError> {
    let plan = ImportPlan::from_report(report, namespace)?;
    let database = GraphDatabase::connect(connection).await?;
    match clear {
        Clear::Nothing => {}
        Clear::Namespace => database.clear(Some(&plan.namespace)).await?,
        Clear::All => database.clear(None).await?,
    }
    database.create_schema().await?;
    database.import(&plan).await?;

    let summary = database.verify(&plan.namespace).await?;
    println!("{}", summary);
    println!(
        "{}",
        format!("Import completed successfully for namespace '{}'!", plan.namespace).green()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Cli, Commands};
    use clap::Parser;
    use tempfile::TempDir;

    #[test]
    fn clear_all_wins() {
        let cli = Cli::try_parse_from([
            "layer-build",
            "import-graph",
            "report.txt",
            "-n",
            "oss",
            "--clear-all",
        ])
        .unwrap();
        match cli.command {
            Commands::ImportGraph(args) => assert_eq!(args.clear(), Clear::All),
            other => panic!("Expected import-graph, got {:?}", other),
        }
        assert!(Cli::try_parse_from([
            "layer-build",
            "import-graph",
            "report.txt",
            "-n",
            "oss",
            "--clear",
            "--clear-all"
        ])
        .is_err());
    }

    #[test]
    fn combine_writes_the_report() {
        let temp = TempDir::new().unwrap();
        let dot = temp.path().join("task-depends.dot");
        let layers = temp.path().join("package-layers.txt");
        let out = temp.path().join("combined_output.txt");
        std::fs::write(
            &dot,
            "\"busybox.do_compile\" -> \"lib32-glibc.do_populate_sysroot\"\n",
        )
        .unwrap();
        std::fs::write(&layers, "busybox:\n  meta 1.36.1\nglibc:\n  meta 2.39\n").unwrap();

        combine(&dot, &layers, &out).unwrap();
        let report = CombinedReport::read(&out).unwrap();
        assert_eq!(report.packages["busybox"].dependencies, vec!["glibc"]);
        assert_eq!(report.with_layers(), 2);
    }
}
