//! Import of package dependency reports into Neo4j
//!
//! Every import lands in a namespace (usually the layer name) so that the
//! package graphs of several layers can share one database. Packages and
//! layers are nodes keyed by `(name, namespace)`; `BELONGS_TO` links a
//! package to the layers providing it and `DEPENDS_ON` links packages.

use std::collections::BTreeSet;
use std::fmt;

use convenient_bitbake::CombinedReport;
use neo4rs::{query, ConfigBuilder, Graph, Query};
use tracing::{debug, info, warn};

/// Number of rows sent per `UNWIND` statement.
pub const BATCH_SIZE: usize = 500;

const CLEAR_NAMESPACE: &str = "MATCH (n) WHERE n.namespace = $namespace DETACH DELETE n";
const CLEAR_ALL: &str = "MATCH (n) DETACH DELETE n";

const SCHEMA: [&str; 4] = [
    "CREATE CONSTRAINT package_name_namespace IF NOT EXISTS \
     FOR (p:Package) REQUIRE (p.name, p.namespace) IS UNIQUE",
    "CREATE CONSTRAINT layer_name_namespace IF NOT EXISTS \
     FOR (l:Layer) REQUIRE (l.name, l.namespace) IS UNIQUE",
    "CREATE INDEX package_namespace IF NOT EXISTS FOR (p:Package) ON (p.namespace)",
    "CREATE INDEX layer_namespace IF NOT EXISTS FOR (l:Layer) ON (l.namespace)",
];

const MERGE_LAYERS: &str =
    "UNWIND $names AS name MERGE (:Layer {name: name, namespace: $namespace})";
const MERGE_PACKAGES: &str =
    "UNWIND $names AS name MERGE (:Package {name: name, namespace: $namespace})";
const MERGE_BELONGS_TO: &str = "UNWIND $pairs AS pair \
     MATCH (p:Package {name: pair[0], namespace: $namespace}) \
     MATCH (l:Layer {name: pair[1], namespace: $namespace}) \
     MERGE (p)-[:BELONGS_TO {namespace: $namespace}]->(l)";
const MERGE_DEPENDS_ON: &str = "UNWIND $pairs AS pair \
     MATCH (p1:Package {name: pair[0], namespace: $namespace}) \
     MATCH (p2:Package {name: pair[1], namespace: $namespace}) \
     MERGE (p1)-[:DEPENDS_ON {namespace: $namespace}]->(p2)";

const COUNT_PACKAGES: &str =
    "MATCH (p:Package) WHERE p.namespace = $namespace RETURN count(p) AS count";
const COUNT_LAYERS: &str =
    "MATCH (l:Layer) WHERE l.namespace = $namespace RETURN count(l) AS count";
const COUNT_DEPENDS_ON: &str =
    "MATCH ()-[r:DEPENDS_ON]->() WHERE r.namespace = $namespace RETURN count(r) AS count";
const COUNT_BELONGS_TO: &str =
    "MATCH ()-[r:BELONGS_TO]->() WHERE r.namespace = $namespace RETURN count(r) AS count";
const TOP_PACKAGES: &str = "MATCH (p:Package)-[:DEPENDS_ON]->(dep) \
     WHERE p.namespace = $namespace \
     RETURN p.name AS package, count(dep) AS dep_count \
     ORDER BY dep_count DESC LIMIT 5";
const LIST_NAMESPACES: &str = "MATCH (n) WHERE n.namespace IS NOT NULL \
     RETURN DISTINCT n.namespace AS namespace ORDER BY namespace";

#[derive(Debug, thiserror::Error)]
pub enum GraphImportError {
    #[error("Neo4j error: {0}")]
    Neo4j(#[from] neo4rs::Error),

    #[error("Unexpected value in column {0}: {1}")]
    Decode(&'static str, String),

    #[error("Query returned no rows: {0}")]
    NoRows(&'static str),

    #[error("Namespace must not be empty")]
    EmptyNamespace,
}

/// Connection parameters for the graph database.
#[derive(Debug, Clone)]
pub struct GraphConnection {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub db: String,
}

pub fn clear_namespace_query(namespace: &str) -> Query {
    query(CLEAR_NAMESPACE).param("namespace", namespace)
}

pub fn clear_all_query() -> Query {
    query(CLEAR_ALL)
}

/// Everything one report contributes to a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportPlan {
    pub namespace: String,
    pub layers: Vec<String>,
    pub packages: Vec<String>,
    pub belongs_to: Vec<(String, String)>,
    pub depends_on: Vec<(String, String)>,
}

impl ImportPlan {
    pub fn from_report(
        report: &CombinedReport,
        namespace: &str,
    ) -> Result<ImportPlan, GraphImportError> {
        let namespace = namespace.trim();
        if namespace.is_empty() {
            return Err(GraphImportError::EmptyNamespace);
        }

        let layers: BTreeSet<&str> = report.layers();
        let mut belongs_to = Vec::new();
        let mut depends_on = Vec::new();
        for (package, info) in &report.packages {
            for layer in &info.layers {
                belongs_to.push((package.clone(), layer.clone()));
            }
            for dependency in &info.dependencies {
                if !report.packages.contains_key(dependency) {
                    debug!("Dependency {} of {} is not a known package", dependency, package);
                }
                depends_on.push((package.clone(), dependency.clone()));
            }
        }

        Ok(ImportPlan {
            namespace: namespace.to_string(),
            layers: layers.into_iter().map(str::to_string).collect(),
            packages: report.packages.keys().cloned().collect(),
            belongs_to,
            depends_on,
        })
    }

    /// The MERGE statements in dependency order: nodes first, then
    /// relationships between them.
    pub fn queries(&self) -> Vec<Query> {
        let mut queries = Vec::new();
        for chunk in self.layers.chunks(BATCH_SIZE) {
            queries.push(self.names_query(MERGE_LAYERS, chunk));
        }
        for chunk in self.packages.chunks(BATCH_SIZE) {
            queries.push(self.names_query(MERGE_PACKAGES, chunk));
        }
        for chunk in self.belongs_to.chunks(BATCH_SIZE) {
            queries.push(self.pairs_query(MERGE_BELONGS_TO, chunk));
        }
        for chunk in self.depends_on.chunks(BATCH_SIZE) {
            queries.push(self.pairs_query(MERGE_DEPENDS_ON, chunk));
        }
        queries
    }

    fn names_query(&self, statement: &str, names: &[String]) -> Query {
        query(statement)
            .param("namespace", self.namespace.as_str())
            .param("names", names.to_vec())
    }

    fn pairs_query(&self, statement: &str, pairs: &[(String, String)]) -> Query {
        let pairs: Vec<Vec<String>> = pairs
            .iter()
            .map(|(from, to)| vec![from.clone(), to.clone()])
            .collect();
        query(statement)
            .param("namespace", self.namespace.as_str())
            .param("pairs", pairs)
    }
}

/// Counts read back after an import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub namespace: String,
    pub packages: i64,
    pub layers: i64,
    pub depends_on: i64,
    pub belongs_to: i64,
    pub top_packages: Vec<(String, i64)>,
}

impl fmt::Display for ImportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Import Verification for namespace {} ===", self.namespace)?;
        writeln!(f, "Total Package nodes: {}", self.packages)?;
        writeln!(f, "Total Layer nodes: {}", self.layers)?;
        writeln!(f, "Total DEPENDS_ON relationships: {}", self.depends_on)?;
        writeln!(f, "Total BELONGS_TO relationships: {}", self.belongs_to)?;
        writeln!(f)?;
        writeln!(f, "Top 5 packages by dependency count:")?;
        for (package, count) in &self.top_packages {
            writeln!(f, "  {}: {} dependencies", package, count)?;
        }
        Ok(())
    }
}

pub struct GraphDatabase {
    graph: Graph,
}

impl GraphDatabase {
    pub async fn connect(connection: &GraphConnection) -> Result<GraphDatabase, GraphImportError> {
        let config = ConfigBuilder::new()
            .uri(connection.uri.as_str())
            .user(connection.user.as_str())
            .password(connection.password.as_str())
            .db(connection.db.as_str())
            .build()?;
        let graph = Graph::connect(config).await?;
        info!("Connected to {}", connection.uri);
        Ok(GraphDatabase { graph })
    }

    /// Delete the nodes of one namespace, or everything when `namespace`
    /// is `None`.
    pub async fn clear(&self, namespace: Option<&str>) -> Result<(), GraphImportError> {
        match namespace {
            Some(namespace) => {
                self.graph.run(clear_namespace_query(namespace)).await?;
                info!("Cleared existing data for namespace '{}'", namespace);
            }
            None => {
                self.graph.run(clear_all_query()).await?;
                warn!("Cleared all existing data from database");
            }
        }
        Ok(())
    }

    /// Create constraints and indexes. Servers without support for one of
    /// them are tolerated.
    pub async fn create_schema(&self) -> Result<(), GraphImportError> {
        for statement in SCHEMA {
            if let Err(e) = self.graph.run(query(statement)).await {
                warn!("Schema statement failed ({}): {}", statement, e);
            }
        }
        info!("Created constraints and indexes");
        Ok(())
    }

    pub async fn import(&self, plan: &ImportPlan) -> Result<(), GraphImportError> {
        let queries = plan.queries();
        let len = queries.len();
        let mut txn = self.graph.start_txn().await?;
        info!("run {} queries", len);
        txn.run_queries(queries).await?;
        info!("commit {} queries", len);
        txn.commit().await?;
        info!(
            "Imported {} packages, {} layers, {} BELONGS_TO and {} DEPENDS_ON into '{}'",
            plan.packages.len(),
            plan.layers.len(),
            plan.belongs_to.len(),
            plan.depends_on.len(),
            plan.namespace
        );
        Ok(())
    }

    pub async fn verify(&self, namespace: &str) -> Result<ImportSummary, GraphImportError> {
        let mut summary = ImportSummary {
            namespace: namespace.to_string(),
            packages: self.count(COUNT_PACKAGES, namespace).await?,
            layers: self.count(COUNT_LAYERS, namespace).await?,
            depends_on: self.count(COUNT_DEPENDS_ON, namespace).await?,
            belongs_to: self.count(COUNT_BELONGS_TO, namespace).await?,
            top_packages: Vec::new(),
        };

        let mut result = self
            .graph
            .execute(query(TOP_PACKAGES).param("namespace", namespace))
            .await?;
        while let Some(row) = result.next().await? {
            let package: String = row
                .get("package")
                .map_err(|e| GraphImportError::Decode("package", e.to_string()))?;
            let count: i64 = row
                .get("dep_count")
                .map_err(|e| GraphImportError::Decode("dep_count", e.to_string()))?;
            summary.top_packages.push((package, count));
        }
        Ok(summary)
    }

    pub async fn list_namespaces(&self) -> Result<Vec<String>, GraphImportError> {
        let mut namespaces = Vec::new();
        let mut result = self.graph.execute(query(LIST_NAMESPACES)).await?;
        while let Some(row) = result.next().await? {
            let namespace: String = row
                .get("namespace")
                .map_err(|e| GraphImportError::Decode("namespace", e.to_string()))?;
            namespaces.push(namespace);
        }
        Ok(namespaces)
    }

    async fn count(
        &self,
        statement: &'static str,
        namespace: &str,
    ) -> Result<i64, GraphImportError> {
        let mut result = self
            .graph
            .execute(query(statement).param("namespace", namespace))
            .await?;
        let row = result
            .next()
            .await?
            .ok_or(GraphImportError::NoRows(statement))?;
        row.get("count")
            .map_err(|e| GraphImportError::Decode("count", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const REPORT: &str = "Package Dependency and Layer Information
================================================================================

Package: busybox
  Layers: meta
  Dependencies:
    - glibc (layers: meta, meta-rdk-oss-reference)
    - virtual/libc (layer: unknown)

Package: glibc
  Layers: meta, meta-rdk-oss-reference
  Dependencies: none

Package: virtual/libc
  Layers: (not found in package-layers.txt)
  Dependencies: none

";

    #[test]
    fn plan_collects_nodes_and_relationships() {
        let report = CombinedReport::parse(REPORT);
        let plan = ImportPlan::from_report(&report, "oss").unwrap();

        assert_eq!(plan.namespace, "oss");
        assert_eq!(plan.layers, vec!["meta", "meta-rdk-oss-reference"]);
        assert_eq!(plan.packages, vec!["busybox", "glibc", "virtual/libc"]);
        assert_eq!(plan.belongs_to.len(), 3);
        assert_eq!(
            plan.depends_on,
            vec![
                ("busybox".to_string(), "glibc".to_string()),
                ("busybox".to_string(), "virtual/libc".to_string()),
            ]
        );
    }

    #[test]
    #[traced_test]
    fn dangling_dependency_is_logged() {
        let report = CombinedReport::parse(
            "Package: busybox\n  Layers: meta\n  Dependencies:\n    - musl (layer: unknown)\n\n",
        );
        let plan = ImportPlan::from_report(&report, "oss").unwrap();
        assert_eq!(plan.packages, vec!["busybox"]);
        assert_eq!(
            plan.depends_on,
            vec![("busybox".to_string(), "musl".to_string())]
        );
        assert!(logs_contain("Dependency musl of busybox is not a known package"));
    }

    #[test]
    fn empty_namespace_is_rejected() {
        let report = CombinedReport::parse(REPORT);
        assert!(matches!(
            ImportPlan::from_report(&report, "  "),
            Err(GraphImportError::EmptyNamespace)
        ));
    }

    #[test]
    fn queries_are_batched_and_namespaced() {
        let report = CombinedReport::parse(REPORT);
        let mut plan = ImportPlan::from_report(&report, "vendor").unwrap();
        plan.packages = (0..BATCH_SIZE + 1).map(|i| format!("pkg{}", i)).collect();

        let queries = plan.queries();
        // layers, two package batches, belongs_to, depends_on
        assert_eq!(queries.len(), 5);
        assert!(queries.iter().all(|q| q.has_param_key("namespace")));
        assert!(queries[0].has_param_key("names"));
        assert!(queries[3].has_param_key("pairs"));
    }

    #[test]
    fn empty_report_needs_no_queries() {
        let plan = ImportPlan::from_report(&CombinedReport::default(), "oss").unwrap();
        assert!(plan.queries().is_empty());
    }

    #[test]
    fn clear_queries() {
        assert!(clear_namespace_query("oss").has_param_key("namespace"));
        assert!(!clear_all_query().has_param_key("namespace"));
    }

    #[test]
    fn summary_renders_counts() {
        let summary = ImportSummary {
            namespace: "oss".to_string(),
            packages: 3,
            layers: 2,
            depends_on: 2,
            belongs_to: 3,
            top_packages: vec![("busybox".to_string(), 2)],
        };
        let text = summary.to_string();
        assert!(text.starts_with("=== Import Verification for namespace oss ===\n"));
        assert!(text.contains("Total Package nodes: 3\n"));
        assert!(text.ends_with("  busybox: 2 dependencies\n"));
    }
}
