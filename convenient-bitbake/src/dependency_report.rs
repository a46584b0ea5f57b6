//! Package dependency and layer reports
//!
//! Combines the dependency graph written by `bitbake -g` with the recipe to
//! layer listing of `bitbake-layers show-recipes` into one text report, and
//! reads such reports back.

use crate::ConfError;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};

const REPORT_TITLE: &str = "Package Dependency and Layer Information";
const NO_LAYERS: &str = "(not found in package-layers.txt)";
const MULTILIB_PREFIX: &str = "lib32-";

/// Package name -> packages it depends on.
pub type DependencyMap = BTreeMap<String, BTreeSet<String>>;

/// Package name -> layers providing it, in listing order.
pub type PackageLayers = BTreeMap<String, Vec<String>>;

fn edge_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^"([^"]+)"\s*->\s*"([^"]+)""#).expect("edge pattern is valid")
    })
}

fn dependency_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*-\s*([^\s(]+)").expect("dependency pattern is valid"))
}

/// Reduce a graph node to a package name: the multilib prefix is dropped
/// and task nodes (`busybox.do_compile`) collapse onto their recipe.
pub fn package_name(node: &str) -> String {
    let name = node.replace(MULTILIB_PREFIX, "");
    match name.rfind(".do_") {
        Some(pos) => name[..pos].to_string(),
        None => name,
    }
}

/// Parse the edges of a dependency `.dot` file.
pub fn parse_dot(text: &str) -> DependencyMap {
    let mut dependencies = DependencyMap::new();
    for line in text.lines() {
        if let Some(caps) = edge_regex().captures(line.trim()) {
            let from = package_name(&caps[1]);
            let to = package_name(&caps[2]);
            if from != to {
                dependencies.entry(from).or_default().insert(to);
            }
        }
    }
    debug!("Parsed dependencies for {} packages", dependencies.len());
    dependencies
}

pub fn parse_dot_file(path: &Path) -> Result<DependencyMap, ConfError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfError::Io(path.to_path_buf(), e.to_string()))?;
    Ok(parse_dot(&text))
}

/// Parse the output of `bitbake-layers show-recipes`.
pub fn parse_show_recipes(text: &str) -> PackageLayers {
    let mut package_layers = PackageLayers::new();
    let mut current: Option<String> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty()
            || line.starts_with("WARNING:")
            || line.starts_with("NOTE:")
            || line.starts_with("Summary:")
            || line.starts_with("===")
        {
            continue;
        }

        if let Some(package) = line.strip_suffix(':') {
            current = Some(package.replace(MULTILIB_PREFIX, ""));
        } else if let Some(package) = &current {
            if let Some(layer) = line.split_whitespace().next() {
                package_layers
                    .entry(package.clone())
                    .or_default()
                    .push(layer.to_string());
            }
        }
    }
    debug!("Parsed layer information for {} packages", package_layers.len());
    package_layers
}

pub fn parse_show_recipes_file(path: &Path) -> Result<PackageLayers, ConfError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfError::Io(path.to_path_buf(), e.to_string()))?;
    Ok(parse_show_recipes(&text))
}

/// Dependencies and providing layers of one package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageInfo {
    pub dependencies: Vec<String>,
    pub layers: Vec<String>,
}

/// Combined dependency and layer information for all packages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CombinedReport {
    pub packages: BTreeMap<String, PackageInfo>,
}

impl CombinedReport {
    /// Merge both sources. Packages that only ever appear as a dependency
    /// are included too.
    pub fn combine(dependencies: &DependencyMap, package_layers: &PackageLayers) -> Self {
        let mut names: BTreeSet<&String> = dependencies.keys().collect();
        names.extend(package_layers.keys());
        names.extend(dependencies.values().flatten());

        let packages = names
            .into_iter()
            .map(|name| {
                let info = PackageInfo {
                    dependencies: dependencies
                        .get(name)
                        .map(|deps| deps.iter().cloned().collect())
                        .unwrap_or_default(),
                    layers: package_layers.get(name).cloned().unwrap_or_default(),
                };
                (name.clone(), info)
            })
            .collect();
        CombinedReport { packages }
    }

    pub fn with_dependencies(&self) -> usize {
        self.packages
            .values()
            .filter(|p| !p.dependencies.is_empty())
            .count()
    }

    pub fn with_layers(&self) -> usize {
        self.packages.values().filter(|p| !p.layers.is_empty()).count()
    }

    /// Render the report text.
    pub fn render(&self) -> String {
        let mut out = format!("{}\n{}\n\n", REPORT_TITLE, "=".repeat(80));

        for (package, info) in &self.packages {
            out.push_str(&format!("Package: {}\n", package));
            if info.layers.is_empty() {
                out.push_str(&format!("  Layers: {}\n", NO_LAYERS));
            } else {
                out.push_str(&format!("  Layers: {}\n", info.layers.join(", ")));
            }

            if info.dependencies.is_empty() {
                out.push_str("  Dependencies: none\n");
            } else {
                out.push_str("  Dependencies:\n");
                for dep in &info.dependencies {
                    let line = match self.packages.get(dep).filter(|d| !d.layers.is_empty()) {
                        Some(d) => format!("    - {} (layers: {})\n", dep, d.layers.join(", ")),
                        None => format!("    - {} (layer: unknown)\n", dep),
                    };
                    out.push_str(&line);
                }
            }
            out.push('\n');
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<(), ConfError> {
        std::fs::write(path, self.render())
            .map_err(|e| ConfError::Io(path.to_path_buf(), e.to_string()))?;
        info!(
            "Wrote dependency report for {} packages to {:?}",
            self.packages.len(),
            path
        );
        Ok(())
    }

    /// Read a rendered report back.
    pub fn parse(text: &str) -> Self {
        let mut packages = BTreeMap::<String, PackageInfo>::new();
        let mut current: Option<String> = None;
        let mut in_dependencies = false;

        for line in text.lines() {
            let trimmed = line.trim();
            if line.starts_with(REPORT_TITLE) || line.starts_with('=') {
                continue;
            }

            if let Some(name) = line.strip_prefix("Package: ") {
                let name = name.trim().to_string();
                packages.insert(name.clone(), PackageInfo::default());
                current = Some(name);
                in_dependencies = false;
                continue;
            }

            let Some(info) = current.as_ref().and_then(|c| packages.get_mut(c)) else {
                continue;
            };

            if let Some(layers) = trimmed.strip_prefix("Layers: ") {
                if layers != NO_LAYERS {
                    info.layers = layers.split(',').map(|l| l.trim().to_string()).collect();
                }
            } else if trimmed == "Dependencies:" {
                in_dependencies = true;
            } else if trimmed == "Dependencies: none" {
                in_dependencies = false;
            } else if in_dependencies && trimmed.starts_with("- ") {
                if let Some(caps) = dependency_line_regex().captures(line) {
                    info.dependencies.push(caps[1].to_string());
                }
            }
        }
        CombinedReport { packages }
    }

    pub fn read(path: &Path) -> Result<Self, ConfError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfError::Io(path.to_path_buf(), e.to_string()))?;
        Ok(Self::parse(&text))
    }

    /// All distinct layer names mentioned in the report.
    pub fn layers(&self) -> BTreeSet<&str> {
        self.packages
            .values()
            .flat_map(|p| p.layers.iter().map(String::as_str))
            .collect()
    }
}
