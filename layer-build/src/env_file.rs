//! The flat environment file shared between `configure` and the execution
//! commands. It is a list of `export KEY="value"` lines and can be sourced by
//! a POSIX shell as well.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::environment::{BuildEnvironment, EnvError, FeedSource, LayerSpec};
use crate::layer::Layer;

const LAYER_FIELDS: [&str; 10] = [
    "MANIFEST_URL",
    "MANIFEST_BRANCH",
    "MANIFEST_FILE",
    "PACKAGE",
    "MACHINE",
    "FEED_PATH",
    "FEED_URL",
    "FEED_SOURCE",
    "INCLUDE_DIR",
    "CHECKOUT_MARKER",
];

impl BuildEnvironment {
    /// Variables exported for the environment, in file order.
    pub fn to_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("TARGET".to_string(), self.target.clone()),
            ("LAYER".to_string(), self.layer.to_string()),
            ("MANIFEST_BRANCH".to_string(), self.manifest_branch.clone()),
            ("OSS_BRANCH".to_string(), self.oss_branch.clone()),
            ("MACHINE".to_string(), self.machine.clone()),
            ("WORKSPACE".to_string(), path_string(&self.workspace)),
            (
                "SHARED_FEED_ROOT".to_string(),
                path_string(&self.shared_feed_root),
            ),
            ("FEED_BASE_URL".to_string(), self.feed_base_url.clone()),
            ("BUILD_DIR".to_string(), self.build_dir().to_string()),
            ("WORK_DIR".to_string(), path_string(self.work_dir())),
        ];
        for spec in self.chain() {
            let key = spec.layer.key();
            let values = [
                spec.manifest_url.clone(),
                spec.manifest_branch.clone(),
                spec.manifest_file.clone(),
                spec.package.clone(),
                spec.machine.clone(),
                path_string(&spec.feed_path),
                spec.remote_feed_url.clone(),
                spec.feed_source.to_string(),
                path_string(&spec.include_dir),
                path_string(&spec.checkout_marker),
            ];
            for (field, value) in LAYER_FIELDS.iter().zip(values) {
                vars.push((format!("{}_{}", key, field), value));
            }
        }
        vars
    }

    /// Rebuild an environment from exported variables.
    pub fn from_vars(vars: &BTreeMap<String, String>) -> Result<BuildEnvironment, EnvError> {
        let get = |key: &str| -> Result<String, EnvError> {
            vars.get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| EnvError::Missing(key.to_string()))
        };

        let layer: Layer = get("LAYER")?.parse()?;
        let workspace = PathBuf::from(get("WORKSPACE")?);
        let mut layers = BTreeMap::new();
        for chain_layer in layer.chain() {
            let key = chain_layer.key();
            let field = |name: &str| get(&format!("{}_{}", key, name));
            let machine = field("MACHINE")?;
            layers.insert(
                chain_layer,
                LayerSpec {
                    layer: chain_layer,
                    manifest_url: field("MANIFEST_URL")?,
                    manifest_branch: field("MANIFEST_BRANCH")?,
                    manifest_file: field("MANIFEST_FILE")?,
                    package: field("PACKAGE")?,
                    build_dir: format!("build-{}", machine),
                    work_dir: workspace.join(chain_layer.name()),
                    feed_path: PathBuf::from(field("FEED_PATH")?),
                    remote_feed_url: field("FEED_URL")?,
                    feed_source: field("FEED_SOURCE")?.parse::<FeedSource>()?,
                    include_dir: PathBuf::from(field("INCLUDE_DIR")?),
                    checkout_marker: PathBuf::from(field("CHECKOUT_MARKER")?),
                    machine,
                },
            );
        }

        Ok(BuildEnvironment {
            target: get("TARGET")?,
            layer,
            manifest_branch: get("MANIFEST_BRANCH")?,
            oss_branch: get("OSS_BRANCH")?,
            machine: get("MACHINE")?,
            workspace,
            shared_feed_root: PathBuf::from(get("SHARED_FEED_ROOT")?),
            feed_base_url: get("FEED_BASE_URL")?,
            layers,
        })
    }

    pub fn to_env_file(&self) -> String {
        self.to_vars()
            .into_iter()
            .map(|(key, value)| format!("export {}=\"{}\"\n", key, escape(&value)))
            .collect()
    }

    pub fn write_env_file(&self, path: &Path) -> Result<(), EnvError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| EnvError::Io(parent.to_path_buf(), e.to_string()))?;
        }
        std::fs::write(path, self.to_env_file())
            .map_err(|e| EnvError::Io(path.to_path_buf(), e.to_string()))?;
        info!("Wrote build environment for {} to {:?}", self.layer, path);
        Ok(())
    }

    pub fn read_env_file(path: &Path) -> Result<BuildEnvironment, EnvError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EnvError::Io(path.to_path_buf(), e.to_string()))?;
        let vars = parse_env_file(&text)
            .map_err(|line| EnvError::Config(path.to_path_buf(), format!("line {}", line)))?;
        debug!("Read {} variables from {:?}", vars.len(), path);
        BuildEnvironment::from_vars(&vars)
    }
}

fn path_string(path: &Path) -> String {
    path.display().to_string()
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Parse `export KEY="value"` lines. Blank lines and comments are skipped.
/// The error is the 1-based number of the first malformed line.
pub fn parse_env_file(text: &str) -> Result<BTreeMap<String, String>, usize> {
    let mut vars = BTreeMap::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let assignment = line.strip_prefix("export ").unwrap_or(line).trim_start();
        let (key, quoted) = assignment.split_once('=').ok_or(index + 1)?;
        let inner = quoted
            .strip_prefix('"')
            .and_then(|q| q.strip_suffix('"'))
            .ok_or(index + 1)?;

        let mut value = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                value.push(chars.next().ok_or(index + 1)?);
            } else {
                value.push(c);
            }
        }
        vars.insert(key.trim().to_string(), value);
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{BuildConfig, LayerOverride};
    use tempfile::TempDir;

    fn environment(layer: Layer) -> BuildEnvironment {
        BuildConfig {
            target: Some("raspberrypi4-64".to_string()),
            layer: Some(layer),
            manifest_branch: Some("RDK7-1.0.0".to_string()),
            oss_branch: Some("4.6.2-community".to_string()),
            workspace: Some(PathBuf::from("/work")),
            shared_feed_root: Some(PathBuf::from("/shared")),
            ..Default::default()
        }
        .resolve()
        .unwrap()
    }

    #[test]
    fn file_round_trips_through_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state/build.env");
        let env = environment(Layer::Middleware);
        env.write_env_file(&path).unwrap();
        assert_eq!(BuildEnvironment::read_env_file(&path).unwrap(), env);
    }

    #[test]
    fn later_layers_are_not_written() {
        let text = environment(Layer::Middleware).to_env_file();
        assert!(text.contains("export LAYER=\"middleware\"\n"));
        assert!(text.contains("export WORK_DIR=\"/work/middleware\"\n"));
        assert!(text.contains("export BUILD_DIR=\"build-raspberrypi4-64-rdke\"\n"));
        assert!(text.contains(
            "export OSS_FEED_PATH=\"/shared/rdk-arm64-oss/4.6.2-community/ipk\"\n"
        ));
        assert!(!text.contains("APPLICATION_"));
        assert!(!text.contains("IMAGE_ASSEMBLER_"));
        assert!(!text.contains("/application"));
    }

    #[test]
    fn values_are_shell_escaped() {
        let mut cfg = BuildConfig {
            target: Some("raspberrypi4-64".to_string()),
            layer: Some(Layer::Oss),
            manifest_branch: Some("RDK7".to_string()),
            oss_branch: Some("4.6.2".to_string()),
            workspace: Some(PathBuf::from("/work")),
            shared_feed_root: Some(PathBuf::from("/shared")),
            ..Default::default()
        };
        cfg.layers.insert(
            Layer::Oss,
            LayerOverride {
                manifest_url: Some("https://example.com/$HOME/`id`/\"q\"\\".to_string()),
                ..Default::default()
            },
        );
        let env = cfg.resolve().unwrap();
        let text = env.to_env_file();
        assert!(text.contains(
            "export OSS_MANIFEST_URL=\"https://example.com/\\$HOME/\\`id\\`/\\\"q\\\"\\\\\"\n"
        ));
        let vars = parse_env_file(&text).unwrap();
        assert_eq!(
            BuildEnvironment::from_vars(&vars).unwrap().requested().manifest_url,
            "https://example.com/$HOME/`id`/\"q\"\\"
        );
    }

    #[test]
    fn missing_keys_are_named() {
        let mut vars = parse_env_file(&environment(Layer::Vendor).to_env_file()).unwrap();
        vars.remove("VENDOR_PACKAGE");
        match BuildEnvironment::from_vars(&vars) {
            Err(EnvError::Missing(key)) => assert_eq!(key, "VENDOR_PACKAGE"),
            other => panic!("Expected missing VENDOR_PACKAGE, got {:?}", other),
        }
    }

    #[test]
    fn malformed_lines_are_reported() {
        assert_eq!(parse_env_file("# comment\n\nexport A=\"1\"\nB=2\n"), Err(4));
        assert_eq!(
            parse_env_file("A=\"x\"\n").unwrap().get("A").map(String::as_str),
            Some("x")
        );
    }
}
