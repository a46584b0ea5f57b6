use std::path::{Path, PathBuf};
use std::sync::Mutex;

use convenient_bitbake::ConfFile;
use layer_build::builder::INDEX_TOOL;
use layer_build::publisher::{COMPRESSED_INDEX_FILE, INDEX_FILE};
use layer_build::{
    BuildConfig, BuildEnvironment, CommandOutput, CommandRunner, CommandSpec, FeedError, FeedLock,
    Layer, Pipeline, PipelineError, RunError, RunState, Stage, StageError, Step,
};
use tempfile::TempDir;
use tracing_test::traced_test;

/// Stands in for `repo`, `bitbake` and the index tool. Checkouts, build
/// outputs and command output are laid out the way the real tools do.
struct ScriptedBuildHost {
    calls: Mutex<Vec<String>>,
    fail_build_of: Option<Layer>,
}

impl ScriptedBuildHost {
    fn new() -> Self {
        ScriptedBuildHost {
            calls: Mutex::new(Vec::new()),
            fail_build_of: None,
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn package_arch(layer: Layer) -> &'static str {
        match layer {
            Layer::Oss => "armv8a",
            _ => "armv7at2hf-neon",
        }
    }

    fn repo(&self, layer: Layer, spec: &CommandSpec, cwd: &Path) {
        self.record(format!("{}: repo {}", layer, spec.args[0]));
        let profile = layer.profile();
        match spec.args[0].as_str() {
            "init" => {
                let file = &spec.args[spec.args.iter().position(|a| a == "-m").unwrap() + 1];
                let manifests = cwd.join(".repo/manifests");
                std::fs::create_dir_all(&manifests).unwrap();
                std::fs::write(
                    manifests.join(file),
                    format!(
                        r#"<manifest>
  <remote name="rdkcentral" fetch="https://github.com/rdkcentral/"/>
  <default remote="rdkcentral" revision="main"/>
  <project name="meta-{}-release" path="{}"/>
  <project name="poky" path="poky"/>
</manifest>"#,
                        layer, profile.checkout_marker
                    ),
                )
                .unwrap();
            }
            "sync" => {
                std::fs::create_dir_all(cwd.join(profile.checkout_marker)).unwrap();
                std::fs::create_dir_all(cwd.join("poky")).unwrap();
                std::fs::create_dir_all(cwd.join("scripts")).unwrap();
                std::fs::write(cwd.join("scripts/setup-environment"), "").unwrap();
                let include_dir = cwd.join(profile.include_dir);
                std::fs::create_dir_all(&include_dir).unwrap();
                for upstream in layer.predecessors() {
                    std::fs::write(
                        include_dir.join(format!("{}-ipk-feed.inc", upstream)),
                        format!(
                            "# feed of {}\n{} = \"http://placeholder/ipk\"\n",
                            upstream,
                            upstream.feed_key()
                        ),
                    )
                    .unwrap();
                }
            }
            other => panic!("unexpected repo command {}", other),
        }
    }

    fn bitbake(
        &self,
        layer: Layer,
        spec: &CommandSpec,
        cwd: &Path,
    ) -> Result<CommandOutput, RunError> {
        let line = &spec.args[1];
        let command = line.split("&& ").nth(1).unwrap().to_string();
        self.record(format!("{}: {}", layer, command));

        let machine = &spec
            .env
            .iter()
            .find(|(k, _)| k == "MACHINE")
            .unwrap()
            .1;
        let build = cwd.join(format!("build-{}", machine));
        let tmpdir = build.join("tmp");
        let deploy = tmpdir.join("deploy/ipk");
        let arch = Self::package_arch(layer);
        let words: Vec<&str> = command.split_whitespace().collect();

        let mut output = CommandOutput::default();
        match words.as_slice() {
            ["bitbake", "-e", _] => {
                output.stdout = format!(
                    "#\n# $DEPLOY_DIR_IPK\nDEPLOY_DIR_IPK=\"{}\"\nPACKAGE_ARCH=\"{}\"\nTMPDIR=\"{}\"\nexport BUILD_ARCH=\"x86_64\"\n",
                    deploy.display(),
                    arch,
                    tmpdir.display()
                );
            }
            ["bitbake", "-g", package] => {
                std::fs::create_dir_all(&build).unwrap();
                std::fs::write(
                    build.join("task-depends.dot"),
                    format!(
                        "digraph depends {{\n\"{0}.do_build\" -> \"lib32-wpeframework.do_build\"\n\"lib32-wpeframework.do_compile\" -> \"lib32-openssl.do_populate_sysroot\"\n}}\n",
                        package
                    ),
                )
                .unwrap();
            }
            ["bitbake-layers", "show-recipes"] => {
                output.stdout = concat!(
                    "=== Available recipes: ===\n",
                    "lib32-wpeframework:\n  meta-rdk-video 4.4\n",
                    "openssl:\n  meta 3.2.1\n",
                )
                .to_string();
            }
            ["bitbake", package] => {
                if self.fail_build_of == Some(layer) {
                    output.status = 1;
                    output.stderr = format!("ERROR: {} failed to build\n", package);
                    return Ok(output);
                }
                let arch_dir = deploy.join(arch);
                std::fs::create_dir_all(&arch_dir).unwrap();
                std::fs::write(arch_dir.join(format!("{}_1.0-r0_{}.ipk", package, arch)), package)
                    .unwrap();
                if layer == Layer::Oss {
                    std::fs::create_dir_all(deploy.join("all")).unwrap();
                    std::fs::write(deploy.join("all/base-files_3.0.14-r0_all.ipk"), "base")
                        .unwrap();
                    let tool_dir =
                        tmpdir.join("work/x86_64-linux/opkg-utils-native/0.6.3/image/usr/bin");
                    std::fs::create_dir_all(&tool_dir).unwrap();
                    std::fs::write(tool_dir.join(INDEX_TOOL), "").unwrap();
                }
            }
            other => panic!("unexpected bitbake command {:?}", other),
        }
        Ok(output)
    }

    fn index(&self, cwd: &Path) -> CommandOutput {
        self.record("oss: index".to_string());
        let mut packages: Vec<String> = walkdir::WalkDir::new(cwd)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().map_or(false, |x| x == "ipk"))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        packages.sort();
        CommandOutput {
            stdout: packages
                .iter()
                .map(|p| format!("Package: {}\nFilename: {}\n\n", p.split('_').next().unwrap(), p))
                .collect(),
            ..Default::default()
        }
    }
}

impl CommandRunner for ScriptedBuildHost {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunError> {
        let cwd = spec.cwd.clone().expect("every command runs in a directory");
        if spec.program.ends_with(INDEX_TOOL) {
            return Ok(self.index(&cwd));
        }
        let layer: Layer = cwd
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        match spec.program.as_str() {
            "repo" => {
                self.repo(layer, spec, &cwd);
                Ok(CommandOutput::default())
            }
            "bash" => self.bitbake(layer, spec, &cwd),
            other => panic!("unexpected program {}", other),
        }
    }
}

fn environment(root: &Path, layer: Layer) -> BuildEnvironment {
    BuildConfig {
        target: Some("raspberrypi4-64".to_string()),
        layer: Some(layer),
        manifest_branch: Some("RDK7-1.0.0".to_string()),
        oss_branch: Some("4.6.2-community".to_string()),
        workspace: Some(root.join("workspace")),
        shared_feed_root: Some(root.join("shared")),
        ..Default::default()
    }
    .generate()
    .unwrap()
}

#[test]
#[traced_test]
fn vendor_build_on_a_fresh_workspace() {
    let temp = TempDir::new().unwrap();
    let env = environment(temp.path(), Layer::Vendor);
    let host = ScriptedBuildHost::new();

    let mut pipeline = Pipeline::new(&env, &host).with_sync_jobs(8);
    let report = pipeline.build().unwrap().clone();

    assert_eq!(
        host.calls(),
        vec![
            "oss: repo init",
            "oss: repo sync",
            "oss: bitbake packagegroup-oss-layer",
            "oss: bitbake -e packagegroup-oss-layer",
            "oss: index",
            "vendor: repo init",
            "vendor: repo sync",
            "vendor: bitbake lib32-packagegroup-vendor-layer",
            "vendor: bitbake -e lib32-packagegroup-vendor-layer",
        ]
    );

    let oss_feed = temp.path().join("shared/rdk-arm64-oss/4.6.2-community/ipk");
    let vendor_feed = temp
        .path()
        .join("shared/raspberrypi4-64-rdke-vendor/RDK7-1.0.0/ipk");
    assert_eq!(
        report.feeds.iter().map(|f| f.path.clone()).collect::<Vec<PathBuf>>(),
        vec![oss_feed.clone(), vendor_feed.clone()]
    );
    assert!(oss_feed.join("armv8a/packagegroup-oss-layer_1.0-r0_armv8a.ipk").is_file());
    assert!(oss_feed.join(INDEX_FILE).is_file());
    assert!(oss_feed.join(COMPRESSED_INDEX_FILE).is_file());
    assert!(vendor_feed
        .join("armv7at2hf-neon/lib32-packagegroup-vendor-layer_1.0-r0_armv7at2hf-neon.ipk")
        .is_file());

    let vendor = env.spec(Layer::Vendor).unwrap();
    let include = ConfFile::read(
        vendor
            .work_dir
            .join(&vendor.include_dir)
            .join("oss-ipk-feed.inc"),
    )
    .unwrap();
    assert_eq!(
        include.get("OSS_IPK_SERVER_PATH"),
        Some(format!("file://{}", oss_feed.display()).as_str())
    );

    for layer in [Layer::Oss, Layer::Vendor] {
        assert_eq!(
            report.stages(layer),
            vec![
                Stage::ManifestReady,
                Stage::FeedConfigured,
                Stage::Built,
                Stage::Published
            ]
        );
    }
    assert_eq!(report.synced, vec![Layer::Oss, Layer::Vendor]);
    assert_eq!(report.state, RunState::Done);
}

#[test]
fn rerun_skips_checkouts() {
    let temp = TempDir::new().unwrap();
    let env = environment(temp.path(), Layer::Vendor);
    let host = ScriptedBuildHost::new();
    Pipeline::new(&env, &host).build().unwrap();

    let again = ScriptedBuildHost::new();
    let mut pipeline = Pipeline::new(&env, &again);
    let report = pipeline.build().unwrap();
    assert!(report.synced.is_empty());
    assert!(!again.calls().iter().any(|c| c.contains("repo")));
    assert_eq!(report.feeds.len(), 2);
}

#[test]
fn failed_build_stops_the_chain() {
    let temp = TempDir::new().unwrap();
    let env = environment(temp.path(), Layer::Middleware);
    let mut host = ScriptedBuildHost::new();
    host.fail_build_of = Some(Layer::Vendor);

    let mut pipeline = Pipeline::new(&env, &host);
    match pipeline.build() {
        Err(PipelineError::Stage {
            layer,
            step,
            source: StageError::Build(_),
        }) => {
            assert_eq!(layer, Layer::Vendor);
            assert_eq!(step, Step::Build);
        }
        other => panic!("Expected vendor build failure, got {:?}", other.map(|r| r.clone())),
    }

    let report = pipeline.report();
    assert_eq!(report.state, RunState::Failed(Layer::Vendor, Step::Build));
    assert_eq!(report.feeds.len(), 1);
    assert!(!host.calls().iter().any(|c| c.starts_with("middleware")));
    assert!(matches!(pipeline.build(), Err(PipelineError::Finished(_))));
}

#[test]
fn image_assembler_publishes_no_feed() {
    let temp = TempDir::new().unwrap();
    let env = environment(temp.path(), Layer::ImageAssembler);
    let host = ScriptedBuildHost::new();

    let mut pipeline = Pipeline::new(&env, &host);
    let report = pipeline.build().unwrap();
    assert_eq!(report.feeds.len(), 4);
    assert_eq!(
        report.stages(Layer::ImageAssembler),
        vec![Stage::ManifestReady, Stage::FeedConfigured, Stage::Built]
    );
    assert!(!host
        .calls()
        .contains(&"image-assembler: bitbake -e lib32-rdk-fullstack-image".to_string()));
}

#[test]
fn concurrent_run_is_refused() {
    let temp = TempDir::new().unwrap();
    let env = environment(temp.path(), Layer::Oss);
    let _held = FeedLock::acquire(&env.shared_feed_root, "layer-build build").unwrap();

    let host = ScriptedBuildHost::new();
    let mut pipeline = Pipeline::new(&env, &host);
    assert!(matches!(
        pipeline.build(),
        Err(PipelineError::Lock(FeedError::Locked { .. }))
    ));
    assert!(host.calls().is_empty());
    assert_eq!(pipeline.report().state, RunState::Pending);
}

#[test]
fn dependency_mode_writes_the_combined_report() {
    let temp = TempDir::new().unwrap();
    let env = environment(temp.path(), Layer::Oss);
    let host = ScriptedBuildHost::new();

    let mut pipeline = Pipeline::new(&env, &host);
    let analysis = pipeline.dependencies().unwrap();

    assert_eq!(
        host.calls(),
        vec![
            "oss: repo init",
            "oss: repo sync",
            "oss: bitbake -g packagegroup-oss-layer",
            "oss: bitbake-layers show-recipes",
        ]
    );
    let build = env.requested().build_path();
    assert_eq!(analysis.report_path, build.join("combined_output.txt"));
    assert!(build.join("package-layers.txt").is_file());

    let text = std::fs::read_to_string(&analysis.report_path).unwrap();
    assert!(text.contains(
        "Package: wpeframework\n  Layers: meta-rdk-video\n  Dependencies:\n    - openssl (layers: meta)\n"
    ));
    assert_eq!(
        pipeline.report().stages(Layer::Oss),
        vec![
            Stage::ManifestReady,
            Stage::FeedConfigured,
            Stage::DependenciesAnalysed
        ]
    );
}
