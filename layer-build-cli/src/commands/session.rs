//! Interactive work inside a configured layer.

use layer_build::{BuildEnvironment, CommandRunner, CommandSpec, SystemRunner};
use tracing::info;

use super::{CliError, Context};

/// The command run in the requested layer's work directory with the build
/// environment exported.
pub fn session_command(env: &BuildEnvironment, program: &str, args: &[String]) -> CommandSpec {
    CommandSpec::new(program)
        .args(args.iter().cloned())
        .cwd(env.work_dir())
        .envs(env.to_vars())
}

pub fn shell(context: &Context) -> Result<(), CliError> {
    let env = context.load_environment()?;
    let shell = std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "bash".to_string());
    info!("Starting {} in {:?}", shell, env.work_dir());
    SystemRunner.check(&session_command(&env, &shell, &[]))?;
    Ok(())
}

pub fn exec(context: &Context, command: &[String]) -> Result<(), CliError> {
    let env = context.load_environment()?;
    // clap requires at least one word
    let Some((program, args)) = command.split_first() else {
        return Ok(());
    };
    SystemRunner.check(&session_command(&env, program, args))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use layer_build::{BuildConfig, Layer};
    use tempfile::TempDir;

    #[test]
    fn session_runs_in_the_requested_layer() {
        let temp = TempDir::new().unwrap();
        let env = BuildConfig {
            target: Some("raspberrypi4-64".to_string()),
            layer: Some(Layer::Vendor),
            manifest_branch: Some("RDK7-1.0.0".to_string()),
            oss_branch: Some("4.6.2-community".to_string()),
            workspace: Some(temp.path().join("workspace")),
            shared_feed_root: Some(temp.path().join("shared")),
            ..Default::default()
        }
        .resolve()
        .unwrap();

        let spec = session_command(&env, "bitbake", &["-e".to_string()]);
        assert_eq!(spec.program, "bitbake");
        assert_eq!(spec.args, vec!["-e"]);
        assert_eq!(spec.cwd, Some(temp.path().join("workspace/vendor")));
        assert!(spec
            .env
            .contains(&("MACHINE".to_string(), "raspberrypi4-64-rdke".to_string())));
        assert!(spec.env.contains(&("LAYER".to_string(), "vendor".to_string())));
    }

    #[test]
    fn failing_command_is_an_error() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("workspace/oss")).unwrap();
        let env = BuildConfig {
            target: Some("raspberrypi4-64".to_string()),
            layer: Some(Layer::Oss),
            manifest_branch: Some("RDK7-1.0.0".to_string()),
            oss_branch: Some("4.6.2-community".to_string()),
            workspace: Some(temp.path().join("workspace")),
            shared_feed_root: Some(temp.path().join("shared")),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        let context = Context::new(temp.path().to_path_buf(), None);
        env.write_env_file(&context.env_file).unwrap();

        let check_layer = ["sh", "-c", "test \"$LAYER\" = oss"].map(String::from);
        assert!(exec(&context, &check_layer).is_ok());
        assert!(matches!(
            exec(&context, &["sh".to_string(), "-c".to_string(), "exit 3".to_string()]),
            Err(CliError::Run(layer_build::RunError::Failed { status: 3, .. }))
        ));
    }
}
