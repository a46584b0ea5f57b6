//! External process execution.
//!
//! Every call to `repo`, `bitbake` and friends goes through a
//! [`CommandRunner`] so that the pipeline can be driven without them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Failed to start `{0}`: {1}")]
    Spawn(String, std::io::Error),

    #[error("`{command}` exited with status {status}{}", stderr_suffix(.stderr))]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    match stderr.trim() {
        "" => String::new(),
        text => format!(": {}", text.lines().last().unwrap_or(text)),
    }
}

/// A process to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Collect stdout and stderr instead of passing them through.
    pub capture: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(vars);
        self
    }

    pub fn capture(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Shell-like rendering for messages.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| {
                if part.is_empty() || part.contains(char::is_whitespace) {
                    format!("'{}'", part)
                } else {
                    part.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    /// Empty unless the command was captured.
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

pub trait CommandRunner {
    /// Run a process to completion. A non-zero exit status is not an error
    /// at this level.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunError>;

    /// Run a process and fail unless it exits successfully.
    fn check(&self, spec: &CommandSpec) -> Result<CommandOutput, RunError> {
        let output = self.run(spec)?;
        if output.success() {
            Ok(output)
        } else {
            Err(RunError::Failed {
                command: spec.command_line(),
                status: output.status,
                stderr: output.stderr,
            })
        }
    }
}

/// Runs processes on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunError> {
        debug!(
            "Running `{}` in {:?}",
            spec.command_line(),
            spec.cwd.as_deref().unwrap_or_else(|| Path::new("."))
        );
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        command.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }

        if spec.capture {
            let output = command
                .stdin(Stdio::null())
                .output()
                .map_err(|e| RunError::Spawn(spec.command_line(), e))?;
            Ok(CommandOutput {
                status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        } else {
            let status = command
                .status()
                .map_err(|e| RunError::Spawn(spec.command_line(), e))?;
            Ok(CommandOutput {
                status: status.code().unwrap_or(-1),
                ..Default::default()
            })
        }
    }
}

/// Quote a string for a POSIX shell command line.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=+@%,".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_command_line() {
        let spec = CommandSpec::new("repo")
            .arg("init")
            .args(["-u", "https://example.com/manifest"])
            .arg("two words")
            .cwd("/work/oss")
            .env("MACHINE", "rdk-arm64")
            .capture();
        assert_eq!(
            spec.command_line(),
            "repo init -u https://example.com/manifest 'two words'"
        );
        assert_eq!(spec.cwd, Some(PathBuf::from("/work/oss")));
        assert!(spec.capture);
    }

    #[test]
    fn system_runner_captures_output() {
        let output = SystemRunner
            .check(&CommandSpec::new("sh").args(["-c", "echo out; echo err >&2"]).capture())
            .unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[test]
    fn non_zero_exit_is_an_error_only_when_checked() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .capture();
        assert_eq!(SystemRunner.run(&spec).unwrap().status, 3);
        match SystemRunner.check(&spec) {
            Err(RunError::Failed { status, stderr, .. }) => {
                assert_eq!(status, 3);
                assert_eq!(stderr, "broken\n");
            }
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        assert!(matches!(
            SystemRunner.run(&CommandSpec::new("layer-build-no-such-program")),
            Err(RunError::Spawn(_, _))
        ));
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("build-rdk-arm64"), "build-rdk-arm64");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
