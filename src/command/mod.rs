//! External command execution shared by the tracker and archive collaborators.
//!
//! Both `git` and the archive CLI are driven through [`CommandRunner`] so the
//! orchestration logic can be exercised with scripted fakes.

use std::ffi::OsString;
use std::process::Command;

use camino::Utf8Path;
use thiserror::Error;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable exit status, `unknown` when the process was killed.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised when an external command cannot be run at all.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError>;

    /// Runs `program` with `dir` as its working directory.
    ///
    /// The default implementation ignores `dir`; runners that spawn real
    /// processes override it.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started.
    fn run_in(
        &self,
        _dir: &Utf8Path,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, CommandError> {
        self.run(program, args)
    }
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl ProcessCommandRunner {
    fn execute(program: &str, command: &mut Command) -> Result<CommandOutput, CommandError> {
        let output = command.output().map_err(|err| CommandError::Spawn {
            program: program.to_owned(),
            message: err.to_string(),
        })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        Self::execute(program, Command::new(program).args(args))
    }

    fn run_in(
        &self,
        dir: &Utf8Path,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, CommandError> {
        Self::execute(program, Command::new(program).args(args).current_dir(dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some(0), true)]
    #[case(Some(1), false)]
    #[case(None, false)]
    fn is_success_requires_zero_exit(#[case] code: Option<i32>, #[case] expected: bool) {
        let output = CommandOutput {
            code,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(output.is_success(), expected);
    }

    #[test]
    fn status_text_reports_unknown_without_code() {
        let output = CommandOutput {
            code: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(output.status_text(), "unknown");
    }

    #[test]
    fn process_runner_reports_spawn_failures() {
        let err = ProcessCommandRunner
            .run("tagmirror-definitely-missing-binary", &[])
            .expect_err("missing binary should fail to spawn");
        let CommandError::Spawn { program, .. } = err;
        assert_eq!(program, "tagmirror-definitely-missing-binary");
    }
}
