//! `std::process` based tool runner.

use std::path::Path;
use std::process::Command;

use tracing::{debug, instrument};

use super::traits::ToolRunner;
use crate::error::AssemblyError;

/// Runs tools as child processes, blocking until they exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    #[instrument(level = "debug", skip(self, args), fields(program = %program.display()))]
    fn run(&self, program: &Path, args: &[String]) -> Result<(), AssemblyError> {
        debug!(args = ?args, "Starting external tool");

        let output = Command::new(program).args(args).output().map_err(|e| {
            AssemblyError::io(format!("failed to start {}", program.display()), e)
        })?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!("{}", line);
        }

        if !output.status.success() {
            return Err(AssemblyError::ExternalToolFailure {
                program: program.display().to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_success() {
        ProcessRunner.run(Path::new("true"), &[]).unwrap();
    }

    #[test]
    fn test_failure_carries_stderr() {
        let err = ProcessRunner
            .run(
                Path::new("sh"),
                &["-c".to_string(), "echo broken >&2; exit 3".to_string()],
            )
            .unwrap_err();

        match err {
            AssemblyError::ExternalToolFailure { program, status, stderr } => {
                assert_eq!(program, "sh");
                assert!(status.contains('3'));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_program() {
        let err = ProcessRunner
            .run(Path::new("/nonexistent/fwgen-tool"), &[])
            .unwrap_err();
        assert!(matches!(err, AssemblyError::Io { .. }));
    }
}
