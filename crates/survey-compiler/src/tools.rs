//! External command-line tools
//!
//! Conversion (ogr2ogr) and tiling (tippecanoe) run as subprocesses. Success
//! is the exit status; stdout and stderr are captured for logs and for the
//! decoders that parse tool output.

use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Last few stderr lines, for error messages
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        lines[lines.len().saturating_sub(5)..].join("\n")
    }
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run `program args..`. `timeout` of `None` waits for completion.
    async fn run(&self, program: &str, args: &[String], timeout: Option<Duration>) -> io::Result<ToolOutput>;

    /// `<program> --version` exits successfully within `timeout`. Any error,
    /// including a timeout, counts as absent.
    async fn available(&self, program: &str, timeout: Duration) -> bool {
        match self.run(program, &["--version".to_string()], Some(timeout)).await {
            Ok(output) => output.success,
            Err(e) => {
                warn!(program, error = %e, "Tool probe failed");
                false
            }
        }
    }
}

/// Runs tools as local child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String], timeout: Option<Duration>) -> io::Result<ToolOutput> {
        debug!(program, ?args, "Running tool");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{} did not finish within {:?}", program, limit),
                    )
                })??,
            None => child.wait_with_output().await?,
        };

        let result = ToolOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success {
            debug!(program, code = ?result.code, stderr = %result.stderr_tail(), "Tool exited with failure");
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let runner = ProcessRunner;
        assert!(
            !runner
                .available("definitely-not-a-real-tool-4b1e", Duration::from_secs(1))
                .await
        );
    }

    #[test]
    fn test_stderr_tail() {
        let output = ToolOutput {
            success: false,
            code: Some(1),
            stdout: String::new(),
            stderr: (1..=8).map(|i| format!("line {}\n", i)).collect(),
        };
        assert_eq!(output.stderr_tail(), "line 4\nline 5\nline 6\nline 7\nline 8");
    }
}
