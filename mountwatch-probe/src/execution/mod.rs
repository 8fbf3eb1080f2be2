//! Command execution for mountwatch probes
//!
//! Runs a local process (normally `ssh` or `ping`) with a hard timeout:
//! - Never returns an error: failures are folded into the exit code
//! - Timeout is reported as exit 124, spawn failure or signal death as 255
//! - The child is killed when the timeout fires

use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

/// Exit code reported when a command exceeded its timeout (same as coreutils `timeout`).
pub const EXIT_TIMEOUT: i32 = 124;

/// Exit code reported when the command could not be run or the host could not be
/// reached (same as `ssh` on connection failure).
pub const EXIT_UNREACHABLE: i32 = 255;

/// Result of one command invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u128,
}

impl CommandOutput {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            execution_time_ms: 0,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// True when the exit code itself says the command never reached the host
    /// or never finished.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self.exit_code, EXIT_TIMEOUT | EXIT_UNREACHABLE)
    }
}

/// Executes one command with a timeout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &[String], timeout: Duration) -> CommandOutput;
}

/// Runs commands as local child processes
#[derive(Debug, Default, Clone)]
pub struct LocalRunner;

impl LocalRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, command: &[String], timeout: Duration) -> CommandOutput {
        let start_time = Instant::now();

        let Some((program, args)) = command.split_first() else {
            return CommandOutput::new(EXIT_UNREACHABLE, "", "empty command");
        };
        debug!("Executing {} (timeout: {:?})", command.join(" "), timeout);

        let child = AsyncCommand::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn {}: {}", program, e);
                let mut output = CommandOutput::new(
                    EXIT_UNREACHABLE,
                    "",
                    format!("failed to execute {}: {}", program, e),
                );
                output.execution_time_ms = start_time.elapsed().as_millis();
                return output;
            }
        };

        let mut output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => CommandOutput::new(
                // A missing code means the child died on a signal.
                output.status.code().unwrap_or(EXIT_UNREACHABLE),
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr),
            ),
            Ok(Err(e)) => CommandOutput::new(
                EXIT_UNREACHABLE,
                "",
                format!("failed to collect output of {}: {}", program, e),
            ),
            Err(_) => CommandOutput::new(
                EXIT_TIMEOUT,
                "",
                format!("command timed out after {}s", timeout.as_secs()),
            ),
        };

        output.execution_time_ms = start_time.elapsed().as_millis();
        output
    }
}
