//! Shell command runner.
//!
//! Commands run as `sh -c <command>` in their own process group with a
//! per-attempt deadline. On timeout or cancellation the child is killed
//! (`kill_on_drop`); exit code -1 stands in for timeout, start failure, and
//! signal death.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub cancelled: bool,
    pub start_error: Option<String>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled && self.start_error.is_none()
    }

    fn failed(exit_code: i32, started: Instant) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            duration: started.elapsed(),
            timed_out: false,
            cancelled: false,
            start_error: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let started = Instant::now();

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return RunOutcome {
                    start_error: Some(e.to_string()),
                    ..RunOutcome::failed(-1, started)
                };
            }
        };

        tokio::select! {
            result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) => RunOutcome {
                    // Signal death carries no code; fold it into -1.
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    duration: started.elapsed(),
                    timed_out: false,
                    cancelled: false,
                    start_error: None,
                },
                Ok(Err(e)) => RunOutcome {
                    start_error: Some(e.to_string()),
                    ..RunOutcome::failed(-1, started)
                },
                Err(_) => RunOutcome {
                    timed_out: true,
                    ..RunOutcome::failed(-1, started)
                },
            },
            _ = cancel.cancelled() => RunOutcome {
                cancelled: true,
                ..RunOutcome::failed(-1, started)
            },
        }
    }
}
