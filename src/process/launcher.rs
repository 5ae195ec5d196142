//! Backend subprocess supervision.
//!
//! # Responsibilities
//! - Spawn the FastCGI program given on the command line
//! - Relay its stdout/stderr lines into the log
//! - Report the exit status

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Delay before the HTTP side starts listening, giving a freshly spawned
/// backend time to bind its socket.
pub const STARTUP_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("no backend command given")]
    EmptyCommand,
    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// A launched backend process with its output relayed into tracing.
#[derive(Debug)]
pub struct BackendProcess {
    child: Child,
    command: String,
}

impl BackendProcess {
    /// Spawn `argv[0]` with the remaining arguments, piping its output.
    pub fn spawn(argv: &[String]) -> Result<Self, LaunchError> {
        let (program, args) = argv.split_first().ok_or(LaunchError::EmptyCommand)?;
        tracing::info!(command = %program, args = ?args, "Run");

        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                command: program.clone(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            relay_lines(stdout, program.clone(), false);
        }
        if let Some(stderr) = child.stderr.take() {
            relay_lines(stderr, program.clone(), true);
        }

        Ok(Self {
            child,
            command: program.clone(),
        })
    }

    /// Wait for the process to exit and log the status.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        let status = self.child.wait().await?;
        tracing::info!(command = %self.command, code = ?status.code(), "Backend exited");
        Ok(status)
    }

    /// Stop the backend, forcefully if it ignores the request.
    pub async fn stop(&mut self) {
        if let Err(err) = self.child.start_kill() {
            tracing::warn!(command = %self.command, error = %err, "Failed to signal backend");
            return;
        }
        match tokio::time::timeout(Duration::from_secs(1), self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(command = %self.command, code = ?status.code(), "Backend stopped")
            }
            Ok(Err(err)) => {
                tracing::warn!(command = %self.command, error = %err, "Failed to reap backend")
            }
            Err(_) => tracing::warn!(command = %self.command, "Backend did not exit in time"),
        }
    }
}

/// Forward each line of the child's output into the log.
fn relay_lines(pipe: impl AsyncRead + Unpin + Send + 'static, command: String, is_stderr: bool) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                tracing::warn!(command = %command, "STDERR: {}", line);
            } else {
                tracing::info!(command = %command, "STDOUT: {}", line);
            }
        }
    });
}
