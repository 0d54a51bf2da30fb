//! The worker child process.
//!
//! Spawned by the daemon from its own binary (hidden `worker` subcommand),
//! a worker executes one shell command at a time:
//!
//! 1. Announce `ready` on stdout, exactly once.
//! 2. Read one [`JobAssignment`] per stdin line.
//! 3. Tokenize the command ([`shell`]); reject anything unparseable.
//! 4. Run it through `sh -c`, capturing stdout and stderr.
//! 5. Write exactly one terminal reply per assignment.
//!
//! Stdout is reserved for the protocol; all logging goes to stderr. EOF on
//! stdin is the shutdown signal and exits the loop cleanly. The worker
//! persists nothing; a crashing command is just a non-zero exit.

pub mod shell;

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::error::Result;
use crate::pool::protocol::{JobAssignment, WorkerReply};

/// Entry point for the `worker` subcommand.
pub async fn run() -> Result<()> {
    run_loop(tokio::io::stdin(), tokio::io::stdout()).await
}

async fn run_loop<R, W>(input: R, mut output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send_reply(&mut output, &WorkerReply::Ready).await?;
    tracing::debug!("worker ready");

    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let assignment: JobAssignment = match serde_json::from_str(&line) {
            Ok(assignment) => assignment,
            Err(e) => {
                tracing::error!(error = %e, "dropping malformed assignment");
                continue;
            }
        };
        tracing::debug!(job_id = %assignment.id, command = %assignment.command, "executing job");
        let reply = execute(assignment).await;
        send_reply(&mut output, &reply).await?;
    }

    tracing::debug!("stdin closed, worker exiting");
    Ok(())
}

/// Run one assignment to a terminal reply. Never returns an error: every
/// failure mode, including spawn errors, becomes a `failed` reply.
pub async fn execute(job: JobAssignment) -> WorkerReply {
    if shell::tokenize(&job.command).is_err() {
        return WorkerReply::Failed {
            job,
            error: "Unparseable command".to_string(),
        };
    }

    let result = Command::new("sh")
        .arg("-c")
        .arg(&job.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    match result {
        Ok(output) => {
            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                WorkerReply::Completed {
                    job,
                    output: if stdout.is_empty() { None } else { Some(stdout) },
                }
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let error = if stderr.is_empty() {
                    format!(
                        "Process exited with code {}",
                        output.status.code().unwrap_or(-1)
                    )
                } else {
                    stderr
                };
                WorkerReply::Failed { job, error }
            }
        }
        Err(e) => WorkerReply::Failed {
            job,
            error: e.to_string(),
        },
    }
}

async fn send_reply<W: AsyncWrite + Unpin>(output: &mut W, reply: &WorkerReply) -> Result<()> {
    let mut line = serde_json::to_string(reply)?;
    line.push('\n');
    output.write_all(line.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}
