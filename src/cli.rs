//! Operator CLI: clap definitions plus the thin HTTP client that maps each
//! subcommand onto one control-API request. Exit codes mirror HTTP families:
//! any non-2xx response becomes an error and a non-zero exit.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use crate::error::{QueueError, Result};

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(version)]
#[command(about = "Single-host background job queue with retries and a dead-letter queue")]
pub struct Cli {
    /// Address of the daemon's control API (client subcommands)
    #[arg(long, global = true, default_value = "127.0.0.1:7077")]
    pub addr: SocketAddr,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon
    Serve {
        /// Address to bind the control API on
        #[arg(long, default_value = "127.0.0.1:7077")]
        listen: SocketAddr,

        /// Directory holding queue.db snapshots
        #[arg(long, default_value = "./queuectl-state")]
        state_dir: PathBuf,

        /// Number of worker child processes
        #[arg(long, default_value_t = 3)]
        workers: usize,
    },

    /// Internal: worker child process (spawned by the daemon)
    #[command(hide = true)]
    Worker,

    /// Enqueue a shell command as a job
    Enqueue {
        /// The shell command to execute
        command: String,

        /// Client-supplied job id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Per-job retry cap, overriding the configured default
        #[arg(long)]
        max_retries: Option<u32>,

        /// Earliest eligibility, epoch milliseconds (0 = immediately)
        #[arg(long)]
        run_after: Option<i64>,
    },

    /// List jobs, newest first
    List {
        /// Filter by state: pending|processing|completed|failed|dead
        #[arg(long)]
        state: Option<String>,
    },

    /// Show one job record
    Get { id: String },

    /// Show job and worker summaries
    Status,

    /// Dead-letter queue operations
    #[command(subcommand)]
    Dlq(DlqCommand),

    /// Runtime configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Ask the daemon to drain and exit
    Shutdown,
}

#[derive(Subcommand, Debug)]
pub enum DlqCommand {
    /// List dead jobs
    List,
    /// Re-queue one dead job with a fresh retry budget
    Retry { id: String },
    /// Re-queue every dead job
    RetryAll,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// List all config keys
    List,
    /// Show one config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
}

/// Execute a client subcommand against the daemon at `addr`.
pub async fn run(addr: SocketAddr, command: Command) -> Result<()> {
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let body = match command {
        Command::Serve { .. } | Command::Worker => {
            unreachable!("server roles are dispatched in main")
        }
        Command::Enqueue {
            command,
            id,
            max_retries,
            run_after,
        } => {
            let mut payload = json!({ "command": command });
            if let Some(id) = id {
                payload["id"] = json!(id);
            }
            if let Some(max_retries) = max_retries {
                payload["max_retries"] = json!(max_retries);
            }
            if let Some(run_after) = run_after {
                payload["run_after"] = json!(run_after);
            }
            let response = client
                .post(format!("{base}/api/jobs"))
                .json(&payload)
                .send()
                .await?;
            expect_json(response).await?
        }
        Command::List { state } => {
            let mut request = client.get(format!("{base}/api/jobs"));
            if let Some(state) = state {
                request = request.query(&[("state", state)]);
            }
            expect_json(request.send().await?).await?
        }
        Command::Get { id } => {
            expect_json(client.get(format!("{base}/api/jobs/{id}")).send().await?).await?
        }
        Command::Status => {
            expect_json(client.get(format!("{base}/api/status")).send().await?).await?
        }
        Command::Dlq(DlqCommand::List) => {
            expect_json(client.get(format!("{base}/api/dlq")).send().await?).await?
        }
        Command::Dlq(DlqCommand::Retry { id }) => {
            if id.trim().is_empty() {
                return Err(QueueError::Validation("job id must not be empty".into()));
            }
            expect_json(
                client
                    .post(format!("{base}/api/dlq/{id}/retry"))
                    .send()
                    .await?,
            )
            .await?
        }
        Command::Dlq(DlqCommand::RetryAll) => {
            expect_json(client.post(format!("{base}/api/dlq/retry-all")).send().await?).await?
        }
        Command::Config(ConfigCommand::List) => {
            expect_json(client.get(format!("{base}/api/config")).send().await?).await?
        }
        Command::Config(ConfigCommand::Get { key }) => {
            expect_json(client.get(format!("{base}/api/config/{key}")).send().await?).await?
        }
        Command::Config(ConfigCommand::Set { key, value }) => {
            expect_json(
                client
                    .put(format!("{base}/api/config/{key}"))
                    .json(&json!({ "value": value }))
                    .send()
                    .await?,
            )
            .await?
        }
        Command::Shutdown => {
            expect_json(client.post(format!("{base}/api/shutdown")).send().await?).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

/// Parse the response body as JSON and turn non-2xx statuses into errors
/// carrying the server's message.
async fn expect_json(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let text = response.text().await?;
    let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

    if status.is_success() {
        Ok(body)
    } else {
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        Err(QueueError::Remote(format!("{message} (HTTP {status})")))
    }
}
