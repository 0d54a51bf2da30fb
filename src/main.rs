use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use queuectl::cli::{self, Cli, Command};
use queuectl::config::DaemonConfig;
use queuectl::daemon::Daemon;
use queuectl::worker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    // Worker stdout carries the wire protocol; its logs must go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if matches!(args.command, Command::Worker) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match args.command {
        Command::Serve {
            listen,
            state_dir,
            workers,
        } => {
            let config = DaemonConfig::new(listen, state_dir, workers);
            let handle = Daemon::new(config).start(CancellationToken::new()).await?;
            handle.wait().await?;
        }
        Command::Worker => {
            worker::run().await?;
        }
        command => {
            cli::run(args.addr, command).await?;
        }
    }

    Ok(())
}
