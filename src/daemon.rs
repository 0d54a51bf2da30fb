//! Daemon wiring: open the store, recover, spawn the worker pool, bind the
//! control API, and hand everything to the scheduler core.

use std::net::SocketAddr;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::DaemonConfig;
use crate::error::{QueueError, Result};
use crate::pool::WorkerPool;
use crate::scheduler::{CoreHandle, Scheduler};
use crate::store::{now_ms, JobStore};

pub struct Daemon {
    config: DaemonConfig,
}

/// A started daemon: the resolved listen address, a handle into the core,
/// and the scheduler task to wait on.
pub struct DaemonHandle {
    pub local_addr: SocketAddr,
    pub core: CoreHandle,
    scheduler: JoinHandle<Result<()>>,
    api: JoinHandle<()>,
}

impl DaemonHandle {
    /// Wait for the scheduler core to drain and exit. A failed final
    /// snapshot surfaces here as an error (non-zero process exit).
    pub async fn wait(self) -> Result<()> {
        let result = self
            .scheduler
            .await
            .map_err(|e| QueueError::Internal(format!("scheduler task panicked: {e}")))?;
        self.api.abort();
        result
    }
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Self {
        Self { config }
    }

    /// Start all subsystems. Store-init failure is fatal here; everything
    /// after that is handled by the running core.
    pub async fn start(self, token: CancellationToken) -> Result<DaemonHandle> {
        watch_shutdown_signals(token.clone());

        let mut store = JobStore::open(&self.config.state_dir)?;
        let recovered = store.recover_stuck(now_ms())?;
        if recovered > 0 {
            tracing::info!(recovered, "reset jobs left processing by a previous run");
        }

        let (worker_tx, worker_rx) = mpsc::channel(128);
        let (program, args) = match self.config.worker_command.clone() {
            Some((program, args)) => (program, args),
            None => (std::env::current_exe()?, vec!["worker".to_string()]),
        };
        let mut pool = WorkerPool::new(program, args, worker_tx);
        pool.init(self.config.worker_count)?;

        let (scheduler, core) = Scheduler::new(store, pool, worker_rx, token.clone());

        let listener = tokio::net::TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(
            addr = %local_addr,
            workers = self.config.worker_count,
            state_dir = %self.config.state_dir.display(),
            "queuectl daemon starting"
        );

        let api_state = ApiState { core: core.clone() };
        let api_token = token.clone();
        let api = tokio::spawn(async move {
            if let Err(e) = api::serve(listener, api_state, api_token).await {
                tracing::error!(error = %e, "control API server failed");
            }
        });

        let scheduler = tokio::spawn(scheduler.run());

        Ok(DaemonHandle {
            local_addr,
            core,
            scheduler,
            api,
        })
    }
}

/// Cancel the daemon's token on SIGTERM or SIGINT, handing the drain to the
/// scheduler core and closing the control-plane listener. A failed handler
/// install is logged and leaves the control API's shutdown operation as the
/// only way to stop the daemon.
fn watch_shutdown_signals(token: CancellationToken) {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return;
        }
    };

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, draining the queue");
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, draining the queue");
            }
        }
        token.cancel();
    });
}
