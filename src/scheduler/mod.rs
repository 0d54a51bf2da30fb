//! The scheduling core: one task owning the job store and the worker pool.
//!
//! Every state transition — dispatch ticks, worker replies and exits,
//! control-plane requests, snapshot ticks, shutdown — is serialized through
//! this task, so no lock protects the store or the pool and the "one dispatch
//! per tick" rule holds structurally. Control-plane callers talk to the core
//! through a [`CoreHandle`]: a request message carrying a oneshot reply
//! channel.
//!
//! Shutdown: the cancellation token flips the core into draining. Writes are
//! refused, dispatch stops, dead workers are not replaced. When the last
//! bound worker reports its terminal result the core takes a final snapshot
//! and returns; a failed final snapshot is the only error this loop exits
//! with.

pub mod retry;

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ConfigKey;
use crate::error::{QueueError, Result};
use crate::pool::protocol::{JobAssignment, WorkerReply};
use crate::pool::{PoolStats, WorkerEvent, WorkerPool};
use crate::store::{now_ms, Job, JobState, JobStore, JobSummary, NewJob};

/// Combined job-table and worker-pool counts for the status endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatusReport {
    #[serde(rename = "jobSummary")]
    pub jobs: JobSummary,
    #[serde(rename = "workerSummary")]
    pub workers: PoolStats,
}

/// Requests from the control plane into the core, each carrying its reply
/// channel.
#[derive(Debug)]
pub enum ControlRequest {
    Enqueue {
        new: NewJob,
        reply: oneshot::Sender<Result<Job>>,
    },
    List {
        filter: Option<JobState>,
        reply: oneshot::Sender<Result<Vec<Job>>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Result<Job>>,
    },
    Status {
        reply: oneshot::Sender<Result<StatusReport>>,
    },
    DlqList {
        reply: oneshot::Sender<Result<Vec<Job>>>,
    },
    DlqRetryOne {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    DlqRetryAll {
        reply: oneshot::Sender<Result<usize>>,
    },
    ConfigList {
        reply: oneshot::Sender<Result<Vec<(String, String)>>>,
    },
    ConfigGet {
        key: String,
        reply: oneshot::Sender<Result<(String, String)>>,
    },
    ConfigSet {
        key: String,
        value: String,
        reply: oneshot::Sender<Result<(String, String)>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<String>>,
    },
}

/// Cloneable client side of the core's control channel.
#[derive(Clone)]
pub struct CoreHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl CoreHandle {
    pub async fn enqueue(&self, new: NewJob) -> Result<Job> {
        let (reply, rx) = oneshot::channel();
        self.request(ControlRequest::Enqueue { new, reply }, rx).await
    }

    pub async fn list(&self, filter: Option<JobState>) -> Result<Vec<Job>> {
        let (reply, rx) = oneshot::channel();
        self.request(ControlRequest::List { filter, reply }, rx).await
    }

    pub async fn get(&self, id: String) -> Result<Job> {
        let (reply, rx) = oneshot::channel();
        self.request(ControlRequest::Get { id, reply }, rx).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let (reply, rx) = oneshot::channel();
        self.request(ControlRequest::Status { reply }, rx).await
    }

    pub async fn dlq_list(&self) -> Result<Vec<Job>> {
        let (reply, rx) = oneshot::channel();
        self.request(ControlRequest::DlqList { reply }, rx).await
    }

    pub async fn dlq_retry_one(&self, id: String) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(ControlRequest::DlqRetryOne { id, reply }, rx).await
    }

    pub async fn dlq_retry_all(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.request(ControlRequest::DlqRetryAll { reply }, rx).await
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        let (reply, rx) = oneshot::channel();
        self.request(ControlRequest::ConfigList { reply }, rx).await
    }

    pub async fn config_get(&self, key: String) -> Result<(String, String)> {
        let (reply, rx) = oneshot::channel();
        self.request(ControlRequest::ConfigGet { key, reply }, rx).await
    }

    pub async fn config_set(&self, key: String, value: String) -> Result<(String, String)> {
        let (reply, rx) = oneshot::channel();
        self.request(ControlRequest::ConfigSet { key, value, reply }, rx)
            .await
    }

    pub async fn shutdown(&self) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.request(ControlRequest::Shutdown { reply }, rx).await
    }

    async fn request<T>(
        &self,
        req: ControlRequest,
        rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        self.tx
            .send(req)
            .await
            .map_err(|_| QueueError::CoreUnavailable)?;
        rx.await.map_err(|_| QueueError::CoreUnavailable)?
    }
}

pub struct Scheduler {
    store: JobStore,
    pool: WorkerPool,
    control_rx: mpsc::Receiver<ControlRequest>,
    worker_rx: mpsc::Receiver<WorkerEvent>,
    token: CancellationToken,
    draining: bool,
}

impl Scheduler {
    /// Build the core around an opened store and an initialized pool.
    /// Returns the scheduler plus the handle the control plane uses.
    pub fn new(
        store: JobStore,
        pool: WorkerPool,
        worker_rx: mpsc::Receiver<WorkerEvent>,
        token: CancellationToken,
    ) -> (Self, CoreHandle) {
        let (tx, control_rx) = mpsc::channel(64);
        (
            Self {
                store,
                pool,
                control_rx,
                worker_rx,
                token,
                draining: false,
            },
            CoreHandle { tx },
        )
    }

    pub async fn run(mut self) -> Result<()> {
        let settings = self.store.settings()?;
        let mut tick = new_interval(settings.tick_interval_ms);
        let mut save = new_interval(settings.save_interval_ms);

        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled(), if !self.draining => {
                    self.begin_drain("signal");
                }
                Some(req) = self.control_rx.recv() => {
                    match self.handle_control(req) {
                        Some(ConfigKey::TickIntervalMs) => {
                            if let Ok(settings) = self.store.settings() {
                                tick = new_interval(settings.tick_interval_ms);
                            }
                        }
                        Some(ConfigKey::SaveIntervalMs) => {
                            if let Ok(settings) = self.store.settings() {
                                save = new_interval(settings.save_interval_ms);
                            }
                        }
                        _ => {}
                    }
                }
                Some(event) = self.worker_rx.recv() => {
                    self.handle_worker_event(event);
                }
                _ = tick.tick() => {
                    self.dispatch_next().await;
                }
                _ = save.tick() => {
                    self.snapshot_if_dirty();
                }
            }

            if self.draining && self.pool.processing_count() == 0 {
                break;
            }
        }

        tracing::info!("queue drained, writing final snapshot");
        self.store.snapshot()?;
        Ok(())
    }

    fn begin_drain(&mut self, origin: &str) {
        if self.draining {
            return;
        }
        self.draining = true;
        // Stops the control-plane listener as well.
        self.token.cancel();
        tracing::info!(
            origin,
            processing = self.pool.processing_count(),
            "shutting down, draining in-flight jobs"
        );
    }

    /// One scheduler tick: claim the oldest eligible job and bind it to one
    /// idle worker. At most one dispatch per tick.
    async fn dispatch_next(&mut self) {
        if self.draining || !self.pool.has_idle() {
            return;
        }
        let now = now_ms();
        let job = match self.store.claim_next(now) {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "claim_next failed");
                return;
            }
        };
        match self.pool.dispatch(&job.id, &job.command).await {
            Ok(worker) => {
                tracing::debug!(job_id = %job.id, worker, "job dispatched");
            }
            Err(e) => {
                // The worker's exit event will handle the respawn; the job
                // goes straight back to pending.
                tracing::error!(job_id = %job.id, error = %e, "dispatch failed, resetting job");
                if let Err(e) = self.store.reset_processing(&job.id, now) {
                    tracing::error!(job_id = %job.id, error = %e, "reset after failed dispatch");
                }
            }
        }
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Reply { worker, reply } => match reply {
                WorkerReply::Ready => self.pool.mark_ready(worker),
                WorkerReply::Completed { job, output } => {
                    self.apply_terminal(worker, job, Ok(output));
                }
                WorkerReply::Failed { job, error } => {
                    self.apply_terminal(worker, job, Err(error));
                }
            },
            WorkerEvent::Exited { worker, code } => self.handle_worker_exit(worker, code),
        }
    }

    /// Apply a terminal reply: clear the binding, return the worker to the
    /// idle queue, and write the job's fate to the store.
    fn apply_terminal(
        &mut self,
        worker: u64,
        job: JobAssignment,
        outcome: std::result::Result<Option<String>, String>,
    ) {
        match self.pool.release(worker) {
            Some(bound) if bound == job.id => {}
            other => {
                tracing::warn!(
                    worker,
                    job_id = %job.id,
                    bound = ?other,
                    "terminal reply does not match binding"
                );
            }
        }

        let now = now_ms();
        match outcome {
            Ok(output) => {
                match self.store.complete(&job.id, now) {
                    Ok(true) => {
                        tracing::info!(job_id = %job.id, "job completed");
                        if let Some(output) = output {
                            tracing::debug!(job_id = %job.id, output = %output.trim_end(), "job output");
                        }
                    }
                    Ok(false) => {
                        tracing::warn!(job_id = %job.id, "completion for job no longer processing");
                    }
                    Err(e) => tracing::error!(job_id = %job.id, error = %e, "recording completion"),
                }
            }
            Err(error) => self.apply_failure(&job.id, &error, now),
        }
    }

    fn apply_failure(&mut self, job_id: &str, error: &str, now: i64) {
        let row = match self.store.get(job_id) {
            Ok(Some(row)) => row,
            Ok(None) => {
                tracing::warn!(job_id, "failure reported for unknown job");
                return;
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "loading failed job");
                return;
            }
        };
        let settings = match self.store.settings() {
            Ok(settings) => settings,
            Err(e) => {
                tracing::error!(error = %e, "loading settings, using defaults");
                crate::config::Settings::default()
            }
        };

        let (new_attempts, verdict) = retry::on_failure(&row, &settings, now);
        let write = match verdict {
            retry::RetryVerdict::Retry { run_after } => {
                tracing::warn!(
                    job_id,
                    attempts = new_attempts,
                    retry_in_ms = run_after - now,
                    error,
                    "job failed, will retry"
                );
                self.store
                    .fail(job_id, new_attempts, JobState::Pending, run_after, now)
            }
            retry::RetryVerdict::Dead => {
                tracing::warn!(
                    job_id,
                    attempts = new_attempts,
                    error,
                    "job failed, moved to dead-letter queue"
                );
                self.store
                    .fail(job_id, new_attempts, JobState::Dead, row.run_after, now)
            }
        };
        match write {
            Ok(true) => {}
            Ok(false) => tracing::warn!(job_id, "failure for job no longer processing"),
            Err(e) => tracing::error!(job_id, error = %e, "recording failure"),
        }
    }

    /// A worker process died. Its bound job (if any) returns to `pending`
    /// without an attempt bump; a replacement is spawned unless draining.
    fn handle_worker_exit(&mut self, worker: u64, code: Option<i32>) {
        let bound = self.pool.remove(worker);
        if let Some(job_id) = &bound {
            tracing::warn!(worker, code, job_id = %job_id, "worker died while bound");
            match self.store.reset_processing(job_id, now_ms()) {
                Ok(true) => {}
                Ok(false) => tracing::warn!(job_id = %job_id, "bound job was not processing"),
                Err(e) => tracing::error!(job_id = %job_id, error = %e, "resetting crashed job"),
            }
        } else {
            tracing::info!(worker, code, "worker exited");
        }

        if !self.draining {
            if let Err(e) = self.pool.spawn_one() {
                tracing::error!(error = %e, "respawning worker");
            }
        }
    }

    /// Returns the config key whose value changed, so the run loop can
    /// re-arm its interval timers.
    fn handle_control(&mut self, req: ControlRequest) -> Option<ConfigKey> {
        let mut changed = None;
        match req {
            ControlRequest::Enqueue { new, reply } => {
                let result = if self.draining {
                    Err(QueueError::ShuttingDown)
                } else {
                    self.store.enqueue(new)
                };
                if let Ok(job) = &result {
                    tracing::info!(job_id = %job.id, command = %job.command, "job enqueued");
                }
                let _ = reply.send(result);
            }
            ControlRequest::List { filter, reply } => {
                let _ = reply.send(self.store.list(filter));
            }
            ControlRequest::Get { id, reply } => {
                let result = self
                    .store
                    .get(&id)
                    .and_then(|job| job.ok_or(QueueError::JobNotFound(id)));
                let _ = reply.send(result);
            }
            ControlRequest::Status { reply } => {
                let result = self.store.summarize().map(|jobs| StatusReport {
                    jobs,
                    workers: self.pool.stats(),
                });
                let _ = reply.send(result);
            }
            ControlRequest::DlqList { reply } => {
                let _ = reply.send(self.store.list(Some(JobState::Dead)));
            }
            ControlRequest::DlqRetryOne { id, reply } => {
                let result = if self.draining {
                    Err(QueueError::ShuttingDown)
                } else {
                    self.store.requeue_dead(&id, now_ms())
                };
                let _ = reply.send(result);
            }
            ControlRequest::DlqRetryAll { reply } => {
                let result = if self.draining {
                    Err(QueueError::ShuttingDown)
                } else {
                    self.store.requeue_all_dead(now_ms()).and_then(|count| {
                        if count == 0 {
                            Err(QueueError::DlqEmpty)
                        } else {
                            Ok(count)
                        }
                    })
                };
                let _ = reply.send(result);
            }
            ControlRequest::ConfigList { reply } => {
                let _ = reply.send(self.store.config_all());
            }
            ControlRequest::ConfigGet { key, reply } => {
                let result = self.store.config_get(&key).and_then(|value| match value {
                    Some(value) => Ok((key, value)),
                    None => Err(QueueError::UnknownConfigKey(key)),
                });
                let _ = reply.send(result);
            }
            ControlRequest::ConfigSet { key, value, reply } => {
                let result = if self.draining {
                    Err(QueueError::ShuttingDown)
                } else {
                    self.store.config_set(&key, &value).map(|sanitized| {
                        tracing::info!(key = %key, value = %sanitized, "config updated");
                        changed = ConfigKey::parse(&key);
                        (key, sanitized)
                    })
                };
                let _ = reply.send(result);
            }
            ControlRequest::Shutdown { reply } => {
                let _ = reply.send(Ok("shutting down".to_string()));
                self.begin_drain("control api");
            }
        }
        changed
    }

    fn snapshot_if_dirty(&mut self) {
        if !self.store.is_dirty() {
            return;
        }
        match self.store.snapshot() {
            Ok(()) => tracing::debug!("snapshot written"),
            Err(e) => tracing::error!(error = %e, "snapshot failed, will retry"),
        }
    }
}

fn new_interval(period_ms: u64) -> Interval {
    let mut interval = interval(Duration::from_millis(period_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
