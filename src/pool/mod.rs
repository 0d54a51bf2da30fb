//! Worker pool: a bounded set of child processes executing jobs.
//!
//! The pool tracks an idle queue (workers that have announced `ready` and
//! hold no job) and a binding map (worker -> job id). A worker is in exactly
//! one of spawning / idle / busy at any time. Replies and exits flow back to
//! the scheduler as [`WorkerEvent`]s over one channel; the pool itself makes
//! no policy decisions (the scheduler decides when to respawn, the store
//! decides what a crash means for the bound job).

pub mod protocol;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;

use crate::error::{QueueError, Result};
use protocol::{JobAssignment, WorkerReply};

pub type WorkerId = u64;

/// Everything a worker child can tell the daemon.
#[derive(Debug)]
pub enum WorkerEvent {
    Reply { worker: WorkerId, reply: WorkerReply },
    Exited { worker: WorkerId, code: Option<i32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerPhase {
    /// Process started, `ready` not yet seen.
    Spawning,
    Idle,
    Busy,
}

struct WorkerHandle {
    phase: WorkerPhase,
    stdin: ChildStdin,
}

/// Live worker counts for the status endpoint. `live` excludes workers that
/// are still spawning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub processing: usize,
    pub idle: usize,
    pub live: usize,
}

pub struct WorkerPool {
    program: PathBuf,
    args: Vec<String>,
    events_tx: mpsc::Sender<WorkerEvent>,
    workers: HashMap<WorkerId, WorkerHandle>,
    idle: VecDeque<WorkerId>,
    bindings: HashMap<WorkerId, String>,
    next_id: WorkerId,
}

impl WorkerPool {
    pub fn new(program: PathBuf, args: Vec<String>, events_tx: mpsc::Sender<WorkerEvent>) -> Self {
        Self {
            program,
            args,
            events_tx,
            workers: HashMap::new(),
            idle: VecDeque::new(),
            bindings: HashMap::new(),
            next_id: 1,
        }
    }

    /// Spawn the initial complement of workers.
    pub fn init(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.spawn_one()?;
        }
        Ok(())
    }

    /// Start one child and wire up its reader tasks. The worker is not
    /// placed in the idle queue until its `ready` message arrives.
    pub fn spawn_one(&mut self) -> Result<WorkerId> {
        let id = self.next_id;
        self.next_id += 1;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| QueueError::Validation("worker stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| QueueError::Validation("worker stdout not piped".into()))?;
        let stderr = child.stderr.take();

        // Surface worker logs without letting OS buffers fill up.
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(worker = id, "stderr: {line}");
                }
            });
        }

        // Reader task: forward replies, then report the exit once stdout
        // closes. Owning `child` here lets it reap the process.
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<WorkerReply>(&line) {
                        Ok(reply) => {
                            if events_tx
                                .send(WorkerEvent::Reply { worker: id, reply })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(worker = id, error = %e, "unparseable worker reply");
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(worker = id, error = %e, "worker stdout read error");
                        break;
                    }
                }
            }
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(_) => None,
            };
            let _ = events_tx.send(WorkerEvent::Exited { worker: id, code }).await;
        });

        self.workers.insert(
            id,
            WorkerHandle {
                phase: WorkerPhase::Spawning,
                stdin,
            },
        );
        tracing::info!(worker = id, "worker spawned");
        Ok(id)
    }

    /// Handle a `ready` announcement: the worker joins the idle queue.
    pub fn mark_ready(&mut self, id: WorkerId) {
        match self.workers.get_mut(&id) {
            Some(handle) if handle.phase == WorkerPhase::Spawning => {
                handle.phase = WorkerPhase::Idle;
                self.idle.push_back(id);
                tracing::debug!(worker = id, "worker ready");
            }
            Some(handle) => {
                tracing::warn!(worker = id, phase = ?handle.phase, "duplicate ready ignored");
            }
            None => {
                tracing::warn!(worker = id, "ready from unknown worker");
            }
        }
    }

    pub fn has_idle(&self) -> bool {
        !self.idle.is_empty()
    }

    /// Bind the next idle worker to `job` and send the assignment down its
    /// stdin. On a write failure the worker is discarded (its exit event
    /// will follow) and the error is returned so the caller can reset the
    /// job.
    pub async fn dispatch(&mut self, job_id: &str, command: &str) -> Result<WorkerId> {
        let id = self
            .idle
            .pop_front()
            .ok_or_else(|| QueueError::Validation("no idle worker".into()))?;

        let assignment = JobAssignment {
            id: job_id.to_string(),
            command: command.to_string(),
        };
        let mut line = serde_json::to_string(&assignment)?;
        line.push('\n');

        let written = {
            let handle = self
                .workers
                .get_mut(&id)
                .expect("idle queue entry without handle");
            write_line(&mut handle.stdin, &line).await
        };
        if let Err(e) = written {
            tracing::warn!(worker = id, error = %e, "failed to send assignment");
            self.workers.remove(&id);
            return Err(e);
        }

        if let Some(handle) = self.workers.get_mut(&id) {
            handle.phase = WorkerPhase::Busy;
        }
        self.bindings.insert(id, job_id.to_string());
        Ok(id)
    }

    /// Clear the binding after a terminal reply and return the worker to the
    /// idle queue. Returns the job id the worker was bound to, if any.
    pub fn release(&mut self, id: WorkerId) -> Option<String> {
        let job_id = self.bindings.remove(&id);
        if let Some(handle) = self.workers.get_mut(&id) {
            handle.phase = WorkerPhase::Idle;
            self.idle.push_back(id);
        }
        job_id
    }

    /// Remove a dead worker from all pool state. Returns the job id it was
    /// bound to so the caller can reset that job.
    pub fn remove(&mut self, id: WorkerId) -> Option<String> {
        self.workers.remove(&id);
        self.idle.retain(|w| *w != id);
        self.bindings.remove(&id)
    }

    pub fn bound_job(&self, id: WorkerId) -> Option<&str> {
        self.bindings.get(&id).map(String::as_str)
    }

    pub fn processing_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn stats(&self) -> PoolStats {
        let processing = self.bindings.len();
        let idle = self.idle.len();
        PoolStats {
            processing,
            idle,
            live: processing + idle,
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}
