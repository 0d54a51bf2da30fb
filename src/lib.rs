//! queuectl: a single-host background job queue.
//!
//! Shell-command jobs are persisted in an embedded store, dispatched one per
//! scheduler tick onto a bounded pool of worker child processes, retried
//! with exponential backoff, and banished to a dead-letter queue once their
//! retry budget runs out. An HTTP control plane (enqueue, list, status, DLQ,
//! config, shutdown) serves the operator CLI.

pub mod api;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod pool;
pub mod scheduler;
pub mod store;
pub mod worker;
