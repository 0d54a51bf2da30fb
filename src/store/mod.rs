//! Durable job store: the `jobs` and `config` tables, held in an in-memory
//! SQLite database with periodic file snapshots (see [`snapshot`]).
//!
//! The store is owned exclusively by the scheduler task; every mutation sets
//! the dirty flag and the snapshotter clears it only after a successful
//! write, so a failed snapshot is retried on the next interval.

pub mod snapshot;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{ConfigKey, Settings};
use crate::error::{QueueError, Result};
use snapshot::SnapshotPaths;

const CREATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id          TEXT PRIMARY KEY,
    command     TEXT NOT NULL,
    state       TEXT NOT NULL,
    attempts    INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER,
    run_after   INTEGER NOT NULL DEFAULT 0,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_state_run_after ON jobs(state, run_after);

CREATE TABLE IF NOT EXISTS config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    /// Reserved: accepted in list filters, never written by any transition.
    Failed,
    Dead,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Processing => write!(f, "processing"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Dead => write!(f, "dead"),
        }
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::Validation(format!(
                "unknown job state '{other}'"
            ))),
        }
    }
}

/// One row of the `jobs` table. Timestamps and `run_after` are epoch
/// milliseconds; `run_after = 0` means immediately eligible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: Option<u32>,
    pub run_after: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Enqueue input: everything optional except the command.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewJob {
    pub command: String,
    pub id: Option<String>,
    pub max_retries: Option<u32>,
    pub run_after: Option<i64>,
}

/// Per-state row counts, served by the status endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    pub total: u64,
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct JobStore {
    conn: Connection,
    paths: SnapshotPaths,
    dirty: bool,
}

impl JobStore {
    /// Open the store rooted at `state_dir`, restoring the previous snapshot
    /// if one exists and seeding config defaults on first start.
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let paths = SnapshotPaths::in_dir(state_dir);

        let mut conn = Connection::open_in_memory()?;
        if paths.snapshot_exists() {
            tracing::info!(path = %paths.db_path().display(), "restoring snapshot");
            snapshot::restore_snapshot(&mut conn, &paths)?;
        }
        conn.execute_batch(CREATE_SCHEMA_SQL)?;

        let mut store = Self {
            conn,
            paths,
            dirty: false,
        };
        store.seed_config_defaults()?;
        Ok(store)
    }

    fn seed_config_defaults(&mut self) -> Result<()> {
        for key in ConfigKey::ALL {
            self.conn.execute(
                "INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)",
                params![key.as_str(), key.default_value().to_string()],
            )?;
        }
        Ok(())
    }

    // --- job lifecycle ---------------------------------------------------

    pub fn enqueue(&mut self, new: NewJob) -> Result<Job> {
        if new.command.trim().is_empty() {
            return Err(QueueError::Validation("command must not be empty".into()));
        }
        if let Some(id) = &new.id {
            if id.trim().is_empty() {
                return Err(QueueError::Validation("job id must not be empty".into()));
            }
        }

        let id = new.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let exists: bool = self
            .conn
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", params![id], |_| Ok(()))
            .optional()?
            .is_some();
        if exists {
            return Err(QueueError::DuplicateJob(id));
        }

        let now = now_ms();
        let job = Job {
            id,
            command: new.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: new.max_retries,
            run_after: new.run_after.unwrap_or(0),
            created_at: now,
            updated_at: now,
        };
        self.conn.execute(
            "INSERT INTO jobs (id, command, state, attempts, max_retries, run_after, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job.id,
                job.command,
                job.state.to_string(),
                job.attempts,
                job.max_retries,
                job.run_after,
                job.created_at,
                job.updated_at,
            ],
        )?;
        self.dirty = true;
        Ok(job)
    }

    /// Claim the oldest eligible pending job and move it to `processing`.
    /// Selection order is ascending `created_at`, ties broken by id, so
    /// dispatch is FIFO-by-creation and stable.
    pub fn claim_next(&mut self, now: i64) -> Result<Option<Job>> {
        let job = self
            .conn
            .query_row(
                "SELECT id, command, state, attempts, max_retries, run_after, created_at, updated_at
                 FROM jobs
                 WHERE state = 'pending' AND run_after <= ?1
                 ORDER BY created_at ASC, id ASC
                 LIMIT 1",
                params![now],
                row_to_job,
            )
            .optional()?;

        let Some(mut job) = job else {
            return Ok(None);
        };

        self.conn.execute(
            "UPDATE jobs SET state = 'processing', updated_at = ?2 WHERE id = ?1",
            params![job.id, now],
        )?;
        self.dirty = true;
        job.state = JobState::Processing;
        job.updated_at = now;
        Ok(Some(job))
    }

    /// Terminal success. Conditional on `processing` so a stale reply cannot
    /// clobber a later transition. Returns whether a row changed.
    pub fn complete(&mut self, id: &str, now: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE jobs SET state = 'completed', updated_at = ?2
             WHERE id = ?1 AND state = 'processing'",
            params![id, now],
        )?;
        if changed > 0 {
            self.dirty = true;
        }
        Ok(changed > 0)
    }

    /// Apply a failure verdict: bump attempts and either re-queue with a
    /// delay or banish to the dead-letter queue.
    pub fn fail(
        &mut self,
        id: &str,
        new_attempts: u32,
        new_state: JobState,
        new_run_after: i64,
        now: i64,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE jobs SET state = ?2, attempts = ?3, run_after = ?4, updated_at = ?5
             WHERE id = ?1 AND state = 'processing'",
            params![id, new_state.to_string(), new_attempts, new_run_after, now],
        )?;
        if changed > 0 {
            self.dirty = true;
        }
        Ok(changed > 0)
    }

    /// Return a job whose worker died back to `pending`, attempts untouched.
    pub fn reset_processing(&mut self, id: &str, now: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE jobs SET state = 'pending', updated_at = ?2
             WHERE id = ?1 AND state = 'processing'",
            params![id, now],
        )?;
        if changed > 0 {
            self.dirty = true;
        }
        Ok(changed > 0)
    }

    /// Startup recovery: no worker can be alive yet, so every `processing`
    /// row left behind by a previous process becomes `pending` again.
    pub fn recover_stuck(&mut self, now: i64) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE jobs SET state = 'pending', updated_at = ?1 WHERE state = 'processing'",
            params![now],
        )?;
        if changed > 0 {
            self.dirty = true;
        }
        Ok(changed)
    }

    // --- reads -----------------------------------------------------------

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        let job = self
            .conn
            .query_row(
                "SELECT id, command, state, attempts, max_retries, run_after, created_at, updated_at
                 FROM jobs WHERE id = ?1",
                params![id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// All jobs, newest first, optionally filtered by state.
    pub fn list(&self, filter: Option<JobState>) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        match filter {
            Some(state) => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, command, state, attempts, max_retries, run_after, created_at, updated_at
                     FROM jobs WHERE state = ?1
                     ORDER BY created_at DESC, id DESC",
                )?;
                let rows = stmt.query_map(params![state.to_string()], row_to_job)?;
                for row in rows {
                    jobs.push(row?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, command, state, attempts, max_retries, run_after, created_at, updated_at
                     FROM jobs
                     ORDER BY created_at DESC, id DESC",
                )?;
                let rows = stmt.query_map([], row_to_job)?;
                for row in rows {
                    jobs.push(row?);
                }
            }
        }
        Ok(jobs)
    }

    pub fn summarize(&self) -> Result<JobSummary> {
        let mut summary = JobSummary::default();
        let mut stmt = self
            .conn
            .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (state, count) = row?;
            match state.parse::<JobState>()? {
                JobState::Pending => summary.pending = count,
                JobState::Processing => summary.processing = count,
                JobState::Completed => summary.completed = count,
                JobState::Failed => summary.failed = count,
                JobState::Dead => summary.dead = count,
            }
            summary.total += count;
        }
        Ok(summary)
    }

    // --- dead-letter queue -----------------------------------------------

    /// Give one dead job a fresh retry budget. Affects only rows currently
    /// in `dead`; anything else is not-found.
    pub fn requeue_dead(&mut self, id: &str, now: i64) -> Result<()> {
        if id.trim().is_empty() {
            return Err(QueueError::Validation("job id must not be empty".into()));
        }
        let changed = self.conn.execute(
            "UPDATE jobs SET state = 'pending', attempts = 0, run_after = 0, updated_at = ?2
             WHERE id = ?1 AND state = 'dead'",
            params![id, now],
        )?;
        if changed == 0 {
            return Err(QueueError::JobNotFound(id.to_string()));
        }
        self.dirty = true;
        Ok(())
    }

    pub fn requeue_all_dead(&mut self, now: i64) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE jobs SET state = 'pending', attempts = 0, run_after = 0, updated_at = ?1
             WHERE state = 'dead'",
            params![now],
        )?;
        if changed > 0 {
            self.dirty = true;
        }
        Ok(changed)
    }

    // --- config ----------------------------------------------------------

    pub fn config_all(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM config ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut pairs = Vec::new();
        for row in rows {
            pairs.push(row?);
        }
        Ok(pairs)
    }

    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Validate against the key's schema and store the sanitized value.
    pub fn config_set(&mut self, key: &str, value: &str) -> Result<String> {
        let known = ConfigKey::parse(key)
            .ok_or_else(|| QueueError::Validation(format!("unknown config key '{key}'")))?;
        let sanitized = known.validate(value)?;
        self.conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, sanitized],
        )?;
        self.dirty = true;
        Ok(sanitized)
    }

    pub fn settings(&self) -> Result<Settings> {
        let pairs = self.config_all()?;
        Ok(Settings::from_pairs(
            pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        ))
    }

    // --- snapshotting ----------------------------------------------------

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Export the in-memory image to disk. The dirty flag survives a failed
    /// write so the next interval retries.
    pub fn snapshot(&mut self) -> Result<()> {
        snapshot::write_snapshot(&self.conn, &self.paths)?;
        self.dirty = false;
        Ok(())
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let state_text: String = row.get(2)?;
    let state = state_text.parse::<JobState>().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("invalid job state '{state_text}'").into(),
        )
    })?;
    Ok(Job {
        id: row.get(0)?,
        command: row.get(1)?,
        state,
        attempts: row.get(3)?,
        max_retries: row.get(4)?,
        run_after: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}
