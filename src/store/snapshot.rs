//! Crash-consistent persistence for the in-memory database.
//!
//! The whole dataset is exported with the SQLite online-backup API into a
//! staging file, which is then atomically renamed over the canonical
//! snapshot. Readers of the snapshot only ever observe a complete database.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::backup::Backup;
use rusqlite::{Connection, OpenFlags};

use crate::error::{QueueError, Result};

const DB_FILENAME: &str = "queue.db";
const TMP_FILENAME: &str = "queue.db.tmp";

const BACKUP_PAGES_PER_STEP: std::os::raw::c_int = 64;
const BACKUP_PAUSE: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct SnapshotPaths {
    db_path: PathBuf,
    tmp_path: PathBuf,
}

impl SnapshotPaths {
    pub fn in_dir(state_dir: &Path) -> Self {
        Self {
            db_path: state_dir.join(DB_FILENAME),
            tmp_path: state_dir.join(TMP_FILENAME),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn snapshot_exists(&self) -> bool {
        self.db_path.exists()
    }
}

/// Write the current in-memory image to disk: backup into the staging file,
/// then rename over the canonical snapshot.
pub fn write_snapshot(conn: &Connection, paths: &SnapshotPaths) -> Result<()> {
    match fs::remove_file(&paths.tmp_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut staging = Connection::open(&paths.tmp_path)?;
    {
        let backup = Backup::new(conn, &mut staging)?;
        backup.run_to_completion(BACKUP_PAGES_PER_STEP, BACKUP_PAUSE, None)?;
    }
    staging.close().map_err(|(_, e)| QueueError::Database(e))?;

    fs::rename(&paths.tmp_path, &paths.db_path)?;
    Ok(())
}

/// Load a previously written snapshot into the in-memory database,
/// replacing its contents.
pub fn restore_snapshot(conn: &mut Connection, paths: &SnapshotPaths) -> Result<()> {
    let source = Connection::open_with_flags(
        &paths.db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let backup = Backup::new(&source, conn)?;
    backup.run_to_completion(BACKUP_PAGES_PER_STEP, BACKUP_PAUSE, None)?;
    Ok(())
}
