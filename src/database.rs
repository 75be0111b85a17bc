//! SQLite persistence backend.
//!
//! One row per (name, version, fingerprint, replica), unique on that tuple.
//! A row with no finish time is a running placeholder; the uniqueness
//! constraint is the only cross-process exclusion mechanism. WAL mode for
//! concurrent read access from other processes.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::entry::{AnnounceOutcome, Entry, EntryId, RunInfo};
use crate::error::Result;
use crate::key::{Config, Key};

/// Persistence backend. Owns the SQLite connection.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn();

        // WAL mode for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS entries (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL,
                version     INTEGER NOT NULL,
                fingerprint TEXT NOT NULL,
                replica     INTEGER NOT NULL DEFAULT 0,
                config      TEXT NOT NULL,
                result      TEXT,
                start_time  TEXT NOT NULL,
                finish_time TEXT,
                run_info    TEXT,
                UNIQUE(name, version, fingerprint, replica)
            );

            CREATE INDEX IF NOT EXISTS idx_entries_name ON entries(name, version);
            CREATE INDEX IF NOT EXISTS idx_entries_running ON entries(finish_time)
                WHERE finish_time IS NULL;
            ",
        )?;

        Ok(())
    }

    /// A poisoned mutex only means another thread panicked mid-operation;
    /// the connection itself is still usable.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically announce a key or retrieve its existing row.
    ///
    /// Attempts to insert a running placeholder scoped by the uniqueness of
    /// (name, version, fingerprint, replica). A conflicting insert from a
    /// racing caller is absorbed by re-reading the row inside the same
    /// transaction; the race never surfaces.
    pub fn announce_or_retrieve(&self, key: &Key) -> Result<AnnounceOutcome> {
        let config = serde_json::to_string(key.config())?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT INTO entries (name, version, fingerprint, replica, config, start_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name, version, fingerprint, replica) DO NOTHING",
            params![
                key.name(),
                key.version(),
                key.fingerprint(),
                key.replica(),
                config,
                now
            ],
        )?;
        if inserted == 1 {
            let entry_id = tx.last_insert_rowid();
            tx.commit()?;
            return Ok(AnnounceOutcome::ComputeHere(entry_id));
        }

        let row: EntryRow = tx.query_row(
            "SELECT id, result, start_time, finish_time, run_info FROM entries
             WHERE name = ?1 AND version = ?2 AND fingerprint = ?3 AND replica = ?4",
            params![key.name(), key.version(), key.fingerprint(), key.replica()],
            EntryRow::from_row,
        )?;
        tx.commit()?;

        if row.finish_time.is_none() {
            Ok(AnnounceOutcome::RunningElsewhere(row.id))
        } else {
            Ok(AnnounceOutcome::Finished(row.into_entry(key.clone())?))
        }
    }

    /// Mark a running row as finished, recording the result and run metadata.
    pub fn finish_entry(
        &self,
        entry_id: EntryId,
        result: &serde_json::Value,
        run_info: &RunInfo,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE entries SET result = ?1, finish_time = ?2, run_info = ?3 WHERE id = ?4",
            params![
                serde_json::to_string(result)?,
                Utc::now().to_rfc3339(),
                serde_json::to_string(run_info)?,
                entry_id
            ],
        )?;
        Ok(())
    }

    /// Delete a running row. A failed computation leaves no trace.
    pub fn cancel_entry(&self, entry_id: EntryId) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM entries WHERE id = ?1", params![entry_id])?;
        Ok(())
    }

    /// Delete the row for a key. Safe to call on an absent key.
    pub fn remove(&self, key: &Key) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM entries
             WHERE name = ?1 AND version = ?2 AND fingerprint = ?3 AND replica = ?4",
            params![key.name(), key.version(), key.fingerprint(), key.replica()],
        )?;
        Ok(())
    }

    /// Append a finished row at the next unused replica index for
    /// (name, version, fingerprint), without executing anything. Returns
    /// the assigned replica index.
    ///
    /// Read-max-then-insert: two concurrent callers from different
    /// processes can race for the same index. Known and accepted.
    pub fn insert_new_replica(&self, key: &Key, result: &serde_json::Value) -> Result<u32> {
        let config = serde_json::to_string(key.config())?;
        let result = serde_json::to_string(result)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let replica: i64 = tx.query_row(
            "SELECT COALESCE(MAX(replica) + 1, 0) FROM entries
             WHERE name = ?1 AND version = ?2 AND fingerprint = ?3",
            params![key.name(), key.version(), key.fingerprint()],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO entries (name, version, fingerprint, replica, config, result, start_time, finish_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![key.name(), key.version(), key.fingerprint(), replica, config, result, now],
        )?;
        tx.commit()?;
        Ok(replica as u32)
    }

    /// Load the finished entry for a key, if any. Running rows don't count.
    pub fn load_finished(&self, key: &Key) -> Result<Option<Entry>> {
        let conn = self.conn();
        let row: Option<EntryRow> = conn
            .query_row(
                "SELECT id, result, start_time, finish_time, run_info FROM entries
                 WHERE name = ?1 AND version = ?2 AND fingerprint = ?3 AND replica = ?4
                 AND finish_time IS NOT NULL",
                params![key.name(), key.version(), key.fingerprint(), key.replica()],
                EntryRow::from_row,
            )
            .optional()?;
        match row {
            Some(row) => Ok(Some(row.into_entry(key.clone())?)),
            None => Ok(None),
        }
    }

    /// All finished entries sharing (name, version, fingerprint), replica
    /// order not guaranteed.
    pub fn load_finished_replicas(&self, key: &Key) -> Result<Vec<Entry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, result, start_time, finish_time, run_info, replica FROM entries
             WHERE name = ?1 AND version = ?2 AND fingerprint = ?3
             AND finish_time IS NOT NULL",
        )?;
        let rows = stmt
            .query_map(
                params![key.name(), key.version(), key.fingerprint()],
                |row| {
                    let entry_row = EntryRow::from_row(row)?;
                    let replica: u32 = row.get(5)?;
                    Ok((entry_row, replica))
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (row, replica) in rows {
            entries.push(row.into_entry(key.with_replica(replica))?);
        }
        Ok(entries)
    }

    /// Enumerate persisted keys, optionally filtered by name and version.
    pub fn list_keys(&self, name: Option<&str>, version: Option<u32>) -> Result<Vec<Key>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name, version, fingerprint, replica, config FROM entries
             WHERE (?1 IS NULL OR name = ?1) AND (?2 IS NULL OR version = ?2)",
        )?;
        let rows = stmt
            .query_map(params![name, version], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut keys = Vec::with_capacity(rows.len());
        for (name, version, fingerprint, replica, config) in rows {
            let config: Config = serde_json::from_str(&config)?;
            keys.push(Key::from_parts(name, version, config, replica, fingerprint));
        }
        Ok(keys)
    }

    /// Delete every row with no finish time. Startup recovery for rows
    /// orphaned by a crashed process. Returns how many were deleted.
    pub fn cancel_all_running(&self) -> Result<usize> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM entries WHERE finish_time IS NULL", [])?;
        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// Row parsing
// ---------------------------------------------------------------------------

struct EntryRow {
    id: EntryId,
    result: Option<String>,
    start_time: Option<String>,
    finish_time: Option<String>,
    run_info: Option<String>,
}

impl EntryRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            result: row.get(1)?,
            start_time: row.get(2)?,
            finish_time: row.get(3)?,
            run_info: row.get(4)?,
        })
    }

    fn into_entry(self, key: Key) -> Result<Entry> {
        let result = match self.result {
            Some(text) => serde_json::from_str(&text)?,
            None => serde_json::Value::Null,
        };
        let run_info: Option<RunInfo> = match self.run_info {
            Some(text) => serde_json::from_str(&text)?,
            None => None,
        };
        Ok(Entry {
            entry_id: self.id,
            key,
            result,
            start_time: parse_time(self.start_time),
            finish_time: parse_time(self.finish_time),
            run_info,
        })
    }
}

fn parse_time(text: Option<String>) -> Option<DateTime<Utc>> {
    text.and_then(|s| s.parse().ok())
}
