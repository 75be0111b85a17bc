//! Persisted outcome records and the announce protocol's outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::Key;

/// Rowid of a persisted entry.
pub type EntryId = i64;

/// Metadata recorded when a computation finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    /// Wall-clock execution time of the body.
    pub duration_ms: u64,
}

/// A persisted outcome record.
///
/// While a computation runs, its row has no finish time and no result; a
/// missing finish time is the sole discriminator of "running" vs "done".
/// Failed computations leave no row at all.
#[derive(Debug, Clone)]
pub struct Entry {
    pub entry_id: EntryId,
    pub key: Key,
    /// Opaque result value. Interpreted only by callers.
    pub result: serde_json::Value,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub run_info: Option<RunInfo>,
}

/// What the backend found (or created) when a key was announced.
#[derive(Debug)]
pub enum AnnounceOutcome {
    /// A finished entry already exists; no execution needed.
    Finished(Entry),
    /// This caller inserted the running row and must compute.
    ComputeHere(EntryId),
    /// A running row exists that this caller did not create.
    RunningElsewhere(EntryId),
}
