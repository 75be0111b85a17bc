//! The coordination core: single-flight in-process execution and the
//! cross-process announce protocol.
//!
//! Per key, one process-wide waiter exists while a computation runs. The
//! first caller registers the waiter and announces the key to the backend;
//! concurrent same-process callers block on the waiter and receive the
//! identical terminal outcome. A running row owned by another process is
//! reported as an error, never awaited. The waiter table's mutex guards
//! only table lookups and mutations — never the body's execution, never
//! backend I/O.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use chrono::Utc;
use tracing::{debug, info};

use crate::computation::{Computation, Ref, ToKey};
use crate::database::Database;
use crate::entry::{AnnounceOutcome, Entry, EntryId, RunInfo};
use crate::error::{Error, Result};
use crate::key::Key;

/// Why an in-flight computation did not produce a result.
#[derive(Clone)]
enum FailureKind {
    /// The body failed with this message.
    Failed(String),
    /// Another process owns the running row.
    Elsewhere,
}

type WaitOutcome = std::result::Result<Entry, FailureKind>;

/// One-shot result cell shared by every thread interested in one running
/// key. The outcome is published exactly once. The registering thread is
/// recorded so a body re-entering its own key can be rejected instead of
/// waiting on itself.
struct Waiter {
    owner: ThreadId,
    cell: Mutex<Option<WaitOutcome>>,
    ready: Condvar,
}

impl Waiter {
    fn new() -> Self {
        Self {
            owner: thread::current().id(),
            cell: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Block until the outcome is published. No timeout; the owner always
    /// publishes, on success and on every failure path.
    fn wait(&self) -> WaitOutcome {
        let mut cell = lock(&self.cell);
        loop {
            if let Some(outcome) = cell.as_ref() {
                return outcome.clone();
            }
            cell = self.ready.wait(cell).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn publish(&self, outcome: WaitOutcome) {
        let mut cell = lock(&self.cell);
        *cell = Some(outcome);
        self.ready.notify_all();
    }
}

/// A poisoned mutex only means another thread panicked while holding it;
/// the guarded data is still consistent for our access patterns.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The memoizing store. Owns the persistence backend and the in-process
/// waiter table; shared across threads by reference.
pub struct Store {
    db: Database,
    waiters: Mutex<HashMap<Key, Arc<Waiter>>>,
}

impl Store {
    /// Open or create a store backed by a database file. The file may be
    /// shared with other processes.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: Database::open(path)?,
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// A store backed by an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            db: Database::in_memory()?,
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// Compute-or-load the result for a ref.
    pub fn get(&self, r: &Ref) -> Result<serde_json::Value> {
        Ok(self.get_entry(r)?.result)
    }

    /// The announce/compute/wait protocol.
    ///
    /// The waiter is registered *before* the backend announce, so a racing
    /// same-process caller always finds it and joins instead of announcing
    /// a second time. Whatever the announce reports — a finished entry, a
    /// foreign owner, or compute-here — the registering thread publishes
    /// that terminal outcome to any joiners that arrived meanwhile.
    pub fn get_entry(&self, r: &Ref) -> Result<Entry> {
        let key = r.key();

        let waiter = {
            let mut waiters = lock(&self.waiters);
            if let Some(waiter) = waiters.get(key) {
                if waiter.owner == thread::current().id() {
                    // A body re-entering its own key would wait on itself
                    return Err(Error::ComputedElsewhere(key.to_string()));
                }
                let waiter = Arc::clone(waiter);
                drop(waiters);
                debug!(key = %key, "joining in-flight computation");
                return joined_outcome(key, waiter.wait());
            }
            let waiter = Arc::new(Waiter::new());
            waiters.insert(key.clone(), Arc::clone(&waiter));
            waiter
        };

        match self.db.announce_or_retrieve(key) {
            Ok(AnnounceOutcome::Finished(entry)) => {
                debug!(key = %key, entry_id = entry.entry_id, "cached result found");
                self.conclude(key, &waiter, Ok(entry.clone()));
                Ok(entry)
            }
            Ok(AnnounceOutcome::ComputeHere(entry_id)) => self.execute(r, entry_id, &waiter),
            Ok(AnnounceOutcome::RunningElsewhere(entry_id)) => {
                debug!(key = %key, entry_id, "owned by another process");
                self.conclude(key, &waiter, Err(FailureKind::Elsewhere));
                Err(Error::ComputedElsewhere(key.to_string()))
            }
            Err(e) => {
                self.conclude(key, &waiter, Err(FailureKind::Failed(e.to_string())));
                Err(e)
            }
        }
    }

    /// Run the body (outside all locks), persist the outcome, publish.
    fn execute(&self, r: &Ref, entry_id: EntryId, waiter: &Arc<Waiter>) -> Result<Entry> {
        let key = r.key();
        let start = Utc::now();
        debug!(key = %key, entry_id, "computing");

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| r.execute(self))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                // A panicking body must not leave the running row or a
                // stale waiter behind; the key stays retryable.
                if let Err(cancel_err) = self.db.cancel_entry(entry_id) {
                    debug!(key = %key, entry_id, error = %cancel_err, "failed to drop running row");
                }
                self.conclude(key, waiter, Err(FailureKind::Failed(panic_message(&payload))));
                panic::resume_unwind(payload);
            }
        };

        match outcome {
            Ok(result) => {
                let finish = Utc::now();
                let duration_ms = (finish - start).num_milliseconds().max(0) as u64;
                let run_info = RunInfo { duration_ms };
                if let Err(e) = self.db.finish_entry(entry_id, &result, &run_info) {
                    // Result could not be persisted; drop the running row
                    // so the key stays retryable.
                    let _ = self.db.cancel_entry(entry_id);
                    self.conclude(key, waiter, Err(FailureKind::Failed(e.to_string())));
                    return Err(e);
                }
                let entry = Entry {
                    entry_id,
                    key: key.clone(),
                    result,
                    start_time: Some(start),
                    finish_time: Some(finish),
                    run_info: Some(run_info),
                };
                debug!(key = %key, entry_id, duration_ms, "finished");
                self.conclude(key, waiter, Ok(entry.clone()));
                Ok(entry)
            }
            Err(e) => {
                // No partially-finished state survives a failure.
                if let Err(cancel_err) = self.db.cancel_entry(entry_id) {
                    debug!(key = %key, entry_id, error = %cancel_err, "failed to drop running row");
                }
                self.conclude(key, waiter, Err(FailureKind::Failed(e.to_string())));
                Err(e)
            }
        }
    }

    /// Remove the waiter and publish the outcome in one critical section,
    /// so no caller can both miss the waiter and miss the persisted row.
    fn conclude(&self, key: &Key, waiter: &Arc<Waiter>, outcome: WaitOutcome) {
        let mut waiters = lock(&self.waiters);
        waiters.remove(key);
        waiter.publish(outcome);
    }

    // -----------------------------------------------------------------------
    // Queries and management
    // -----------------------------------------------------------------------

    /// Delete the cached row for a key. Safe on an absent key; other keys
    /// are unaffected.
    pub fn remove<K: ToKey>(&self, key: &K) -> Result<()> {
        self.db.remove(key.to_key())
    }

    /// Result of a finished entry, or `NotFound`.
    pub fn load<K: ToKey>(&self, key: &K) -> Result<serde_json::Value> {
        Ok(self.load_entry(key)?.result)
    }

    pub fn load_or_none<K: ToKey>(&self, key: &K) -> Result<Option<serde_json::Value>> {
        Ok(self.load_entry_or_none(key)?.map(|entry| entry.result))
    }

    pub fn load_entry<K: ToKey>(&self, key: &K) -> Result<Entry> {
        self.load_entry_or_none(key)?
            .ok_or_else(|| Error::NotFound(key.to_key().to_string()))
    }

    pub fn load_entry_or_none<K: ToKey>(&self, key: &K) -> Result<Option<Entry>> {
        self.db.load_finished(key.to_key())
    }

    /// Seed a precomputed result at the next unused replica index for the
    /// key's (name, version, fingerprint). Returns the key with its
    /// assigned replica.
    pub fn insert_new_replica<K: ToKey>(&self, key: &K, result: serde_json::Value) -> Result<Key> {
        let key = key.to_key();
        let replica = self.db.insert_new_replica(key, &result)?;
        debug!(key = %key, replica, "inserted new replica");
        Ok(key.with_replica(replica))
    }

    /// Results of every finished replica sharing the key's
    /// (name, version, fingerprint). Order is not guaranteed.
    pub fn load_replicas<K: ToKey>(&self, key: &K) -> Result<Vec<serde_json::Value>> {
        Ok(self
            .load_replica_entries(key)?
            .into_iter()
            .map(|entry| entry.result)
            .collect())
    }

    pub fn load_replica_entries<K: ToKey>(&self, key: &K) -> Result<Vec<Entry>> {
        self.db.load_finished_replicas(key.to_key())
    }

    /// All persisted keys for a computation's name and version.
    pub fn query_keys(&self, computation: &Computation) -> Result<Vec<Key>> {
        self.db
            .list_keys(Some(computation.name()), Some(computation.version()))
    }

    /// Every persisted key.
    pub fn all_keys(&self) -> Result<Vec<Key>> {
        self.db.list_keys(None, None)
    }

    /// Delete every row with no finish time — a startup recovery sweep for
    /// rows orphaned by a crashed process. Returns how many were deleted.
    pub fn cancel_running(&self) -> Result<usize> {
        let deleted = self.db.cancel_all_running()?;
        if deleted > 0 {
            info!(deleted, "cancelled orphaned running entries");
        }
        Ok(deleted)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "computation body panicked".to_string()
    }
}

fn joined_outcome(key: &Key, outcome: WaitOutcome) -> Result<Entry> {
    match outcome {
        Ok(entry) => Ok(entry),
        Err(FailureKind::Failed(message)) => Err(Error::ComputationFailed {
            name: key.name().to_string(),
            message,
        }),
        Err(FailureKind::Elsewhere) => Err(Error::ComputedElsewhere(key.to_string())),
    }
}
