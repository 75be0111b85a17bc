//! # memovault
//!
//! Memoizing execution engine: named, versioned, parameterized computations
//! run at most once per distinct argument set and replica index, with
//! results durably cached in SQLite and transparently reused by later
//! callers — including callers in other processes sharing the same file.
//!
//! Configs are content-addressed (canonical encoding + SHA-224), and an
//! announce/compute/wait protocol guarantees at-most-one execution per key:
//! concurrent same-process callers join a single flight, while a key owned
//! by another process is reported as an error rather than awaited.

pub mod computation;
pub mod database;
pub mod entry;
pub mod error;
pub mod key;
pub mod store;

pub use computation::{Args, CallContext, Computation, ComputationBuilder, Param, Ref, ToKey};
pub use database::Database;
pub use entry::{AnnounceOutcome, Entry, EntryId, RunInfo};
pub use error::{Error, Result};
pub use key::{Config, ConfigValue, EPHEMERAL_PREFIX, Key, fingerprint};
pub use store::Store;
