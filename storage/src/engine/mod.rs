//! A transactional, ordered key-value store backed by SQLite.
//!
//! [Engine] organizes data into named [Bucket]s. Each bucket holds entries in key
//! order (keys compare bytewise) and maintains its own monotonically increasing
//! sequence (useful for generating keys). Buckets are created, read and modified
//! exclusively through transactions:
//!
//! - [Engine::with_read] runs a closure against a consistent snapshot. Any number
//!   of readers may run concurrently, and they never wait on a writer.
//! - [Engine::with_write] runs a closure in a write transaction. At most one
//!   write transaction runs at a time (across all buckets). If the closure returns
//!   an error, the transaction is rolled back. Otherwise, it is committed (and
//!   synced) before `with_write` returns.
//!
//! # Format
//!
//! The database holds two tables: `buckets` (name and sequence) and `entries`
//! (bucket, key and value). The schema is versioned with the database's
//! `user_version` and migrated on [Engine::open]. The database runs in WAL mode
//! with `synchronous = FULL`, so a commit survives power loss once acknowledged
//! and an interrupted commit is rolled back on the next open.
//!
//! # Compaction
//!
//! Deleted entries leave free pages behind. [Engine::compact] rebuilds the
//! database. If [Config::compact_after] is set, free pages are also returned to
//! the filesystem after any commit that leaves more than that many bytes free.
//! Live data never triggers compaction.
//!
//! # Locking
//!
//! An advisory lock on `<path>.lock` prevents two processes from opening the same
//! database. [Engine::open] polls for the lock until [Config::connect_timeout]
//! elapses.
//!
//! # Example
//!
//! ```rust
//! use mixclient_storage::engine::{Config, Engine, Error};
//! use std::time::Duration;
//! use tracing::Span;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let engine = Engine::open(Span::current(), Config {
//!     path: dir.path().join("store.db"),
//!     connect_timeout: Duration::from_secs(1),
//!     compact_after: None,
//! }).unwrap();
//!
//! // Store a value
//! engine.with_write(|tx| {
//!     let mut bucket = tx.create_bucket_if_not_exists("greetings")?;
//!     let seq = bucket.next_sequence()?;
//!     bucket.put(&seq.to_be_bytes(), b"hello")?;
//!     Ok::<_, Error>(())
//! }).unwrap();
//!
//! // Read it back
//! let count = engine.with_read(|tx| match tx.bucket("greetings")? {
//!     Some(bucket) => bucket.len(),
//!     None => Ok(0),
//! }).unwrap();
//! assert_eq!(count, 1);
//!
//! engine.close().unwrap();
//! ```

mod metrics;
mod migrations;
mod storage;

pub use storage::{Bucket, BucketMut, Engine, ReadTx, WriteTx};

use std::{num::NonZeroU64, path::PathBuf, time::Duration};
use thiserror::Error;

/// Errors that can occur when interacting with an [Engine].
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    #[error("locked by another process: {0}")]
    Locked(PathBuf),
    #[error("engine closed")]
    Closed,
    #[error("bucket exists: {0}")]
    BucketExists(String),
}

/// Configuration for an [Engine].
#[derive(Clone, Debug)]
pub struct Config {
    /// Path of the database. The lock (and SQLite's write-ahead log) are stored
    /// beside it.
    pub path: PathBuf,

    /// How long to wait for another process to release the lock.
    pub connect_timeout: Duration,

    /// Return free pages to the filesystem once more than this many bytes are
    /// free.
    pub compact_after: Option<NonZeroU64>,
}
