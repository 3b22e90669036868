use super::{metrics::Metrics, migrations::migrations, Config, Error};
use bytes::Bytes;
use fs2::FileExt;
use prometheus_client::registry::Registry;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::{
    fs::{File, OpenOptions},
    ops::Deref,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn, Span};

/// How long to wait between attempts to acquire the lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Suffix of the advisory lock file.
const LOCK_SUFFIX: &str = "lock";

/// Get a bucket by name from whatever transaction `conn` is in.
fn lookup<'a>(conn: &'a Connection, name: &str) -> Result<Option<Bucket<'a>>, Error> {
    let found = conn
        .prepare_cached("SELECT 1 FROM buckets WHERE name = ?1")?
        .query_row([name], |_| Ok(()))
        .optional()?;
    Ok(found.map(|_| Bucket {
        conn,
        name: name.to_string(),
    }))
}

/// An ordered collection of key-value pairs with its own sequence.
///
/// Keys compare bytewise.
pub struct Bucket<'a> {
    conn: &'a Connection,
    name: String,
}

impl Bucket<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the value stored at `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        let value = self
            .conn
            .prepare_cached("SELECT value FROM entries WHERE bucket = ?1 AND key = ?2")?
            .query_row(params![self.name, key], |row| row.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(value.map(Bytes::from))
    }

    /// All entries in key order.
    pub fn entries(&self) -> Result<Vec<(Bytes, Bytes)>, Error> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT key, value FROM entries WHERE bucket = ?1 ORDER BY key")?;
        let rows = stmt.query_map([&self.name], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        rows.map(|row| {
            row.map(|(key, value)| (Bytes::from(key), Bytes::from(value)))
                .map_err(Error::from)
        })
        .collect()
    }

    /// Number of stored entries.
    pub fn len(&self) -> Result<usize, Error> {
        let len = self
            .conn
            .prepare_cached("SELECT COUNT(*) FROM entries WHERE bucket = ?1")?
            .query_row([&self.name], |row| row.get::<_, i64>(0))?;
        Ok(len as usize)
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// The last value returned by [BucketMut::next_sequence] (0 if never called).
    pub fn sequence(&self) -> Result<u64, Error> {
        let sequence = self
            .conn
            .prepare_cached("SELECT sequence FROM buckets WHERE name = ?1")?
            .query_row([&self.name], |row| row.get::<_, i64>(0))?;
        Ok(sequence as u64)
    }
}

/// A consistent, read-only view of the engine.
pub struct ReadTx<'a> {
    conn: &'a Connection,
}

impl ReadTx<'_> {
    /// Get a bucket by name.
    pub fn bucket(&self, name: &str) -> Result<Option<Bucket<'_>>, Error> {
        lookup(self.conn, name)
    }

    /// Names of all buckets in order.
    pub fn buckets(&self) -> Result<Vec<String>, Error> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT name FROM buckets ORDER BY name")?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        names.map(|name| name.map_err(Error::from)).collect()
    }
}

/// A pending set of mutations.
///
/// Changes are only visible to readers (and only persisted) once the closure
/// passed to [Engine::with_write] returns successfully.
pub struct WriteTx<'a> {
    conn: &'a Connection,
}

impl WriteTx<'_> {
    /// Get a bucket by name.
    pub fn bucket(&self, name: &str) -> Result<Option<Bucket<'_>>, Error> {
        lookup(self.conn, name)
    }

    /// Get a mutable handle to an existing bucket.
    pub fn bucket_mut(&mut self, name: &str) -> Result<Option<BucketMut<'_>>, Error> {
        Ok(lookup(self.conn, name)?.map(|bucket| BucketMut { bucket }))
    }

    /// Create a new bucket, failing if it already exists.
    pub fn create_bucket(&mut self, name: &str) -> Result<BucketMut<'_>, Error> {
        if !self.insert(name)? {
            return Err(Error::BucketExists(name.to_string()));
        }
        Ok(self.handle(name))
    }

    /// Create a bucket unless it already exists.
    pub fn create_bucket_if_not_exists(&mut self, name: &str) -> Result<BucketMut<'_>, Error> {
        self.insert(name)?;
        Ok(self.handle(name))
    }

    /// Returns whether the bucket was created.
    fn insert(&self, name: &str) -> Result<bool, Error> {
        let inserted = self
            .conn
            .prepare_cached("INSERT OR IGNORE INTO buckets (name) VALUES (?1)")?
            .execute([name])?;
        Ok(inserted > 0)
    }

    fn handle(&mut self, name: &str) -> BucketMut<'_> {
        BucketMut {
            bucket: Bucket {
                conn: self.conn,
                name: name.to_string(),
            },
        }
    }
}

/// A bucket being modified within a [WriteTx].
pub struct BucketMut<'a> {
    bucket: Bucket<'a>,
}

impl BucketMut<'_> {
    /// Advance and return the bucket's sequence.
    ///
    /// The first call on a new bucket returns 1. Values are never reused, even if
    /// the keys they were used for are deleted.
    pub fn next_sequence(&mut self) -> Result<u64, Error> {
        let sequence = self
            .bucket
            .conn
            .prepare_cached(
                "UPDATE buckets SET sequence = sequence + 1 WHERE name = ?1 RETURNING sequence",
            )?
            .query_row([&self.bucket.name], |row| row.get::<_, i64>(0))?;
        Ok(sequence as u64)
    }

    /// Store `value` at `key`, replacing any existing value.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.bucket
            .conn
            .prepare_cached(
                "INSERT OR REPLACE INTO entries (bucket, key, value) VALUES (?1, ?2, ?3)",
            )?
            .execute(params![self.bucket.name, key, value])?;
        Ok(())
    }

    /// Delete `key`. Deleting a key that does not exist is a no-op.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.bucket
            .conn
            .prepare_cached("DELETE FROM entries WHERE bucket = ?1 AND key = ?2")?
            .execute(params![self.bucket.name, key])?;
        Ok(())
    }
}

impl<'a> Deref for BucketMut<'a> {
    type Target = Bucket<'a>;

    fn deref(&self) -> &Bucket<'a> {
        &self.bucket
    }
}

/// The connection and lock held by the (single) writer.
struct Writer {
    conn: Connection,
    lock: File,
}

/// A transactional key-value store persisted to a single SQLite database.
pub struct Engine {
    span: Span,
    cfg: Config,

    writer: Mutex<Option<Writer>>,
    readers: Mutex<Vec<Connection>>,
    closed: AtomicBool,

    metrics: Metrics,
}

impl Engine {
    /// Open (or create) the engine at `cfg.path`.
    ///
    /// Fails with [Error::Locked] if another handle holds the lock for longer
    /// than `cfg.connect_timeout`. A database that cannot be read is reported,
    /// never repaired.
    pub fn open(span: Span, cfg: Config) -> Result<Self, Error> {
        let lock = acquire(&sibling(&cfg.path, LOCK_SUFFIX), cfg.connect_timeout)?;
        let mut conn = Connection::open(&cfg.path)?;
        conn.busy_timeout(cfg.connect_timeout)?;

        // Only takes effect before the first table is created
        conn.pragma_update(None, "auto_vacuum", "INCREMENTAL")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations().to_latest(&mut conn)?;

        let engine = Self {
            span,
            cfg,
            writer: Mutex::new(None),
            readers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            metrics: Metrics::default(),
        };
        let (buckets, size, free) = engine.observe(&conn)?;
        debug!(
            parent: &engine.span,
            path = %engine.cfg.path.display(),
            buckets,
            size,
            free,
            "opened engine"
        );
        *engine.writer.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Writer { conn, lock });
        Ok(engine)
    }

    /// Register the engine's metrics.
    pub fn register(&self, registry: &mut Registry) {
        self.metrics.register(registry);
    }

    /// Open an additional connection that only reads.
    fn connect_reader(&self) -> Result<Connection, Error> {
        let conn = Connection::open(&self.cfg.path)?;
        conn.busy_timeout(self.cfg.connect_timeout)?;
        conn.pragma_update(None, "query_only", "ON")?;
        Ok(conn)
    }

    /// Run `f` against a consistent snapshot.
    ///
    /// Readers never wait on a writer and never observe a commit that completes
    /// after they start.
    pub fn with_read<R, E: From<Error>>(
        &self,
        f: impl FnOnce(&ReadTx<'_>) -> Result<R, E>,
    ) -> Result<R, E> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed.into());
        }
        let pooled = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => self.connect_reader()?,
        };
        let result = read(&mut conn, f);

        let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.closed.load(Ordering::Acquire) {
            readers.push(conn);
        }
        result
    }

    /// Run `f` in a write transaction.
    ///
    /// Only one write transaction runs at a time. If `f` returns an error, none of
    /// its changes are kept. Otherwise, its changes are durable before they are
    /// made visible to readers.
    pub fn with_write<R, E: From<Error>>(
        &self,
        f: impl FnOnce(&mut WriteTx<'_>) -> Result<R, E>,
    ) -> Result<R, E> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = guard.as_mut().ok_or(Error::Closed)?;

        let tx = writer
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(Error::from)?;
        let result = f(&mut WriteTx { conn: &tx });
        let result = match result {
            Ok(result) => result,
            Err(err) => {
                if let Err(err) = tx.rollback() {
                    warn!(parent: &self.span, ?err, "failed to roll back transaction");
                }
                self.metrics.rollbacks.inc();
                debug!(parent: &self.span, "rolled back transaction");
                return Err(err);
            }
        };
        if let Err(err) = tx.commit() {
            self.metrics.rollbacks.inc();
            warn!(parent: &self.span, ?err, "failed to commit transaction");
            return Err(Error::from(err).into());
        }
        self.metrics.commits.inc();

        // The commit is durable regardless of whether maintenance succeeds
        if let Err(err) = self.maintain(&writer.conn) {
            warn!(parent: &self.span, ?err, "failed to reclaim free pages");
        }
        Ok(result)
    }

    /// Refresh the gauges and, once more than [Config::compact_after] bytes are
    /// free, return free pages to the filesystem.
    fn maintain(&self, conn: &Connection) -> Result<(), Error> {
        let (_, _, free) = self.observe(conn)?;
        let Some(limit) = self.cfg.compact_after else {
            return Ok(());
        };
        if free <= limit.get() {
            return Ok(());
        }

        // Each row returned frees one page
        let mut stmt = conn.prepare("PRAGMA incremental_vacuum")?;
        let mut rows = stmt.query([])?;
        while rows.next()?.is_some() {}
        drop(rows);
        drop(stmt);

        self.metrics.compactions.inc();
        let (_, size, remaining) = self.observe(conn)?;
        debug!(parent: &self.span, freed = free.saturating_sub(remaining), size, "reclaimed free pages");
        Ok(())
    }

    /// Update the gauges, returning the number of buckets, the size of the
    /// database and the bytes held by free pages.
    fn observe(&self, conn: &Connection) -> Result<(u64, u64, u64), Error> {
        let buckets = conn.query_row("SELECT COUNT(*) FROM buckets", [], |row| {
            row.get::<_, i64>(0)
        })?;
        let page_size = pragma(conn, "page_size")?;
        let size = pragma(conn, "page_count")? * page_size;
        let free = pragma(conn, "freelist_count")? * page_size;
        self.metrics.buckets.set(buckets);
        self.metrics.size.set(size as i64);
        self.metrics.free.set(free as i64);
        Ok((buckets as u64, size, free))
    }

    /// Rebuild the database, dropping all free pages.
    pub fn compact(&self) -> Result<(), Error> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = guard.as_mut().ok_or(Error::Closed)?;
        let (_, old_size, _) = self.observe(&writer.conn)?;
        writer.conn.execute_batch("VACUUM")?;
        self.metrics.compactions.inc();
        let (_, new_size, _) = self.observe(&writer.conn)?;
        debug!(parent: &self.span, old_size, new_size, "compacted database");
        Ok(())
    }

    /// Names of all buckets in order.
    pub fn buckets(&self) -> Result<Vec<String>, Error> {
        self.with_read(|tx| tx.buckets())
    }

    /// Close all connections and release the lock.
    ///
    /// Calling `close` more than once is a no-op. All transactions started after
    /// `close` fail with [Error::Closed].
    pub fn close(&self) -> Result<(), Error> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(writer) = guard.take() else {
            return Ok(());
        };
        self.closed.store(true, Ordering::Release);
        let readers = std::mem::take(
            &mut *self.readers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for reader in readers {
            reader.close().map_err(|(_, err)| err)?;
        }

        // The last connection to close checkpoints the write-ahead log
        writer.conn.close().map_err(|(_, err)| err)?;
        FileExt::unlock(&writer.lock)?;
        debug!(parent: &self.span, path = %self.cfg.path.display(), "closed engine");
        Ok(())
    }
}

/// Run `f` in a read transaction on `conn`.
fn read<R, E: From<Error>>(
    conn: &mut Connection,
    f: impl FnOnce(&ReadTx<'_>) -> Result<R, E>,
) -> Result<R, E> {
    let tx = conn.transaction().map_err(Error::from)?;

    // The snapshot is taken by the first read, not by BEGIN
    tx.query_row("SELECT COUNT(*) FROM buckets", [], |row| row.get::<_, i64>(0))
        .map_err(Error::from)?;
    let result = f(&ReadTx { conn: &tx });
    if let Err(err) = tx.finish() {
        return Err(Error::from(err).into());
    }
    result
}

/// Read an integer pragma.
fn pragma(conn: &Connection, name: &str) -> Result<u64, Error> {
    let value = conn.pragma_query_value(None, name, |row| row.get::<_, i64>(0))?;
    Ok(value as u64)
}

/// Path of a file stored beside `path` (`<path>.<suffix>`).
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Poll for an exclusive lock on `path` until `timeout` elapses.
fn acquire(path: &Path, timeout: Duration) -> Result<File, Error> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let contended = fs2::lock_contended_error().raw_os_error();
    let deadline = Instant::now() + timeout;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(err) if err.raw_os_error() == contended => {}
            Err(err) => return Err(Error::Io(err)),
        }
        if Instant::now() >= deadline {
            return Err(Error::Locked(path.to_path_buf()));
        }
        thread::sleep(LOCK_RETRY_INTERVAL);
    }
}
