//!
//! permsql catalog
//! ---------------
//! SQLite-backed catalog of existing resources and executor for composed permission
//! queries. The engine only reads from it; populating the catalog tables belongs to
//! whoever owns the underlying databases (the helpers here exist for that owner and
//! for tests).
//!
//! Every resolution call runs inside one deferred read transaction, so the resource
//! enumeration and the rule fragments see the same catalog state. Queries run on the
//! blocking pool; a timed-out call cancels its job and interrupts SQLite if the job is
//! the one currently executing.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, InterruptHandle, TransactionBehavior};
use tracing::debug;

use crate::error::{PermError, PermResult};
use crate::query::{bind_named, Params};

const CATALOG_DDL: &str = "
CREATE TABLE IF NOT EXISTS catalog_databases (
    database_name TEXT PRIMARY KEY NOT NULL
);
CREATE TABLE IF NOT EXISTS catalog_tables (
    database_name TEXT NOT NULL REFERENCES catalog_databases(database_name) ON DELETE CASCADE,
    table_name TEXT NOT NULL,
    PRIMARY KEY (database_name, table_name)
);
CREATE TABLE IF NOT EXISTS catalog_views (
    database_name TEXT NOT NULL REFERENCES catalog_databases(database_name) ON DELETE CASCADE,
    view_name TEXT NOT NULL,
    PRIMARY KEY (database_name, view_name)
);
CREATE TABLE IF NOT EXISTS catalog_queries (
    database_name TEXT NOT NULL REFERENCES catalog_databases(database_name) ON DELETE CASCADE,
    query_name TEXT NOT NULL,
    sql TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (database_name, query_name)
);
";

/// Identifies one read job so a timed-out caller can cancel it.
#[derive(Debug, Clone)]
pub struct ReadGuard {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl ReadGuard {
    pub fn is_cancelled(&self) -> bool { self.cancelled.load(Ordering::Relaxed) }
}

pub struct Catalog {
    conn: Mutex<Connection>,
    interrupt: InterruptHandle,
    next_job: AtomicU64,
    /// Job holding the connection, 0 when idle. Held across `interrupt()` so a stale
    /// cancel cannot land on the next job.
    running_job: Mutex<u64>,
}

impl Catalog {
    /// Open or create a catalog database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> PermResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> PermResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> PermResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(CATALOG_DDL)?;
        let interrupt = conn.get_interrupt_handle();
        Ok(Self { conn: Mutex::new(conn), interrupt, next_job: AtomicU64::new(1), running_job: Mutex::new(0) })
    }

    pub fn add_database(&self, name: &str) -> PermResult<()> {
        self.conn.lock().execute("INSERT OR IGNORE INTO catalog_databases (database_name) VALUES (?1)", params![name])?;
        Ok(())
    }

    pub fn add_table(&self, database: &str, table: &str) -> PermResult<()> {
        let conn = self.conn.lock();
        conn.execute("INSERT OR IGNORE INTO catalog_databases (database_name) VALUES (?1)", params![database])?;
        conn.execute("INSERT OR IGNORE INTO catalog_tables (database_name, table_name) VALUES (?1, ?2)", params![database, table])?;
        Ok(())
    }

    pub fn add_view(&self, database: &str, view: &str) -> PermResult<()> {
        let conn = self.conn.lock();
        conn.execute("INSERT OR IGNORE INTO catalog_databases (database_name) VALUES (?1)", params![database])?;
        conn.execute("INSERT OR IGNORE INTO catalog_views (database_name, view_name) VALUES (?1, ?2)", params![database, view])?;
        Ok(())
    }

    pub fn add_query(&self, database: &str, query: &str, sql: &str) -> PermResult<()> {
        let conn = self.conn.lock();
        conn.execute("INSERT OR IGNORE INTO catalog_databases (database_name) VALUES (?1)", params![database])?;
        conn.execute(
            "INSERT OR REPLACE INTO catalog_queries (database_name, query_name, sql) VALUES (?1, ?2, ?3)",
            params![database, query, sql],
        )?;
        Ok(())
    }

    /// Drops the database and, through the foreign keys, everything under it.
    pub fn remove_database(&self, name: &str) -> PermResult<bool> {
        let n = self.conn.lock().execute("DELETE FROM catalog_databases WHERE database_name = ?1", params![name])?;
        Ok(n > 0)
    }

    pub fn remove_table(&self, database: &str, table: &str) -> PermResult<bool> {
        let n = self.conn.lock().execute(
            "DELETE FROM catalog_tables WHERE database_name = ?1 AND table_name = ?2",
            params![database, table],
        )?;
        Ok(n > 0)
    }

    /// Run arbitrary setup SQL (extra catalog tables for custom resource models).
    pub fn execute_batch(&self, sql: &str) -> PermResult<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    pub fn read_guard(&self) -> ReadGuard {
        ReadGuard { id: self.next_job.fetch_add(1, Ordering::Relaxed), cancelled: Arc::new(AtomicBool::new(false)) }
    }

    /// Cancel a read job; interrupts SQLite only when that job holds the connection.
    pub fn cancel(&self, guard: &ReadGuard) {
        guard.cancelled.store(true, Ordering::SeqCst);
        let running = self.running_job.lock();
        if *running == guard.id {
            debug!(target: "permsql::catalog", "interrupting read job {}", guard.id);
            self.interrupt.interrupt();
        }
    }

    /// Run `f` against one consistent snapshot on the blocking pool.
    pub async fn snapshot<T, F>(self: &Arc<Self>, guard: &ReadGuard, f: F) -> PermResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Snapshot<'_>) -> PermResult<T> + Send + 'static,
    {
        let this = Arc::clone(self);
        let guard = guard.clone();
        tokio::task::spawn_blocking(move || this.run_snapshot(&guard, f))
            .await
            .map_err(|e| PermError::Internal(format!("snapshot task failed: {}", e)))?
    }

    fn run_snapshot<T, F>(&self, guard: &ReadGuard, f: F) -> PermResult<T>
    where
        F: FnOnce(&Snapshot<'_>) -> PermResult<T>,
    {
        let mut conn = self.conn.lock();
        *self.running_job.lock() = guard.id;
        if guard.is_cancelled() {
            *self.running_job.lock() = 0;
            return Err(PermError::ResolutionTimeout { timeout_ms: 0 });
        }
        let result = (|| -> PermResult<T> {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let out = f(&Snapshot { tx: &tx, guard })?;
            tx.finish()?;
            Ok(out)
        })();
        *self.running_job.lock() = 0;
        result
    }
}

/// Read access inside one transaction.
pub struct Snapshot<'a> {
    tx: &'a rusqlite::Transaction<'a>,
    guard: &'a ReadGuard,
}

impl<'a> Snapshot<'a> {
    /// Stream rows to `visit` until it returns `Ok(false)` or rows run out.
    pub fn query_each<F>(&self, sql: &str, params: &Params, mut visit: F) -> PermResult<()>
    where
        F: FnMut(&rusqlite::Row<'_>) -> PermResult<bool>,
    {
        let mut stmt = self.tx.prepare(sql)?;
        bind_named(&mut stmt, params)?;
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next()? {
            if self.guard.is_cancelled() {
                return Err(PermError::ResolutionTimeout { timeout_ms: 0 });
            }
            if !visit(row)? { break; }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_reads_catalog_rows() {
        let cat = Arc::new(Catalog::in_memory().unwrap());
        cat.add_table("sales", "orders").unwrap();
        cat.add_view("sales", "summary").unwrap();
        cat.add_database("hr").unwrap();
        let guard = cat.read_guard();
        let names = cat
            .snapshot(&guard, |snap| {
                let mut out = Vec::new();
                snap.query_each("SELECT database_name FROM catalog_databases ORDER BY 1", &Params::new(), |row| {
                    out.push(row.get::<_, String>(0)?);
                    Ok(true)
                })?;
                Ok(out)
            })
            .await
            .unwrap();
        assert_eq!(names, vec!["hr".to_string(), "sales".to_string()]);
    }

    #[tokio::test]
    async fn visitor_can_stop_early() {
        let cat = Arc::new(Catalog::in_memory().unwrap());
        for t in ["a", "b", "c"] { cat.add_table("db", t).unwrap(); }
        let guard = cat.read_guard();
        let seen = cat
            .snapshot(&guard, |snap| {
                let mut n = 0;
                snap.query_each("SELECT table_name FROM catalog_tables", &Params::new(), |_| {
                    n += 1;
                    Ok(n < 2)
                })?;
                Ok(n)
            })
            .await
            .unwrap();
        assert_eq!(seen, 2);
    }

    #[tokio::test]
    async fn cancelled_guard_fails_closed() {
        let cat = Arc::new(Catalog::in_memory().unwrap());
        let guard = cat.read_guard();
        cat.cancel(&guard);
        let r = cat.snapshot(&guard, |_| Ok(())).await;
        assert!(matches!(r, Err(PermError::ResolutionTimeout { .. })));
    }

    #[tokio::test]
    async fn stale_cancel_leaves_the_running_job_alone() {
        let cat = Arc::new(Catalog::in_memory().unwrap());
        cat.add_table("db", "t").unwrap();
        let first = cat.read_guard();
        cat.snapshot(&first, |_| Ok(())).await.unwrap();

        let second = cat.read_guard();
        let inner = Arc::clone(&cat);
        let n = cat
            .snapshot(&second, move |snap| {
                assert_eq!(*inner.running_job.lock(), snap.guard.id);
                inner.cancel(&first);
                let mut n = 0;
                snap.query_each("SELECT table_name FROM catalog_tables", &Params::new(), |_| {
                    n += 1;
                    Ok(true)
                })?;
                Ok(n)
            })
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(*cat.running_job.lock(), 0);
    }

    #[test]
    fn removing_database_cascades() {
        let cat = Catalog::in_memory().unwrap();
        cat.add_table("db", "t").unwrap();
        cat.add_query("db", "q", "select 1").unwrap();
        assert!(cat.remove_database("db").unwrap());
        let n: i64 = cat.conn.lock().query_row("SELECT COUNT(*) FROM catalog_tables", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 0);
        assert!(!cat.remove_table("db", "t").unwrap());
    }
}
