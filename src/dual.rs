//! The dual-engine driver: a synchronous in-memory mirror backed by an
//! asynchronous write-through queue to the worker, with retry and recovery.
//!
//! Grounded on the teacher's retry/backoff math in `pool.rs`
//! (`retry_on_busy`, `is_busy_error`, the `min(base*2^n, max)` formula) and
//! its busy-error detection, generalized from "retry a SQLite call" to
//! "retry flushing a batch to the worker".

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use rusqlite::Connection;

use crate::config::{DriverConfig, RetryConfig};
use crate::driver::Driver;
use crate::error::DriverError;
use crate::wire::{RawResult, SqlScalar, Statement};
use crate::worker::engine as worker_engine;

/// Why the dual-engine driver considers itself usable-but-incomplete,
/// surfaced via [`DualDriver::status`] rather than silently swallowed (see
/// the design decision on `bootSync` error handling).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedReason {
    BootSyncIncomplete,
    WorkerRecoveryFailed,
}

/// `status()`'s return shape: `{ready, persistent, pendingSync}` plus the
/// degraded flag this crate adds.
#[derive(Debug, Clone)]
pub struct Status {
    pub ready: bool,
    pub persistent: bool,
    pub pending_sync: usize,
    pub degraded: Option<DegradedReason>,
}

pub struct DualDriver {
    driver: Arc<Driver>,
    memory: Arc<StdMutex<Connection>>,
    queue: Arc<StdMutex<Vec<Statement>>>,
    retry_count: Arc<AtomicU32>,
    is_importing: Arc<AtomicBool>,
    flush_in_flight: Arc<AtomicBool>,
    degraded: Arc<StdMutex<Option<DegradedReason>>>,
    retry: RetryConfig,
}

impl DualDriver {
    /// Configure the underlying driver, open the in-memory mirror, wait for
    /// the worker to become ready, and run boot sync.
    pub async fn open(config: DriverConfig) -> Result<Self, DriverError> {
        let retry = config.retry;
        let driver = Arc::new(Driver::new());
        driver.set_config(config).await;

        let memory = Connection::open_in_memory()?;
        apply_memory_pragmas(&memory)?;

        let dual = Self {
            driver,
            memory: Arc::new(StdMutex::new(memory)),
            queue: Arc::new(StdMutex::new(Vec::new())),
            retry_count: Arc::new(AtomicU32::new(0)),
            is_importing: Arc::new(AtomicBool::new(false)),
            flush_in_flight: Arc::new(AtomicBool::new(false)),
            degraded: Arc::new(StdMutex::new(None)),
            retry,
        };

        // Triggers worker init (the driver's own lazy-init gate).
        dual.driver.exec(Statement::get("SELECT 1", vec![])).await?;
        dual.boot_sync().await;
        Ok(dual)
    }

    /// Enumerate persistent user tables, replay their schema, then stream
    /// rows into the memory mirror. Failures are logged and leave the
    /// driver usable but flagged via [`DualDriver::status`].
    async fn boot_sync(&self) {
        if let Err(e) = self.try_boot_sync().await {
            tracing::warn!(error = %e, "boot sync incomplete; memory mirror may be missing data");
            *self.degraded.lock().unwrap_or_else(|p| p.into_inner()) =
                Some(DegradedReason::BootSyncIncomplete);
        }
    }

    async fn try_boot_sync(&self) -> Result<(), DriverError> {
        let tables = self
            .driver
            .exec(Statement::all(
                "SELECT name, sql FROM sqlite_master WHERE type='table' AND name != 'sqlite_sequence'",
                vec![],
            ))
            .await?;

        for row in &tables.rows {
            let (name, create_sql) = match (&row[0], &row[1]) {
                (SqlScalar::Text(name), SqlScalar::Text(sql)) => (name.clone(), sql.clone()),
                _ => continue,
            };

            {
                let memory = self.memory.lock().unwrap_or_else(|p| p.into_inner());
                memory.execute(&create_sql, [])?;
            }

            let rows = self
                .driver
                .exec(Statement::all(&format!("SELECT * FROM {name}"), vec![]))
                .await?;

            if rows.rows.is_empty() {
                continue;
            }
            let placeholders = vec!["?"; rows.columns.len()].join(", ");
            let insert_sql = format!("INSERT INTO {name} VALUES ({placeholders})");

            let mut memory = self.memory.lock().unwrap_or_else(|p| p.into_inner());
            let tx = memory.transaction()?;
            for row_values in &rows.rows {
                tx.execute(
                    &insert_sql,
                    rusqlite::params_from_iter(row_values.iter().cloned()),
                )?;
            }
            tx.commit()?;
        }
        Ok(())
    }

    /// Synchronous read/write against the memory mirror; writes additionally
    /// enqueue for async replication.
    pub fn exec(&self, stmt: Statement) -> Result<RawResult, DriverError> {
        let is_write = stmt.is_write();
        let result = {
            let memory = self.memory.lock().unwrap_or_else(|p| p.into_inner());
            worker_engine::exec(&memory, &stmt)?
        };
        if is_write {
            self.queue.lock().unwrap_or_else(|p| p.into_inner()).push(stmt);
            self.schedule_flush();
        }
        Ok(result)
    }

    pub fn pending_sync_count(&self) -> usize {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub async fn is_ready(&self) -> bool {
        self.driver.is_ready().await
    }

    pub async fn status(&self) -> Status {
        Status {
            ready: self.driver.is_ready().await,
            persistent: self.driver.has_persistent_storage().await,
            pending_sync: self.pending_sync_count(),
            degraded: *self.degraded.lock().unwrap_or_else(|p| p.into_inner()),
        }
    }

    /// Flush pending writes, then export; blocks the flusher from
    /// interleaving a batch with the full-file replace underneath export.
    pub async fn export_database(&self) -> Result<crate::wire::ExportedDatabase, DriverError> {
        self.flush_sync_queue().await;
        self.driver.export_database().await
    }

    /// Flush, replace the file, then rebuild the memory mirror from
    /// scratch via another boot sync.
    pub async fn import_database(&self, data: Vec<u8>) -> Result<(), DriverError> {
        self.flush_sync_queue().await;
        self.is_importing.store(true, Ordering::SeqCst);
        let result = self.driver.import_database(data).await;
        if result.is_ok() {
            let fresh = Connection::open_in_memory()?;
            apply_memory_pragmas(&fresh)?;
            *self.memory.lock().unwrap_or_else(|p| p.into_inner()) = fresh;
            self.boot_sync().await;
        }
        self.is_importing.store(false, Ordering::SeqCst);
        result
    }

    pub async fn destroy(&self) {
        self.driver.destroy().await;
    }

    /// Submitted straight to the worker, bypassing the memory mirror and
    /// sync queue — a caller explicitly asking for `execBatch`/`transaction`
    /// semantics wants the worker's atomicity guarantee, not the mirror's
    /// synchronous-read shortcut.
    pub async fn exec_batch(&self, statements: Vec<Statement>) -> Result<Vec<RawResult>, DriverError> {
        self.driver.exec_batch(statements).await
    }

    pub async fn transaction(&self, statements: Vec<Statement>) -> Result<Vec<RawResult>, DriverError> {
        self.driver.transaction(statements).await
    }

    pub async fn has_persistent_storage(&self) -> bool {
        self.driver.has_persistent_storage().await
    }

    /// Drain the queue synchronously (used before export/import so the
    /// on-disk file reflects the memory state).
    pub async fn flush_sync_queue(&self) {
        while self.pending_sync_count() > 0 {
            if flush_once(
                &self.driver,
                &self.queue,
                &self.retry_count,
                &self.is_importing,
                &self.degraded,
                self.retry,
            )
            .await
                == FlushOutcome::NothingToDo
            {
                break;
            }
        }
    }

    fn schedule_flush(&self) {
        if self.flush_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let driver = self.driver.clone();
        let queue = self.queue.clone();
        let retry_count = self.retry_count.clone();
        let is_importing = self.is_importing.clone();
        let degraded = self.degraded.clone();
        let flush_in_flight = self.flush_in_flight.clone();
        let retry = self.retry;
        tokio::spawn(async move {
            loop {
                match flush_once(&driver, &queue, &retry_count, &is_importing, &degraded, retry).await {
                    FlushOutcome::NothingToDo | FlushOutcome::Blocked => break,
                    FlushOutcome::Flushed { more_pending } => {
                        if !more_pending {
                            break;
                        }
                    }
                    FlushOutcome::Retrying => continue,
                }
            }
            flush_in_flight.store(false, Ordering::SeqCst);
        });
    }
}

#[derive(Debug, PartialEq, Eq)]
enum FlushOutcome {
    NothingToDo,
    Blocked,
    Flushed { more_pending: bool },
    Retrying,
}

/// Single-writer flush step: swap the queue for a fresh empty one, send the
/// captured batch as one `execBatch`, and apply the retry policy on
/// failure. Free function (not a `DualDriver` method) so it can be spawned
/// without requiring an `Arc<Self>` receiver.
async fn flush_once(
    driver: &Arc<Driver>,
    queue: &Arc<StdMutex<Vec<Statement>>>,
    retry_count: &Arc<AtomicU32>,
    is_importing: &Arc<AtomicBool>,
    degraded: &Arc<StdMutex<Option<DegradedReason>>>,
    retry: RetryConfig,
) -> FlushOutcome {
    if is_importing.load(Ordering::SeqCst) {
        return FlushOutcome::Blocked;
    }

    let batch = {
        let mut q = queue.lock().unwrap_or_else(|p| p.into_inner());
        if q.is_empty() {
            return FlushOutcome::NothingToDo;
        }
        std::mem::take(&mut *q)
    };

    match driver.exec_batch(batch.clone()).await {
        Ok(_) => {
            retry_count.store(0, Ordering::SeqCst);
            let more_pending = !queue.lock().unwrap_or_else(|p| p.into_inner()).is_empty();
            FlushOutcome::Flushed { more_pending }
        }
        Err(e) => {
            let attempt = retry_count.fetch_add(1, Ordering::SeqCst) + 1;
            let message = e.to_string();
            let worker_related = message.to_lowercase().contains("timeout")
                || message.to_lowercase().contains("worker");

            if attempt <= retry.max_retries {
                // Re-prepend the failed batch at the queue head, preserving
                // original order ahead of anything accrued during flight.
                let mut q = queue.lock().unwrap_or_else(|p| p.into_inner());
                let mut merged = batch;
                merged.append(&mut q);
                *q = merged;
                drop(q);

                tracing::warn!(attempt, error = %e, "sync queue flush failed, will retry");
                if worker_related {
                    recover_worker(driver, degraded).await;
                }
                tokio::time::sleep(retry.delay_for(attempt)).await;
                FlushOutcome::Retrying
            } else {
                tracing::error!(error = %e, "dropping sync batch after exhausting retries");
                retry_count.store(0, Ordering::SeqCst);
                recover_worker(driver, degraded).await;
                FlushOutcome::NothingToDo
            }
        }
    }
}

async fn recover_worker(driver: &Arc<Driver>, degraded: &Arc<StdMutex<Option<DegradedReason>>>) {
    if let Err(e) = driver.recover().await {
        tracing::error!(error = %e, "worker recovery failed; driver remains degraded");
        *degraded.lock().unwrap_or_else(|p| p.into_inner()) = Some(DegradedReason::WorkerRecoveryFailed);
    }
}

fn apply_memory_pragmas(conn: &Connection) -> Result<(), DriverError> {
    conn.pragma_update(None, "synchronous", "OFF")?;
    conn.pragma_update(None, "journal_mode", "MEMORY")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "locking_mode", "EXCLUSIVE")?;
    conn.pragma_update(None, "cache_size", -64000)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;

    async fn open_dual(path: &std::path::Path) -> DualDriver {
        DualDriver::open(
            DriverConfig::builder()
                .database_path(path.to_string_lossy())
                .backend(Backend::Worker)
                .build(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn writes_are_visible_immediately_and_enqueued() {
        let dir = tempfile::tempdir().unwrap();
        let dual = open_dual(&dir.path().join("t.db")).await;

        dual.exec(Statement::run("CREATE TABLE k(v INT)", vec![])).unwrap();
        dual.exec(Statement::run("INSERT INTO k VALUES(1)", vec![])).unwrap();

        let rows = dual.exec(Statement::all("SELECT v FROM k", vec![])).unwrap();
        assert_eq!(rows.rows, vec![vec![SqlScalar::Int(1)]]);
        assert!(dual.pending_sync_count() > 0);
    }

    #[tokio::test]
    async fn flush_sync_queue_drains_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let dual = open_dual(&dir.path().join("t.db")).await;

        dual.exec(Statement::run("CREATE TABLE k(v INT)", vec![])).unwrap();
        for i in 0..25 {
            dual.exec(Statement::run("INSERT INTO k VALUES(?)", vec![SqlScalar::Int(i)]))
                .unwrap();
        }
        dual.flush_sync_queue().await;
        assert_eq!(dual.pending_sync_count(), 0);

        let persisted = dual
            .driver
            .exec(Statement::get("SELECT count(*) FROM k", vec![]))
            .await
            .unwrap();
        assert_eq!(persisted.rows[0][0], SqlScalar::Int(25));
    }
}
