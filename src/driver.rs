//! The OPFS-variant driver: the main request coordinator.
//!
//! Owns the state machine (`Unconfigured → Configured → Initializing →
//! Ready → Destroyed`), the single-entry init gate, per-operation timeouts,
//! and the broadcast subscription used for cross-instance `reinit`/`close`
//! notifications. Request/response correlation itself lives one layer down
//! in [`crate::worker::WorkerHandle`] — each dispatch owns its `oneshot`
//! reply, so there is no separate `pendingMessages` map to maintain here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex as AsyncMutex, RwLock};

use crate::config::{Backend, DriverConfig};
use crate::coordinator::{BroadcastHandle, BroadcastKind, BroadcastMessage};
use crate::error::DriverError;
use crate::util::new_client_key;
use crate::wire::{Envelope, ExportedDatabase, OperationKind, RawResult, RequestPayload, ResponsePayload, Statement};
use crate::worker::WorkerHandle;

fn timeout_for(op: OperationKind) -> Duration {
    let ms = match op {
        OperationKind::Init => 30_000,
        OperationKind::Import => 60_000,
        OperationKind::Export => 30_000,
        OperationKind::ExecBatch => 15_000,
        OperationKind::Transaction => 15_000,
        OperationKind::Exec => 5_000,
        OperationKind::Destroy => 2_000,
    };
    Duration::from_millis(ms)
}

enum State {
    Unconfigured,
    Configured(DriverConfig),
    Ready(ReadyState),
    Destroyed,
}

struct ReadyState {
    config: DriverConfig,
    worker: Arc<WorkerHandle>,
    poster: Option<BroadcastHandle>,
    listener_stop: Option<oneshot::Sender<()>>,
    /// Flips to `true` the moment `destroy()`/`recover()` tears this state
    /// down, so a `dispatch` already awaiting the worker's reply can reject
    /// immediately instead of waiting for (or racing) the worker's answer.
    destroy_tx: watch::Sender<bool>,
}

type ReinitHandler = dyn Fn() + Send + Sync;
type CloseHandler = dyn Fn() + Send + Sync;

/// Main-thread-equivalent façade over the worker. `setConfig` must precede
/// any other call; initialization itself is lazy, triggered by the first
/// operation.
pub struct Driver {
    client_key: String,
    state: RwLock<State>,
    init_gate: AsyncMutex<()>,
    next_id: AtomicU64,
    on_reinit: AsyncMutex<Option<Arc<ReinitHandler>>>,
    on_close: AsyncMutex<Option<Arc<CloseHandler>>>,
}

impl Driver {
    pub fn new() -> Self {
        Self {
            client_key: new_client_key(),
            state: RwLock::new(State::Unconfigured),
            init_gate: AsyncMutex::new(()),
            next_id: AtomicU64::new(1),
            on_reinit: AsyncMutex::new(None),
            on_close: AsyncMutex::new(None),
        }
    }

    pub async fn set_config(&self, config: DriverConfig) {
        let mut state = self.state.write().await;
        *state = State::Configured(config);
    }

    pub async fn on_reinit<F: Fn() + Send + Sync + 'static>(&self, handler: F) {
        *self.on_reinit.lock().await = Some(Arc::new(handler));
    }

    pub async fn on_close<F: Fn() + Send + Sync + 'static>(&self, handler: F) {
        *self.on_close.lock().await = Some(Arc::new(handler));
    }

    pub async fn is_ready(&self) -> bool {
        matches!(*self.state.read().await, State::Ready(_))
    }

    /// OPFS is always "reachable" for the on-disk equivalent backend used
    /// here, so this tracks whether the configured backend persists at all.
    pub async fn has_persistent_storage(&self) -> bool {
        match &*self.state.read().await {
            State::Ready(ready) => !ready.config.database_path.is_empty(),
            State::Configured(cfg) => !cfg.database_path.is_empty(),
            _ => false,
        }
    }

    /// Lazily initializes (if needed) then dispatches `stmt` as `exec`.
    pub async fn exec(&self, stmt: Statement) -> Result<RawResult, DriverError> {
        match self
            .dispatch(OperationKind::Exec, RequestPayload::Exec(stmt))
            .await?
        {
            ResponsePayload::Exec(raw) => Ok(raw),
            other => Err(DriverError::Protocol(format!(
                "unexpected response to exec: {other:?}"
            ))),
        }
    }

    pub async fn exec_batch(&self, statements: Vec<Statement>) -> Result<Vec<RawResult>, DriverError> {
        match self
            .dispatch(OperationKind::ExecBatch, RequestPayload::ExecBatch(statements))
            .await?
        {
            ResponsePayload::ExecBatch(rows) => Ok(rows),
            other => Err(DriverError::Protocol(format!(
                "unexpected response to execBatch: {other:?}"
            ))),
        }
    }

    pub async fn transaction(&self, statements: Vec<Statement>) -> Result<Vec<RawResult>, DriverError> {
        match self
            .dispatch(OperationKind::Transaction, RequestPayload::Transaction(statements))
            .await?
        {
            ResponsePayload::ExecBatch(rows) => Ok(rows),
            other => Err(DriverError::Protocol(format!(
                "unexpected response to transaction: {other:?}"
            ))),
        }
    }

    /// Export wrapped in the shared named lock (concurrent exports allowed,
    /// exclusive with any in-flight import).
    pub async fn export_database(&self) -> Result<ExportedDatabase, DriverError> {
        let db_path = self.database_path().await?;
        let lock = crate::coordinator::NamedLock::new(std::path::Path::new(&db_path));
        let _guard = lock.acquire(crate::coordinator::LockMode::Shared).await?;
        match self.dispatch(OperationKind::Export, RequestPayload::Export).await? {
            ResponsePayload::Export(exported) => Ok(exported),
            other => Err(DriverError::Protocol(format!(
                "unexpected response to export: {other:?}"
            ))),
        }
    }

    /// Import wrapped in the exclusive named lock; broadcasts `close` before
    /// and `reinit` after, so peer instances drop and rebuild their state.
    pub async fn import_database(&self, data: Vec<u8>) -> Result<(), DriverError> {
        let db_path = self.database_path().await?;
        let lock = crate::coordinator::NamedLock::new(std::path::Path::new(&db_path));
        let _guard = lock.acquire(crate::coordinator::LockMode::Exclusive).await?;

        self.post_broadcast(BroadcastKind::Close).await;
        self.dispatch(OperationKind::Import, RequestPayload::Import { data })
            .await?;
        self.post_broadcast(BroadcastKind::Reinit).await;
        Ok(())
    }

    /// Flip the destroy signal (rejecting every in-flight `dispatch` still
    /// awaiting a worker reply with `WorkerUnavailable("Worker destroyed
    /// while operation was pending")`), post a best-effort `destroy`
    /// envelope, stop the broadcast listener, and clear state. Never fails.
    pub async fn destroy(&self) {
        if let Some(mut ready) = self.teardown_ready().await {
            self.wind_down(&mut ready).await;
        }
    }

    /// Terminate the current worker (if any) and run the init sequence
    /// again, returning to `Configured` rather than `Destroyed` on
    /// teardown. Used by the dual-engine driver's worker-recovery path.
    pub async fn recover(&self) -> Result<(), DriverError> {
        let config = if let Some(mut ready) = self.teardown_ready().await {
            self.wind_down(&mut ready).await;
            ready.config
        } else {
            match &*self.state.read().await {
                State::Configured(c) => c.clone(),
                State::Unconfigured => return Err(DriverError::NoConfiguration),
                State::Destroyed => return Err(DriverError::Destroyed),
                State::Ready(_) => unreachable!("teardown_ready already drained Ready"),
            }
        };
        *self.state.write().await = State::Configured(config);
        self.ensure_ready().await?;
        Ok(())
    }

    async fn teardown_ready(&self) -> Option<ReadyState> {
        let mut state = self.state.write().await;
        if matches!(&*state, State::Ready(_)) {
            if let State::Ready(ready) = std::mem::replace(&mut *state, State::Destroyed) {
                return Some(ready);
            }
        }
        None
    }

    async fn wind_down(&self, ready: &mut ReadyState) {
        let _ = ready.destroy_tx.send(true);
        if let Some(poster) = ready.poster.take() {
            poster.post(BroadcastKind::Close);
        }
        if let Some(stop) = ready.listener_stop.take() {
            let _ = stop.send(());
        }
        let _ = tokio::time::timeout(
            timeout_for(OperationKind::Destroy),
            ready.worker.submit(RequestPayload::Destroy),
        )
        .await;
    }

    async fn database_path(&self) -> Result<String, DriverError> {
        match &*self.state.read().await {
            State::Ready(ready) => Ok(ready.config.database_path.clone()),
            State::Configured(cfg) => Ok(cfg.database_path.clone()),
            State::Unconfigured => Err(DriverError::NoConfiguration),
            State::Destroyed => Err(DriverError::Destroyed),
        }
    }

    async fn post_broadcast(&self, kind: BroadcastKind) {
        if let State::Ready(ready) = &*self.state.read().await {
            if let Some(poster) = &ready.poster {
                poster.post(kind);
            }
        }
    }

    async fn dispatch(
        &self,
        op: OperationKind,
        payload: RequestPayload,
    ) -> Result<ResponsePayload, DriverError> {
        let (worker, mut destroyed) = self.ensure_ready().await?;
        let envelope = Envelope {
            id: self.next_id(),
            payload,
        };
        tracing::debug!(id = envelope.id, op = op.as_str(), "dispatching envelope");
        let next = timeout_for(op);
        tokio::select! {
            result = tokio::time::timeout(next, worker.submit(envelope.payload)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(DriverError::Timeout(next)),
                }
            }
            _ = destroyed.changed() => Err(DriverError::WorkerUnavailable(
                "Worker destroyed while operation was pending".to_string(),
            )),
        }
    }

    /// The single-entry init gate: concurrent first operations serialize on
    /// `init_gate`; only the first actually spawns the worker, the rest
    /// observe the now-`Ready` state and proceed. Returns the worker handle
    /// paired with a receiver that fires once this `Ready` state is torn
    /// down, so `dispatch` can reject in-flight calls on a concurrent
    /// `destroy()`.
    async fn ensure_ready(&self) -> Result<(Arc<WorkerHandle>, watch::Receiver<bool>), DriverError> {
        if let State::Ready(ready) = &*self.state.read().await {
            return Ok((ready.worker.clone(), ready.destroy_tx.subscribe()));
        }

        let _gate = self.init_gate.lock().await;
        // Re-check: another caller may have finished init while we waited.
        if let State::Ready(ready) = &*self.state.read().await {
            return Ok((ready.worker.clone(), ready.destroy_tx.subscribe()));
        }

        let config = match &*self.state.read().await {
            State::Configured(cfg) => cfg.clone(),
            State::Ready(_) => unreachable!("handled above"),
            State::Unconfigured => return Err(DriverError::NoConfiguration),
            State::Destroyed => return Err(DriverError::Destroyed),
        };

        if config.backend != Backend::Worker {
            return Err(DriverError::UnsupportedBackend(config.backend.as_str().to_string()));
        }

        let worker = Arc::new(
            tokio::time::timeout(
                timeout_for(OperationKind::Init),
                spawn_worker(config.database_path.clone()),
            )
            .await
            .map_err(|_| DriverError::Timeout(timeout_for(OperationKind::Init)))??,
        );

        let (poster, listener_stop) = if !config.database_path.is_empty() {
            let poster = BroadcastHandle::subscribe(
                std::path::Path::new(&config.database_path),
                self.client_key.clone(),
            );
            let mut listener = BroadcastHandle::subscribe(
                std::path::Path::new(&config.database_path),
                self.client_key.clone(),
            );
            let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
            let on_reinit = self.on_reinit.lock().await.clone();
            let on_close = self.on_close.lock().await.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = &mut stop_rx => break,
                        msg = listener.recv_foreign() => {
                            match msg {
                                Some(BroadcastMessage { kind: BroadcastKind::Reinit, .. }) => {
                                    if let Some(h) = &on_reinit { h(); }
                                }
                                Some(BroadcastMessage { kind: BroadcastKind::Close, .. }) => {
                                    if let Some(h) = &on_close { h(); }
                                }
                                None => break,
                            }
                        }
                    }
                }
            });
            (Some(poster), Some(stop_tx))
        } else {
            (None, None)
        };

        let (destroy_tx, destroy_rx) = watch::channel(false);
        *self.state.write().await = State::Ready(ReadyState {
            config,
            worker: worker.clone(),
            poster,
            listener_stop,
            destroy_tx,
        });
        Ok((worker, destroy_rx))
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

async fn spawn_worker(database_path: String) -> Result<WorkerHandle, DriverError> {
    // `spawn` itself blocks briefly opening the connection; run it off the
    // async executor's worker threads via spawn_blocking so a slow open
    // (e.g. cross-process contention) cannot stall the runtime.
    tokio::task::spawn_blocking(move || WorkerHandle::spawn(database_path))
        .await
        .map_err(|e| DriverError::WorkerUnavailable(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::wire::SqlScalar;

    async fn configured_driver(path: &std::path::Path) -> Driver {
        let driver = Driver::new();
        driver
            .set_config(
                DriverConfig::builder()
                    .database_path(path.to_string_lossy())
                    .backend(Backend::Worker)
                    .build(),
            )
            .await;
        driver
    }

    #[tokio::test]
    async fn lazy_init_then_exec_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let driver = configured_driver(&dir.path().join("t.db")).await;

        driver
            .exec(Statement::run("CREATE TABLE k(v INT)", vec![]))
            .await
            .unwrap();
        driver
            .exec(Statement::run("INSERT INTO k VALUES(?)", vec![SqlScalar::Int(7)]))
            .await
            .unwrap();
        let result = driver
            .exec(Statement::all("SELECT v FROM k", vec![]))
            .await
            .unwrap();

        assert_eq!(result.columns, vec!["v".to_string()]);
        assert_eq!(result.rows, vec![vec![SqlScalar::Int(7)]]);
        assert!(driver.is_ready().await);
    }

    #[tokio::test]
    async fn operation_before_set_config_is_rejected() {
        let driver = Driver::new();
        let err = driver.exec(Statement::run("SELECT 1", vec![])).await;
        assert!(matches!(err, Err(DriverError::NoConfiguration)));
    }

    #[tokio::test]
    async fn destroy_then_exec_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let driver = configured_driver(&dir.path().join("t.db")).await;
        driver.exec(Statement::run("SELECT 1", vec![])).await.unwrap();

        driver.destroy().await;
        let err = driver.exec(Statement::run("SELECT 1", vec![])).await;
        assert!(matches!(err, Err(DriverError::Destroyed)));
    }

    #[tokio::test]
    async fn unsupported_backend_is_rejected_before_spawning_worker() {
        let driver = Driver::new();
        driver
            .set_config(
                DriverConfig::builder()
                    .database_path("t.db")
                    .backend(Backend::Memory)
                    .build(),
            )
            .await;
        let err = driver.exec(Statement::run("SELECT 1", vec![])).await;
        assert!(matches!(err, Err(DriverError::UnsupportedBackend(_))));
    }

    #[tokio::test]
    async fn destroy_rejects_a_request_already_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(configured_driver(&dir.path().join("t.db")).await);

        let slow = driver.clone();
        let slow_task = tokio::spawn(async move {
            slow.exec(Statement::get(
                "WITH RECURSIVE cnt(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM cnt WHERE x < 5000000) \
                 SELECT count(*) FROM cnt",
                vec![],
            ))
            .await
        });
        // Let the slow statement reach the worker thread before queuing the next one.
        tokio::time::sleep(Duration::from_millis(5)).await;

        let pending = driver.clone();
        let pending_task =
            tokio::spawn(async move { pending.exec(Statement::run("SELECT 1", vec![])).await });
        // Give the pending exec a chance to enqueue behind the slow one and start awaiting.
        tokio::time::sleep(Duration::from_millis(5)).await;

        driver.destroy().await;

        match pending_task.await.unwrap() {
            Err(DriverError::WorkerUnavailable(msg)) => {
                assert_eq!(msg, "Worker destroyed while operation was pending");
            }
            other => panic!("expected WorkerUnavailable, got {other:?}"),
        }

        let _ = slow_task.await;
    }

    #[tokio::test]
    async fn concurrent_first_operations_share_one_init() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(configured_driver(&dir.path().join("t.db")).await);

        let a = driver.clone();
        let b = driver.clone();
        let (ra, rb) = tokio::join!(
            a.exec(Statement::run("CREATE TABLE IF NOT EXISTS k(v INT)", vec![])),
            b.exec(Statement::run("CREATE TABLE IF NOT EXISTS k(v INT)", vec![])),
        );
        ra.unwrap();
        rb.unwrap();
    }
}
