//! The worker thread: owns one SQLite connection bound to a file path and
//! serves requests one at a time, in receive order.
//!
//! Grounded on the dedicated-background-thread pattern used for SQLite
//! access in the broader ecosystem (a `std::sync::mpsc` request channel
//! feeding a spawned thread, replies correlated with a `oneshot::Sender`
//! carried alongside each request) rather than the teacher's own
//! same-thread `DbBroker::with_conn`, since the spec requires the SQLite
//! handle to live off the caller's thread entirely.

pub mod engine;

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use rusqlite::Connection;
use tokio::sync::oneshot;

use crate::error::DriverError;
use crate::wire::{ExportedDatabase, RequestPayload, ResponsePayload};

struct WorkItem {
    payload: RequestPayload,
    respond: oneshot::Sender<Result<ResponsePayload, DriverError>>,
}

/// A handle to a running worker thread. Dropping it closes the request
/// channel, which ends the thread's receive loop on its next iteration.
pub struct WorkerHandle {
    sender: std_mpsc::Sender<WorkItem>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn the worker thread, open `database_path`, and apply pragmas.
    /// Mirrors the `init` envelope: the connection is live by the time this
    /// returns successfully.
    pub fn spawn(database_path: String) -> Result<Self, DriverError> {
        let (sender, receiver) = std_mpsc::channel::<WorkItem>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), DriverError>>();

        let join = std::thread::Builder::new()
            .name(format!("sqlworker-{}", sanitize(&database_path)))
            .spawn(move || run(database_path, receiver, ready_tx))
            .map_err(|e| DriverError::WorkerUnavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                sender,
                join: Some(join),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DriverError::WorkerUnavailable(
                "worker thread exited before signaling readiness".to_string(),
            )),
        }
    }

    /// Submit a request and await its reply. Returns `WorkerUnavailable` if
    /// the thread has already exited (crashed or was destroyed).
    pub async fn submit(
        &self,
        payload: RequestPayload,
    ) -> Result<ResponsePayload, DriverError> {
        let (respond, rx) = oneshot::channel();
        self.sender
            .send(WorkItem { payload, respond })
            .map_err(|_| DriverError::WorkerUnavailable("worker thread has exited".to_string()))?;
        rx.await
            .map_err(|_| DriverError::WorkerUnavailable("worker thread dropped the reply".to_string()))?
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            // Closing the sender by dropping self.sender (already happening
            // as part of struct teardown) ends the thread's recv loop.
            let _ = join.join();
        }
    }
}

fn sanitize(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn run(
    database_path: String,
    receiver: std_mpsc::Receiver<WorkItem>,
    ready_tx: std_mpsc::Sender<Result<(), DriverError>>,
) {
    let mut conn = match engine::open_connection(&database_path) {
        Ok(conn) => {
            let _ = ready_tx.send(Ok(()));
            conn
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let mut ready = true;
    while let Ok(item) = receiver.recv() {
        let result = handle(&mut conn, &database_path, &mut ready, item.payload);
        let _ = item.respond.send(result);
    }
    tracing::debug!(database_path, "worker thread shutting down");
}

fn handle(
    conn: &mut Connection,
    database_path: &str,
    ready: &mut bool,
    payload: RequestPayload,
) -> Result<ResponsePayload, DriverError> {
    if !*ready {
        return Err(DriverError::Destroyed);
    }
    match payload {
        RequestPayload::Init { .. } => Ok(ResponsePayload::Unit),
        RequestPayload::Exec(stmt) => engine::exec(conn, &stmt).map(ResponsePayload::Exec),
        RequestPayload::ExecBatch(stmts) => {
            engine::exec_batch(conn, &stmts).map(ResponsePayload::ExecBatch)
        }
        RequestPayload::Transaction(stmts) => {
            engine::exec_batch(conn, &stmts).map(ResponsePayload::ExecBatch)
        }
        RequestPayload::Export => engine::export(conn, database_path)
            .map(|ExportedDatabase { name, data }| ResponsePayload::Export(ExportedDatabase { name, data })),
        RequestPayload::Import { data } => {
            *conn = engine::import(database_path, &data)?;
            Ok(ResponsePayload::Unit)
        }
        RequestPayload::Destroy => {
            *ready = false;
            Ok(ResponsePayload::Unit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{SqlScalar, Statement};

    #[tokio::test]
    async fn init_then_exec_round_trips_a_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db").to_string_lossy().into_owned();
        let worker = WorkerHandle::spawn(path).unwrap();

        worker
            .submit(RequestPayload::Exec(Statement::run(
                "CREATE TABLE k(v INT)",
                vec![],
            )))
            .await
            .unwrap();
        worker
            .submit(RequestPayload::Exec(Statement::run(
                "INSERT INTO k VALUES (?)",
                vec![SqlScalar::Int(7)],
            )))
            .await
            .unwrap();
        let result = worker
            .submit(RequestPayload::Exec(Statement::all("SELECT v FROM k", vec![])))
            .await
            .unwrap();

        match result {
            ResponsePayload::Exec(raw) => {
                assert_eq!(raw.columns, vec!["v".to_string()]);
                assert_eq!(raw.rows, vec![vec![SqlScalar::Int(7)]]);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn destroy_then_exec_fails_deterministically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db").to_string_lossy().into_owned();
        let worker = WorkerHandle::spawn(path).unwrap();

        worker.submit(RequestPayload::Destroy).await.unwrap();
        let err = worker
            .submit(RequestPayload::Exec(Statement::run("SELECT 1", vec![])))
            .await;
        assert!(matches!(err, Err(DriverError::Destroyed)));
    }
}
