//! sqlworker: non-blocking, durable, cross-process-coordinated SQLite.
//!
//! A SQLite connection lives on a dedicated worker thread and is reached
//! through a request/response envelope, never touched directly by callers.
//! On top of that sits a driver that lazily initializes the worker, tracks
//! per-operation timeouts, and coordinates with peer instances on the same
//! database path through a broadcast registry and an advisory file lock.
//! An optional dual-engine driver layers a synchronous in-memory mirror
//! with a write-through queue over the same worker, trading durability
//! latency for query latency.
//!
//! # Layers
//!
//! - [`wire`]: the envelope and statement types that cross the worker
//!   boundary.
//! - [`worker`]: the dedicated thread and the SQLite operations it runs.
//! - [`coordinator`]: the broadcast registry and named lock used for
//!   cross-instance `reinit`/`close` notification and import/export
//!   mutual exclusion.
//! - [`driver`]: the request coordinator — state machine, init gate,
//!   timeouts, broadcast wiring.
//! - [`dual`]: the synchronous in-memory mirror and write-through queue.
//! - [`client`]: the typed query/get/run/batch/transaction surface and row
//!   materialization.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sqlworker::{Backend, Client, Driver, DriverConfig, sql};
//!
//! # async fn run() -> Result<(), sqlworker::DriverError> {
//! let driver = Arc::new(Driver::new());
//! driver
//!     .set_config(
//!         DriverConfig::builder()
//!             .database_path("app.db")
//!             .backend(Backend::Worker)
//!             .build(),
//!     )
//!     .await;
//! let client = Client::with_driver(driver);
//!
//! client.run("CREATE TABLE IF NOT EXISTS k(v INT)", vec![]).await?;
//! let rendered = sql!("SELECT {}+{} AS s", 1i64, 2i64);
//! let rows = client.query_rendered(rendered).await?;
//! assert_eq!(rows[0][0].1, sqlworker::SqlScalar::Int(3));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod dual;
pub mod error;
pub mod util;
pub mod wire;
pub mod worker;

pub use client::{Client, ClientStatus, RenderedSql, Row, StatementRecorder};
pub use config::{Backend, DriverConfig, DriverConfigBuilder, RetryConfig};
pub use coordinator::{BroadcastKind, BroadcastMessage, LockMode, NamedLock};
pub use driver::Driver;
pub use dual::{DegradedReason, DualDriver, Status as DualStatus};
pub use error::DriverError;
pub use wire::{ExportedDatabase, OperationKind, RawResult, SqlScalar, Statement, StatementMethod};
