//! The typed query/get/run/transaction/batch surface callers use directly,
//! plus `RawResult` → row materialization and tagged-template assembly.

use std::sync::Arc;

use crate::driver::Driver;
use crate::dual::DualDriver;
use crate::error::DriverError;
use crate::wire::{ExportedDatabase, RawResult, SqlScalar, Statement, StatementMethod};

/// A materialized row: column name paired with value, in column order.
/// Missing or extra columns never occur here since rows are built directly
/// from a `RawResult`'s own `columns` vector.
pub type Row = Vec<(String, SqlScalar)>;

fn materialize(raw: RawResult) -> Vec<Row> {
    let RawResult { columns, rows } = raw;
    rows.into_iter()
        .map(|values| columns.iter().cloned().zip(values).collect())
        .collect()
}

/// The result of weaving a template's literal parts with `?` placeholders,
/// produced by the [`crate::sql`] macro.
#[derive(Debug, Clone)]
pub struct RenderedSql {
    pub sql: String,
    pub params: Vec<SqlScalar>,
}

/// Interleaves `{}` placeholders in `template` with `?` and pairs the
/// template with its already-evaluated interpolated values. The Rust
/// analogue of weaving a tagged-template's literal parts with placeholders.
pub fn render_template(template: &str, params: Vec<SqlScalar>) -> RenderedSql {
    RenderedSql {
        sql: template.replace("{}", "?"),
        params,
    }
}

/// Build a [`RenderedSql`] from a template literal and interpolated values,
/// e.g. `sql!("SELECT {}+{} AS s", 1, 2)`.
#[macro_export]
macro_rules! sql {
    ($template:expr $(, $arg:expr)* $(,)?) => {
        $crate::client::render_template(
            $template,
            vec![$($crate::wire::SqlScalar::from($arg)),*],
        )
    };
}

/// Collects statements through callback-driven recording for `batch`/
/// `transaction`. This is a *statement-recording* transaction: the
/// callback cannot branch on intermediate results, only append statements.
#[derive(Default)]
pub struct StatementRecorder {
    statements: Vec<Statement>,
}

impl StatementRecorder {
    fn push(&mut self, sql: impl Into<String>, params: Vec<SqlScalar>, method: StatementMethod) {
        self.statements.push(Statement::new(sql, params, method));
    }

    pub fn run(&mut self, sql: impl Into<String>, params: Vec<SqlScalar>) {
        self.push(sql, params, StatementMethod::Run);
    }

    pub fn get(&mut self, sql: impl Into<String>, params: Vec<SqlScalar>) {
        self.push(sql, params, StatementMethod::Get);
    }

    pub fn all(&mut self, sql: impl Into<String>, params: Vec<SqlScalar>) {
        self.push(sql, params, StatementMethod::All);
    }

    pub fn rendered(&mut self, rendered: RenderedSql, method: StatementMethod) {
        self.push(rendered.sql, rendered.params, method);
    }
}

/// `status()`'s return shape.
#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub ready: bool,
    pub persistent: bool,
    pub pending_sync: Option<usize>,
}

enum Engine {
    Single(Arc<Driver>),
    Dual(Arc<DualDriver>),
}

impl Engine {
    async fn exec(&self, stmt: Statement) -> Result<RawResult, DriverError> {
        match self {
            Engine::Single(d) => d.exec(stmt).await,
            Engine::Dual(d) => d.exec(stmt),
        }
    }

    async fn exec_batch(&self, statements: Vec<Statement>) -> Result<Vec<RawResult>, DriverError> {
        match self {
            Engine::Single(d) => d.exec_batch(statements).await,
            Engine::Dual(d) => d.exec_batch(statements).await,
        }
    }

    async fn transaction(&self, statements: Vec<Statement>) -> Result<Vec<RawResult>, DriverError> {
        match self {
            Engine::Single(d) => d.transaction(statements).await,
            Engine::Dual(d) => d.transaction(statements).await,
        }
    }

    async fn export_database(&self) -> Result<ExportedDatabase, DriverError> {
        match self {
            Engine::Single(d) => d.export_database().await,
            Engine::Dual(d) => d.export_database().await,
        }
    }

    async fn import_database(&self, data: Vec<u8>) -> Result<(), DriverError> {
        match self {
            Engine::Single(d) => d.import_database(data).await,
            Engine::Dual(d) => d.import_database(data).await,
        }
    }

    async fn destroy(&self) {
        match self {
            Engine::Single(d) => d.destroy().await,
            Engine::Dual(d) => d.destroy().await,
        }
    }

    async fn is_ready(&self) -> bool {
        match self {
            Engine::Single(d) => d.is_ready().await,
            Engine::Dual(d) => d.is_ready().await,
        }
    }

    async fn has_persistent_storage(&self) -> bool {
        match self {
            Engine::Single(d) => d.has_persistent_storage().await,
            Engine::Dual(d) => d.has_persistent_storage().await,
        }
    }

    fn pending_sync_count(&self) -> Option<usize> {
        match self {
            Engine::Single(_) => None,
            Engine::Dual(d) => Some(d.pending_sync_count()),
        }
    }
}

/// Typed façade over either driver variant. Construct with
/// [`Client::with_driver`] for the OPFS-equivalent variant or
/// [`Client::with_dual_driver`] for the synchronous-mirror variant.
pub struct Client {
    engine: Engine,
}

impl Client {
    pub fn with_driver(driver: Arc<Driver>) -> Self {
        Self {
            engine: Engine::Single(driver),
        }
    }

    pub fn with_dual_driver(driver: Arc<DualDriver>) -> Self {
        Self {
            engine: Engine::Dual(driver),
        }
    }

    pub async fn query(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlScalar>,
    ) -> Result<Vec<Row>, DriverError> {
        let raw = self.engine.exec(Statement::all(sql, params)).await?;
        Ok(materialize(raw))
    }

    pub async fn get(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlScalar>,
    ) -> Result<Option<Row>, DriverError> {
        let raw = self.engine.exec(Statement::get(sql, params)).await?;
        Ok(materialize(raw).into_iter().next())
    }

    pub async fn run(&self, sql: impl Into<String>, params: Vec<SqlScalar>) -> Result<(), DriverError> {
        self.engine.exec(Statement::run(sql, params)).await?;
        Ok(())
    }

    /// Feed a [`RenderedSql`] produced by the [`crate::sql`] macro through
    /// `query`.
    pub async fn query_rendered(&self, rendered: RenderedSql) -> Result<Vec<Row>, DriverError> {
        self.query(rendered.sql, rendered.params).await
    }

    pub async fn batch<F: FnOnce(&mut StatementRecorder)>(
        &self,
        record: F,
    ) -> Result<Vec<RawResult>, DriverError> {
        let mut recorder = StatementRecorder::default();
        record(&mut recorder);
        self.engine.exec_batch(recorder.statements).await
    }

    pub async fn transaction<F: FnOnce(&mut StatementRecorder)>(
        &self,
        record: F,
    ) -> Result<Vec<RawResult>, DriverError> {
        let mut recorder = StatementRecorder::default();
        record(&mut recorder);
        self.engine.transaction(recorder.statements).await
    }

    pub async fn export_database(&self) -> Result<ExportedDatabase, DriverError> {
        self.engine.export_database().await
    }

    pub async fn import_database(&self, data: Vec<u8>) -> Result<(), DriverError> {
        self.engine.import_database(data).await
    }

    pub async fn ready(&self) -> bool {
        self.engine.is_ready().await
    }

    pub async fn close(&self) {
        self.engine.destroy().await;
    }

    pub async fn status(&self) -> ClientStatus {
        ClientStatus {
            ready: self.engine.is_ready().await,
            persistent: self.engine.has_persistent_storage().await,
            pending_sync: self.engine.pending_sync_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backend, DriverConfig};

    async fn client_over_fresh_driver(path: &std::path::Path) -> Client {
        let driver = Arc::new(Driver::new());
        driver
            .set_config(
                DriverConfig::builder()
                    .database_path(path.to_string_lossy())
                    .backend(Backend::Worker)
                    .build(),
            )
            .await;
        Client::with_driver(driver)
    }

    #[tokio::test]
    async fn query_get_run_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let client = client_over_fresh_driver(&dir.path().join("t.db")).await;

        client.run("CREATE TABLE k(v INT)", vec![]).await.unwrap();
        client.run("INSERT INTO k VALUES(?)", vec![7i64.into()]).await.unwrap();

        let rows = client.query("SELECT v FROM k", vec![]).await.unwrap();
        assert_eq!(rows, vec![vec![("v".to_string(), SqlScalar::Int(7))]]);

        let row = client.get("SELECT v FROM k WHERE v = ?", vec![7i64.into()]).await.unwrap();
        assert_eq!(row, Some(vec![("v".to_string(), SqlScalar::Int(7))]));
    }

    #[tokio::test]
    async fn sql_macro_weaves_placeholders_and_collects_params() {
        let rendered = crate::sql!("SELECT {}+{} AS s", 1i64, 2i64);
        assert_eq!(rendered.sql, "SELECT ?+? AS s");
        assert_eq!(rendered.params, vec![SqlScalar::Int(1), SqlScalar::Int(2)]);

        let dir = tempfile::tempdir().unwrap();
        let client = client_over_fresh_driver(&dir.path().join("t.db")).await;
        let rows = client.query_rendered(rendered).await.unwrap();
        assert_eq!(rows, vec![vec![("s".to_string(), SqlScalar::Int(3))]]);
    }

    #[tokio::test]
    async fn batch_submits_all_statements_as_one_execbatch() {
        let dir = tempfile::tempdir().unwrap();
        let client = client_over_fresh_driver(&dir.path().join("t.db")).await;

        let results = client
            .batch(|rec| {
                rec.run("CREATE TABLE k(v INT)", vec![]);
                rec.run("INSERT INTO k VALUES(1)", vec![]);
                rec.run("INSERT INTO k VALUES(2)", vec![]);
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 3);

        let rows = client.query("SELECT v FROM k ORDER BY v", vec![]).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn status_reports_ready_and_persistent() {
        let dir = tempfile::tempdir().unwrap();
        let client = client_over_fresh_driver(&dir.path().join("t.db")).await;
        client.run("SELECT 1", vec![]).await.unwrap();

        let status = client.status().await;
        assert!(status.ready);
        assert!(status.persistent);
        assert_eq!(status.pending_sync, None);
    }
}
