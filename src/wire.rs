//! The envelope shape that crosses the worker boundary.
//!
//! A single envelope shape is used in both directions: requests carry
//! `{id, type, payload}`, responses carry `{id, success, result|error}`.
//! `OperationKind` determines which payload/result shape applies, mirroring
//! the wire format table in the design docs this crate implements.
//!
//! Everything here is plain data — no I/O, no locking. The worker thread
//! and the driver serialize through [`crate::worker`] and [`crate::driver`].

use serde::{Deserialize, Serialize};

/// One SQL-representable scalar: a parameter value or a result cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlScalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<bool> for SqlScalar {
    fn from(v: bool) -> Self {
        SqlScalar::Bool(v)
    }
}

impl From<i64> for SqlScalar {
    fn from(v: i64) -> Self {
        SqlScalar::Int(v)
    }
}

impl From<f64> for SqlScalar {
    fn from(v: f64) -> Self {
        SqlScalar::Float(v)
    }
}

impl From<String> for SqlScalar {
    fn from(v: String) -> Self {
        SqlScalar::Text(v)
    }
}

impl From<&str> for SqlScalar {
    fn from(v: &str) -> Self {
        SqlScalar::Text(v.to_string())
    }
}

impl From<Vec<u8>> for SqlScalar {
    fn from(v: Vec<u8>) -> Self {
        SqlScalar::Blob(v)
    }
}

impl<T: Into<SqlScalar>> From<Option<T>> for SqlScalar {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => SqlScalar::Null,
        }
    }
}

/// How a statement's rows should be materialized. See spec's execute model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatementMethod {
    /// Discard rows; return empty columns and rows.
    Run,
    /// Return the first row only (or none).
    Get,
    /// Return every row.
    All,
    /// Return every row (column-name-insensitive callers; same as `All` on the wire).
    Values,
}

/// One SQL operation: opaque text, ordered parameters, and a materialization mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlScalar>,
    pub method: StatementMethod,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlScalar>, method: StatementMethod) -> Self {
        Self {
            sql: sql.into(),
            params,
            method,
        }
    }

    pub fn run(sql: impl Into<String>, params: Vec<SqlScalar>) -> Self {
        Self::new(sql, params, StatementMethod::Run)
    }

    pub fn get(sql: impl Into<String>, params: Vec<SqlScalar>) -> Self {
        Self::new(sql, params, StatementMethod::Get)
    }

    pub fn all(sql: impl Into<String>, params: Vec<SqlScalar>) -> Self {
        Self::new(sql, params, StatementMethod::All)
    }

    /// Prefix keywords classified as mutating for sync-queue routing (see spec's
    /// write-detection classifier). Heuristic, not authoritative — exotic forms like
    /// `WITH ... INSERT` or bare `REPLACE` are intentionally not covered here.
    pub const WRITE_PREFIXES: &'static [&'static str] =
        &["INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER"];

    /// Case-insensitive first-keyword match against [`Statement::WRITE_PREFIXES`].
    pub fn is_write(&self) -> bool {
        let trimmed = self.sql.trim_start();
        Self::WRITE_PREFIXES
            .iter()
            .any(|kw| trimmed.len() >= kw.len() && trimmed[..kw.len()].eq_ignore_ascii_case(kw))
    }
}

/// Rows aligned to `columns`, produced per statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlScalar>>,
}

impl RawResult {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// The set of operations the worker understands. Each variant pairs a request
/// payload with the response payload that answers it (see the wire format table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestPayload {
    Init { database_path: String },
    Exec(Statement),
    ExecBatch(Vec<Statement>),
    Transaction(Vec<Statement>),
    Export,
    Import { data: Vec<u8> },
    Destroy,
}

impl RequestPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            RequestPayload::Init { .. } => OperationKind::Init,
            RequestPayload::Exec(_) => OperationKind::Exec,
            RequestPayload::ExecBatch(_) => OperationKind::ExecBatch,
            RequestPayload::Transaction(_) => OperationKind::Transaction,
            RequestPayload::Export => OperationKind::Export,
            RequestPayload::Import { .. } => OperationKind::Import,
            RequestPayload::Destroy => OperationKind::Destroy,
        }
    }
}

/// Tag for an operation, used for per-operation timeout lookup and logging —
/// kept distinct from `RequestPayload` so the driver can name an operation
/// before it has constructed (or without constructing) the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Init,
    Exec,
    ExecBatch,
    Transaction,
    Export,
    Import,
    Destroy,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Init => "init",
            OperationKind::Exec => "exec",
            OperationKind::ExecBatch => "execBatch",
            OperationKind::Transaction => "transaction",
            OperationKind::Export => "export",
            OperationKind::Import => "import",
            OperationKind::Destroy => "destroy",
        }
    }
}

/// Export result: a detached byte buffer plus a suggested file name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedDatabase {
    pub name: String,
    pub data: Vec<u8>,
}

/// The worker's answer to a given payload kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    Unit,
    Exec(RawResult),
    ExecBatch(Vec<RawResult>),
    Export(ExportedDatabase),
}

/// A request envelope: `{id, type, payload}`.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: u64,
    pub payload: RequestPayload,
}

/// A response envelope: `{id, success: true, result}` or `{id, success: false, error}`.
pub type EnvelopeResult = Result<ResponsePayload, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_prefix_classifier_matches_documented_keywords() {
        assert!(Statement::run("INSERT INTO t VALUES (1)", vec![]).is_write());
        assert!(Statement::run("  update t set a=1", vec![]).is_write());
        assert!(!Statement::run("SELECT * FROM t", vec![]).is_write());
        assert!(!Statement::run("REPLACE INTO t VALUES (1)", vec![]).is_write());
    }

    #[test]
    fn scalar_conversions_round_trip_through_option() {
        let v: SqlScalar = Some(7i64).into();
        assert_eq!(v, SqlScalar::Int(7));
        let v: SqlScalar = None::<i64>.into();
        assert_eq!(v, SqlScalar::Null);
    }
}
