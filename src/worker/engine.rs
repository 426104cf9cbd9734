//! Operations the worker thread runs against its one `rusqlite::Connection`.
//!
//! Everything here is synchronous and runs on the dedicated worker thread
//! (see [`super::WorkerHandle`]) — never called directly from async code.

use std::path::Path;

use rusqlite::{backup::Backup, params_from_iter, Connection, ToSql};

use crate::error::DriverError;
use crate::wire::{ExportedDatabase, RawResult, SqlScalar, Statement, StatementMethod};

/// Open `path` and apply the pragmas the worker engine requires: WAL
/// journaling, normal sync (durable enough once WAL checkpoints, much
/// faster than FULL), a modest page cache, and foreign key enforcement.
pub fn open_connection(path: &str) -> Result<Connection, DriverError> {
    let conn = Connection::open(path)?;
    apply_pragmas(&conn)?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection) -> Result<(), DriverError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", 5000)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

impl ToSql for SqlScalar {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value};
        Ok(match self {
            SqlScalar::Null => ToSqlOutput::Owned(Value::Null),
            SqlScalar::Bool(b) => ToSqlOutput::Owned(Value::Integer(*b as i64)),
            SqlScalar::Int(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlScalar::Float(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlScalar::Text(s) => ToSqlOutput::Owned(Value::Text(s.clone())),
            SqlScalar::Blob(b) => ToSqlOutput::Owned(Value::Blob(b.clone())),
        })
    }
}

fn column_value(value: rusqlite::types::ValueRef<'_>) -> SqlScalar {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => SqlScalar::Null,
        ValueRef::Integer(i) => SqlScalar::Int(i),
        ValueRef::Real(f) => SqlScalar::Float(f),
        ValueRef::Text(t) => SqlScalar::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlScalar::Blob(b.to_vec()),
    }
}

/// Execute one statement, materializing rows per its `method` (run/get/all/values).
pub fn exec(conn: &Connection, stmt: &Statement) -> Result<RawResult, DriverError> {
    let mut prepared = conn.prepare(&stmt.sql)?;
    let columns: Vec<String> = prepared
        .column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();

    if matches!(stmt.method, StatementMethod::Run) {
        prepared.execute(params_from_iter(stmt.params.iter()))?;
        return Ok(RawResult::empty());
    }

    let column_count = columns.len();
    let mut rows_iter = prepared.query(params_from_iter(stmt.params.iter()))?;

    let mut rows = Vec::new();
    while let Some(row) = rows_iter.next()? {
        let mut tuple = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            tuple.push(column_value(row.get_ref(idx)?));
        }
        rows.push(tuple);
        if matches!(stmt.method, StatementMethod::Get) {
            break;
        }
    }

    Ok(RawResult { columns, rows })
}

/// Run every statement inside one transaction; on any error the whole
/// transaction rolls back and no partial `RawResult`s escape.
pub fn exec_batch(conn: &mut Connection, statements: &[Statement]) -> Result<Vec<RawResult>, DriverError> {
    let tx = conn.transaction()?;
    let mut results = Vec::with_capacity(statements.len());
    for stmt in statements {
        let result = exec(&tx, stmt)?;
        results.push(result);
    }
    tx.commit()?;
    Ok(results)
}

/// Serialize the live database to a detached byte buffer via SQLite's
/// backup API, which captures a consistent snapshot including any pages
/// still only in the WAL. The snapshot is staged through a scratch file
/// (rather than `Connection::serialize`, which this crate's SQLite feature
/// set does not enable) and read back as bytes.
pub fn export(conn: &Connection, db_path: &str) -> Result<ExportedDatabase, DriverError> {
    let scratch_path = Path::new(db_path).with_extension("sqlworker-export.tmp");
    {
        let mut scratch = Connection::open(&scratch_path)?;
        let backup = Backup::new(conn, &mut scratch)?;
        backup.run_to_completion(5, std::time::Duration::from_millis(50), None)?;
    }
    let data = std::fs::read(&scratch_path)?;
    let mut wal_path = scratch_path.clone().into_os_string();
    wal_path.push("-wal");
    let mut shm_path = scratch_path.clone().into_os_string();
    shm_path.push("-shm");
    let _ = std::fs::remove_file(&scratch_path);
    let _ = std::fs::remove_file(wal_path);
    let _ = std::fs::remove_file(shm_path);
    let name = Path::new(db_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "database".to_string());
    Ok(ExportedDatabase { name, data })
}

/// Replace strategy: write `data` to a sibling temp file, close and reopen
/// over the original path, replacing it atomically, then re-apply pragmas.
///
/// This is the strategy this crate has standardized on (see the design
/// decision log) rather than the per-table merge alternative, because it
/// gives byte-for-byte round-trip parity.
pub fn import(path: &str, data: &[u8]) -> Result<Connection, DriverError> {
    let target = Path::new(path);
    let tmp_path = target.with_extension("sqlworker-import.tmp");
    std::fs::write(&tmp_path, data)?;
    // Validate the buffer is actually openable SQLite before committing it
    // over the live file.
    {
        let check = Connection::open(&tmp_path)?;
        check.query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))?;
    }
    std::fs::rename(&tmp_path, target)?;
    open_connection(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        apply_pragmas(&conn).ok(); // journal_mode=WAL is meaningless for :memory: but harmless
        conn
    }

    #[test]
    fn run_discards_rows() {
        let conn = memory_conn();
        let result = exec(
            &conn,
            &Statement::run("CREATE TABLE k(v INT)", vec![]),
        )
        .unwrap();
        assert!(result.columns.is_empty());
        assert!(result.rows.is_empty());
    }

    #[test]
    fn get_returns_single_row_scalar() {
        let conn = memory_conn();
        let result = exec(
            &conn,
            &Statement::get("SELECT ? AS v", vec![SqlScalar::Int(7)]),
        )
        .unwrap();
        assert_eq!(result.columns, vec!["v".to_string()]);
        assert_eq!(result.rows, vec![vec![SqlScalar::Int(7)]]);
    }

    #[test]
    fn batch_rolls_back_entirely_on_error() {
        let mut conn = memory_conn();
        exec(
            &conn,
            &Statement::run("CREATE TABLE k(v INTEGER NOT NULL) STRICT", vec![]),
        )
        .unwrap();

        let statements = vec![
            Statement::run("INSERT INTO k VALUES(1)", vec![]),
            Statement::run("INSERT INTO k VALUES(?)", vec![SqlScalar::Text("x".into())]),
        ];
        let err = exec_batch(&mut conn, &statements);
        assert!(err.is_err());

        let count = exec(&conn, &Statement::get("SELECT count(*) FROM k", vec![])).unwrap();
        assert_eq!(count.rows[0][0], SqlScalar::Int(0));
    }
}
