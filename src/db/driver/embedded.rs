use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Batch, Connection, Statement, ToSql};
use tracing::{error, info};

use super::{preview, DriverAdapter, SqlValue, Tuple};
use crate::config::{DbLocation, DriverKind};
use crate::{AppError, AppResult};

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            SqlValue::Integer(v) => ToSqlOutput::Borrowed(ValueRef::Integer(*v)),
            SqlValue::Real(v) => ToSqlOutput::Borrowed(ValueRef::Real(*v)),
            SqlValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            SqlValue::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

fn value_from_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Integer(v),
        ValueRef::Real(v) => SqlValue::Real(v),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    }
}

/// In-process engine: one connection, no pool, driven on the blocking pool.
pub struct EmbeddedDriver {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl EmbeddedDriver {
    pub async fn open(location: &DbLocation) -> AppResult<Self> {
        let location = location.clone();
        let conn = tokio::task::spawn_blocking(move || -> AppResult<Connection> {
            let conn = match &location {
                DbLocation::File(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            AppError::from(e).with_context("path", parent.display().to_string())
                        })?;
                    }
                    let conn = Connection::open(path)?;
                    let _mode: String = conn.pragma_update_and_check(
                        None,
                        "journal_mode",
                        "WAL",
                        |row| row.get(0),
                    )?;
                    conn
                }
                DbLocation::Memory => Connection::open_in_memory()?,
            };
            conn.pragma_update(None, "foreign_keys", true)?;
            Ok(conn)
        })
        .await
        .map_err(join_error)?
        .map_err(|e| e.wrap("DRIVER/OPEN_FAILED", "Failed to open the embedded database"))?;

        info!(
            target: "waystone::db",
            event = "db_open",
            driver = "embedded",
            sqlite_version = rusqlite::version()
        );
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> AppResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_mut() {
                Some(conn) => f(conn),
                None => Err(AppError::closed().with_context("driver", "embedded")),
            }
        })
        .await
        .map_err(join_error)?
    }
}

fn join_error(err: tokio::task::JoinError) -> AppError {
    AppError::new("DRIVER/TASK_FAILED", err.to_string())
}

fn collect_rows(stmt: &mut Statement<'_>, params: &[SqlValue]) -> AppResult<Vec<Tuple>> {
    let width = stmt.column_count();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut tuple = Vec::with_capacity(width);
        for idx in 0..width {
            tuple.push(value_from_ref(row.get_ref(idx)?));
        }
        out.push(tuple);
    }
    Ok(out)
}

/// Runs exactly one statement. `prepare` stops at the first `;`, so trailing
/// statements are refused rather than dropped.
fn run_statement(conn: &Connection, sql: &str, params: &[SqlValue]) -> AppResult<Vec<Tuple>> {
    let mut batch = Batch::new(conn, sql);
    let Some(mut stmt) = batch.next()? else {
        return Ok(Vec::new());
    };
    if batch.next()?.is_some() {
        return Err(AppError::new(
            AppError::DRIVER_MULTIPLE_STATEMENTS,
            "Only one statement may be sent per call",
        )
        .with_context("sql", preview(sql)));
    }
    collect_rows(&mut stmt, params)
}

/// Runs every statement of a migration body in order, each prepared after the
/// previous one has run.
fn run_script(conn: &Connection, sql: &str) -> AppResult<()> {
    let mut batch = Batch::new(conn, sql);
    while let Some(mut stmt) = batch.next()? {
        collect_rows(&mut stmt, &[])?;
    }
    Ok(())
}

#[async_trait]
impl DriverAdapter for EmbeddedDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Embedded
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> AppResult<Vec<Tuple>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| run_statement(conn, &sql, &params))
            .await
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> AppResult<u64> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| {
            // Stepping through `query` also tolerates statements that yield rows.
            run_statement(conn, &sql, &params)?;
            Ok(conn.changes() as u64)
        })
        .await
    }

    async fn execute_batch(&self, statements: &[String]) -> AppResult<()> {
        let statements = statements.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for (index, stmt) in statements.iter().enumerate() {
                if let Err(e) = run_script(&tx, stmt) {
                    if let Err(rb) = tx.rollback() {
                        error!(target: "waystone::db", event = "db_tx_rollback_failed", error = %rb);
                    }
                    return Err(e
                        .with_context("statement_index", index.to_string())
                        .with_context("sql", preview(stmt)));
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn close(&self) {
        let conn = Arc::clone(&self.conn);
        let closed = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            match guard.take() {
                Some(conn) => conn.close().map_err(|(_, e)| AppError::from(e)),
                None => Ok(()),
            }
        })
        .await;
        match closed {
            Ok(Ok(())) => info!(target: "waystone::db", event = "driver_closed", driver = "embedded"),
            Ok(Err(e)) => error!(target: "waystone::db", event = "driver_close_failed", error = %e),
            Err(e) => error!(target: "waystone::db", event = "driver_close_failed", error = %e),
        }
    }

    fn is_closed(&self) -> bool {
        self.conn
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tuples_keep_column_order_and_types() {
        let driver = EmbeddedDriver::open(&DbLocation::Memory).await.expect("open");
        driver
            .execute("CREATE TABLE t (a INTEGER, b TEXT, c REAL, d BLOB)", &[])
            .await
            .expect("create");
        let changed = driver
            .execute(
                "INSERT INTO t (a, b, c, d) VALUES (?, ?, ?, ?)",
                &[
                    SqlValue::Integer(7),
                    SqlValue::Text("x".into()),
                    SqlValue::Real(1.5),
                    SqlValue::Blob(vec![1, 2]),
                ],
            )
            .await
            .expect("insert");
        assert_eq!(changed, 1);

        let rows = driver.query("SELECT d, c, b, a FROM t", &[]).await.expect("select");
        assert_eq!(
            rows,
            vec![vec![
                SqlValue::Blob(vec![1, 2]),
                SqlValue::Real(1.5),
                SqlValue::Text("x".into()),
                SqlValue::Integer(7),
            ]]
        );
    }

    #[tokio::test]
    async fn failed_batch_rolls_back_earlier_statements() {
        let driver = EmbeddedDriver::open(&DbLocation::Memory).await.expect("open");
        let err = driver
            .execute_batch(&[
                "CREATE TABLE first (x INTEGER)".to_string(),
                "CREATE TABLE broken (".to_string(),
            ])
            .await
            .expect_err("second statement is invalid");
        assert_eq!(err.context().get("statement_index"), Some(&"1".to_string()));

        let rows = driver
            .query("SELECT name FROM sqlite_master WHERE name = 'first'", &[])
            .await
            .expect("catalog");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn batch_entries_run_every_statement_in_the_body() {
        let driver = EmbeddedDriver::open(&DbLocation::Memory).await.expect("open");
        driver
            .execute_batch(&[
                "CREATE TABLE a (x INTEGER);\nCREATE INDEX a_x ON a (x);\n".to_string(),
            ])
            .await
            .expect("batch");
        let rows = driver
            .query("SELECT name FROM sqlite_master WHERE name = 'a_x'", &[])
            .await
            .expect("catalog");
        assert_eq!(rows, vec![vec![SqlValue::Text("a_x".into())]]);
    }

    #[tokio::test]
    async fn single_calls_refuse_trailing_statements() {
        let driver = EmbeddedDriver::open(&DbLocation::Memory).await.expect("open");
        let err = driver
            .execute("CREATE TABLE a (x INTEGER); CREATE TABLE b (y INTEGER)", &[])
            .await
            .expect_err("two statements");
        assert_eq!(err.code(), AppError::DRIVER_MULTIPLE_STATEMENTS);

        // A trailing semicolon and comment are not a second statement.
        driver
            .execute("CREATE TABLE c (z INTEGER); -- done", &[])
            .await
            .expect("single statement");
        let rows = driver
            .query("SELECT name FROM sqlite_master WHERE name IN ('a', 'b') ", &[])
            .await
            .expect("catalog");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn closed_driver_rejects_calls() {
        let driver = EmbeddedDriver::open(&DbLocation::Memory).await.expect("open");
        driver.close().await;
        assert!(driver.is_closed());
        let err = driver.query("SELECT 1", &[]).await.expect_err("closed");
        assert_eq!(err.code(), AppError::DB_CLOSED);
    }
}
