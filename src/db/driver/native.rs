use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{ConnectOptions, Row, Sqlite, SqlitePool, TypeInfo, ValueRef};
use tracing::{error, info, warn};

use super::{preview, DriverAdapter, SqlValue, Tuple};
use crate::config::{DbConfig, DbLocation, DriverKind};
use crate::{AppError, AppResult};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// On-disk engine backed by an sqlx connection pool.
pub struct NativeDriver {
    pool: SqlitePool,
}

impl NativeDriver {
    pub async fn open(config: &DbConfig, location: &DbLocation) -> AppResult<Self> {
        let (opts, max_connections) = match location {
            DbLocation::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        error!(
                            target: "waystone::db",
                            event = "data_dir_create_failed",
                            error = %e,
                            path = %parent.display()
                        );
                        AppError::from(e).with_context("path", parent.display().to_string())
                    })?;
                }
                let opts = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Full);
                (opts, config.max_connections.max(1))
            }
            // Every pooled connection to `:memory:` would see its own database.
            DbLocation::Memory => (
                SqliteConnectOptions::new().in_memory(true),
                1,
            ),
        };
        let opts = opts
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .log_statements(log::LevelFilter::Debug);

        let mut pool_opts = SqlitePoolOptions::new().max_connections(max_connections);
        if matches!(location, DbLocation::Memory) {
            // Dropping the only connection would drop the database with it.
            pool_opts = pool_opts.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_opts
            .after_connect(|conn, _| {
                Box::pin(async move {
                    sqlx::query("PRAGMA wal_autocheckpoint = 1000;")
                        .execute(&mut *conn)
                        .await?;
                    Ok::<_, sqlx::Error>(())
                })
            })
            .connect_with(opts)
            .await
            .map_err(|e| {
                AppError::from(e)
                    .wrap("DRIVER/OPEN_FAILED", "Failed to open the native database")
                    .with_context("location", location.to_string())
            })?;

        log_effective_pragmas(&pool, location).await;
        Ok(Self { pool })
    }

    fn pool(&self) -> AppResult<&SqlitePool> {
        if self.pool.is_closed() {
            Err(AppError::closed().with_context("driver", "native"))
        } else {
            Ok(&self.pool)
        }
    }
}

async fn log_effective_pragmas(pool: &SqlitePool, location: &DbLocation) {
    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let fks: (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "waystone::db",
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        foreign_keys = %fks.0,
        location = %location
    );

    if matches!(location, DbLocation::File(_)) && !jm.0.eq_ignore_ascii_case("wal") {
        warn!(
            target: "waystone::db",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
}

fn bind_all<'q>(mut query: SqliteQuery<'q>, params: &[SqlValue]) -> SqliteQuery<'q> {
    for value in params {
        query = match value {
            SqlValue::Null => query.bind(Option::<i64>::None),
            SqlValue::Integer(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::Blob(v) => query.bind(v.clone()),
        };
    }
    query
}

fn row_to_tuple(row: &SqliteRow) -> Tuple {
    (0..row.len())
        .map(|idx| {
            let Ok(raw) = row.try_get_raw(idx) else {
                return SqlValue::Null;
            };
            if raw.is_null() {
                return SqlValue::Null;
            }
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => row
                    .try_get::<i64, _>(idx)
                    .map(SqlValue::Integer)
                    .unwrap_or(SqlValue::Null),
                "REAL" => row
                    .try_get::<f64, _>(idx)
                    .map(SqlValue::Real)
                    .unwrap_or(SqlValue::Null),
                "BLOB" => row
                    .try_get::<Vec<u8>, _>(idx)
                    .map(SqlValue::Blob)
                    .unwrap_or(SqlValue::Null),
                _ => row
                    .try_get::<String, _>(idx)
                    .map(SqlValue::Text)
                    .unwrap_or(SqlValue::Null),
            }
        })
        .collect()
}

#[async_trait]
impl DriverAdapter for NativeDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Native
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> AppResult<Vec<Tuple>> {
        let pool = self.pool()?;
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(pool)
            .await
            .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_tuple).collect())
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> AppResult<u64> {
        let pool = self.pool()?;
        let result = bind_all(sqlx::query(sql), params)
            .execute(pool)
            .await
            .map_err(AppError::from)?;
        Ok(result.rows_affected())
    }

    async fn execute_batch(&self, statements: &[String]) -> AppResult<()> {
        let pool = self.pool()?;
        let mut tx = pool.begin().await.map_err(AppError::from)?;
        for (index, stmt) in statements.iter().enumerate() {
            if let Err(e) = sqlx::query(stmt).execute(&mut *tx).await {
                if let Err(rb) = tx.rollback().await {
                    error!(target: "waystone::db", event = "db_tx_rollback_failed", error = %rb);
                }
                return Err(AppError::from(e)
                    .with_context("statement_index", index.to_string())
                    .with_context("sql", preview(stmt)));
            }
        }
        tx.commit().await.map_err(AppError::from)?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!(target: "waystone::db", event = "driver_closed", driver = "native");
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
