use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::DriverKind;
use crate::db::driver::{preview, DriverAdapter, SqlValue, Tuple};
use crate::AppResult;

/// Result shape requested for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// No rows expected.
    Run,
    /// At most the first row.
    Get,
    /// Every row.
    All,
    /// Every row, positional. Rows are always positional here so this
    /// behaves like `All`.
    Values,
}

/// What the statement text looks like it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Plain read: SELECT, WITH, PRAGMA, VALUES, EXPLAIN.
    Read,
    /// A write with a RETURNING clause.
    WriteReturning,
    /// Anything else.
    Write,
}

static LEADING_COMMENTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:\s+|--[^\n]*(?:\n|$)|/\*.*?\*/)*").unwrap());
static READ_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(SELECT|WITH|PRAGMA|VALUES|EXPLAIN)\b").unwrap());
static RETURNING_CLAUSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bRETURNING\b").unwrap());

impl StatementKind {
    /// Keyword sniffing. A CTE feeding an INSERT still reads as `Read`; callers
    /// that know their shape should pass an explicit mode instead of relying on
    /// this.
    pub fn classify(sql: &str) -> Self {
        let body = match LEADING_COMMENTS.find(sql) {
            Some(m) => &sql[m.end()..],
            None => sql,
        };
        if READ_PREFIX.is_match(body) {
            StatementKind::Read
        } else if RETURNING_CLAUSE.is_match(body) {
            StatementKind::WriteReturning
        } else {
            StatementKind::Write
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverRows {
    pub rows: Vec<Tuple>,
}

impl DriverRows {
    fn shaped(rows: Vec<Tuple>, mode: QueryMode) -> Self {
        let rows = match mode {
            QueryMode::Run => Vec::new(),
            QueryMode::Get => rows.into_iter().take(1).collect(),
            QueryMode::All | QueryMode::Values => rows,
        };
        DriverRows { rows }
    }

    pub fn into_first(self) -> Option<Tuple> {
        self.rows.into_iter().next()
    }
}

/// Translates `(sql, params, mode)` calls into driver calls.
///
/// Read failures are logged and come back as an empty row set; write failures
/// (including writes with RETURNING) are logged and returned.
#[derive(Clone)]
pub struct ProxyExecutor {
    driver: Arc<dyn DriverAdapter>,
}

impl ProxyExecutor {
    pub fn new(driver: Arc<dyn DriverAdapter>) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &Arc<dyn DriverAdapter> {
        &self.driver
    }

    pub fn kind(&self) -> DriverKind {
        self.driver.kind()
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: &[SqlValue],
        mode: QueryMode,
    ) -> AppResult<DriverRows> {
        debug!(target: "waystone::db", event = "sql", mode = ?mode, sql = %preview(sql));
        match StatementKind::classify(sql) {
            StatementKind::Read => match self.driver.query(sql, params).await {
                Ok(rows) => Ok(DriverRows::shaped(rows, mode)),
                Err(err) => {
                    error!(
                        target: "waystone::db",
                        event = "sql_read_failed",
                        sql = %preview(sql),
                        error = %err
                    );
                    Ok(DriverRows::default())
                }
            },
            StatementKind::WriteReturning => {
                let rows = self.driver.query(sql, params).await.map_err(|err| {
                    log_write_failure(sql, &err);
                    err
                })?;
                Ok(DriverRows::shaped(rows, mode))
            }
            StatementKind::Write => {
                self.driver.execute(sql, params).await.map_err(|err| {
                    log_write_failure(sql, &err);
                    err
                })?;
                Ok(DriverRows::default())
            }
        }
    }

    /// Runs a write and reports the affected row count.
    pub async fn execute_counted(&self, sql: &str, params: &[SqlValue]) -> AppResult<u64> {
        debug!(target: "waystone::db", event = "sql", mode = "run", sql = %preview(sql));
        self.driver.execute(sql, params).await.map_err(|err| {
            log_write_failure(sql, &err);
            err
        })
    }
}

fn log_write_failure(sql: &str, err: &crate::AppError) {
    error!(
        target: "waystone::db",
        event = "sql_write_failed",
        sql = %preview(sql),
        error = %err
    );
}
