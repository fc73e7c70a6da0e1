//! SQL execution backends.
//!
//! Both engines sit behind [`DriverAdapter`]; the concrete adapter is picked
//! once by [`open`] and nothing above this module branches on the platform.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{DbConfig, DbLocation, DriverKind};
use crate::AppResult;

mod embedded;
mod native;

pub use embedded::EmbeddedDriver;
pub use native::NativeDriver;

/// One SQLite value, positional and untyped by column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            SqlValue::Real(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "NULL",
            SqlValue::Integer(_) => "INTEGER",
            SqlValue::Real(_) => "REAL",
            SqlValue::Text(_) => "TEXT",
            SqlValue::Blob(_) => "BLOB",
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Integer(v) => write!(f, "{v}"),
            SqlValue::Real(v) => write!(f, "{v}"),
            SqlValue::Text(v) => write!(f, "'{v}'"),
            SqlValue::Blob(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Integer(value.into())
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Integer(value as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        SqlValue::Text(value.clone())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        SqlValue::Blob(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A result row with column names stripped; callers recover names by position.
pub type Tuple = Vec<SqlValue>;

/// Uniform execution contract over the platform SQLite engines.
///
/// Implementations must be Send + Sync; the handle is shared by every clone
/// of the query layer.
#[async_trait]
pub trait DriverAdapter: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// Run a row-returning statement and flatten every row to a tuple.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> AppResult<Vec<Tuple>>;

    /// Run a statement for its side effects, returning the affected row count.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> AppResult<u64>;

    /// Run statements in order inside one transaction. The first failure
    /// rolls the whole batch back and is returned with its statement index.
    async fn execute_batch(&self, statements: &[String]) -> AppResult<()>;

    /// Release the connection. Every later call fails with `DB/CLOSED`.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Opens the adapter configured for `location`.
pub async fn open(config: &DbConfig, location: &DbLocation) -> AppResult<Arc<dyn DriverAdapter>> {
    let driver: Arc<dyn DriverAdapter> = match config.driver {
        DriverKind::Native => Arc::new(NativeDriver::open(config, location).await?),
        DriverKind::Embedded => Arc::new(EmbeddedDriver::open(location).await?),
    };
    tracing::info!(
        target: "waystone::db",
        event = "driver_open",
        driver = %driver.kind(),
        location = %location
    );
    Ok(driver)
}

/// Collapses a statement to one line for log fields.
pub(crate) fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    if trimmed.chars().count() > 100 {
        let cut: String = trimmed.chars().take(100).collect();
        format!("{cut}…")
    } else {
        trimmed.to_string()
    }
}
