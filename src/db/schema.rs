//! Declared local tables and their typed records.
//!
//! Query results come back as positional tuples; a [`Table`]'s column order
//! is what turns them back into named fields.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::driver::{SqlValue, Tuple};
use crate::time::{now_ms, to_date};
use crate::{AppError, AppResult};

#[derive(Debug, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    /// Auto-increment keys are left out of inserts when unset.
    pub auto_increment: bool,
}

impl Column {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            auto_increment: false,
        }
    }

    pub const fn auto(name: &'static str) -> Self {
        Self {
            name,
            auto_increment: true,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column],
}

impl Table {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    #[allow(clippy::result_large_err)]
    pub fn ensure_column(&self, name: &str) -> AppResult<&'static Column> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| self.unknown_column(name))
    }

    pub fn unknown_column(&self, name: &str) -> AppError {
        AppError::new(AppError::QUERY_UNKNOWN_COLUMN, "Unknown column")
            .with_context("table", self.name)
            .with_context("column", name.to_string())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> {
        self.columns.iter().map(|c| c.name)
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// A positional tuple read against its table declaration.
pub struct Row<'a> {
    table: &'static Table,
    values: &'a [SqlValue],
}

impl<'a> Row<'a> {
    pub fn new(table: &'static Table, values: &'a Tuple) -> Self {
        Self { table, values }
    }

    #[allow(clippy::result_large_err)]
    fn value(&self, column: &str) -> AppResult<&'a SqlValue> {
        let idx = self
            .table
            .column_index(column)
            .ok_or_else(|| self.table.unknown_column(column))?;
        self.values.get(idx).ok_or_else(|| {
            AppError::new(AppError::QUERY_DECODE, "Row is shorter than its table")
                .with_context("table", self.table.name)
                .with_context("column", column.to_string())
                .with_context("width", self.values.len().to_string())
        })
    }

    fn decode_error(&self, column: &str, expected: &str, found: &SqlValue) -> AppError {
        AppError::new(AppError::QUERY_DECODE, "Unexpected column type")
            .with_context("table", self.table.name)
            .with_context("column", column.to_string())
            .with_context("expected", expected.to_string())
            .with_context("found", found.type_name())
    }

    #[allow(clippy::result_large_err)]
    pub fn opt_i64(&self, column: &str) -> AppResult<Option<i64>> {
        match self.value(column)? {
            SqlValue::Null => Ok(None),
            other => other
                .as_i64()
                .map(Some)
                .ok_or_else(|| self.decode_error(column, "INTEGER", other)),
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn i64(&self, column: &str) -> AppResult<i64> {
        self.opt_i64(column)?
            .ok_or_else(|| self.decode_error(column, "INTEGER", &SqlValue::Null))
    }

    #[allow(clippy::result_large_err)]
    pub fn opt_text(&self, column: &str) -> AppResult<Option<String>> {
        match self.value(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(v) => Ok(Some(v.clone())),
            other => Err(self.decode_error(column, "TEXT", other)),
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn text(&self, column: &str) -> AppResult<String> {
        self.opt_text(column)?
            .ok_or_else(|| self.decode_error(column, "TEXT", &SqlValue::Null))
    }

    #[allow(clippy::result_large_err)]
    pub fn opt_timestamp(&self, column: &str) -> AppResult<Option<DateTime<Utc>>> {
        Ok(self.opt_i64(column)?.map(to_date))
    }

    #[allow(clippy::result_large_err)]
    pub fn timestamp(&self, column: &str) -> AppResult<DateTime<Utc>> {
        Ok(to_date(self.i64(column)?))
    }
}

/// A typed row of a declared table.
pub trait Record: Sized + Send {
    const TABLE: &'static Table;

    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row<'_>) -> AppResult<Self>;

    /// Column/value pairs written on insert.
    fn insert_values(&self) -> Vec<(&'static str, SqlValue)>;
}

pub const MIGRATIONS_TABLE_NAME: &str = "__drizzle_migrations";

pub const MIGRATIONS_TABLE: Table = Table {
    name: MIGRATIONS_TABLE_NAME,
    columns: &[
        Column::auto("id"),
        Column::new("hash"),
        Column::new("tag"),
        Column::new("created_at"),
    ],
};

/// Owned by the migration engine rather than by any migration script.
pub const MIGRATIONS_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS \"__drizzle_migrations\" (\
     \"id\" INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,\
     \"hash\" TEXT NOT NULL,\
     \"tag\" TEXT NOT NULL UNIQUE,\
     \"created_at\" INTEGER NOT NULL DEFAULT (CAST(strftime('%s','now') AS INTEGER) * 1000)\
     )";

/// One applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: Option<i64>,
    pub hash: String,
    pub tag: String,
    pub created_at: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn new(tag: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            id: None,
            hash: hash.into(),
            tag: tag.into(),
            created_at: to_date(now_ms()),
        }
    }
}

impl Record for MigrationRecord {
    const TABLE: &'static Table = &MIGRATIONS_TABLE;

    fn from_row(row: &Row<'_>) -> AppResult<Self> {
        Ok(Self {
            id: row.opt_i64("id")?,
            hash: row.text("hash")?,
            tag: row.text("tag")?,
            created_at: row.timestamp("created_at")?,
        })
    }

    fn insert_values(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("id", self.id.map(SqlValue::Integer).unwrap_or(SqlValue::Null)),
            ("hash", self.hash.as_str().into()),
            ("tag", self.tag.as_str().into()),
            ("created_at", self.created_at.timestamp_millis().into()),
        ]
    }
}

pub const APP_META_TABLE_NAME: &str = "app_meta";

pub const APP_META_TABLE: Table = Table {
    name: APP_META_TABLE_NAME,
    columns: &[Column::new("key"), Column::new("value")],
};

pub const APP_META_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS \"app_meta\" (\
     \"key\" TEXT PRIMARY KEY NOT NULL,\
     \"value\" TEXT NOT NULL\
     )";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMeta {
    pub key: String,
    pub value: String,
}

impl Record for AppMeta {
    const TABLE: &'static Table = &APP_META_TABLE;

    fn from_row(row: &Row<'_>) -> AppResult<Self> {
        Ok(Self {
            key: row.text("key")?,
            value: row.text("value")?,
        })
    }

    fn insert_values(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("key", self.key.as_str().into()),
            ("value", self.value.as_str().into()),
        ]
    }
}

pub const USER_TABLE: Table = Table {
    name: "user",
    columns: &[
        Column::new("id"),
        Column::new("name"),
        Column::new("created_at"),
    ],
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: crate::id::new_uuid_v7(),
            name: name.into(),
            created_at: Some(to_date(now_ms())),
        }
    }
}

impl Record for User {
    const TABLE: &'static Table = &USER_TABLE;

    fn from_row(row: &Row<'_>) -> AppResult<Self> {
        Ok(Self {
            id: row.text("id")?,
            name: row.text("name")?,
            created_at: row.opt_timestamp("created_at")?,
        })
    }

    fn insert_values(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("id", self.id.as_str().into()),
            ("name", self.name.as_str().into()),
            (
                "created_at",
                self.created_at.map(|t| t.timestamp_millis()).into(),
            ),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Doc,
    Link,
    Image,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Doc => "doc",
            ResourceKind::Link => "link",
            ResourceKind::Image => "image",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "doc" => Ok(ResourceKind::Doc),
            "link" => Ok(ResourceKind::Link),
            "image" => Ok(ResourceKind::Image),
            other => Err(AppError::new(AppError::QUERY_DECODE, "Unknown resource type")
                .with_context("value", other.to_string())),
        }
    }
}

pub const RESOURCE_TABLE: Table = Table {
    name: "resource",
    columns: &[
        Column::new("id"),
        Column::new("type"),
        Column::new("created_at"),
        Column::new("updated_at"),
        Column::new("deleted_at"),
        Column::new("version"),
        Column::new("origin"),
    ],
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub kind: Option<ResourceKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: Option<i64>,
    pub origin: Option<String>,
}

impl Resource {
    pub fn new(kind: ResourceKind) -> Self {
        let now = to_date(now_ms());
        Self {
            id: crate::id::new_uuid_v7(),
            kind: Some(kind),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: Some(0),
            origin: None,
        }
    }
}

impl Record for Resource {
    const TABLE: &'static Table = &RESOURCE_TABLE;

    fn from_row(row: &Row<'_>) -> AppResult<Self> {
        let kind = match row.opt_text("type")? {
            Some(raw) => Some(raw.parse()?),
            None => None,
        };
        Ok(Self {
            id: row.text("id")?,
            kind,
            created_at: row.timestamp("created_at")?,
            updated_at: row.timestamp("updated_at")?,
            deleted_at: row.opt_timestamp("deleted_at")?,
            version: row.opt_i64("version")?,
            origin: row.opt_text("origin")?,
        })
    }

    fn insert_values(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("id", self.id.as_str().into()),
            ("type", self.kind.map(|k| k.as_str()).into()),
            ("created_at", self.created_at.timestamp_millis().into()),
            ("updated_at", self.updated_at.timestamp_millis().into()),
            (
                "deleted_at",
                self.deleted_at.map(|t| t.timestamp_millis()).into(),
            ),
            ("version", self.version.into()),
            ("origin", self.origin.as_deref().into()),
        ]
    }
}
