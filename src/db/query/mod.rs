//! Typed query handle over the proxy executor.
//!
//! Builders validate every column against the record's declared [`Table`]
//! before any SQL is produced. Identifiers are quoted and values are always
//! bound.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::DriverKind;
use crate::db::driver::{DriverAdapter, SqlValue, Tuple};
use crate::db::schema::{quote_ident, Record, Row, Table};
use crate::{AppError, AppResult};

pub mod proxy;

pub use proxy::{DriverRows, ProxyExecutor, QueryMode, StatementKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    fn as_sql(self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

/// The handle the rest of the application queries through. Cheap to clone;
/// every clone shares the same driver.
#[derive(Clone)]
pub struct LocalDb {
    proxy: ProxyExecutor,
}

impl std::fmt::Debug for LocalDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDb")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

impl LocalDb {
    pub fn new(driver: Arc<dyn DriverAdapter>) -> Self {
        Self {
            proxy: ProxyExecutor::new(driver),
        }
    }

    pub fn kind(&self) -> DriverKind {
        self.proxy.kind()
    }

    pub fn select<R: Record>(&self) -> Select<'_, R> {
        Select {
            db: self,
            filters: Filters::new(R::TABLE),
            order: Vec::new(),
            limit: None,
            _record: PhantomData,
        }
    }

    pub async fn insert<R: Record>(&self, record: &R) -> AppResult<u64> {
        let table = R::TABLE;
        let mut values = Vec::new();
        for (column, value) in record.insert_values() {
            let declared = table.ensure_column(column)?;
            // Unset auto-increment keys are assigned by SQLite.
            if declared.auto_increment && value.is_null() {
                continue;
            }
            values.push((column, value));
        }
        let columns: Vec<String> = values.iter().map(|(c, _)| quote_ident(c)).collect();
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table.name),
            columns.join(", "),
            placeholders
        );
        let params: Vec<SqlValue> = values.into_iter().map(|(_, v)| v).collect();
        self.proxy.execute_counted(&sql, &params).await
    }

    pub fn update<R: Record>(&self) -> Update<'_, R> {
        Update {
            db: self,
            sets: Vec::new(),
            filters: Filters::new(R::TABLE),
            _record: PhantomData,
        }
    }

    pub fn delete<R: Record>(&self) -> Delete<'_, R> {
        Delete {
            db: self,
            filters: Filters::new(R::TABLE),
            _record: PhantomData,
        }
    }

    /// Escape hatch for statements the builders don't cover. The statement is
    /// classified by keyword to pick the read or write path.
    pub async fn raw(
        &self,
        sql: &str,
        params: &[SqlValue],
        mode: QueryMode,
    ) -> AppResult<DriverRows> {
        self.proxy.execute(sql, params, mode).await
    }

    /// Runs a write without classification and returns the affected row count.
    pub async fn run(&self, sql: &str, params: &[SqlValue]) -> AppResult<u64> {
        self.proxy.execute_counted(sql, params).await
    }

    /// Runs statements in order inside one transaction.
    pub async fn run_batch(&self, statements: &[String]) -> AppResult<()> {
        self.proxy.driver().execute_batch(statements).await
    }

    pub async fn close(&self) {
        self.proxy.driver().close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.proxy.driver().is_closed()
    }
}

/// Column filters shared by select/update/delete. The first invalid column is
/// kept and reported when the statement runs.
struct Filters {
    table: &'static Table,
    clauses: Vec<(&'static str, SqlValue)>,
    error: Option<AppError>,
}

impl Filters {
    fn new(table: &'static Table) -> Self {
        Self {
            table,
            clauses: Vec::new(),
            error: None,
        }
    }

    fn column(&mut self, name: &str) -> Option<&'static str> {
        match self.table.ensure_column(name) {
            Ok(col) => Some(col.name),
            Err(err) => {
                self.error.get_or_insert(err);
                None
            }
        }
    }

    fn push(&mut self, name: &str, value: SqlValue) {
        if let Some(col) = self.column(name) {
            self.clauses.push((col, value));
        }
    }

    #[allow(clippy::result_large_err)]
    fn check(&mut self) -> AppResult<()> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn render(&self, sql: &mut String, params: &mut Vec<SqlValue>) {
        if self.clauses.is_empty() {
            return;
        }
        let parts: Vec<String> = self
            .clauses
            .iter()
            .map(|(col, value)| {
                // `=` never matches NULL.
                let op = if value.is_null() { "IS" } else { "=" };
                format!("{} {op} ?", quote_ident(col))
            })
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&parts.join(" AND "));
        params.extend(self.clauses.iter().map(|(_, v)| v.clone()));
    }
}

pub struct Select<'a, R: Record> {
    db: &'a LocalDb,
    filters: Filters,
    order: Vec<(&'static str, Order)>,
    limit: Option<u32>,
    _record: PhantomData<R>,
}

impl<'a, R: Record> Select<'a, R> {
    pub fn where_eq(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.filters.push(column, value.into());
        self
    }

    pub fn order_by(mut self, column: &str, order: Order) -> Self {
        if let Some(col) = self.filters.column(column) {
            self.order.push((col, order));
        }
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    fn build(&self) -> (String, Vec<SqlValue>) {
        let table = R::TABLE;
        let columns: Vec<String> = table.column_names().map(quote_ident).collect();
        let mut sql = format!(
            "SELECT {} FROM {}",
            columns.join(", "),
            quote_ident(table.name)
        );
        let mut params = Vec::new();
        self.filters.render(&mut sql, &mut params);
        if !self.order.is_empty() {
            let parts: Vec<String> = self
                .order
                .iter()
                .map(|(col, order)| format!("{} {}", quote_ident(col), order.as_sql()))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&parts.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        (sql, params)
    }

    pub async fn all(mut self) -> AppResult<Vec<R>> {
        self.filters.check()?;
        let (sql, params) = self.build();
        let rows = self.db.proxy.execute(&sql, &params, QueryMode::All).await?;
        decode_rows(rows.rows)
    }

    pub async fn first(mut self) -> AppResult<Option<R>> {
        self.filters.check()?;
        self.limit = Some(1);
        let (sql, params) = self.build();
        let rows = self.db.proxy.execute(&sql, &params, QueryMode::Get).await?;
        match rows.into_first() {
            Some(tuple) => Ok(Some(R::from_row(&Row::new(R::TABLE, &tuple))?)),
            None => Ok(None),
        }
    }
}

#[allow(clippy::result_large_err)]
fn decode_rows<R: Record>(rows: Vec<Tuple>) -> AppResult<Vec<R>> {
    rows.iter()
        .map(|tuple| R::from_row(&Row::new(R::TABLE, tuple)))
        .collect()
}

pub struct Update<'a, R: Record> {
    db: &'a LocalDb,
    sets: Vec<(&'static str, SqlValue)>,
    filters: Filters,
    _record: PhantomData<R>,
}

impl<'a, R: Record> Update<'a, R> {
    pub fn set(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        if let Some(col) = self.filters.column(column) {
            self.sets.push((col, value.into()));
        }
        self
    }

    pub fn where_eq(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.filters.push(column, value.into());
        self
    }

    pub async fn execute(mut self) -> AppResult<u64> {
        self.filters.check()?;
        if self.sets.is_empty() {
            return Err(AppError::new("QUERY/EMPTY_UPDATE", "Update has no columns to set")
                .with_context("table", R::TABLE.name));
        }
        let assignments: Vec<String> = self
            .sets
            .iter()
            .map(|(col, _)| format!("{} = ?", quote_ident(col)))
            .collect();
        let mut sql = format!(
            "UPDATE {} SET {}",
            quote_ident(R::TABLE.name),
            assignments.join(", ")
        );
        let mut params: Vec<SqlValue> = self.sets.iter().map(|(_, v)| v.clone()).collect();
        self.filters.render(&mut sql, &mut params);
        self.db.proxy.execute_counted(&sql, &params).await
    }
}

pub struct Delete<'a, R: Record> {
    db: &'a LocalDb,
    filters: Filters,
    _record: PhantomData<R>,
}

impl<'a, R: Record> Delete<'a, R> {
    pub fn where_eq(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.filters.push(column, value.into());
        self
    }

    pub async fn execute(mut self) -> AppResult<u64> {
        self.filters.check()?;
        let mut sql = format!("DELETE FROM {}", quote_ident(R::TABLE.name));
        let mut params = Vec::new();
        self.filters.render(&mut sql, &mut params);
        self.db.proxy.execute_counted(&sql, &params).await
    }
}
