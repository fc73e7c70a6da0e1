//! Local SQLite bootstrap for the waystone client: driver selection, typed
//! queries and an embedded, hash-tracked migration journal.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod time;

mod id;

pub use config::{DbConfig, DbLocation, DbName, DriverKind};
pub use db::{
    DatabaseService, Journal, LocalDb, MetaStore, MigrationReport, MigrationState, Migrator,
    QueryMode, SqlValue,
};
pub use error::{AppError, AppResult};
pub use id::new_uuid_v7;

/// Installs logging for the binary or an application embedding this crate.
/// With an on-disk config, a rotating file sink is added under its data
/// directory.
pub fn init_logging(config: Option<&DbConfig>) -> anyhow::Result<()> {
    let dir = config.filter(|c| !c.in_memory).map(DbConfig::log_dir);
    logging::init_with(&logging::LogSettings::from_env(dir))
}
