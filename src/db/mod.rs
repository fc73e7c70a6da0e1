//! Local database: drivers, typed queries, the migration journal and engine,
//! and the service that ties them to one open database.

pub mod driver;
pub mod journal;
pub mod lock;
pub mod meta;
pub mod migrate;
pub mod query;
pub mod schema;
pub mod service;

pub use driver::{DriverAdapter, SqlValue, Tuple};
pub use journal::{Journal, JournalEntry, JournalError, MigrationBatch};
pub use lock::{DbLock, LockError};
pub use meta::MetaStore;
pub use migrate::{EntryReport, EntryStatus, MigrationReport, MigrationState, Migrator};
pub use query::{DriverRows, LocalDb, Order, QueryMode};
pub use service::DatabaseService;
