use tracing::{error, info};

use crate::config::{DbConfig, DbLocation, DbName};
use crate::db::driver;
use crate::db::journal::Journal;
use crate::db::lock::DbLock;
use crate::db::migrate::{EntryReport, EntryStatus, MigrationReport, Migrator};
use crate::db::query::LocalDb;
use crate::{AppError, AppResult};

struct ActiveDb {
    name: DbName,
    db: LocalDb,
    report: MigrationReport,
    // Released on drop, after the driver has been closed.
    _lock: Option<DbLock>,
}

/// Owns the open database for one session: the driver, the query handle and
/// the lock on the database file.
pub struct DatabaseService {
    config: DbConfig,
    journal: Journal,
    active: Option<ActiveDb>,
}

impl DatabaseService {
    /// Service over the migrations compiled into the binary.
    #[allow(clippy::result_large_err)]
    pub fn new(config: DbConfig) -> AppResult<Self> {
        let journal = Journal::embedded()?;
        Ok(Self::with_journal(config, journal))
    }

    pub fn with_journal(config: DbConfig, journal: Journal) -> Self {
        Self {
            config,
            journal,
            active: None,
        }
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Opens `name`, brings its schema to the journal head and returns the
    /// query handle. Calling it again for the open database returns the live
    /// handle; a different name closes the current one first.
    pub async fn initialize(&mut self, name: &DbName) -> AppResult<LocalDb> {
        if let Some(active) = &self.active {
            if &active.name == name && !active.db.is_closed() {
                return Ok(active.db.clone());
            }
            self.close().await;
        }

        let location = self.config.location(name);
        info!(
            target: "waystone::db",
            event = "db_initialize",
            name = %name,
            driver = %self.config.driver,
            location = %location
        );

        let lock = match &location {
            DbLocation::File(path) => Some(DbLock::acquire(path)?),
            DbLocation::Memory => None,
        };
        let db = LocalDb::new(driver::open(&self.config, &location).await?);

        let report = match Migrator::new(&db, &self.journal).run().await {
            Ok(report) => report,
            Err(err) => {
                error!(
                    target: "waystone::db",
                    event = "db_initialize_failed",
                    name = %name,
                    error = %err
                );
                db.close().await;
                return Err(err.with_context("db", name.to_string()));
            }
        };

        info!(
            target: "waystone::db",
            event = "db_initialized",
            name = %name,
            applied = report.applied.len(),
            head = report.head.as_deref().unwrap_or("none")
        );
        self.active = Some(ActiveDb {
            name: name.clone(),
            db: db.clone(),
            report,
            _lock: lock,
        });
        Ok(db)
    }

    #[allow(clippy::result_large_err)]
    pub fn db(&self) -> AppResult<LocalDb> {
        let active = self.active.as_ref().ok_or_else(AppError::uninitialized)?;
        if active.db.is_closed() {
            return Err(AppError::closed().with_context("db", active.name.to_string()));
        }
        Ok(active.db.clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| !a.db.is_closed())
            .unwrap_or(false)
    }

    pub fn name(&self) -> Option<&DbName> {
        self.active.as_ref().map(|a| &a.name)
    }

    /// Report from the last engine run on the open database.
    pub fn report(&self) -> Option<&MigrationReport> {
        self.active.as_ref().map(|a| &a.report)
    }

    /// Re-checks schema currency on the live handle, applying anything new.
    pub async fn verify(&mut self) -> AppResult<MigrationReport> {
        let db = self.db()?;
        let report = Migrator::new(&db, &self.journal).run().await?;
        if let Some(active) = self.active.as_mut() {
            active.report = report.clone();
        }
        Ok(report)
    }

    /// Per-entry migration state of `name`, without migrating it. The lock is
    /// taken like `initialize` does. A database file that does not exist yet
    /// is reported as entirely pending and is not created.
    pub async fn status(&self, name: &DbName) -> AppResult<Vec<EntryReport>> {
        if let Some(active) = &self.active {
            if &active.name == name && !active.db.is_closed() {
                return Migrator::new(&active.db, &self.journal).status().await;
            }
        }

        let location = self.config.location(name);
        let _lock = match location.path() {
            Some(path) if !path.exists() => {
                info!(
                    target: "waystone::db",
                    event = "db_status_missing_file",
                    name = %name,
                    location = %location
                );
                return Ok(self
                    .journal
                    .entries()
                    .iter()
                    .map(|entry| EntryReport {
                        tag: entry.tag.clone(),
                        status: EntryStatus::Pending,
                    })
                    .collect());
            }
            Some(path) => Some(DbLock::acquire(path)?),
            None => None,
        };

        let db = LocalDb::new(driver::open(&self.config, &location).await?);
        let entries = Migrator::new(&db, &self.journal).status().await;
        db.close().await;
        entries
    }

    /// Closes the driver and releases the file lock. A no-op when nothing is
    /// open.
    pub async fn close(&mut self) {
        if let Some(active) = self.active.take() {
            active.db.close().await;
            info!(target: "waystone::db", event = "db_closed", name = %active.name);
        }
    }

    pub async fn destroy(mut self) {
        self.close().await;
    }
}
