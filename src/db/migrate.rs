//! Schema currency check and migration runner.
//!
//! One run walks `Unchecked → VerifyingTables → (TablesMissing | TablesPresent)
//! → VerifyingHead → (HeadCurrent | HeadStale) → Applying → Done`. A missing
//! bookkeeping table skips the head check and goes straight to Applying.

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::db::driver::preview;
use crate::db::journal::{Journal, JournalEntry};
use crate::db::query::{LocalDb, Order, QueryMode};
use crate::db::schema::{MigrationRecord, MIGRATIONS_TABLE_DDL, MIGRATIONS_TABLE_NAME};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Unchecked,
    VerifyingTables,
    TablesMissing,
    TablesPresent,
    VerifyingHead,
    HeadCurrent,
    HeadStale,
    Applying,
    Done,
}

/// Outcome of one successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    /// Tags whose recorded hash no longer matches the embedded source.
    pub drifted: Vec<String>,
    pub states: Vec<MigrationState>,
    pub head: Option<String>,
}

impl MigrationReport {
    /// True when the run found the schema current and applied nothing.
    pub fn was_current(&self) -> bool {
        self.states.contains(&MigrationState::HeadCurrent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryStatus {
    Applied,
    Pending,
    Drifted { recorded: String, expected: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryReport {
    pub tag: String,
    #[serde(flatten)]
    pub status: EntryStatus,
}

pub struct Migrator<'a> {
    db: &'a LocalDb,
    journal: &'a Journal,
}

impl<'a> Migrator<'a> {
    pub fn new(db: &'a LocalDb, journal: &'a Journal) -> Self {
        Self { db, journal }
    }

    pub async fn run(&self) -> AppResult<MigrationReport> {
        let mut report = MigrationReport {
            head: self.journal.head().map(str::to_string),
            states: vec![MigrationState::Unchecked],
            ..MigrationReport::default()
        };

        report.states.push(MigrationState::VerifyingTables);
        debug!(target: "waystone::migrator", event = "verify_tables");
        if self.tables_exist().await {
            report.states.push(MigrationState::TablesPresent);
            info!(target: "waystone::migrator", event = "tables_present");

            report.states.push(MigrationState::VerifyingHead);
            if self.head_is_current().await {
                report.states.push(MigrationState::HeadCurrent);
                report.states.push(MigrationState::Done);
                return Ok(report);
            }
            report.states.push(MigrationState::HeadStale);
        } else {
            report.states.push(MigrationState::TablesMissing);
            warn!(target: "waystone::migrator", event = "tables_missing", table = MIGRATIONS_TABLE_NAME);
        }

        report.states.push(MigrationState::Applying);
        self.apply(&mut report).await?;
        report.states.push(MigrationState::Done);
        info!(
            target: "waystone::migrator",
            event = "migrations_applied",
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            head = report.head.as_deref().unwrap_or("none")
        );
        Ok(report)
    }

    /// Catalog probe for the bookkeeping table. Read errors count as absent.
    pub async fn tables_exist(&self) -> bool {
        let probe = self
            .db
            .raw(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
                &[MIGRATIONS_TABLE_NAME.into()],
                QueryMode::Get,
            )
            .await;
        matches!(probe, Ok(rows) if !rows.rows.is_empty())
    }

    /// Compares the newest record's tag with the journal head. Read errors
    /// count as stale.
    pub async fn head_is_current(&self) -> bool {
        let expected = self.journal.head();
        let applied = match self
            .db
            .select::<MigrationRecord>()
            .order_by("id", Order::Desc)
            .first()
            .await
        {
            Ok(record) => record.map(|r| r.tag),
            Err(err) => {
                error!(target: "waystone::migrator", event = "head_check_failed", error = %err);
                return false;
            }
        };
        if applied.as_deref() == expected {
            info!(
                target: "waystone::migrator",
                event = "schema_current",
                head = expected.unwrap_or("none")
            );
            true
        } else {
            warn!(
                target: "waystone::migrator",
                event = "schema_stale",
                expected_head = expected.unwrap_or("none"),
                applied_head = applied.as_deref().unwrap_or("none")
            );
            false
        }
    }

    async fn applied_record(&self, tag: &str) -> Option<MigrationRecord> {
        match self
            .db
            .select::<MigrationRecord>()
            .where_eq("tag", tag)
            .first()
            .await
        {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    target: "waystone::migrator",
                    event = "applied_lookup_failed",
                    tag = %tag,
                    error = %err
                );
                None
            }
        }
    }

    async fn apply(&self, report: &mut MigrationReport) -> AppResult<()> {
        self.db
            .run(MIGRATIONS_TABLE_DDL, &[])
            .await
            .map_err(|e| e.wrap(AppError::MIGRATION_RECORD_FAILED, "Failed to create migration table"))?;

        for entry in self.journal.entries() {
            debug!(target: "waystone::migrator", event = "migration_process", tag = %entry.tag);
            if let Some(existing) = self.applied_record(&entry.tag).await {
                self.note_drift(entry, &existing, report)?;
                info!(target: "waystone::migrator", event = "migration_skip", tag = %entry.tag);
                report.skipped.push(entry.tag.clone());
                continue;
            }
            self.apply_entry(entry).await?;
            report.applied.push(entry.tag.clone());
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn note_drift(
        &self,
        entry: &JournalEntry,
        existing: &MigrationRecord,
        report: &mut MigrationReport,
    ) -> AppResult<()> {
        let expected = self.journal.batch(entry)?.hash;
        if existing.hash != expected {
            warn!(
                target: "waystone::migrator",
                event = "migration_hash_drift",
                tag = %entry.tag,
                recorded = %existing.hash,
                expected = %expected
            );
            report.drifted.push(entry.tag.clone());
        }
        Ok(())
    }

    async fn apply_entry(&self, entry: &JournalEntry) -> AppResult<()> {
        let batch = self.journal.batch(entry)?;
        for stmt in &batch.statements {
            debug!(
                target: "waystone::migrator",
                event = "migration_stmt",
                tag = %batch.tag,
                sql = %preview(stmt)
            );
        }
        if let Err(err) = self.db.run_batch(&batch.statements).await {
            error!(
                target: "waystone::migrator",
                event = "migration_stmt_error",
                tag = %batch.tag,
                error = %err
            );
            return Err(err
                .wrap(AppError::MIGRATION_STATEMENT_FAILED, "Migration statement failed")
                .with_context("tag", batch.tag));
        }

        let record = MigrationRecord::new(&batch.tag, &batch.hash);
        if let Err(err) = self.db.insert(&record).await {
            error!(
                target: "waystone::migrator",
                event = "migration_record_error",
                tag = %batch.tag,
                error = %err
            );
            return Err(err
                .wrap(AppError::MIGRATION_RECORD_FAILED, "Failed to record applied migration")
                .with_context("tag", batch.tag));
        }
        info!(target: "waystone::migrator", event = "migration_applied", tag = %batch.tag);
        Ok(())
    }

    /// Per-entry view without applying anything.
    pub async fn status(&self) -> AppResult<Vec<EntryReport>> {
        let tables = self.tables_exist().await;
        let mut out = Vec::with_capacity(self.journal.len());
        for entry in self.journal.entries() {
            let existing = if tables {
                self.applied_record(&entry.tag).await
            } else {
                None
            };
            let status = match existing {
                None => EntryStatus::Pending,
                Some(record) => {
                    let expected = self.journal.batch(entry)?.hash;
                    if record.hash == expected {
                        EntryStatus::Applied
                    } else {
                        EntryStatus::Drifted {
                            recorded: record.hash,
                            expected,
                        }
                    }
                }
            };
            out.push(EntryReport {
                tag: entry.tag.clone(),
                status,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::DbLocation;
    use crate::db::driver::EmbeddedDriver;

    async fn db() -> LocalDb {
        let driver = EmbeddedDriver::open(&DbLocation::Memory).await.expect("open");
        LocalDb::new(Arc::new(driver))
    }

    fn journal() -> Journal {
        Journal::from_sources(&[
            ("0001_init", "CREATE TABLE t (x INTEGER);"),
            (
                "0002_add_index",
                "CREATE INDEX t_x ON t (x);\n--> statement-breakpoint\nCREATE TABLE u (y TEXT);",
            ),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn fresh_database_walks_the_missing_table_path() {
        let db = db().await;
        let journal = journal();
        let report = Migrator::new(&db, &journal).run().await.unwrap();
        assert_eq!(
            report.states,
            vec![
                MigrationState::Unchecked,
                MigrationState::VerifyingTables,
                MigrationState::TablesMissing,
                MigrationState::Applying,
                MigrationState::Done,
            ]
        );
        assert_eq!(report.applied, vec!["0001_init", "0002_add_index"]);
        assert_eq!(report.head.as_deref(), Some("0002_add_index"));
    }

    #[tokio::test]
    async fn second_run_short_circuits_on_current_head() {
        let db = db().await;
        let journal = journal();
        Migrator::new(&db, &journal).run().await.unwrap();
        let report = Migrator::new(&db, &journal).run().await.unwrap();
        assert!(report.was_current());
        assert!(report.applied.is_empty());
        assert_eq!(report.states.last(), Some(&MigrationState::Done));
    }

    #[tokio::test]
    async fn stale_head_applies_only_new_entries() {
        let db = db().await;
        let first = Journal::from_sources(&[("0001_init", "CREATE TABLE t (x INTEGER);")]).unwrap();
        Migrator::new(&db, &first).run().await.unwrap();

        let report = Migrator::new(&db, &journal()).run().await.unwrap();
        assert!(report.states.contains(&MigrationState::HeadStale));
        assert_eq!(report.skipped, vec!["0001_init"]);
        assert_eq!(report.applied, vec!["0002_add_index"]);
    }

    #[tokio::test]
    async fn statement_failure_carries_the_tag_and_records_nothing() {
        let db = db().await;
        let journal = Journal::from_sources(&[
            ("0001_init", "CREATE TABLE t (x INTEGER);"),
            ("0002_broken", "CREATE TABLE v (;"),
        ])
        .unwrap();
        let err = Migrator::new(&db, &journal).run().await.unwrap_err();
        assert_eq!(err.code(), AppError::MIGRATION_STATEMENT_FAILED);
        assert_eq!(err.context().get("tag"), Some(&"0002_broken".to_string()));

        let status = Migrator::new(&db, &journal).status().await.unwrap();
        assert_eq!(status[0].status, EntryStatus::Applied);
        assert_eq!(status[1].status, EntryStatus::Pending);
    }

    #[tokio::test]
    async fn edited_source_is_reported_as_drift() {
        let db = db().await;
        Migrator::new(&db, &journal()).run().await.unwrap();

        let edited = Journal::from_sources(&[
            ("0001_init", "CREATE TABLE t (x INTEGER); -- edited"),
            (
                "0002_add_index",
                "CREATE INDEX t_x ON t (x);\n--> statement-breakpoint\nCREATE TABLE u (y TEXT);",
            ),
            ("0003_more", "CREATE TABLE w (z INTEGER);"),
        ])
        .unwrap();
        let report = Migrator::new(&db, &edited).run().await.unwrap();
        assert_eq!(report.drifted, vec!["0001_init"]);
        assert_eq!(report.applied, vec!["0003_more"]);

        let status = Migrator::new(&db, &edited).status().await.unwrap();
        assert!(matches!(status[0].status, EntryStatus::Drifted { .. }));
    }

    #[tokio::test]
    async fn empty_journal_is_a_no_op() {
        let db = db().await;
        let journal = Journal::from_sources::<&str, &str>(&[]).unwrap();
        let report = Migrator::new(&db, &journal).run().await.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.head, None);
        // The bookkeeping table now exists and matches the empty head.
        let again = Migrator::new(&db, &journal).run().await.unwrap();
        assert!(again.was_current());
    }
}
