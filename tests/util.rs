#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::path::Path;

use waystone_lib::db::schema::MigrationRecord;
use waystone_lib::db::Order;
use waystone_lib::{DatabaseService, DbConfig, DriverKind, Journal, LocalDb, QueryMode};

pub const DRIVERS: [DriverKind; 2] = [DriverKind::Native, DriverKind::Embedded];

pub fn file_service(dir: &Path, driver: DriverKind, journal: Journal) -> DatabaseService {
    DatabaseService::with_journal(DbConfig::new(dir, driver), journal)
}

pub fn memory_service(driver: DriverKind, journal: Journal) -> DatabaseService {
    DatabaseService::with_journal(DbConfig::in_memory(driver), journal)
}

pub fn two_step_journal() -> Journal {
    Journal::from_sources(&[
        (
            "0001_init",
            "CREATE TABLE note (id INTEGER PRIMARY KEY, body TEXT NOT NULL);",
        ),
        (
            "0002_add_index",
            "CREATE UNIQUE INDEX note_body_idx ON note (body);\n--> statement-breakpoint\nINSERT INTO note (body) VALUES ('seed');",
        ),
    ])
    .unwrap()
}

/// Applied tags in insertion order.
pub async fn recorded_tags(db: &LocalDb) -> Vec<String> {
    db.select::<MigrationRecord>()
        .order_by("id", Order::Asc)
        .all()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.tag)
        .collect()
}

pub async fn object_exists(db: &LocalDb, kind: &str, name: &str) -> bool {
    let rows = db
        .raw(
            "SELECT 1 FROM sqlite_master WHERE type = ? AND name = ?",
            &[kind.into(), name.into()],
            QueryMode::Get,
        )
        .await
        .unwrap();
    !rows.rows.is_empty()
}

pub async fn count(db: &LocalDb, table: &str) -> i64 {
    let rows = db
        .raw(&format!("SELECT COUNT(*) FROM \"{table}\""), &[], QueryMode::Get)
        .await
        .unwrap();
    rows.rows
        .first()
        .and_then(|r| r.first())
        .and_then(|v| v.as_i64())
        .unwrap_or(-1)
}
