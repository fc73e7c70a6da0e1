use anyhow::Result;
use tempfile::tempdir;
use waystone_lib::{DatabaseService, DbConfig, DbName, Journal, MigrationState};

mod util;

#[tokio::test]
async fn fresh_database_reaches_embedded_head_on_both_drivers() -> Result<()> {
    let journal = Journal::embedded()?;
    let expected: Vec<String> = journal.entries().iter().map(|e| e.tag.clone()).collect();

    for driver in util::DRIVERS {
        let dir = tempdir()?;
        let mut service = DatabaseService::new(DbConfig::new(dir.path(), driver))?;
        let db = service.initialize(&DbName::default()).await?;

        assert_eq!(util::recorded_tags(&db).await, expected, "{driver}");
        for table in ["app_meta", "user", "resource", "__drizzle_migrations"] {
            assert!(
                util::object_exists(&db, "table", table).await,
                "{driver}: expected table `{table}`"
            );
        }
        for index in ["resource_type_idx", "resource_updated_at_idx"] {
            assert!(
                util::object_exists(&db, "index", index).await,
                "{driver}: expected index `{index}`"
            );
        }
        let report = service.report().cloned().unwrap_or_default();
        assert_eq!(report.states.first(), Some(&MigrationState::Unchecked));
        assert!(report.states.contains(&MigrationState::TablesMissing));
        service.destroy().await;

        assert!(dir.path().join("local.db").exists(), "{driver}: db file");
    }
    Ok(())
}

#[tokio::test]
async fn second_initialize_adds_no_records() -> Result<()> {
    for driver in util::DRIVERS {
        let dir = tempdir()?;
        let name = DbName::new("second_run")?;

        let mut first = util::file_service(dir.path(), driver, util::two_step_journal());
        first.initialize(&name).await?;
        first.destroy().await;

        let mut second = util::file_service(dir.path(), driver, util::two_step_journal());
        let db = second.initialize(&name).await?;
        let report = second.report().cloned().unwrap_or_default();
        assert!(report.was_current(), "{driver}: {:?}", report.states);
        assert!(report.applied.is_empty());
        assert_eq!(util::recorded_tags(&db).await, vec!["0001_init", "0002_add_index"]);
        // The seed insert ran exactly once.
        assert_eq!(util::count(&db, "note").await, 1);
        second.destroy().await;
    }
    Ok(())
}

#[tokio::test]
async fn verify_on_live_handle_is_idempotent() -> Result<()> {
    for driver in util::DRIVERS {
        let mut service = util::memory_service(driver, util::two_step_journal());
        let db = service.initialize(&DbName::default()).await?;
        let report = service.verify().await?;
        assert!(report.was_current());
        assert_eq!(util::recorded_tags(&db).await.len(), 2);
        service.destroy().await;
    }
    Ok(())
}
