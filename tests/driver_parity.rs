use anyhow::Result;
use waystone_lib::{DbName, QueryMode, SqlValue};

mod util;

#[tokio::test]
async fn both_drivers_return_identical_tuples() -> Result<()> {
    let mut results = Vec::new();
    for driver in util::DRIVERS {
        let mut service = util::memory_service(driver, util::two_step_journal());
        let db = service.initialize(&DbName::default()).await?;
        db.raw(
            "INSERT INTO note (body) VALUES (?), (?)",
            &["alpha".into(), "beta".into()],
            QueryMode::Run,
        )
        .await?;
        let rows = db
            .raw(
                "SELECT id, body, NULL, 1.5, x'0102' FROM note ORDER BY id",
                &[],
                QueryMode::All,
            )
            .await?;
        results.push(rows.rows);
        service.destroy().await;
    }

    assert_eq!(results[0], results[1]);
    assert_eq!(
        results[0][1],
        vec![
            SqlValue::Integer(2),
            SqlValue::Text("alpha".into()),
            SqlValue::Null,
            SqlValue::Real(1.5),
            SqlValue::Blob(vec![1, 2]),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn read_failures_degrade_and_write_failures_surface() -> Result<()> {
    for driver in util::DRIVERS {
        let mut service = util::memory_service(driver, util::two_step_journal());
        let db = service.initialize(&DbName::default()).await?;

        let rows = db.raw("SELECT * FROM missing", &[], QueryMode::All).await?;
        assert!(rows.rows.is_empty(), "{driver}");

        let err = db
            .raw(
                "INSERT INTO note (body) VALUES ('seed') RETURNING id",
                &[],
                QueryMode::Get,
            )
            .await
            .unwrap_err();
        assert!(err.code().starts_with("Sqlite/"), "{driver}: {}", err.code());
        service.destroy().await;
    }
    Ok(())
}

#[tokio::test]
async fn multi_statement_bodies_apply_fully_on_both_drivers() -> Result<()> {
    let mut catalogs = Vec::new();
    for driver in util::DRIVERS {
        let mut service = util::memory_service(driver, util::two_step_journal());
        let db = service.initialize(&DbName::default()).await?;
        db.run_batch(&["CREATE TABLE a (x INTEGER);\nCREATE INDEX a_x ON a (x);".to_string()])
            .await?;
        assert!(util::object_exists(&db, "index", "a_x").await, "{driver}");
        let rows = db
            .raw(
                "SELECT type, name FROM sqlite_master WHERE tbl_name = 'a' ORDER BY name",
                &[],
                QueryMode::All,
            )
            .await?;
        catalogs.push(rows.rows);
        service.destroy().await;
    }
    assert_eq!(catalogs[0], catalogs[1]);
    Ok(())
}
