use assert_cmd::Command;
use tempfile::tempdir;

fn waystone(data_dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("waystone").expect("binary");
    cmd.env("WAYSTONE_LOG", "off")
        .env_remove("WAYSTONE_IN_MEMORY")
        .env_remove("WAYSTONE_DRIVER")
        .arg("--data-dir")
        .arg(data_dir);
    cmd
}

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn list_prints_embedded_tags_in_order() {
    let dir = tempdir().unwrap();
    let output = waystone(dir.path()).arg("list").output().unwrap();
    assert!(output.status.success());
    let tags: Vec<String> = stdout(&output).lines().map(str::to_string).collect();
    assert_eq!(tags, vec!["0000_initial", "0001_resource_indexes"]);
}

#[test]
fn status_reports_pending_until_migrated() {
    for driver in ["native", "embedded"] {
        let dir = tempdir().unwrap();

        let output = waystone(dir.path())
            .args(["--driver", driver, "status"])
            .output()
            .unwrap();
        assert_eq!(output.status.code(), Some(2), "{driver}");
        assert!(stdout(&output).contains("pending"));

        let output = waystone(dir.path())
            .args(["--driver", driver, "migrate", "--json"])
            .output()
            .unwrap();
        assert!(output.status.success(), "{driver}: {output:?}");
        let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(
            report["applied"],
            serde_json::json!(["0000_initial", "0001_resource_indexes"])
        );
        assert_eq!(report["head"], "0001_resource_indexes");

        let output = waystone(dir.path())
            .args(["--driver", driver, "status", "--json"])
            .output()
            .unwrap();
        assert_eq!(output.status.code(), Some(0), "{driver}");
        let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(status["entries"][0]["status"], "applied");
        assert_eq!(status["database"], "local");
    }
}

#[test]
fn second_migrate_applies_nothing() {
    let dir = tempdir().unwrap();
    waystone(dir.path()).arg("migrate").assert().success();
    let output = waystone(dir.path())
        .args(["migrate", "--json"])
        .output()
        .unwrap();
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["applied"], serde_json::json!([]));
    assert!(report["states"]
        .as_array()
        .unwrap()
        .contains(&serde_json::json!("head_current")));
}

#[test]
fn meta_values_and_client_id_persist() {
    let dir = tempdir().unwrap();
    waystone(dir.path())
        .args(["--name", "profile", "meta", "set", "theme", "dark"])
        .assert()
        .success();
    let output = waystone(dir.path())
        .args(["--name", "profile", "meta", "get", "theme"])
        .output()
        .unwrap();
    assert_eq!(stdout(&output).trim(), "dark");
    assert!(dir.path().join("profile.db").exists());

    waystone(dir.path())
        .args(["--name", "profile", "meta", "get", "missing"])
        .assert()
        .code(1);

    let first = waystone(dir.path())
        .args(["meta", "client-id"])
        .output()
        .unwrap();
    let second = waystone(dir.path())
        .args(["meta", "client-id"])
        .output()
        .unwrap();
    assert!(first.status.success());
    assert_eq!(stdout(&first), stdout(&second));
    assert_eq!(stdout(&first).trim().len(), 36);
}

#[test]
fn invalid_database_name_fails_with_code() {
    let dir = tempdir().unwrap();
    let output = waystone(dir.path())
        .args(["--name", "../x", "migrate"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("DB/INVALID_NAME"));
}

#[test]
fn status_leaves_a_fresh_directory_without_a_database() {
    let dir = tempdir().unwrap();
    let output = waystone(dir.path()).arg("status").output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(!dir.path().join("local.db").exists());
    assert!(!dir.path().join("local.db.lock").exists());
}

#[test]
fn status_and_migrate_report_a_held_lock_at_the_top_level() {
    let dir = tempdir().unwrap();
    waystone(dir.path()).arg("migrate").assert().success();
    let _held = waystone_lib::db::DbLock::acquire(&dir.path().join("local.db")).unwrap();

    for command in ["status", "migrate"] {
        let output = waystone(dir.path()).arg(command).output().unwrap();
        assert_eq!(output.status.code(), Some(1), "{command}");
        let err: serde_json::Value = serde_json::from_slice(&output.stderr).unwrap();
        assert_eq!(err["code"], "DB/LOCKED", "{command}");
        assert!(err["context"]["operation"].is_string(), "{command}");
    }
}

#[test]
fn on_disk_runs_install_the_rotating_log_sink() {
    let dir = tempdir().unwrap();
    waystone(dir.path()).arg("migrate").assert().success();
    assert!(dir.path().join("logs").is_dir());
}
