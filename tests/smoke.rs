//! Smoke tests -- verify the binary runs and key subcommands parse.

use assert_cmd::Command;

fn flowtest() -> Command {
    let mut cmd = Command::cargo_bin("flowtest").unwrap();
    cmd.env_remove("FLOWTEST_CONFIG");
    cmd
}

/// Config pointing the database into `dir`, with the scheduler off.
fn config_in(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("flowtest.toml");
    let db = dir.join("flowtest.db");
    std::fs::write(
        &path,
        format!(
            "[storage]\ndb_path = {:?}\n\n[repositories]\ncheckout_root = {:?}\n\n[scheduler]\nenabled = false\n",
            db.to_string_lossy(),
            dir.join("repos").to_string_lossy()
        ),
    )
    .unwrap();
    path
}

#[test]
fn test_cli_help() {
    flowtest()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Automated test discovery"));
}

#[test]
fn test_cli_version() {
    flowtest()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("flowtest"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        &["serve", "--help"][..],
        &["run", "--help"],
        &["sync", "--help"],
        &["repo", "add", "--help"],
        &["schedule", "dry-run", "--help"],
        &["status", "--help"],
    ] {
        flowtest().args(args).assert().success();
    }
}

#[test]
fn test_run_requires_ids() {
    flowtest().arg("run").assert().failure();
}

#[test]
fn test_missing_explicit_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    flowtest()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .args(["schedule", "dry-run"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("failed to read config file"));
}

#[test]
fn test_empty_dry_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    flowtest()
        .arg("--config")
        .arg(&config)
        .args(["schedule", "dry-run", "--hours", "12"])
        .assert()
        .success()
        .stdout(predicates::str::contains("No runs scheduled in next 12 hours."));
}

#[test]
fn test_status_of_unknown_run_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    flowtest()
        .arg("--config")
        .arg(&config)
        .args(["status", "7"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("test run 7 not found"));
}

#[test]
fn test_project_and_manual_case_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    flowtest()
        .arg("--config")
        .arg(&config)
        .args(["project", "add", "web"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Project 'web' added with id 1."));
    flowtest()
        .arg("--config")
        .arg(&config)
        .args(["case", "add", "--project", "1", "--title", "checkout by hand", "--manual"])
        .assert()
        .success();

    // Manual cases are never executed, so the batch reports a failure.
    flowtest()
        .arg("--config")
        .arg(&config)
        .args(["run", "1"])
        .assert()
        .failure()
        .stdout(predicates::str::contains("checkout by hand"))
        .stderr(predicates::str::contains("1 of 1 tests did not pass"));
}
