//! Integration tests for the CLI interface
//!
//! Every test points the binary at a scratch workspace and lock share through
//! an explicit config file, so no test touches a real remote.

use assert_cmd::Command;
use chrono::Utc;
use predicates::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use datagest::lock::{FsLockStorage, LockManager, LockOwner};

struct CliContext {
    temp_dir: TempDir,
}

impl CliContext {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = format!(
            "workspace_root: {}\nlocks_root: {}\nlock_ttl: 1h\n",
            temp_dir.path().join("workspace").display(),
            temp_dir.path().join("locks").display()
        );
        std::fs::write(temp_dir.path().join("config.yaml"), config).unwrap();
        Self { temp_dir }
    }

    fn locks_root(&self) -> PathBuf {
        self.temp_dir.path().join("locks")
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("datagest").unwrap();
        cmd.arg("--config")
            .arg(self.temp_dir.path().join("config.yaml"))
            .env_remove("DATAGEST_ADMIN_MODE")
            .env_remove("DATAGEST_LOCKS_ROOT")
            .env_remove("RUST_LOG");
        cmd
    }

    fn locks_as(&self, user: &str) -> LockManager {
        LockManager::new(
            Arc::new(FsLockStorage::new(self.locks_root())),
            LockOwner::named(user, &format!("{}-workstation", user)),
        )
    }

    fn lock_file_exists(&self, dataset_id: &str) -> bool {
        self.locks_root().join(format!("{}.lock", dataset_id)).exists()
    }
}

#[test]
fn test_cli_help_lists_workflows() {
    let mut cmd = Command::cargo_bin("datagest").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("import"))
        .stdout(predicate::str::contains("return-latest"));
}

#[test]
fn test_invalid_command() {
    let mut cmd = Command::cargo_bin("datagest").unwrap();
    cmd.arg("invalid-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn test_restore_without_confirmation_is_refused() {
    let context = CliContext::new();
    context
        .cmd()
        .args(["restore", "cam1", "abc123"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("requires explicit confirmation"));
}

#[test]
fn test_invalid_dataset_id_is_refused() {
    let context = CliContext::new();
    context
        .cmd()
        .args(["lock", "status", "../cam1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("E4002"));
}

#[test]
fn test_missing_config_file_fails() {
    let mut cmd = Command::cargo_bin("datagest").unwrap();
    cmd.args(["--config", "/nonexistent/datagest.yaml", "lock", "status", "cam1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("/nonexistent/datagest.yaml"));
}

#[test]
fn test_bad_environment_override_fails() {
    let context = CliContext::new();
    context
        .cmd()
        .env("DATAGEST_LOCK_TTL", "soon")
        .args(["lock", "status", "cam1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("DATAGEST_LOCK_TTL"));
}

#[test]
fn test_lock_status_free() {
    let context = CliContext::new();
    context
        .cmd()
        .args(["lock", "status", "cam1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cam1 is not locked."));
}

#[tokio::test]
async fn test_lock_status_names_holder() {
    let context = CliContext::new();
    context
        .locks_as("alice")
        .acquire("cam1", Duration::from_secs(3600))
        .await
        .unwrap();

    context
        .cmd()
        .args(["lock", "status", "cam1"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Dataset locked by alice on alice-workstation since",
        ))
        .stdout(predicate::str::contains("Lease expires"));
}

#[tokio::test]
async fn test_unlock_live_lock_requires_force() {
    let context = CliContext::new();
    context
        .locks_as("alice")
        .acquire("cam1", Duration::from_secs(3600))
        .await
        .unwrap();

    context
        .cmd()
        .args(["lock", "unlock", "cam1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--force"));

    context
        .cmd()
        .args(["lock", "unlock", "cam1", "--force"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("admin_mode"));
    assert!(context.lock_file_exists("cam1"));

    context
        .cmd()
        .env("DATAGEST_ADMIN_MODE", "true")
        .args(["lock", "unlock", "cam1", "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed lock for cam1."));
    assert!(!context.lock_file_exists("cam1"));
}

#[tokio::test]
async fn test_unlock_stale_lock_without_force() {
    let context = CliContext::new();
    let five_hours_ago = Utc::now() - chrono::Duration::hours(5);
    context
        .locks_as("bob")
        .with_clock(move || five_hours_ago)
        .acquire("cam1", Duration::from_secs(3600))
        .await
        .unwrap();

    context
        .cmd()
        .args(["lock", "status", "cam1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stale since"));

    context
        .cmd()
        .args(["lock", "unlock", "cam1"])
        .assert()
        .success();
    assert!(!context.lock_file_exists("cam1"));
}

#[test]
fn test_unreadable_lock_counts_as_held() {
    let context = CliContext::new();
    std::fs::create_dir_all(context.locks_root()).unwrap();
    std::fs::write(context.locks_root().join("cam1.lock"), "not json").unwrap();

    context
        .cmd()
        .args(["lock", "status", "cam1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("unreadable lock file"));

    context
        .cmd()
        .args(["lock", "unlock", "cam1"])
        .assert()
        .code(2);
    assert!(context.lock_file_exists("cam1"));
}
