//! Runtime wiring
//!
//! Builds the production engine from an [`EngineConfig`]: real `git` and
//! `dvc` CLIs behind the watchdog runner, and the lock share on disk.

use std::sync::Arc;
use tracing::debug;

use crate::backend::{DvcCli, GitCli};
use crate::config::EngineConfig;
use crate::lock::{FsLockStorage, LockManager, LockOwner};
use crate::subprocess::{ProcessRunner, TokioProcessRunner};
use crate::workflow::{WorkflowEngine, WorkflowSupervisor};
use crate::workspace::Workspace;

/// Lock manager acting as the current OS user on this host
pub fn lock_manager(config: &EngineConfig) -> LockManager {
    LockManager::new(
        Arc::new(FsLockStorage::new(&config.locks_root)),
        LockOwner::current(),
    )
}

/// Engine using `runner` for every backend subprocess
pub fn build_engine_with(config: &EngineConfig, runner: Arc<dyn ProcessRunner>) -> WorkflowEngine {
    debug!(
        "Workspace {}, locks {}",
        config.workspace_root.display(),
        config.locks_root.display()
    );

    let git = GitCli::new(
        runner.clone(),
        &config.git_executable,
        &config.workspace_root,
        config.git_timeout,
    );
    let dvc = DvcCli::new(
        runner,
        &config.dvc_executable,
        &config.workspace_root,
        config.dvc_timeout,
    )
    .with_remote(config.dvc_remote.clone());

    WorkflowEngine::new(
        Arc::new(git),
        Arc::new(dvc),
        lock_manager(config),
        Workspace::new(&config.workspace_root),
        config.engine_settings(),
    )
}

pub fn build_engine(config: &EngineConfig) -> WorkflowEngine {
    build_engine_with(config, Arc::new(TokioProcessRunner))
}

pub fn build_supervisor(config: &EngineConfig) -> WorkflowSupervisor {
    WorkflowSupervisor::new(build_engine(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::MockProcessRunner;
    use crate::workflow::WorkflowRequest;
    use crate::workflow::WorkflowState;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_engine_runs_git_in_workspace() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            workspace_root: dir.path().join("clone"),
            locks_root: dir.path().join("locks"),
            ..EngineConfig::default()
        };

        let runner = MockProcessRunner::new();
        runner
            .expect_command("git")
            .subcommand("reset")
            .returns_exit_code(0)
            .finish();
        runner
            .expect_command("git")
            .subcommand("clean")
            .returns_exit_code(0)
            .finish();
        runner
            .expect_command("git")
            .subcommand("checkout")
            .returns_exit_code(0)
            .finish();
        runner
            .expect_command("git")
            .subcommand("pull")
            .returns_exit_code(0)
            .finish();
        runner
            .expect_command("dvc")
            .returns_exit_code(0)
            .finish();

        let engine = build_engine_with(&config, Arc::new(runner.clone()));
        let outcome = engine
            .start(WorkflowRequest::ReturnToLatest {
                dataset_id: "cam1".to_string(),
            })
            .wait()
            .await;

        assert_eq!(outcome.state, WorkflowState::Completed, "{:?}", outcome.error);
        let history = runner.get_call_history();
        assert!(history
            .iter()
            .all(|cmd| cmd.working_dir.as_deref() == Some(config.workspace_root.as_path())));
        assert!(runner.verify_called("dvc", 2));
    }
}
