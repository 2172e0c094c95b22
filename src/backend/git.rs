use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::{
    BackendError, ChangeKind, CommitInfo, CommitOutcome, FileChange, Head, PushOutcome,
    VcsBackend, WorkspaceStatus,
};
use crate::retry::{is_non_fast_forward, is_nothing_to_commit};
use crate::subprocess::{
    ProcessCommandBuilder, ProcessError, ProcessOutput, ProcessRunner, RunOptions,
};

const FIELD_SEP: char = '\u{1f}';

/// [`VcsBackend`] backed by the `git` command line
pub struct GitCli {
    runner: Arc<dyn ProcessRunner>,
    executable: String,
    repo_root: PathBuf,
    timeout: Duration,
}

impl GitCli {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        executable: &str,
        repo_root: &Path,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            executable: executable.to_string(),
            repo_root: repo_root.to_path_buf(),
            timeout,
        }
    }

    fn command(&self) -> ProcessCommandBuilder {
        ProcessCommandBuilder::new(&self.executable)
            .current_dir(&self.repo_root)
            .c_locale()
            .env("GIT_TERMINAL_PROMPT", "0")
            .timeout(self.timeout)
    }

    async fn git(&self, args: &[&str]) -> Result<ProcessOutput, ProcessError> {
        let command = self.command().args(args).build();
        self.runner.run(command, RunOptions::default()).await
    }

    async fn git_with_paths(&self, args: &[&str], paths: &[PathBuf]) -> Result<ProcessOutput, ProcessError> {
        let mut builder = self.command().args(args).arg("--");
        for path in paths {
            builder = builder.arg_path(path);
        }
        self.runner.run(builder.build(), RunOptions::default()).await
    }

    fn parse_error(operation: &str, detail: impl Into<String>) -> BackendError {
        BackendError::Parse {
            tool: "git",
            operation: operation.to_string(),
            detail: detail.into(),
        }
    }
}

#[async_trait]
impl VcsBackend for GitCli {
    async fn stage(&self, paths: &[PathBuf]) -> Result<(), BackendError> {
        let existing: Vec<PathBuf> = paths
            .iter()
            .filter(|path| self.repo_root.join(path).exists())
            .cloned()
            .collect();

        let skipped = paths.len() - existing.len();
        if skipped > 0 {
            tracing::debug!("Skipping {} path(s) that no longer exist", skipped);
        }
        if existing.is_empty() {
            return Ok(());
        }

        self.git_with_paths(&["add"], &existing).await?;
        Ok(())
    }

    async fn stage_all(&self, path: &Path) -> Result<(), BackendError> {
        self.git_with_paths(&["add", "-A"], &[path.to_path_buf()])
            .await?;
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<CommitOutcome, BackendError> {
        match self.git(&["commit", "-m", message]).await {
            Ok(_) => {}
            Err(ProcessError::NonZeroExit { message, .. }) if is_nothing_to_commit(&message) => {
                tracing::info!("Nothing to commit");
                return Ok(CommitOutcome::NoChanges);
            }
            Err(e) => return Err(e.into()),
        }

        let output = self.git(&["rev-parse", "--short", "HEAD"]).await?;
        Ok(CommitOutcome::Created {
            revision: output.stdout.trim().to_string(),
        })
    }

    async fn push(&self, remote: &str, branch: &str) -> Result<PushOutcome, BackendError> {
        match self.git(&["push", remote, branch]).await {
            Ok(_) => Ok(PushOutcome::Pushed),
            Err(ProcessError::NonZeroExit { message, .. }) if is_non_fast_forward(&message) => {
                tracing::warn!("Push to {}/{} rejected: remote has new commits", remote, branch);
                Ok(PushOutcome::RejectedNonFastForward)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn pull(&self, remote: &str, branch: &str) -> Result<(), BackendError> {
        self.git(&["pull", "--rebase", remote, branch]).await?;
        Ok(())
    }

    async fn checkout(&self, revision: &str) -> Result<(), BackendError> {
        self.git(&["checkout", "--quiet", revision]).await?;
        Ok(())
    }

    async fn current_head(&self) -> Result<Head, BackendError> {
        match self.git(&["symbolic-ref", "--short", "-q", "HEAD"]).await {
            Ok(output) => return Ok(Head::Attached(output.stdout.trim().to_string())),
            Err(ProcessError::NonZeroExit { code: 1, .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let output = self.git(&["rev-parse", "--short", "HEAD"]).await?;
        Ok(Head::Detached(output.stdout.trim().to_string()))
    }

    async fn status(&self, path: Option<&Path>) -> Result<WorkspaceStatus, BackendError> {
        let args = ["status", "--porcelain=v1", "--branch", "--untracked-files=all"];
        let output = match path {
            Some(path) => self.git_with_paths(&args, &[path.to_path_buf()]).await?,
            None => self.git(&args).await?,
        };
        parse_status(&output.stdout).ok_or_else(|| Self::parse_error("status", output.stdout))
    }

    async fn discard_local_changes(&self) -> Result<(), BackendError> {
        self.git(&["reset", "--hard", "--quiet"]).await?;
        self.git(&["clean", "-fdq"]).await?;
        Ok(())
    }

    async fn log(&self, path: &Path, max: usize) -> Result<Vec<CommitInfo>, BackendError> {
        let count = format!("-n{}", max);
        let output = self
            .git_with_paths(
                &["log", count.as_str(), "--format=%h%x1f%an%x1f%aI%x1f%s"],
                &[path.to_path_buf()],
            )
            .await?;
        parse_log(&output.stdout).map_err(|line| Self::parse_error("log", line))
    }
}

/// Parse `git status --porcelain=v1 --branch` output
fn parse_status(stdout: &str) -> Option<WorkspaceStatus> {
    let mut status = WorkspaceStatus::default();

    for line in stdout.lines() {
        if let Some(header) = line.strip_prefix("## ") {
            if header.starts_with("HEAD (no branch)") {
                status.detached = true;
            } else {
                let branch = header
                    .strip_prefix("No commits yet on ")
                    .unwrap_or(header)
                    .split("...")
                    .next()
                    .unwrap_or(header)
                    .split_whitespace()
                    .next()?;
                status.branch = Some(branch.to_string());
            }
            continue;
        }

        if line.len() < 4 {
            continue;
        }
        let (code, rest) = line.split_at(2);
        let path = rest.trim_start();
        let path = path.rsplit(" -> ").next().unwrap_or(path);
        let kind = match code {
            "??" => ChangeKind::Untracked,
            c if c.contains('R') => ChangeKind::Renamed,
            c if c.contains('D') => ChangeKind::Deleted,
            c if c.contains('A') => ChangeKind::Added,
            _ => ChangeKind::Modified,
        };
        status.changes.push(FileChange {
            kind,
            path: path.trim_matches('"').to_string(),
        });
    }

    Some(status)
}

/// Parse `git log` output written with unit-separated fields
fn parse_log(stdout: &str) -> Result<Vec<CommitInfo>, String> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.splitn(4, FIELD_SEP).collect();
            let [revision, author, date, summary] = fields[..] else {
                return Err(line.to_string());
            };
            let date = DateTime::parse_from_rfc3339(date)
                .map_err(|_| line.to_string())?
                .with_timezone(&Utc);
            Ok(CommitInfo {
                revision: revision.to_string(),
                author: author.to_string(),
                date,
                summary: summary.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Classified;
    use crate::subprocess::MockProcessRunner;

    fn git_cli(mock: &MockProcessRunner, root: &Path) -> GitCli {
        GitCli::new(Arc::new(mock.clone()), "git", root, Duration::from_secs(300))
    }

    #[test]
    fn test_parse_status_attached() {
        let status = parse_status(
            "## main...origin/main [ahead 1]\n M datasets/cam1/dataset.yaml\n?? datasets/cam1/data/new.png\n D datasets/cam1/data/old.png\n",
        )
        .unwrap();
        assert_eq!(status.branch.as_deref(), Some("main"));
        assert!(!status.detached);
        assert_eq!(
            status.changes,
            vec![
                FileChange {
                    kind: ChangeKind::Modified,
                    path: "datasets/cam1/dataset.yaml".to_string()
                },
                FileChange {
                    kind: ChangeKind::Untracked,
                    path: "datasets/cam1/data/new.png".to_string()
                },
                FileChange {
                    kind: ChangeKind::Deleted,
                    path: "datasets/cam1/data/old.png".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_parse_status_detached_and_rename() {
        let status = parse_status("## HEAD (no branch)\nR  a.dvc -> b.dvc\n").unwrap();
        assert!(status.detached);
        assert_eq!(status.branch, None);
        assert_eq!(status.changes[0].kind, ChangeKind::Renamed);
        assert_eq!(status.changes[0].path, "b.dvc");
    }

    #[test]
    fn test_parse_log() {
        let out = "1a2b3c4\u{1f}Alice\u{1f}2024-05-01T09:30:00+02:00\u{1f}Import cam1: 12 images\n";
        let commits = parse_log(out).unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].revision, "1a2b3c4");
        assert_eq!(commits[0].date.to_rfc3339(), "2024-05-01T07:30:00+00:00");
        assert_eq!(commits[0].summary, "Import cam1: 12 images");

        assert!(parse_log("garbage line\n").is_err());
    }

    #[tokio::test]
    async fn test_commit_nothing_to_commit_is_no_changes() {
        let mock = MockProcessRunner::new();
        mock.expect_command("git")
            .subcommand("commit")
            .returns_exit_code(1)
            .returns_stdout("On branch main\nnothing to commit, working tree clean\n")
            .finish();

        let git = git_cli(&mock, Path::new("/repo"));
        assert_eq!(git.commit("Publish cam1").await.unwrap(), CommitOutcome::NoChanges);
        assert_eq!(mock.command_lines(), vec!["git commit -m Publish cam1"]);
    }

    #[tokio::test]
    async fn test_commit_created_reports_revision() {
        let mock = MockProcessRunner::new();
        mock.expect_command("git").subcommand("commit").finish();
        mock.expect_command("git")
            .subcommand("rev-parse")
            .returns_stdout("9f8e7d6\n")
            .finish();

        let git = git_cli(&mock, Path::new("/repo"));
        assert_eq!(
            git.commit("Import cam1").await.unwrap(),
            CommitOutcome::Created {
                revision: "9f8e7d6".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_push_rejection_is_reported_not_failed() {
        let mock = MockProcessRunner::new();
        mock.expect_command("git")
            .subcommand("push")
            .returns_exit_code(1)
            .returns_stderr(" ! [rejected] main -> main (fetch first)\nerror: failed to push some refs")
            .finish();

        let git = git_cli(&mock, Path::new("/repo"));
        assert_eq!(
            git.push("origin", "main").await.unwrap(),
            PushOutcome::RejectedNonFastForward
        );
    }

    #[tokio::test]
    async fn test_push_auth_failure_is_fatal() {
        let mock = MockProcessRunner::new();
        mock.expect_command("git")
            .subcommand("push")
            .returns_exit_code(128)
            .returns_stderr("fatal: Authentication failed for 'https://host/repo'")
            .finish();

        let git = git_cli(&mock, Path::new("/repo"));
        let err = git.push("origin", "main").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::FatalBackend);
    }

    #[tokio::test]
    async fn test_current_head_detached() {
        let mock = MockProcessRunner::new();
        mock.expect_command("git")
            .subcommand("symbolic-ref")
            .returns_exit_code(1)
            .finish();
        mock.expect_command("git")
            .subcommand("rev-parse")
            .returns_stdout("1a2b3c4\n")
            .finish();

        let git = git_cli(&mock, Path::new("/repo"));
        assert_eq!(
            git.current_head().await.unwrap(),
            Head::Detached("1a2b3c4".to_string())
        );
    }

    #[tokio::test]
    async fn test_stage_skips_missing_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("datasets/cam1")).unwrap();
        std::fs::write(dir.path().join("datasets/cam1/dataset.yaml"), "name: cam1\n").unwrap();

        let mock = MockProcessRunner::new();
        mock.expect_command("git").subcommand("add").finish();

        let git = git_cli(&mock, dir.path());
        git.stage(&[
            PathBuf::from("datasets/cam1/dataset.yaml"),
            PathBuf::from("datasets/cam1/data.dvc"),
        ])
        .await
        .unwrap();
        assert_eq!(
            mock.command_lines(),
            vec!["git add -- datasets/cam1/dataset.yaml"]
        );

        git.stage(&[PathBuf::from("gone.dvc")]).await.unwrap();
        assert_eq!(mock.command_lines().len(), 1);
    }
}
