use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

use super::{BackendError, LargeFileBackend, TransferOptions};
use crate::subprocess::{
    ProcessCommandBuilder, ProcessError, ProcessOutput, ProcessRunner, ProgressControl,
    ProgressHandler, RunOptions,
};

static PERCENT: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(\d{1,3})%").ok());

const SQLITE_HEADER: &[u8] = b"SQLite format 3";

/// Completion fraction from the last `NN%` marker in a progress line
pub fn parse_percent(line: &str) -> Option<f64> {
    let regex = PERCENT.as_ref()?;
    let value: u32 = regex
        .captures_iter(line)
        .last()?
        .get(1)?
        .as_str()
        .parse()
        .ok()?;
    Some(f64::from(value.min(100)) / 100.0)
}

fn is_readonly_db_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("readonly database") || lowered.contains("read-only database")
}

/// [`LargeFileBackend`] backed by the `dvc` command line
pub struct DvcCli {
    runner: Arc<dyn ProcessRunner>,
    executable: String,
    repo_root: PathBuf,
    timeout: Duration,
    remote: Option<String>,
}

impl DvcCli {
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
            remote: None,
        }
    }

    /// Use a named remote instead of the repository default
    pub fn with_remote(mut self, remote: Option<String>) -> Self {
        self.remote = remote;
        self
    }

    fn build(&self, args: &[&str], targets: &[PathBuf]) -> crate::subprocess::ProcessCommand {
        let mut builder = ProcessCommandBuilder::new(&self.executable)
            .current_dir(&self.repo_root)
            .c_locale()
            .env("DVC_NO_ANALYTICS", "1")
            .timeout(self.timeout)
            .args(args);
        for target in targets {
            builder = builder.arg_path(target);
        }
        builder.build()
    }

    fn run_options(options: &TransferOptions) -> RunOptions {
        let mut run = RunOptions::default();
        if let Some(cancel) = &options.cancel {
            run = run.with_cancel(cancel.clone());
        }

        let on_progress = options.on_progress.clone();
        let cancel = options.cancel.clone();
        let handler: ProgressHandler = Arc::new(move |line: &str| {
            if let (Some(report), Some(fraction)) = (&on_progress, parse_percent(line)) {
                report(fraction);
            }
            if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                ProgressControl::Abort
            } else {
                ProgressControl::Continue
            }
        });
        run.with_progress(handler)
    }

    fn remote_args<'a>(&'a self, verb: &'a str) -> Vec<&'a str> {
        let mut args = vec![verb];
        if let Some(remote) = &self.remote {
            args.push("-r");
            args.push(remote.as_str());
        }
        args
    }

    /// Run a dvc command, repairing a read-only local state DB once
    async fn run(
        &self,
        args: &[&str],
        targets: &[PathBuf],
        options: &TransferOptions,
    ) -> Result<ProcessOutput, BackendError> {
        let command = self.build(args, targets);
        match self.runner.run(command.clone(), Self::run_options(options)).await {
            Err(ProcessError::NonZeroExit { message, .. }) if is_readonly_db_error(&message) => {
                tracing::warn!("DVC local state database is read-only; repairing and retrying");
                let removed = repair_local_state_db(&self.repo_root)?;
                tracing::debug!("Removed {} local state file(s)", removed);
                Ok(self.runner.run(command, Self::run_options(options)).await?)
            }
            other => Ok(other?),
        }
    }
}

/// Delete sqlite state files under `.dvc/tmp`; returns how many were removed
fn repair_local_state_db(repo_root: &Path) -> Result<usize, BackendError> {
    let tmp_dir = repo_root.join(".dvc").join("tmp");
    if !tmp_dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in WalkDir::new(&tmp_dir).into_iter().filter_map(Result::ok) {
        let path = entry.path();
        if !entry.file_type().is_file() || !is_state_db(path) {
            continue;
        }
        std::fs::remove_file(path).map_err(|source| BackendError::Repair {
            path: path.to_path_buf(),
            source,
        })?;
        removed += 1;
    }
    Ok(removed)
}

fn is_state_db(path: &Path) -> bool {
    let by_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("db") || ext.eq_ignore_ascii_case("sqlite"));
    by_extension || has_sqlite_header(path)
}

fn has_sqlite_header(path: &Path) -> bool {
    let mut header = [0u8; 16];
    std::fs::File::open(path)
        .and_then(|mut file| file.read_exact(&mut header))
        .map(|_| header.starts_with(SQLITE_HEADER))
        .unwrap_or(false)
}

#[async_trait]
impl LargeFileBackend for DvcCli {
    async fn track(&self, paths: &[PathBuf], options: TransferOptions) -> Result<(), BackendError> {
        self.run(&["add"], paths, &options).await?;
        Ok(())
    }

    async fn pull(&self, targets: &[PathBuf], options: TransferOptions) -> Result<(), BackendError> {
        self.run(&self.remote_args("pull"), targets, &options).await?;
        Ok(())
    }

    async fn push(&self, targets: &[PathBuf], options: TransferOptions) -> Result<(), BackendError> {
        self.run(&self.remote_args("push"), targets, &options).await?;
        Ok(())
    }

    async fn checkout(&self, targets: &[PathBuf], options: TransferOptions) -> Result<(), BackendError> {
        self.run(&["checkout"], targets, &options).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::subprocess::MockProcessRunner;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn dvc_cli(mock: &MockProcessRunner, root: &Path) -> DvcCli {
        DvcCli::new(Arc::new(mock.clone()), "dvc", root, Duration::from_secs(1800))
    }

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse_percent("Pushing  45%|████  | 9/20"), Some(0.45));
        assert_eq!(parse_percent("stage 10% then 90%"), Some(0.9));
        assert_eq!(parse_percent("weird 250%"), Some(1.0));
        assert_eq!(parse_percent("Everything is up to date."), None);
    }

    #[tokio::test]
    async fn test_push_reports_fractions_and_remote() {
        let mock = MockProcessRunner::new();
        mock.expect_command("dvc")
            .subcommand("push")
            .returns_stdout("stage 10%\nstage 90%\n2 files pushed\n")
            .finish();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let options = TransferOptions::default()
            .with_progress(Arc::new(move |fraction: f64| sink.lock().unwrap().push(fraction)));

        let dvc = dvc_cli(&mock, Path::new("/repo")).with_remote(Some("nas".to_string()));
        dvc.push(&[PathBuf::from("datasets/cam1/data.dvc")], options)
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![0.1, 0.9]);
        assert_eq!(
            mock.command_lines(),
            vec!["dvc push -r nas datasets/cam1/data.dvc"]
        );
        let env = &mock.get_call_history()[0].env;
        assert_eq!(env.get("DVC_NO_ANALYTICS").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_cancel_aborts_streaming_transfer() {
        let mock = MockProcessRunner::new();
        mock.expect_command("dvc")
            .subcommand("pull")
            .returns_stdout("5%\n10%\n")
            .finish();

        let cancel = CancelToken::new();
        cancel.cancel();
        let dvc = dvc_cli(&mock, Path::new("/repo"));
        let err = dvc
            .pull(&[], TransferOptions::default().with_cancel(cancel))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_readonly_db_is_repaired_once() {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join(".dvc/tmp");
        std::fs::create_dir_all(tmp.join("index")).unwrap();
        std::fs::write(tmp.join("btime.db"), b"x").unwrap();
        std::fs::write(tmp.join("index/state"), b"SQLite format 3\0rest").unwrap();
        std::fs::write(tmp.join("lock"), b"keep me").unwrap();

        let mock = MockProcessRunner::new();
        mock.expect_command("dvc")
            .subcommand("checkout")
            .returns_exit_code(1)
            .returns_stderr("ERROR: attempt to write a readonly database")
            .times(1)
            .finish();
        mock.expect_command("dvc").subcommand("checkout").finish();

        let dvc = dvc_cli(&mock, dir.path());
        dvc.checkout(&[], TransferOptions::default()).await.unwrap();

        assert!(mock.verify_called("dvc", 2));
        assert!(!tmp.join("btime.db").exists());
        assert!(!tmp.join("index/state").exists());
        assert!(tmp.join("lock").exists());
    }

    #[tokio::test]
    async fn test_readonly_db_second_failure_surfaces() {
        let dir = TempDir::new().unwrap();
        let mock = MockProcessRunner::new();
        mock.expect_command("dvc")
            .returns_exit_code(1)
            .returns_stderr("attempt to write a read-only database")
            .finish();

        let dvc = dvc_cli(&mock, dir.path());
        let err = dvc.track(&[PathBuf::from("datasets/cam1/data")], TransferOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Process(ProcessError::NonZeroExit { .. })));
        assert!(mock.verify_called("dvc", 2));
    }
}
