use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::error::ProcessError;
use super::runner::{
    ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner, ProgressControl, RunOptions,
};

/// Failure a mock expectation can produce instead of an exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Timeout,
    Cancelled,
    NotFound,
}

#[derive(Clone)]
pub struct MockProcessRunner {
    expectations: Arc<Mutex<Vec<MockExpectation>>>,
    call_history: Arc<Mutex<Vec<ProcessCommand>>>,
}

type ArgsMatcher = Box<dyn Fn(&[String]) -> bool + Send + Sync>;

struct MockExpectation {
    program: String,
    args_matcher: Option<ArgsMatcher>,
    response: ProcessOutput,
    failure: Option<MockFailure>,
    remaining: Option<usize>,
}

impl MockExpectation {
    fn matches(&self, command: &ProcessCommand) -> bool {
        if self.program != command.program || self.remaining == Some(0) {
            return false;
        }
        match &self.args_matcher {
            Some(matcher) => matcher(&command.args),
            None => true,
        }
    }
}

pub struct MockCommandConfig {
    runner: MockProcessRunner,
    expectation: MockExpectation,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockProcessRunner {
    pub fn new() -> Self {
        Self {
            expectations: Arc::new(Mutex::new(Vec::new())),
            call_history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a canned response. Expectations are consulted in
    /// registration order; one limited with `times(n)` stops matching after
    /// `n` calls so later expectations for the same command take over.
    pub fn expect_command(&self, program: &str) -> MockCommandConfig {
        MockCommandConfig {
            runner: self.clone(),
            expectation: MockExpectation {
                program: program.to_string(),
                args_matcher: None,
                response: ProcessOutput {
                    status: ExitStatus::Success,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: Duration::from_millis(10),
                },
                failure: None,
                remaining: None,
            },
        }
    }

    pub fn verify_called(&self, program: &str, times: usize) -> bool {
        let history = guard(&self.call_history);
        history.iter().filter(|cmd| cmd.program == program).count() == times
    }

    pub fn get_call_history(&self) -> Vec<ProcessCommand> {
        guard(&self.call_history).clone()
    }

    /// Call history rendered as command lines, handy for assertions
    pub fn command_lines(&self) -> Vec<String> {
        guard(&self.call_history)
            .iter()
            .map(ProcessCommand::display)
            .collect()
    }

    fn next_response(
        &self,
        command: &ProcessCommand,
    ) -> Result<(ProcessOutput, Option<MockFailure>), ProcessError> {
        let mut expectations = guard(&self.expectations);
        let expectation = expectations
            .iter_mut()
            .find(|expectation| expectation.matches(command))
            .ok_or_else(|| {
                ProcessError::MockExpectationNotMet(format!(
                    "No expectation found for command: {}",
                    command.display()
                ))
            })?;

        if let Some(remaining) = expectation.remaining.as_mut() {
            *remaining -= 1;
        }
        Ok((expectation.response.clone(), expectation.failure))
    }
}

#[async_trait]
impl ProcessRunner for MockProcessRunner {
    async fn run(
        &self,
        command: ProcessCommand,
        options: RunOptions,
    ) -> Result<ProcessOutput, ProcessError> {
        guard(&self.call_history).push(command.clone());

        let (response, failure) = self.next_response(&command)?;

        if let Some(handler) = &options.on_progress {
            for line in response.stdout.lines().chain(response.stderr.lines()) {
                if handler(line) == ProgressControl::Abort {
                    return Err(ProcessError::Cancelled {
                        command: command.display(),
                    });
                }
            }
        }

        match failure {
            Some(MockFailure::Timeout) => Err(ProcessError::Timeout {
                command: command.display(),
                timeout: command.timeout.unwrap_or_default(),
            }),
            Some(MockFailure::Cancelled) => Err(ProcessError::Cancelled {
                command: command.display(),
            }),
            Some(MockFailure::NotFound) => Err(ProcessError::CommandNotFound(command.program)),
            None => response.into_result(&command),
        }
    }
}

impl MockCommandConfig {
    pub fn with_args<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.expectation.args_matcher = Some(Box::new(matcher));
        self
    }

    /// Match when the first argument is the given subcommand
    pub fn subcommand(self, name: &str) -> Self {
        let name = name.to_string();
        self.with_args(move |args| args.first() == Some(&name))
    }

    pub fn returns_stdout(mut self, stdout: &str) -> Self {
        self.expectation.response.stdout = stdout.to_string();
        self
    }

    pub fn returns_stderr(mut self, stderr: &str) -> Self {
        self.expectation.response.stderr = stderr.to_string();
        self
    }

    pub fn returns_exit_code(mut self, code: i32) -> Self {
        self.expectation.response.status = if code == 0 {
            ExitStatus::Success
        } else {
            ExitStatus::Error(code)
        };
        self
    }

    pub fn fails_with(mut self, failure: MockFailure) -> Self {
        self.expectation.failure = Some(failure);
        self
    }

    pub fn times(mut self, n: usize) -> Self {
        self.expectation.remaining = Some(n);
        self
    }

    pub fn finish(self) {
        guard(&self.runner.expectations).push(self.expectation);
    }
}

impl Default for MockProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}
