//! Bounded execution of backend command-line tools
//!
//! Every invocation carries a wall-clock timeout. When it elapses, or the
//! caller aborts through the progress handler or cancel token, the whole
//! process group is terminated before `run` returns.

pub mod builder;
pub mod error;
pub mod mock;
pub mod runner;


pub use builder::ProcessCommandBuilder;
pub use error::ProcessError;
pub use mock::{MockCommandConfig, MockFailure, MockProcessRunner};
pub use runner::{
    ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner, ProgressControl, ProgressHandler,
    RunOptions, TokioProcessRunner,
};
