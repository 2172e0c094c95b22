//! # Datagest
//!
//! Versioned image datasets on a shared git + DVC remote, with advisory
//! per-dataset locks on a shared filesystem.
//!
//! ## Usage
//!
//! ```bash
//! datagest import <dataset> <folder> [--replace]
//! datagest publish <dataset> -m "message"
//! datagest fetch <dataset> [--shared]
//! datagest restore <dataset> <revision> --yes
//! datagest return-latest <dataset>
//! datagest lock status <dataset>
//! ```
//!
//! ## Modules
//!
//! - `app` - Binary wiring: logging, fatal error reporting, engine construction
//! - `backend` - `git` and `dvc` command-line adapters behind async traits
//! - `cancel` - Cooperative cancellation token
//! - `config` - YAML configuration with environment overrides
//! - `error` - Error taxonomy shared by every module
//! - `lock` - Advisory dataset locks with stale-lock reclamation
//! - `retry` - Bounded exponential backoff for transient failures
//! - `subprocess` - Subprocess abstraction with timeouts, cancellation and mocks
//! - `workflow` - Workflow plans, the run engine and the supervisor
//! - `workspace` - Dataset layout, image folder checks and metadata
//! - `testing` - Scripted backends and fixtures for tests
pub mod app;
pub mod backend;
pub mod cancel;
pub mod config;
pub mod error;
pub mod lock;
pub mod retry;
pub mod subprocess;
pub mod workflow;
pub mod workspace;

pub mod testing;
