use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, warn};

use datagest::app::{self, AppConfig};
use datagest::backend::VcsBackend;
use datagest::config::{ConfigLoader, EngineConfig};
use datagest::error::WorkflowError;
use datagest::lock::LockState;
use datagest::workflow::{
    RunOutcome, WorkflowEvent, WorkflowRequest, WorkflowState, WorkflowSupervisor,
};
use datagest::workspace::{validate_dataset_id, Workspace};

/// Versioned image datasets on a shared git + dvc remote
#[derive(Parser)]
#[command(name = "datagest", version)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Print workflow events as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a folder of images into a dataset and publish it
    Import {
        dataset: String,
        source: PathBuf,
        /// Replace the dataset's current files instead of adding to them
        #[arg(long)]
        replace: bool,
        /// Note recorded in the dataset metadata
        #[arg(long)]
        note: Option<String>,
    },
    /// Commit and push local edits to a dataset
    Publish {
        dataset: String,
        #[arg(short, long)]
        message: String,
    },
    /// Bring the workspace up to date with the remote
    Fetch {
        dataset: String,
        /// Fetch even when the workspace has local changes
        #[arg(long)]
        allow_dirty: bool,
        /// The workspace is shared with other operators; take the dataset lock
        #[arg(long)]
        shared: bool,
    },
    /// Check out a previous version of a dataset
    Restore {
        dataset: String,
        revision: String,
        /// Confirm that the workspace should move to the old version
        #[arg(long)]
        yes: bool,
    },
    /// Discard local changes and return to the latest version
    ReturnLatest { dataset: String },
    /// List commits that touched a dataset
    History {
        dataset: String,
        #[arg(short = 'n', long, default_value = "20")]
        max: usize,
    },
    /// Inspect or clear dataset locks
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },
}

#[derive(Subcommand)]
enum LockCommands {
    /// Show who holds the lock for a dataset
    Status { dataset: String },
    /// Remove a stale lock, or any lock with --force (admin mode only)
    Unlock {
        dataset: String,
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    let config = match ConfigLoader::new(cli.config.clone()).load().await {
        Ok(config) => config,
        Err(e) => {
            app::init_logging(&AppConfig::new(verbose));
            app::handle_fatal_error(e.into(), verbose)
        }
    };

    let app_config = AppConfig::new(verbose)
        .with_config_path(cli.config.clone())
        .with_base_level(&config.log_level);
    app::init_logging(&app_config);
    debug!("Loaded config: {:?}", config);

    if let Err(e) = run(cli, config).await {
        app::handle_fatal_error(e, verbose);
    }
}

async fn run(cli: Cli, config: EngineConfig) -> Result<()> {
    let request = match cli.command {
        Commands::Import {
            dataset,
            source,
            replace,
            note,
        } => WorkflowRequest::Import {
            dataset_id: dataset,
            source,
            replace,
            note,
        },
        Commands::Publish { dataset, message } => WorkflowRequest::Publish {
            dataset_id: dataset,
            message,
        },
        Commands::Fetch {
            dataset,
            allow_dirty,
            shared,
        } => WorkflowRequest::FetchLatest {
            dataset_id: dataset,
            allow_dirty,
            update_shared: shared,
        },
        Commands::Restore {
            dataset,
            revision,
            yes,
        } => WorkflowRequest::RestoreVersion {
            dataset_id: dataset,
            revision,
            confirmed: yes,
        },
        Commands::ReturnLatest { dataset } => WorkflowRequest::ReturnToLatest {
            dataset_id: dataset,
        },
        Commands::History { dataset, max } => return show_history(&config, &dataset, max).await,
        Commands::Lock { command } => return run_lock_command(&config, command).await,
    };

    let supervisor = app::build_supervisor(&config);
    let outcome = run_workflow(&supervisor, request, &config, cli.json).await?;

    match outcome.state {
        WorkflowState::Completed => Ok(()),
        WorkflowState::Cancelled => Err(WorkflowError::cancelled().into()),
        _ => Err(outcome
            .error
            .map(anyhow::Error::new)
            .unwrap_or_else(|| anyhow!("{}", outcome.summary))),
    }
}

/// Stream events until the run finishes. Ctrl-C cancels and waits up to the
/// configured grace period for the run to clean up.
async fn run_workflow(
    supervisor: &WorkflowSupervisor,
    request: WorkflowRequest,
    config: &EngineConfig,
    json: bool,
) -> Result<RunOutcome> {
    let mut handle = supervisor.submit(request)?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(event) => render_event(&event, json)?,
                None => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                eprintln!(
                    "Cancelling; waiting up to {} for the current step to finish...",
                    humantime_serde::re::humantime::format_duration(config.shutdown_grace)
                );
                let report = supervisor.shutdown(config.shutdown_grace).await;
                if !report.is_clean() {
                    warn!("Exiting with active runs: {:?}", report.unfinished);
                    bail!(
                        "Run for {} did not stop within the grace period; its lock expires after the configured ttl",
                        report.unfinished.join(", ")
                    );
                }
            }
        }
    }

    Ok(handle.wait().await)
}

fn render_event(event: &WorkflowEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        WorkflowEvent::Progress {
            step,
            fraction,
            detail,
        } => match detail {
            Some(detail) => println!("[{:>3.0}%] {}: {}", fraction * 100.0, step, detail),
            None => println!("[{:>3.0}%] {}", fraction * 100.0, step),
        },
        WorkflowEvent::Error { error } => match &error.step {
            Some(step) => eprintln!("error during {}: {}", step, error),
            None => eprintln!("error: {}", error),
        },
        WorkflowEvent::Finished { state, summary } => println!("{}: {}", state, summary),
    }
    Ok(())
}

async fn show_history(config: &EngineConfig, dataset: &str, max: usize) -> Result<()> {
    validate_dataset_id(dataset)?;
    let engine = app::build_engine(config);
    let commits = engine
        .vcs()
        .log(&Workspace::relative_dataset_dir(dataset), max)
        .await
        .with_context(|| format!("Failed to read history for {}", dataset))?;

    if commits.is_empty() {
        println!("No history for dataset {}.", dataset);
    }
    for commit in commits {
        println!(
            "{}  {}  {:<16}  {}",
            commit.revision,
            commit.date.format("%Y-%m-%d %H:%M"),
            commit.author,
            commit.summary
        );
    }
    Ok(())
}

async fn run_lock_command(config: &EngineConfig, command: LockCommands) -> Result<()> {
    let locks = app::lock_manager(config);

    match command {
        LockCommands::Status { dataset } => {
            validate_dataset_id(&dataset)?;
            match locks.inspect(&dataset).await? {
                LockState::Free => println!("{} is not locked.", dataset),
                LockState::Held(file) => println!(
                    "{}. Lease expires {}.",
                    file.holder_description(),
                    file.expires_at().format("%Y-%m-%d %H:%M UTC")
                ),
                LockState::Stale(file) => println!(
                    "{} (stale since {}).",
                    file.holder_description(),
                    file.expires_at().format("%Y-%m-%d %H:%M UTC")
                ),
                LockState::Unreadable => println!(
                    "{} has an unreadable lock file; only a forced unlock clears it.",
                    dataset
                ),
            }
        }
        LockCommands::Unlock { dataset, force } => {
            validate_dataset_id(&dataset)?;
            let state = locks.inspect(&dataset).await?;
            match state {
                LockState::Free => {
                    println!("{} is not locked.", dataset);
                    return Ok(());
                }
                LockState::Stale(_) => {}
                LockState::Held(_) | LockState::Unreadable if !force => {
                    bail!(WorkflowError::invalid_request(format!(
                        "{} is locked by a live holder; use --force in admin mode to clear it",
                        dataset
                    )));
                }
                LockState::Held(_) | LockState::Unreadable => {
                    if !config.admin_mode {
                        bail!(WorkflowError::invalid_request(
                            "Forced unlock requires admin_mode in the configuration"
                        ));
                    }
                }
            }

            if locks.force_release(&dataset).await? {
                println!("Removed lock for {}.", dataset);
            } else {
                println!("{} is not locked.", dataset);
            }
        }
    }
    Ok(())
}
