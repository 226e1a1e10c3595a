mod browser;
mod capture;
mod config;
mod export;
mod filter;
mod query;
mod record;
mod report;
mod store;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use capture::{CaptureContext, CaptureEngine, CaptureRequest, ACTIVE_ENV};
use config::Config;
use export::Destination;
use filter::Filter;
use query::{PruneOutcome, QueryEngine};
use report::StatusReport;
use store::LogStore;

#[derive(Parser)]
#[command(name = "shelltape")]
#[command(version, about = "Record and browse your terminal command history")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command on a pseudo-terminal and record its output
    Exec {
        /// Session ID of the calling shell
        #[arg(long)]
        session_id: String,
        /// Run the joined command line through $SHELL -c
        #[arg(long)]
        shell_mode: bool,
        /// Bytes of output to keep [default: from config]
        #[arg(long)]
        max_output_size: Option<usize>,
        /// Command to execute
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Record a command the shell already ran (called by shell hooks)
    Record {
        #[arg(long)]
        command: String,
        #[arg(long, allow_hyphen_values = true)]
        exit_code: i32,
        /// Start time in nanoseconds since epoch
        #[arg(long)]
        start_time: i64,
        /// End time in nanoseconds since epoch
        #[arg(long)]
        end_time: i64,
        #[arg(long)]
        cwd: PathBuf,
        #[arg(long)]
        session_id: String,
        #[arg(long, default_value = "")]
        output: String,
    },
    /// Mark a shell session as finished (called on shell exit)
    SessionEnd {
        #[arg(long)]
        session_id: String,
    },
    /// Browse commands interactively
    Browse,
    /// List recent commands
    List {
        /// Maximum number of commands to display [default: 20]
        #[arg(short, long)]
        limit: Option<usize>,
        /// Only commands whose text or output contains this
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Export commands to Markdown
    Export {
        /// Output file, or - for stdout
        #[arg(short, long)]
        output: PathBuf,
        /// Only commands from this session
        #[arg(short, long)]
        session: Option<String>,
        /// Only commands whose text or output contains this
        #[arg(short, long)]
        filter: Option<String>,
        /// One section per session
        #[arg(long)]
        group_by_session: bool,
    },
    /// Show statistics about the command history
    Stats {
        /// How many of the most used commands to show
        #[arg(long, default_value = "10")]
        top: usize,
    },
    /// Remove old commands from the history
    Clean {
        /// Remove commands older than this many days [default: 90]
        #[arg(long)]
        older_than_days: Option<u32>,
        /// Don't ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Show storage location and usage
    Status,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Exec {
            session_id,
            shell_mode,
            max_output_size,
            command,
        } => {
            // Capture must run the command whatever else goes wrong
            let config = Config::new().unwrap_or_else(|err| {
                warn!("using default config: {err:#}");
                Config::default()
            });
            let request = CaptureRequest {
                argv: command,
                shell_mode,
                max_output_size,
                nested: env::var_os(ACTIVE_ENV).is_some(),
            };
            std::process::exit(exec(&config, request, session_id));
        }
        command => run(command),
    }
}

fn run(command: Commands) -> Result<()> {
    let config = Config::new()?;
    let store = LogStore::open(data_dir(&config))?;
    let query = QueryEngine::new(&store);

    match command {
        // Handled before the store is opened
        Commands::Exec { .. } => {}
        Commands::Record {
            command,
            exit_code,
            start_time,
            end_time,
            cwd,
            session_id,
            output,
        } => {
            let ctx = capture_context(session_id, cwd);
            capture::record_finished(
                &store,
                &ctx,
                command,
                output.into_bytes(),
                exit_code,
                DateTime::from_timestamp_nanos(start_time),
                DateTime::from_timestamp_nanos(end_time),
                max_output_size(&config),
            )
            .context("Failed to record command")?;
        }
        Commands::SessionEnd { session_id } => {
            store.end_session(&session_id, Utc::now())?;
        }
        Commands::Browse => {
            let records = query.list(config.display.browse_limit, &Filter::default())?;
            if records.is_empty() {
                println!("{}", "No commands recorded yet.".yellow());
                return Ok(());
            }
            browser::run(records, &config.export_path())?;
        }
        Commands::List { limit, filter } => {
            let filter = Filter::new(filter.unwrap_or_default());
            let records = query.list(limit.unwrap_or(config.display.list_limit), &filter)?;
            report::print_list(&records);
        }
        Commands::Export {
            output,
            session,
            filter,
            group_by_session,
        } => {
            let filter = Filter::new(filter.unwrap_or_default());
            let records = query.select(session.as_deref(), &filter)?;
            let destination = Destination::parse(&output);
            export::export(&records, &destination, group_by_session)?;
            if let Destination::File(path) = destination {
                println!(
                    "{}",
                    format!("Exported {} commands to {}", records.len(), path.display()).green()
                );
            }
        }
        Commands::Stats { top } => {
            report::print_stats(&query.stats(top)?);
        }
        Commands::Clean { older_than_days, yes } => {
            let days = older_than_days.unwrap_or(config.storage.retention_days);
            let outcome = query.prune(Duration::days(days as i64), yes, |count, cutoff| {
                println!(
                    "{} commands started before {} will be removed.",
                    count.to_string().red().bold(),
                    cutoff.format("%Y-%m-%d")
                );
                confirm("Continue? [y/N] ")
            })?;
            match outcome {
                PruneOutcome::NothingToPrune => {
                    println!("{}", format!("No commands older than {days} days.").yellow());
                }
                PruneOutcome::Declined { .. } => println!("{}", "Aborted.".yellow()),
                PruneOutcome::Pruned(report) => {
                    println!(
                        "{}",
                        format!(
                            "Removed {} commands ({} kept, {} sessions dropped).",
                            report.removed, report.kept, report.sessions_removed
                        )
                        .green()
                    );
                }
            }
        }
        Commands::Status => {
            let scan = store.scan_commands(|_| {})?;
            let status = StatusReport {
                data_dir: store.base_dir().to_path_buf(),
                config_path: Config::default_dir().join("config.toml"),
                commands_path: store.commands_path().to_path_buf(),
                commands_bytes: store.commands_size(),
                sessions_bytes: std::fs::metadata(store.sessions_path())
                    .map(|m| m.len())
                    .unwrap_or(0),
                records: scan.entries,
                skipped: scan.skipped,
                incomplete_tail: scan.incomplete_tail,
                sessions: store.read_sessions()?,
                capturing: env::var_os(ACTIVE_ENV).is_some(),
            };
            report::print_status(&status);
        }
    }

    Ok(())
}

/// Run one captured command and return the exit code to leave with.
fn exec(config: &Config, request: CaptureRequest, session_id: String) -> i32 {
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    let ctx = capture_context(session_id, cwd);

    let store = match LogStore::open(data_dir(config)) {
        Ok(store) => store,
        Err(err) => {
            warn!("not recording: {err:#}");
            return capture::run_direct(&request, &ctx).exit_code;
        }
    };

    let engine = CaptureEngine::new(max_output_size(config))
        .with_drain_timeout(std::time::Duration::from_millis(config.capture.drain_timeout_ms))
        .interactive(io::stdin().is_terminal())
        .with_self_exe(env::current_exe().ok());
    let outcome = engine.capture(&store, &request, &ctx);
    if let Some(record) = &outcome.record {
        tracing::debug!(id = %record.id, relayed = outcome.relayed_bytes, "command recorded");
    }
    outcome.exit_code
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("SHELLTAPE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

// Environment overrides win over config.toml
fn data_dir(config: &Config) -> PathBuf {
    env::var_os("SHELLTAPE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| config.data_dir())
}

fn max_output_size(config: &Config) -> usize {
    env::var("SHELLTAPE_MAX_OUTPUT")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(config.capture.max_output_size)
}

fn capture_context(session_id: String, cwd: PathBuf) -> CaptureContext {
    CaptureContext {
        session_id,
        cwd,
        shell: env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
        hostname: nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string()),
        username: env::var("USER")
            .or_else(|_| env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string()),
    }
}

fn confirm(prompt: &str) -> bool {
    print!("{}", prompt.yellow());
    io::stdout().flush().ok();
    let mut input = String::new();
    if io::stdin().read_line(&mut input).is_err() {
        return false;
    }
    matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
}
