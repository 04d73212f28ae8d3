//! Offsync CLI
//!
//! Inspect and manage an operation log from the shell. Opens the same
//! database file the host application uses; nothing here talks to the
//! network.
//!
//! `retry`, `resolve` and `discard` write the log directly. They cannot see
//! which operations a running engine has in flight, so run them while the
//! host application is stopped or not draining.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use offsync::error::{Result, SyncError};
use offsync::storage::{OperationLog, Storage, SyncStateStore};
use offsync::types::*;

#[derive(Parser)]
#[command(name = "offsync")]
#[command(about = "Offline-first sync engine CLI")]
#[command(version)]
struct Cli {
    /// Database path
    #[arg(
        long,
        env = "OFFSYNC_DB_PATH",
        default_value = "~/.local/share/offsync/sync.db"
    )]
    db_path: String,

    /// Storage mode (local, durable)
    #[arg(long, env = "OFFSYNC_STORAGE_MODE", default_value = "local")]
    storage_mode: String,

    /// Retry ceiling used to classify pending and failed operations
    #[arg(long, env = "OFFSYNC_MAX_RETRIES", default_value = "5")]
    max_retries: u32,

    /// Log as JSON lines
    #[arg(long, env = "OFFSYNC_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the persisted sync state and live log counts
    Status,
    /// List pending operations
    Pending,
    /// List operations that reached the retry ceiling
    Failed,
    /// List operations parked on a manual conflict
    Conflicts,
    /// Show one operation
    Show {
        /// Operation ID
        id: String,
    },
    /// Enqueue an operation
    Queue {
        /// Operation type (create, update, delete)
        r#type: String,
        /// Entity type
        entity: String,
        /// Payload as JSON
        payload: String,
        /// Priority (critical, high, normal, low)
        #[arg(short, long, default_value = "normal")]
        priority: String,
    },
    /// Reset failed operations (all of them, or one by ID)
    ///
    /// Writes the log directly, bypassing a running engine's in-flight
    /// check. Use while the host application is not draining.
    Retry {
        /// Operation ID
        id: Option<String>,
    },
    /// Resolve a parked conflict with the given payload
    ///
    /// Writes the log directly, bypassing a running engine's in-flight
    /// check. Use while the host application is not draining.
    Resolve {
        /// Operation ID
        id: String,
        /// Resolved payload as JSON
        payload: String,
    },
    /// Remove an operation from the log
    ///
    /// Writes the log directly, bypassing a running engine's in-flight
    /// check. Use while the host application is not draining.
    Discard {
        /// Operation ID
        id: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr, stdout is for command output
    if cli.log_json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }

    if cli.max_retries == 0 {
        return Err(SyncError::Config("max_retries must be at least 1".into()));
    }

    // Expand ~ in path
    let db_path = shellexpand::tilde(&cli.db_path).to_string();
    let storage_mode: StorageMode = cli.storage_mode.parse().map_err(SyncError::InvalidInput)?;

    let storage = Storage::open(StorageConfig {
        db_path,
        storage_mode,
    })?;
    let log = OperationLog::new(storage.clone(), cli.max_retries);

    match cli.command {
        Commands::Status => {
            let state = SyncStateStore::load(storage).get();
            let counts = log.counts()?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            println!(
                "Log: {} pending, {} failed, {} conflicts, {} total",
                counts.pending, counts.failed, counts.conflicts, counts.total
            );
        }

        Commands::Pending => print_operations(&log.list_pending()?),

        Commands::Failed => print_operations(&log.list_failed()?),

        Commands::Conflicts => print_operations(&log.list_conflicts()?),

        Commands::Show { id } => {
            let op = log.get(&id)?.ok_or(SyncError::NotFound(id))?;
            println!("{}", serde_json::to_string_pretty(&op)?);
        }

        Commands::Queue {
            r#type,
            entity,
            payload,
            priority,
        } => {
            let op_type: OperationType = r#type.parse().map_err(SyncError::InvalidInput)?;
            let priority: Priority = priority.parse().map_err(SyncError::InvalidInput)?;
            let payload = parse_payload(&payload)?;
            let id = log.enqueue(op_type, &entity, &payload, priority)?;
            refresh_state(&storage, &log)?;
            println!("Queued {}", id);
        }

        Commands::Retry { id: Some(id) } => {
            log.reset_operation(&id)?;
            refresh_state(&storage, &log)?;
            println!("Reset {}", id);
        }

        Commands::Retry { id: None } => {
            let reset = log.reset_failed()?;
            refresh_state(&storage, &log)?;
            println!("Reset {} failed operation(s)", reset);
        }

        Commands::Resolve { id, payload } => {
            let payload = parse_payload(&payload)?;
            log.resolve_conflict(&id, &payload)?;
            refresh_state(&storage, &log)?;
            println!("Resolved {}", id);
        }

        Commands::Discard { id } => {
            if log.discard(&id)? {
                refresh_state(&storage, &log)?;
                println!("Discarded {}", id);
            } else {
                return Err(SyncError::NotFound(id));
            }
        }
    }

    Ok(())
}

fn parse_payload(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| SyncError::InvalidInput(format!("payload is not JSON: {}", e)))
}

/// Keep the persisted snapshot's counts in line with the log
fn refresh_state(storage: &Storage, log: &OperationLog) -> Result<()> {
    let counts = log.counts()?;
    SyncStateStore::load(storage.clone()).refresh_counts(counts);
    Ok(())
}

fn print_operations(ops: &[SyncOperation]) {
    if ops.is_empty() {
        println!("(none)");
        return;
    }
    for op in ops {
        let mut line = format!(
            "{} [{}] {} {} retries={}",
            op.id,
            op.priority.as_str(),
            op.op_type.as_str(),
            op.entity,
            op.retry_count
        );
        if let Some(ref error) = op.last_error {
            line.push_str(&format!(" error={}", truncate(error, 60)));
        }
        println!("{}", line);
    }
}

fn truncate(s: &str, max: usize) -> String {
    let first_line = s.lines().next().unwrap_or(s);
    if first_line.chars().count() <= max {
        first_line.to_string()
    } else {
        let cut: String = first_line.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
