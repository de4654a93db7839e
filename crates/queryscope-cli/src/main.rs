//! queryscope CLI
//!
//! Thin wrapper around queryscope-core for watching MongoDB query traffic
//! from a terminal.
//!
//! ## Usage
//!
//! ```bash
//! # List the databases from ~/.queryscope/config.toml
//! queryscope databases
//!
//! # Stream query shapes until Ctrl-C
//! queryscope tail orders-prod
//!
//! # Show the 20 most recent operations on one collection
//! queryscope recent orders-prod --limit 20 --collection orders
//!
//! # Only profile operations slower than 50ms
//! queryscope level orders-prod slow --slow-ms 50
//!
//! # Canonicalize a profiler entry without connecting
//! queryscope shape '{"ns": "shop.orders", "command": {"find": "orders", "filter": {"status": "open"}}}'
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mongodb::bson::{Bson, Document};
use queryscope_core::profiler::canonicalize_payload;
use queryscope_core::{
    DatabaseId, LogPayload, ProfileLevel, ProfiledQueryEvent, Profiler, ProfilerConfig,
};
use tracing::{info, warn};

/// queryscope - live MongoDB query profiler
#[derive(Parser)]
#[command(name = "queryscope")]
#[command(version)]
#[command(about = "queryscope - live MongoDB query profiler")]
#[command(
    long_about = "Enables MongoDB's profiler on monitored databases, tails system.profile and prints a canonical shape for every query as it runs."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file (default: ~/.queryscope/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured databases
    Databases,

    /// Profile a database and stream its queries until Ctrl-C
    Tail {
        /// Database id from the config file
        database_id: String,

        /// Print one JSON object per event
        #[arg(long)]
        json: bool,
    },

    /// Show the most recent profiler entries
    Recent {
        /// Database id from the config file
        database_id: String,

        /// Number of entries (default: history.default_limit)
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only entries on this collection
        #[arg(long)]
        collection: Option<String>,

        /// Print a JSON array
        #[arg(long)]
        json: bool,
    },

    /// Set the profiling level directly
    Level {
        /// Database id from the config file
        database_id: String,

        /// Level to apply
        #[arg(value_enum)]
        level: LevelArg,

        /// Slow-operation threshold in milliseconds (default: profiling.slow_ms)
        #[arg(long)]
        slow_ms: Option<u64>,
    },

    /// Canonicalize a profiler entry given as (extended) JSON
    Shape {
        /// Profiler entry, or a bare command document with --command
        json: String,

        /// Treat the input as a command document
        #[arg(long)]
        command: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LevelArg {
    Off,
    Slow,
    All,
}

/// Initialize logging based on verbosity level
fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Parse a database id argument
fn parse_database_id(s: &str) -> Result<DatabaseId> {
    s.parse::<DatabaseId>()
        .with_context(|| format!("Invalid database id: {}", s))
}

/// Parse (extended) JSON text into a BSON document
fn parse_document(json: &str) -> Result<Document> {
    let value: serde_json::Value = serde_json::from_str(json).context("Input is not valid JSON")?;
    match Bson::try_from(value).context("Input is not valid extended JSON")? {
        Bson::Document(doc) => Ok(doc),
        other => bail!("Expected a JSON object, got {:?}", other.element_type()),
    }
}

/// Load the config file, falling back to defaults if it does not exist
fn load_config(path: &Path) -> Result<ProfilerConfig> {
    ProfilerConfig::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

fn print_event(event: &ProfiledQueryEvent) {
    println!(
        "{}  {:<16} {:<20} {:>6}ms  {}",
        event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        event.database_id,
        event.collection,
        event.execution_time_ms,
        event.query_shape
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config_path = cli.config.unwrap_or_else(ProfilerConfig::default_path);

    match cli.command {
        Commands::Databases => {
            let config = load_config(&config_path)?;
            if config.databases.is_empty() {
                println!("No databases configured in {}", config_path.display());
            } else {
                println!("Databases ({}):", config.databases.len());
                for target in &config.databases {
                    println!("  {}  {} ({})", target.id, target.database, target.uri);
                }
            }
        }

        Commands::Tail { database_id, json } => {
            let config = load_config(&config_path)?;
            let id = parse_database_id(&database_id)?;
            if config.target(&id).is_none() {
                bail!("Unknown database: {}", id);
            }
            let profiler = Profiler::connect(&config).await?;

            // Subscribe before starting so no early event is missed
            let mut events = profiler.subscribe();
            let outcome = profiler.start_session(&id).await?;
            eprintln!("Profiling {} ({}). Press Ctrl-C to stop.", id, outcome.session_id());

            let mut liveness = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = liveness.tick() => {}
                    event = events.recv() => {
                        let Some(event) = event else {
                            eprintln!("Event stream closed");
                            break;
                        };
                        if json {
                            println!("{}", serde_json::to_string(&event)?);
                        } else {
                            print_event(&event);
                        }
                    }
                }
                if !profiler.is_active(&id) {
                    eprintln!("Profiling session for {} ended", id);
                    break;
                }
            }

            if let Err(e) = profiler.stop_session(&id).await {
                warn!(database_id = %id, error = %e, "Failed to disable profiling on exit");
            }
            profiler.shutdown().await;
            info!(database_id = %id, "Tail finished");
        }

        Commands::Recent {
            database_id,
            limit,
            collection,
            json,
        } => {
            let config = load_config(&config_path)?;
            let id = parse_database_id(&database_id)?;
            if config.target(&id).is_none() {
                bail!("Unknown database: {}", id);
            }
            let profiler = Profiler::connect(&config).await?;
            let events = profiler
                .list_recent(&id, limit, collection.as_deref())
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else if events.is_empty() {
                println!("No profiler entries for {}", id);
            } else {
                for event in &events {
                    print_event(event);
                }
            }
        }

        Commands::Level {
            database_id,
            level,
            slow_ms,
        } => {
            let config = load_config(&config_path)?;
            let id = parse_database_id(&database_id)?;
            if config.target(&id).is_none() {
                bail!("Unknown database: {}", id);
            }
            let slow_ms = slow_ms.unwrap_or(config.profiling.slow_ms);
            let level = match level {
                LevelArg::Off => ProfileLevel::Off,
                LevelArg::Slow => ProfileLevel::SlowOnly {
                    threshold_ms: slow_ms,
                },
                LevelArg::All => ProfileLevel::All,
            };

            let profiler = Profiler::connect(&config).await?;
            profiler
                .set_level(&id, level, Some(slow_ms))
                .await
                .map_err(|e| anyhow!("Failed to set profiling level on {}: {}", id, e))?;
            println!("Profiling level for {} set to {}", id, level);
        }

        // Needs neither config nor connection
        Commands::Shape { json, command } => {
            let doc = parse_document(&json)?;
            let (namespace, payload) = if command {
                ("", LogPayload::Command(doc))
            } else {
                let payload = LogPayload::from_document(&doc);
                (doc.get_str("ns").unwrap_or(""), payload)
            };
            println!("{}", canonicalize_payload(namespace, &payload));
        }
    }

    Ok(())
}
