//! feedcove-migrate CLI
//!
//! Command-line tool for upgrading a Feedcove store in place.

use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use feedcove_migrate::prelude::*;

/// Schema upgrades for the Feedcove store.
#[derive(Parser)]
#[command(name = "feedcove-migrate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL (SQLite path or connection string).
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:feedcove.db")]
    database: String,

    /// Theme name, for themed builds of the client.
    #[arg(short, long)]
    theme: Option<String>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upgrade the store to the current schema version.
    Upgrade,

    /// Show the store's schema version without touching it.
    Status {
        /// Emit machine-readable JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct StatusReport {
    stored_version: Option<u32>,
    current_version: u32,
    pending_steps: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Connect to database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&cli.database)
        .await?;

    match cli.command {
        Commands::Upgrade => {
            let mut conn = pool.acquire().await?;
            let stored = schema_version(&mut conn)
                .await?
                .ok_or_else(|| anyhow::anyhow!("store has no schema version; not a Feedcove store"))?;
            drop(conn);

            if stored < FIRST_SQL_VERSION {
                anyhow::bail!(
                    "store is at version {stored}, which predates the SQLite conversion; \
                     open it with a client old enough to convert it first"
                );
            }

            let context = match &cli.theme {
                Some(name) => StepContext::themed(name),
                None => StepContext::plain(),
            };
            let registry = default_registry();
            upgrade_database(
                &pool,
                &registry,
                stored,
                CURRENT_VERSION,
                &context,
                &mut LogProgress,
            )
            .await?;
            info!(from = stored, to = CURRENT_VERSION, "store is up to date");
        }

        Commands::Status { json } => {
            let mut conn = pool.acquire().await?;
            let stored = schema_version(&mut conn).await?;

            let report = StatusReport {
                stored_version: stored,
                current_version: CURRENT_VERSION,
                pending_steps: stored.map_or(0, |v| CURRENT_VERSION.saturating_sub(v)),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                match report.stored_version {
                    Some(v) if v == CURRENT_VERSION => {
                        println!("Store is at version {v} (current).");
                    }
                    Some(v) if v > CURRENT_VERSION => {
                        println!(
                            "Store is at version {v}, newer than this build ({CURRENT_VERSION})."
                        );
                    }
                    Some(v) => {
                        println!(
                            "Store is at version {v}; {} step(s) pending to reach {CURRENT_VERSION}.",
                            report.pending_steps
                        );
                    }
                    None => println!("Store has no schema version; not a Feedcove store."),
                }
            }
        }
    }

    Ok(())
}
