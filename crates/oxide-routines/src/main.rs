//! oxide-routines CLI
//!
//! Command-line tool for migrating stored procedures, functions and triggers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use oxide_routines::prelude::*;

/// Migrations for stored procedures, functions and triggers.
#[derive(Parser)]
#[command(name = "oxide-routines")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML).
    #[arg(short, long, env = "OXIDE_ROUTINES_CONFIG")]
    config: PathBuf,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a migration from the definition files.
    Generate {
        /// Migration name (letters, digits, `_` and `-`).
        name: String,
    },

    /// Export every live procedure, function and trigger to files.
    Export {
        /// Target folder.
        folder: PathBuf,
    },

    /// Apply pending migrations.
    Up,

    /// Revert the most recent migration.
    Down,

    /// Create the tracking table.
    Init,

    /// Show applied and pending migrations.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

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

    let config = Config::load(&cli.config)?;
    let live = DriverConnector.connect(config.engine, &config.connection).await?;
    let normalizer = for_engine(config.engine);

    match cli.command {
        Commands::Generate { name } => {
            let sandbox = Sandbox::new(
                config.engine,
                Arc::new(DockerCli::default()),
                Arc::new(DriverConnector),
            );
            let engine = DiffEngine::new(&config, live, normalizer, sandbox);
            if let Some(path) = engine.generate(&name).await? {
                println!("{}", path.display());
            }
        }

        Commands::Export { folder } => {
            let written = ExportService::new(&config, live, normalizer)
                .run(&folder)
                .await?;
            info!(count = written.len(), folder = %folder.display(), "Export finished");
        }

        Commands::Up => {
            let applied = ApplyEngine::new(&config, live, normalizer).run().await?;
            info!(count = applied.len(), "Migrations applied");
        }

        Commands::Down => {
            RollbackEngine::new(&config, live, normalizer).run().await?;
        }

        Commands::Init => {
            ApplyEngine::new(&config, live, normalizer).init().await?;
            info!("Tracking table ready.");
        }

        Commands::Status => {
            let status = ApplyEngine::new(&config, live, normalizer).status().await?;
            println!("\nMigrations:");
            println!("{:-<60}", "");
            for name in &status.applied {
                let marker = if status.latest.as_ref() == Some(name) {
                    " (latest)"
                } else {
                    ""
                };
                println!(" [X] {name}{marker}");
            }
            for name in &status.pending {
                println!(" [ ] {name}");
            }
            println!();
        }
    }

    Ok(())
}
