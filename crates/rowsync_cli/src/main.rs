//! rowsync CLI
//!
//! Command-line tools for the directories a sync deployment leaves on disk.
//!
//! # Commands
//!
//! - `batch inspect` - Show the batches under a directory and their parts
//! - `batch verify` - Read every part and check it against its manifest
//! - `snapshot list` - List the snapshots of a server

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// rowsync operator tools.
#[derive(Parser)]
#[command(name = "rowsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Batch directory tools
    Batch {
        #[command(subcommand)]
        command: BatchCommand,
    },

    /// Snapshot directory tools
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum BatchCommand {
    /// Show batches and their parts
    Inspect {
        /// A batch directory, or a directory of batches
        dir: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Read every part and check it against the manifest
    Verify {
        /// A batch directory, or a directory of batches
        dir: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[derive(Subcommand)]
enum SnapshotCommand {
    /// List complete snapshots
    List {
        /// Snapshot directory of a server
        dir: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Batch { command } => match command {
            BatchCommand::Inspect { dir, format } => commands::batch::inspect(&dir, &format)?,
            BatchCommand::Verify { dir, format } => commands::batch::verify(&dir, &format)?,
        },
        Commands::Snapshot { command } => match command {
            SnapshotCommand::List { dir, format } => commands::snapshot::list(&dir, &format)?,
        },
        Commands::Version => {
            println!("rowsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("rowsync core v{}", rowsync_core::VERSION);
        }
    }

    Ok(())
}
