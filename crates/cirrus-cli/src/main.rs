//! Cirrus CLI
//!
//! Command-line interface for the cirrus backup engine

use clap::{Parser, Subcommand};

mod commands;

#[derive(Debug, Parser)]
#[command(name = "cirrus")]
#[command(about = "Cirrus - incremental filesystem backup to dumb storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Produce a backup snapshot of a directory tree
    Backup(commands::backup::BackupArgs),
}

fn main() {
    cirrus_core::logging::init(cirrus_core::logging::Profile::Development);

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Backup(args) => commands::backup::execute(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
