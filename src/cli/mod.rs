//! Command-line interface for blockvault.
//!
//! One module per subcommand, each exposing its clap `Args` struct and a
//! `run` function.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod create;
pub mod list;
pub mod restore;

/// blockvault - block-level deduplicating backup and restore
#[derive(Parser)]
#[command(name = "blockvault")]
#[command(about = "Block-level deduplicating backup and restore for files and block devices")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Path to the metadata database
    #[arg(long, global = true, default_value = "backups.db")]
    pub db: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create, list, and restore backups
    #[command(subcommand)]
    Backup(BackupCommands),
}

/// Backup subcommands
#[derive(Subcommand)]
pub enum BackupCommands {
    /// Create a backup of a device or file
    Create(create::CreateArgs),
    /// List all backups
    List(list::ListArgs),
    /// Restore a backup into a file
    Restore(restore::RestoreArgs),
}
