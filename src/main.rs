//! blockvault - block-level deduplicating backup and restore
//!
//! Main binary entry point for the command-line interface.

use blockvault::cli::{BackupCommands, Cli, Commands};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    blockvault::logging::init(cli.verbose);

    let result = match cli.command {
        Commands::Backup(command) => match command {
            BackupCommands::Create(args) => blockvault::cli::create::run(&cli.db, args).await,
            BackupCommands::List(args) => blockvault::cli::list::run(&cli.db, args).await,
            BackupCommands::Restore(args) => blockvault::cli::restore::run(&cli.db, args).await,
        },
    };

    if let Err(err) = result {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
