//! Backup create command implementation.

use crate::backup::{BackupConfig, BackupEngine, DEFAULT_BLOCK_BUFFER_SIZE, DEFAULT_BLOCK_SIZE};
use crate::format::{format_duration, format_size};
use crate::store::{OutputFormat, Store};
use crate::Result;
use clap::Args;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Arguments for the backup create command
#[derive(Args)]
pub struct CreateArgs {
    /// Path to the device or file to back up
    pub device_path: PathBuf,

    /// Directory the backup artifact is written to
    #[arg(short = 'o', long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Artifact file name (defaults to {volume}_{type}_{timestamp})
    #[arg(long, default_value = "")]
    pub output_filename: String,

    /// Where the artifact goes: file or stdout
    #[arg(short = 'f', long, default_value = "file")]
    pub output_format: OutputFormat,

    /// Block size in bytes
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: usize,

    /// Number of blocks buffered per pipeline window
    #[arg(long, default_value_t = DEFAULT_BLOCK_BUFFER_SIZE)]
    pub block_buffer_size: usize,
}

/// Run the backup create command
pub async fn run(db: &Path, args: CreateArgs) -> Result<()> {
    let store = Store::open(db).await?;
    store.setup_schema().await?;

    let config = BackupConfig {
        device_path: args.device_path.clone(),
        output_format: args.output_format,
        output_directory: args.output_dir.clone(),
        output_file_name: args.output_filename,
        block_size: args.block_size,
        block_buffer_size: args.block_buffer_size,
    };

    eprintln!(
        "Performing backup of {} to {}",
        args.device_path.display(),
        args.output_dir.display()
    );

    let started = Instant::now();
    let mut engine = BackupEngine::new(store.clone(), config).await?;
    engine.run().await?;

    let record = engine.record();
    let unique_blocks = store.unique_blocks_in_backup(record.id).await?;
    let space_saved = engine.source_size().saturating_sub(record.size_in_bytes as u64);

    // The summary moves to stderr when the artifact went to stdout.
    let mut out: Box<dyn Write> = match args.output_format {
        OutputFormat::Stdout => Box::new(io::stderr()),
        OutputFormat::File => Box::new(io::stdout()),
    };
    writeln!(out, "Backup completed successfully!")?;
    writeln!(out, "  Backup file: {}", record.full_path)?;
    writeln!(out, "  Backup size: {}", format_size(record.size_in_bytes as u64))?;
    writeln!(out, "  Source size: {}", format_size(engine.source_size()))?;
    writeln!(out, "  Space saved: {}", format_size(space_saved))?;
    writeln!(out, "  Blocks evaluated: {}", record.total_blocks)?;
    writeln!(out, "  Blocks written: {}", unique_blocks)?;
    writeln!(out, "  Duration: {}", format_duration(started.elapsed()))?;

    Ok(())
}
