//! Backup restore command implementation.

use crate::restore::{RestoreConfig, RestoreEngine, RestoreInputFormat};
use crate::store::Store;
use crate::Result;
use clap::Args;
use std::path::{Path, PathBuf};

/// Arguments for the backup restore command
#[derive(Args)]
pub struct RestoreArgs {
    /// Id of the backup to restore
    pub backup_id: i64,

    /// Directory the restored file is written to
    #[arg(short = 'o', long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Name of the restored file
    #[arg(long, default_value = "restored.backup")]
    pub output_filename: String,
}

/// Run the backup restore command
pub async fn run(db: &Path, args: RestoreArgs) -> Result<()> {
    let store = Store::open(db).await?;
    store.setup_schema().await?;

    let config = RestoreConfig {
        input_format: RestoreInputFormat::File,
        source_backup_id: args.backup_id,
        output_directory: args.output_dir,
        output_file_name: args.output_filename,
    };

    let engine = RestoreEngine::new(store, config).await?;
    engine.run().await?;

    println!("Restore completed: {}", engine.output_path().display());
    Ok(())
}
