//! Backup list command implementation.

use crate::format::format_size;
use crate::store::Store;
use crate::Result;
use clap::Args;
use std::path::Path;

/// Arguments for the backup list command
#[derive(Args)]
pub struct ListArgs {}

/// Run the backup list command
pub async fn run(db: &Path, _args: ListArgs) -> Result<()> {
    let store = Store::open(db).await?;
    store.setup_schema().await?;

    let backups = store.list_backups().await?;
    if backups.is_empty() {
        println!("No backups found");
        return Ok(());
    }

    println!(
        "{:<6} {:<13} {:<12} {:<13} {:<10} {:<20} {}",
        "ID", "TYPE", "BLOCK SIZE", "TOTAL BLOCKS", "SIZE", "CREATED AT", "PATH"
    );
    for backup in backups {
        println!(
            "{:<6} {:<13} {:<12} {:<13} {:<10} {:<20} {}",
            backup.id,
            backup.backup_type.as_str().to_uppercase(),
            backup.block_size,
            backup.total_blocks,
            format_size(backup.size_in_bytes as u64),
            backup.created_at.format("%Y-%m-%d %H:%M:%S"),
            backup.full_path,
        );
    }

    Ok(())
}
