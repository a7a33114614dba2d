//! Restore engine: reconstructs a source by joining a backup's position
//! map against the artifacts holding each block's payload, layering a
//! differential over its full base.

use crate::hash::BlockDigest;
use crate::store::{BackupRecord, BackupType, Store};
use crate::{Error, Result};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::{debug, info};

/// Format of the backup artifact being restored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestoreInputFormat {
    #[default]
    File,
}

/// Configuration for a restore run
#[derive(Debug, Clone)]
pub struct RestoreConfig {
    /// Format of the source artifact
    pub input_format: RestoreInputFormat,
    /// Id of the backup to restore
    pub source_backup_id: i64,
    /// Directory the restored file is written to; must exist
    pub output_directory: PathBuf,
    /// Name of the restored file
    pub output_file_name: String,
}

/// Restore engine for a single run
pub struct RestoreEngine {
    store: Store,
    config: RestoreConfig,
    record: BackupRecord,
    base_full: Option<BackupRecord>,
}

impl RestoreEngine {
    /// Create a new restore engine.
    ///
    /// Fails when the backup id is unknown, when a differential backup
    /// has no full backup to layer over, or when the output directory
    /// does not exist.
    pub async fn new(store: Store, config: RestoreConfig) -> Result<Self> {
        let record = store
            .find_backup(config.source_backup_id)
            .await?
            .ok_or(Error::BackupNotFound {
                id: config.source_backup_id,
            })?;

        let base_full = match record.backup_type {
            BackupType::Full => None,
            BackupType::Differential => Some(
                store
                    .find_last_full_backup(record.volume_id)
                    .await?
                    .ok_or(Error::MissingFullBackup {
                        volume_id: record.volume_id,
                    })?,
            ),
        };

        if !config.output_directory.is_dir() {
            return Err(Error::configuration(format!(
                "output directory '{}' does not exist",
                config.output_directory.display()
            )));
        }

        Ok(Self {
            store,
            config,
            record,
            base_full,
        })
    }

    /// The backup record being restored
    pub fn record(&self) -> &BackupRecord {
        &self.record
    }

    /// Path of the restored file
    pub fn output_path(&self) -> PathBuf {
        self.config
            .output_directory
            .join(&self.config.output_file_name)
    }

    /// Reconstruct the source into the output file.
    ///
    /// A full backup replays its own positions. A differential backup
    /// first replays its full base, then overlays its own positions; any
    /// position the differential does not list keeps the base's bytes.
    pub async fn run(&self) -> Result<()> {
        let output_path = self.output_path();
        let target = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&output_path)?;

        match self.record.backup_type {
            BackupType::Full => self.replay(&self.record, &target).await?,
            BackupType::Differential => {
                let base = self.base_full.as_ref().ok_or(Error::MissingFullBackup {
                    volume_id: self.record.volume_id,
                })?;
                self.replay(base, &target).await?;
                self.replay(&self.record, &target).await?;
            }
        }

        target.sync_all()?;
        info!(
            backup_id = self.record.id,
            output = %output_path.display(),
            "restore complete"
        );
        Ok(())
    }

    /// Replay one backup's position map into the target.
    ///
    /// Each position's payload is read from the artifact of the backup
    /// that first stored the block, at the recorded offset; a position may
    /// therefore resolve into an earlier backup's artifact when its
    /// content was deduplicated at write time. Payloads are verified
    /// against the stored digest and written with positional writes so
    /// passes layer without seek state.
    async fn replay(&self, base: &BackupRecord, target: &File) -> Result<()> {
        let placements = self.store.block_placements_for_backup(base.id).await?;
        let block_size = base.block_size as usize;

        let mut artifacts: HashMap<String, File> = HashMap::new();
        let mut buffer = vec![0u8; block_size];

        for placement in &placements {
            let artifact = match artifacts.entry(placement.artifact_path.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(File::open(&placement.artifact_path)?),
            };

            // The payload is short only when it is the source's final
            // short block, which sits at the end of its artifact.
            let len = read_payload_at(artifact, &mut buffer, placement.artifact_offset as u64)?;
            let payload = &buffer[..len];

            let digest = BlockDigest::from_bytes(payload);
            if digest.as_str() != placement.hash {
                return Err(Error::Integrity {
                    reason: format!(
                        "payload at offset {} of '{}' does not match digest {}",
                        placement.artifact_offset, placement.artifact_path, placement.hash
                    ),
                });
            }

            write_at(
                target,
                payload,
                placement.position as u64 * base.block_size as u64,
            )?;
            debug!(
                position = placement.position,
                artifact = %placement.artifact_path,
                "replayed block"
            );
        }

        Ok(())
    }
}

/// Fill the buffer from the artifact at the given offset, trimming to the
/// bytes actually read
fn read_payload_at(artifact: &mut File, buffer: &mut [u8], offset: u64) -> io::Result<usize> {
    artifact.seek(SeekFrom::Start(offset))?;

    let mut filled = 0;
    while filled < buffer.len() {
        let n = artifact.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(unix)]
fn write_at(target: &File, payload: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    target.write_all_at(payload, offset)
}

#[cfg(not(unix))]
fn write_at(mut target: &File, payload: &[u8], offset: u64) -> io::Result<()> {
    use std::io::Write;
    target.seek(SeekFrom::Start(offset))?;
    target.write_all(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_unknown_backup_id() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("meta.db")).await.unwrap();
        store.setup_schema().await.unwrap();

        let config = RestoreConfig {
            input_format: RestoreInputFormat::File,
            source_backup_id: 42,
            output_directory: dir.path().to_path_buf(),
            output_file_name: "restored".to_string(),
        };

        let result = RestoreEngine::new(store, config).await;
        assert!(matches!(result, Err(Error::BackupNotFound { id: 42 })));
    }

    #[test]
    fn test_write_at_is_positional() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out");
        let target = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .unwrap();

        write_at(&target, b"bb", 2).unwrap();
        write_at(&target, b"aa", 0).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"aabb");
    }

    #[test]
    fn test_read_payload_at_trims_at_eof() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact");
        std::fs::write(&path, [7u8; 100]).unwrap();

        let mut artifact = File::open(&path).unwrap();
        let mut buffer = vec![0u8; 64];

        assert_eq!(read_payload_at(&mut artifact, &mut buffer, 0).unwrap(), 64);
        assert_eq!(read_payload_at(&mut artifact, &mut buffer, 64).unwrap(), 36);
        assert_eq!(read_payload_at(&mut artifact, &mut buffer, 100).unwrap(), 0);
    }
}
