//! Backup engine: streams a source in windows of blocks, deduplicates
//! against the metadata store, and appends only new payloads to the
//! backup artifact.

use crate::hash::{self, BlockDigest};
use crate::probe;
use crate::store::{BackupRecord, BackupType, NewBackup, NewBlock, OutputFormat, Store};
use crate::{Error, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Default block size: 1 MiB
pub const DEFAULT_BLOCK_SIZE: usize = 4096 * 256;

/// Default number of blocks buffered per pipeline window
pub const DEFAULT_BLOCK_BUFFER_SIZE: usize = 10;

/// Configuration for a backup run
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Path to the device or file to back up
    pub device_path: PathBuf,
    /// Where the artifact goes: a file or standard output
    pub output_format: OutputFormat,
    /// Directory the artifact file is written to
    pub output_directory: PathBuf,
    /// Artifact file name; empty means one is synthesized from the
    /// volume name, backup type, and a millisecond timestamp
    pub output_file_name: String,
    /// Number of bytes per block.
    /// WARNING: changing this invalidates differential detection against
    /// earlier backups of the volume.
    pub block_size: usize,
    /// Number of blocks read, hashed, and persisted per window
    pub block_buffer_size: usize,
}

/// Backup engine for a single run.
///
/// Construction performs the metadata preamble (volume resolution, backup
/// type detection, record insertion); [`run`](Self::run) streams the
/// source and writes the artifact.
pub struct BackupEngine {
    store: Store,
    config: BackupConfig,
    record: BackupRecord,
    last_full: Option<BackupRecord>,
    source_size: u64,
}

impl BackupEngine {
    /// Create a new backup engine and insert its backup record.
    ///
    /// The backup is full when the volume has no prior full backup,
    /// differential otherwise; a differential run keeps the last full
    /// backup as the reference for change detection.
    pub async fn new(store: Store, mut config: BackupConfig) -> Result<Self> {
        if config.block_size == 0 {
            return Err(Error::configuration("block size must be greater than zero"));
        }
        if config.block_buffer_size == 0 {
            return Err(Error::configuration(
                "block buffer size must be greater than zero",
            ));
        }

        let source_size = probe::target_size_in_bytes(&config.device_path)?;
        if config.block_size as u64 > source_size {
            warn!(
                block_size = config.block_size,
                source_size,
                "block size exceeds the size of the backup target; this will waste space"
            );
        }
        let total_blocks = source_size.div_ceil(config.block_size as u64);

        let volume_name = config
            .device_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                Error::configuration(format!(
                    "cannot derive a volume name from '{}'",
                    config.device_path.display()
                ))
            })?;
        let volume = store
            .insert_volume(volume_name, &config.device_path.to_string_lossy())
            .await?;

        let last_full = store.find_last_full_backup(volume.id).await?;
        let backup_type = match last_full {
            Some(_) => BackupType::Differential,
            None => BackupType::Full,
        };

        if config.output_file_name.is_empty() {
            config.output_file_name = format!(
                "{}_{}_{}",
                volume.name,
                backup_type,
                Utc::now().timestamp_millis()
            );
        }
        let full_path = config.output_directory.join(&config.output_file_name);

        let record = store
            .insert_backup(NewBackup {
                volume_id: volume.id,
                file_name: &config.output_file_name,
                full_path: &full_path.to_string_lossy(),
                output_format: config.output_format,
                backup_type,
                total_blocks: total_blocks as i64,
                block_size: config.block_size as i64,
                size_in_bytes: source_size as i64,
            })
            .await?;

        info!(
            volume = %volume.name,
            backup_type = %backup_type,
            total_blocks,
            "created backup record"
        );

        Ok(Self {
            store,
            config,
            record,
            last_full,
            source_size,
        })
    }

    /// The backup record created for this run
    pub fn record(&self) -> &BackupRecord {
        &self.record
    }

    /// Byte length of the source as probed at construction
    pub fn source_size(&self) -> u64 {
        self.source_size
    }

    /// Stream the source and persist the backup.
    ///
    /// Windows are processed in strictly ascending order; within each
    /// window the blocks are hashed in parallel, new digests are
    /// persisted, their payloads appended to the artifact in
    /// ascending-position order, and the window's position rows are
    /// bulk-inserted.
    pub async fn run(&mut self) -> Result<()> {
        let mut source = File::open(&self.config.device_path)?;
        let mut target: Box<dyn Write> = match self.config.output_format {
            OutputFormat::File => Box::new(File::create(&self.record.full_path)?),
            OutputFormat::Stdout => Box::new(io::stdout()),
        };

        let block_size = self.config.block_size;
        let window_blocks = self.config.block_buffer_size;
        let window_bytes = block_size * window_blocks;
        let total_blocks = self.record.total_blocks as u64;

        let mut bytes_written: u64 = 0;
        let mut iteration: u64 = 0;

        while iteration * (window_blocks as u64) < total_blocks {
            // A short read trims the window; zero bytes means the source
            // ended early and the loop is done.
            let window = read_window(&mut source, window_bytes)?;
            if window.is_empty() {
                break;
            }

            let base_position = iteration * window_blocks as u64;
            let window_hashes = hash::hash_window(&window, block_size, base_position);

            bytes_written += self
                .write_blocks(
                    target.as_mut(),
                    &window,
                    base_position,
                    &window_hashes,
                    bytes_written,
                )
                .await?;
            self.insert_block_positions(&window_hashes).await?;

            iteration += 1;
        }

        target.flush()?;

        let artifact_size = match self.config.output_format {
            OutputFormat::File => std::fs::metadata(&self.record.full_path)?.len(),
            OutputFormat::Stdout => bytes_written,
        };
        self.store
            .update_backup_size(self.record.id, artifact_size as i64)
            .await?;
        self.record.size_in_bytes = artifact_size as i64;

        info!(
            backup_id = self.record.id,
            artifact_bytes = artifact_size,
            "backup run complete"
        );
        Ok(())
    }

    /// Persist the digests new to the store and append their payloads to
    /// the artifact. Returns the number of bytes written.
    ///
    /// A digest appearing at several positions of the window is written
    /// once, at its lowest position. Block rows are inserted in the same
    /// ascending-position order as the payloads so that block ids follow
    /// artifact order, and each row records this backup and the payload's
    /// byte offset in the artifact (`artifact_offset` is the artifact
    /// length before this window).
    async fn write_blocks(
        &self,
        target: &mut dyn Write,
        window: &[u8],
        base_position: u64,
        window_hashes: &[(u64, BlockDigest)],
        artifact_offset: u64,
    ) -> Result<u64> {
        let mut first_seen: HashMap<&BlockDigest, u64> = HashMap::new();
        for (position, digest) in window_hashes {
            first_seen.entry(digest).or_insert(*position);
        }

        let unique: Vec<BlockDigest> = first_seen.keys().map(|digest| (*digest).clone()).collect();
        let existing = self.store.find_existing_digests(&unique).await?;

        let mut fresh: Vec<(u64, BlockDigest)> = first_seen
            .into_iter()
            .filter(|(digest, _)| !existing.contains(*digest))
            .map(|(digest, position)| (position, digest.clone()))
            .collect();
        fresh.sort_by_key(|(position, _)| *position);

        if fresh.is_empty() {
            return Ok(0);
        }

        let block_size = self.config.block_size;
        let mut payloads = Vec::with_capacity(fresh.len() * block_size);
        let mut new_blocks = Vec::with_capacity(fresh.len());
        let mut offset = artifact_offset;

        for (position, digest) in &fresh {
            let start = (*position - base_position) as usize * block_size;
            let end = usize::min(start + block_size, window.len());
            new_blocks.push(NewBlock {
                digest: digest.clone(),
                backup_id: self.record.id,
                artifact_offset: offset as i64,
            });
            payloads.extend_from_slice(&window[start..end]);
            offset += (end - start) as u64;
        }

        self.store.insert_blocks(&new_blocks).await?;
        target.write_all(&payloads)?;
        debug!(
            blocks = fresh.len(),
            bytes = payloads.len(),
            "wrote new blocks to artifact"
        );
        Ok(payloads.len() as u64)
    }

    /// Bulk-insert the window's position rows.
    ///
    /// A differential run fetches the reference full backup's digests for
    /// exactly this window's position range in one query and skips every
    /// position whose content is unchanged.
    async fn insert_block_positions(&self, window_hashes: &[(u64, BlockDigest)]) -> Result<()> {
        let (first, last) = match (window_hashes.first(), window_hashes.last()) {
            (Some((first, _)), Some((last, _))) => (*first, *last),
            _ => return Ok(()),
        };

        let reference = match (&self.record.backup_type, &self.last_full) {
            (BackupType::Differential, Some(full)) => {
                self.store
                    .position_digests_in_range(full.id, first as i64, last as i64 + 1)
                    .await?
            }
            _ => HashMap::new(),
        };

        let mut unique: Vec<BlockDigest> = Vec::new();
        let mut seen: HashSet<&BlockDigest> = HashSet::new();
        for (_, digest) in window_hashes {
            if seen.insert(digest) {
                unique.push(digest.clone());
            }
        }
        let ids = self.store.blocks_by_digest(&unique).await?;

        let mut rows = Vec::with_capacity(window_hashes.len());
        for (position, digest) in window_hashes {
            if let Some(reference_digest) = reference.get(&(*position as i64)) {
                if reference_digest == digest {
                    continue;
                }
            }
            let block_id = ids.get(digest).ok_or_else(|| Error::Integrity {
                reason: format!("no block row for digest {digest}"),
            })?;
            rows.push((*block_id, *position as i64));
        }

        self.store
            .insert_block_positions_bulk(self.record.id, &rows)
            .await
    }
}

/// Fill a window buffer from the source, trimming to the bytes actually
/// read. Returns an empty buffer at end-of-source.
fn read_window(source: &mut File, capacity: usize) -> io::Result<Vec<u8>> {
    let mut window = vec![0u8; capacity];
    let mut filled = 0;

    while filled < capacity {
        let n = source.read(&mut window[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    window.truncate(filled);
    Ok(window)
}
