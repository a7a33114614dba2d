//! SQLite-backed metadata store for volumes, backups, blocks, and
//! block positions.
//!
//! The store owns all transaction boundaries: every bulk write runs in an
//! explicit transaction and rolls back on error. A repeated block digest
//! is absorbed by the UNIQUE constraint and never raises; a repeated
//! `(backup_id, block_id, position)` triple is a caller bug and
//! propagates.

use crate::hash::BlockDigest;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// SQLite caps the number of bound parameters per statement, so batched
/// queries are chunked below that limit.
const BIND_LIMIT: usize = 900;

/// Output destination recorded for a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    File,
    Stdout,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::File => "file",
            OutputFormat::Stdout => "stdout",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(OutputFormat::File),
            "stdout" => Ok(OutputFormat::Stdout),
            other => Err(Error::configuration(format!(
                "unknown output format '{other}', expected 'file' or 'stdout'"
            ))),
        }
    }
}

/// Whether a backup records every position or only changed ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Differential,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Differential => "differential",
        }
    }
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named source path; every backup belongs to exactly one volume
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Volume {
    pub id: i64,
    pub name: String,
    pub device_path: String,
}

/// One backup run and its fixed geometry.
///
/// `size_in_bytes` holds the source size at creation and is overwritten
/// with the artifact size once the run completes. `total_blocks` and
/// `block_size` never change after creation.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BackupRecord {
    pub id: i64,
    pub volume_id: i64,
    pub file_name: String,
    pub full_path: String,
    pub output_format: OutputFormat,
    pub backup_type: BackupType,
    pub size_in_bytes: i64,
    pub total_blocks: i64,
    pub block_size: i64,
    pub created_at: DateTime<Utc>,
}

/// A content-addressed block row; `hash` is globally unique.
///
/// `backup_id` and `artifact_offset` record which backup's artifact holds
/// the payload and at what byte offset. Later backups that reference the
/// same digest never rewrite the payload, so restores read it from here.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Block {
    pub id: i64,
    pub hash: String,
    pub backup_id: i64,
    pub artifact_offset: i64,
    pub created_at: DateTime<Utc>,
}

/// One position-to-block reference within a backup
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BlockPosition {
    pub id: i64,
    pub backup_id: i64,
    pub block_id: i64,
    pub position: i64,
}

/// Fields required to persist a newly observed block
#[derive(Debug)]
pub struct NewBlock {
    pub digest: BlockDigest,
    pub backup_id: i64,
    pub artifact_offset: i64,
}

/// One position of a backup joined with the artifact holding its payload
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BlockPlacement {
    pub position: i64,
    pub hash: String,
    pub artifact_offset: i64,
    pub artifact_path: String,
}

/// Fields required to create a backup record
#[derive(Debug)]
pub struct NewBackup<'a> {
    pub volume_id: i64,
    pub file_name: &'a str,
    pub full_path: &'a str,
    pub output_format: OutputFormat,
    pub backup_type: BackupType,
    pub total_blocks: i64,
    pub block_size: i64,
    pub size_in_bytes: i64,
}

/// Handle to the metadata database
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the metadata database at the given path.
    ///
    /// A single connection serializes writes; WAL mode keeps concurrent
    /// readers from blocking on them.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Create all tables if they don't exist; idempotent.
    pub async fn setup_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS volumes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                device_path TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                volume_id INTEGER NOT NULL REFERENCES volumes(id),
                file_name TEXT NOT NULL,
                full_path TEXT NOT NULL,
                output_format TEXT NOT NULL DEFAULT 'file'
                    CHECK (output_format IN ('file', 'stdout')),
                backup_type TEXT NOT NULL
                    CHECK (backup_type IN ('full', 'differential')),
                size_in_bytes INTEGER NOT NULL DEFAULT 0,
                total_blocks INTEGER NOT NULL,
                block_size INTEGER NOT NULL,
                created_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blocks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hash TEXT NOT NULL UNIQUE,
                backup_id INTEGER NOT NULL REFERENCES backups(id),
                artifact_offset INTEGER NOT NULL,
                created_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS block_positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backup_id INTEGER NOT NULL REFERENCES backups(id),
                block_id INTEGER NOT NULL REFERENCES blocks(id),
                position INTEGER NOT NULL,
                UNIQUE (backup_id, block_id, position)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_block_positions_backup \
             ON block_positions(backup_id, position)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Look up a volume by name
    pub async fn find_volume_by_name(&self, name: &str) -> Result<Option<Volume>> {
        let volume = sqlx::query_as::<_, Volume>(
            "SELECT id, name, device_path FROM volumes WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(volume)
    }

    /// Insert a volume, returning the existing row on a name conflict.
    ///
    /// The device path is refreshed either way: a volume may move between
    /// backups without becoming a new volume.
    pub async fn insert_volume(&self, name: &str, device_path: &str) -> Result<Volume> {
        let volume = sqlx::query_as::<_, Volume>(
            r#"
            INSERT INTO volumes (name, device_path) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET device_path = excluded.device_path
            RETURNING id, name, device_path
            "#,
        )
        .bind(name)
        .bind(device_path)
        .fetch_one(&self.pool)
        .await?;
        Ok(volume)
    }

    /// Insert a backup record, returning it with its assigned id
    pub async fn insert_backup(&self, backup: NewBackup<'_>) -> Result<BackupRecord> {
        let record = sqlx::query_as::<_, BackupRecord>(
            r#"
            INSERT INTO backups (
                volume_id, file_name, full_path, output_format, backup_type,
                size_in_bytes, total_blocks, block_size, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id, volume_id, file_name, full_path, output_format,
                      backup_type, size_in_bytes, total_blocks, block_size,
                      created_at
            "#,
        )
        .bind(backup.volume_id)
        .bind(backup.file_name)
        .bind(backup.full_path)
        .bind(backup.output_format)
        .bind(backup.backup_type)
        .bind(backup.size_in_bytes)
        .bind(backup.total_blocks)
        .bind(backup.block_size)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    /// Record the artifact byte length once a run completes
    pub async fn update_backup_size(&self, backup_id: i64, size_in_bytes: i64) -> Result<()> {
        sqlx::query("UPDATE backups SET size_in_bytes = ? WHERE id = ?")
            .bind(size_in_bytes)
            .bind(backup_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Most recent full backup of a volume, if any
    pub async fn find_last_full_backup(&self, volume_id: i64) -> Result<Option<BackupRecord>> {
        let record = sqlx::query_as::<_, BackupRecord>(
            "SELECT * FROM backups WHERE volume_id = ? AND backup_type = 'full' \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(volume_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Look up a backup by id
    pub async fn find_backup(&self, backup_id: i64) -> Result<Option<BackupRecord>> {
        let record = sqlx::query_as::<_, BackupRecord>("SELECT * FROM backups WHERE id = ?")
            .bind(backup_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// All backups, ascending by id
    pub async fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        let records = sqlx::query_as::<_, BackupRecord>("SELECT * FROM backups ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    /// Insert a single block; a repeated digest is a no-op that keeps the
    /// original provenance. Returns the row either way.
    pub async fn insert_block(
        &self,
        digest: &BlockDigest,
        backup_id: i64,
        artifact_offset: i64,
    ) -> Result<Block> {
        sqlx::query(
            "INSERT INTO blocks (hash, backup_id, artifact_offset, created_at) \
             VALUES (?, ?, ?, ?) ON CONFLICT(hash) DO NOTHING",
        )
        .bind(digest.as_str())
        .bind(backup_id)
        .bind(artifact_offset)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let block = sqlx::query_as::<_, Block>("SELECT * FROM blocks WHERE hash = ?")
            .bind(digest.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(block)
    }

    /// Insert a batch of blocks in one transaction.
    ///
    /// Ids are assigned in slice order, so callers control the relative
    /// ordering of new blocks. Digests already present are skipped and
    /// keep their original provenance.
    pub async fn insert_blocks(&self, blocks: &[NewBlock]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }

        let created_at = Utc::now();
        let mut tx = self.pool.begin().await?;

        for batch in blocks.chunks(BIND_LIMIT / 4) {
            let values = vec!["(?, ?, ?, ?)"; batch.len()].join(", ");
            let sql = format!(
                "INSERT INTO blocks (hash, backup_id, artifact_offset, created_at) \
                 VALUES {values} ON CONFLICT(hash) DO NOTHING"
            );

            let mut query = sqlx::query(&sql);
            for block in batch {
                query = query
                    .bind(block.digest.as_str())
                    .bind(block.backup_id)
                    .bind(block.artifact_offset)
                    .bind(created_at);
            }
            query.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Return the subset of the given digests already present in the
    /// blocks table
    pub async fn find_existing_digests(
        &self,
        digests: &[BlockDigest],
    ) -> Result<HashSet<BlockDigest>> {
        let mut present = HashSet::with_capacity(digests.len());

        for batch in digests.chunks(BIND_LIMIT) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!("SELECT hash FROM blocks WHERE hash IN ({placeholders})");

            let mut query = sqlx::query_as::<_, (String,)>(&sql);
            for digest in batch {
                query = query.bind(digest.as_str());
            }
            for (hash,) in query.fetch_all(&self.pool).await? {
                present.insert(BlockDigest::new(hash));
            }
        }

        Ok(present)
    }

    /// Resolve digests to block ids
    pub async fn blocks_by_digest(
        &self,
        digests: &[BlockDigest],
    ) -> Result<HashMap<BlockDigest, i64>> {
        let mut ids = HashMap::with_capacity(digests.len());

        for batch in digests.chunks(BIND_LIMIT) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!("SELECT hash, id FROM blocks WHERE hash IN ({placeholders})");

            let mut query = sqlx::query_as::<_, (String, i64)>(&sql);
            for digest in batch {
                query = query.bind(digest.as_str());
            }
            for (hash, id) in query.fetch_all(&self.pool).await? {
                ids.insert(BlockDigest::new(hash), id);
            }
        }

        Ok(ids)
    }

    /// Bulk-insert `(block_id, position)` references for a backup in one
    /// transaction. An empty slice is a no-op.
    pub async fn insert_block_positions_bulk(
        &self,
        backup_id: i64,
        rows: &[(i64, i64)],
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for batch in rows.chunks(BIND_LIMIT / 3) {
            let values = vec!["(?, ?, ?)"; batch.len()].join(", ");
            let sql = format!(
                "INSERT INTO block_positions (backup_id, block_id, position) VALUES {values}"
            );

            let mut query = sqlx::query(&sql);
            for &(block_id, position) in batch {
                query = query.bind(backup_id).bind(block_id).bind(position);
            }
            query.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// All position rows of a backup, ordered by position
    pub async fn positions_by_backup(&self, backup_id: i64) -> Result<Vec<BlockPosition>> {
        let positions = sqlx::query_as::<_, BlockPosition>(
            "SELECT id, backup_id, block_id, position FROM block_positions \
             WHERE backup_id = ? ORDER BY position",
        )
        .bind(backup_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(positions)
    }

    /// Digests of a backup's positions within `[lo, hi)`, keyed by
    /// position. One range query serves a whole pipeline window.
    pub async fn position_digests_in_range(
        &self,
        backup_id: i64,
        lo: i64,
        hi: i64,
    ) -> Result<HashMap<i64, BlockDigest>> {
        let rows = sqlx::query_as::<_, (i64, String)>(
            "SELECT bp.position, b.hash FROM block_positions bp \
             JOIN blocks b ON b.id = bp.block_id \
             WHERE bp.backup_id = ? AND bp.position >= ? AND bp.position < ?",
        )
        .bind(backup_id)
        .bind(lo)
        .bind(hi)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(position, hash)| (position, BlockDigest::new(hash)))
            .collect())
    }

    /// Every position of a backup joined with the digest and the artifact
    /// holding its payload, ordered by position.
    ///
    /// Positions may point at payloads stored by earlier backups (that is
    /// deduplication working), so the owning artifact is resolved through
    /// the block's provenance, not the backup being read.
    pub async fn block_placements_for_backup(
        &self,
        backup_id: i64,
    ) -> Result<Vec<BlockPlacement>> {
        let placements = sqlx::query_as::<_, BlockPlacement>(
            "SELECT bp.position AS position, b.hash AS hash, \
                    b.artifact_offset AS artifact_offset, src.full_path AS artifact_path \
             FROM block_positions bp \
             JOIN blocks b ON b.id = bp.block_id \
             JOIN backups src ON src.id = b.backup_id \
             WHERE bp.backup_id = ? ORDER BY bp.position",
        )
        .bind(backup_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(placements)
    }

    /// Number of distinct blocks referenced by a backup
    pub async fn unique_blocks_in_backup(&self, backup_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT block_id) FROM block_positions WHERE backup_id = ?",
        )
        .bind(backup_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Global count of distinct digests ever observed
    pub async fn total_blocks(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
