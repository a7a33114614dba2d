//! # blockvault
//!
//! Block-level, content-addressed, deduplicating backup and restore for
//! byte-addressable sources (regular files and block devices).
//!
//! A source is split into fixed-size blocks, each identified by the digest
//! of its bytes. Blocks are stored at most once across all backups; a
//! backup is an ordered map of positions to blocks kept in a SQLite
//! metadata store, next to an artifact file holding only the payloads that
//! were new to the store during that run. A differential backup records
//! only positions whose content differs from the most recent full backup
//! of the same volume.

pub mod backup;
pub mod cli;
pub mod error;
pub mod format;
pub mod hash;
pub mod logging;
pub mod probe;
pub mod restore;
pub mod store;

pub use error::{Error, Result};
