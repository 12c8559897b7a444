//! ReDB-backed configuration cache
//!
//! Holds the small JSON documents the wizard pages need at render time
//! (option lists, field copy). Each key carries a monotonically increasing
//! version; the ETag is derived from it. The last issued version of a key
//! outlives `delete`, so a recreated document never reuses an old ETag.
//!
//! Key format: {key}

use crate::error::{Result, StoreError};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

const CONFIG: TableDefinition<&str, &[u8]> = TableDefinition::new("config");
const VERSIONS: TableDefinition<&str, u64> = TableDefinition::new("config_versions");

/// A cached document with its version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedConfig {
    pub version: u64,
    pub payload: Value,
}

impl CachedConfig {
    pub fn etag(&self) -> String {
        format!("W/\"{}\"", self.version)
    }
}

pub struct ConfigCache {
    db: Database,
}

#[allow(clippy::result_large_err)]
impl ConfigCache {
    /// Open the cache (create if not exists)
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(CONFIG)?;
            let _ = write_txn.open_table(VERSIONS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    pub fn get(&self, key: &str) -> Result<Option<CachedConfig>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONFIG)?;

        match table.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Store a document, bumping its version.
    pub fn set(&self, key: &str, payload: Value) -> Result<CachedConfig> {
        validate_key(key)?;

        let write_txn = self.db.begin_write()?;
        let entry = {
            let mut versions = write_txn.open_table(VERSIONS)?;
            let previous = versions.get(key)?.map(|v| v.value()).unwrap_or(0);
            let entry = CachedConfig {
                version: previous + 1,
                payload,
            };
            versions.insert(key, entry.version)?;

            let mut table = write_txn.open_table(CONFIG)?;
            let bytes = serde_json::to_vec(&entry)?;
            table.insert(key, bytes.as_slice())?;
            entry
        };
        write_txn.commit()?;

        tracing::debug!(key, version = entry.version, "Stored config document");
        Ok(entry)
    }

    /// Remove a document. Its version counter is kept.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(CONFIG)?;
            table.remove(key)?.is_some()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Whether `etag` still names the stored version of `key`.
    pub fn is_current(&self, key: &str, etag: &str) -> Result<bool> {
        Ok(self
            .get(key)?
            .is_some_and(|entry| entry.etag() == etag.trim()))
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONFIG)?;

        let mut keys = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }
}

fn validate_key(key: &str) -> Result<()> {
    let ok = !key.is_empty()
        && key.len() <= 128
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}
