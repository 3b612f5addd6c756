//! Persistent alloc storage over an embedded key/value store.
//!
//! Each quota is one 24-byte record at key `namespace_resource`: three
//! big-endian `i64`s (`allocated`, `capacity`, `version`), portable across
//! machines. Every operation runs in a single read-write transaction, so
//! concurrent mutators serialise on the store's transaction machinery rather
//! than an in-process lock.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use tracing::info;

use crate::config::AllocStrategyConfig;
use crate::error::StorageError;
use crate::rate::quota_id;

const QUOTAS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("quotas");

const DB_FILE: &str = "alloc.redb";

/// One persisted quota record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaRecord {
    pub allocated: i64,
    pub capacity: i64,
    pub version: i64,
}

impl QuotaRecord {
    pub const ENCODED_LEN: usize = 24;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..8].copy_from_slice(&self.allocated.to_be_bytes());
        buf[8..16].copy_from_slice(&self.capacity.to_be_bytes());
        buf[16..24].copy_from_slice(&self.version.to_be_bytes());
        buf
    }

    pub fn decode(key: &str, raw: &[u8]) -> Result<Self, StorageError> {
        if raw.len() != Self::ENCODED_LEN {
            return Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: format!("expected {} bytes, got {}", Self::ENCODED_LEN, raw.len()),
            });
        }

        Ok(Self {
            allocated: i64::from_be_bytes(raw[0..8].try_into().unwrap()),
            capacity: i64::from_be_bytes(raw[8..16].try_into().unwrap()),
            version: i64::from_be_bytes(raw[16..24].try_into().unwrap()),
        })
    }
}

/// redb-backed alloc storage for a single, non-replicated node.
pub struct LocalStorage {
    db: Database,
}

impl LocalStorage {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| StorageError::Corrupt {
            key: dir.display().to_string(),
            reason: format!("failed to create storage dir: {}", e),
        })?;

        let path = dir.join(DB_FILE);
        let db = Database::create(&path)?;

        // Make sure the table exists before any read-only transaction runs.
        let txn = db.begin_write()?;
        txn.open_table(QUOTAS_TABLE)?;
        txn.commit()?;

        info!(path = %path.display(), "opened local alloc storage");

        Ok(Self { db })
    }

    pub fn view(&self, namespace: &str, resource: &str) -> Result<(i64, i64, i64), StorageError> {
        let id = quota_id(namespace, resource);

        let txn = self.db.begin_read()?;
        let table = txn.open_table(QUOTAS_TABLE)?;
        let guard = table.get(id.as_str())?.ok_or(StorageError::NotFound)?;
        let record = QuotaRecord::decode(&id, guard.value())?;

        Ok((record.allocated, record.capacity, record.version))
    }

    pub fn alloc(
        &self,
        namespace: &str,
        resource: &str,
        tokens: i64,
        version: i64,
    ) -> Result<(i64, i64, bool), StorageError> {
        self.mutate(namespace, resource, version, |record| {
            let new_allocated = record.allocated + tokens;
            if new_allocated > record.capacity {
                return None;
            }
            Some(new_allocated)
        })
    }

    pub fn free(
        &self,
        namespace: &str,
        resource: &str,
        tokens: i64,
        version: i64,
    ) -> Result<(i64, i64, bool), StorageError> {
        self.mutate(namespace, resource, version, |record| {
            let new_allocated = record.allocated - tokens;
            if new_allocated < 0 {
                return None;
            }
            Some(new_allocated)
        })
    }

    /// Idempotent: an existing record is left untouched.
    pub fn register_quota(
        &self,
        namespace: &str,
        resource: &str,
        cfg: &AllocStrategyConfig,
    ) -> Result<(), StorageError> {
        let id = quota_id(namespace, resource);

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(QUOTAS_TABLE)?;
            if table.get(id.as_str())?.is_none() {
                let record = QuotaRecord {
                    allocated: 0,
                    capacity: cfg.capacity,
                    version: 1,
                };
                table.insert(id.as_str(), record.encode().as_slice())?;
            }
        }
        txn.commit()?;

        Ok(())
    }

    /// Shared check-and-write path for alloc/free. `apply` returns the new
    /// allocated count, or `None` when the request must be refused without
    /// mutating.
    fn mutate(
        &self,
        namespace: &str,
        resource: &str,
        version: i64,
        apply: impl FnOnce(&QuotaRecord) -> Option<i64>,
    ) -> Result<(i64, i64, bool), StorageError> {
        let id = quota_id(namespace, resource);

        let txn = self.db.begin_write()?;
        let outcome;
        {
            let mut table = txn.open_table(QUOTAS_TABLE)?;
            let record = {
                let guard = table.get(id.as_str())?.ok_or(StorageError::NotFound)?;
                QuotaRecord::decode(&id, guard.value())?
            };

            if version != 0 && record.version != version {
                return Err(StorageError::InvalidVersion);
            }

            match apply(&record) {
                None => {
                    outcome = (record.capacity - record.allocated, record.version, false);
                }
                Some(new_allocated) => {
                    let updated = QuotaRecord {
                        allocated: new_allocated,
                        capacity: record.capacity,
                        version: record.version + 1,
                    };
                    table.insert(id.as_str(), updated.encode().as_slice())?;
                    outcome = (
                        updated.capacity - updated.allocated,
                        updated.version,
                        true,
                    );
                }
            }
        }
        txn.commit()?;

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_codec_round_trips() {
        let record = QuotaRecord {
            allocated: 3,
            capacity: 10,
            version: 7,
        };
        let raw = record.encode();
        assert_eq!(raw.len(), QuotaRecord::ENCODED_LEN);
        assert_eq!(QuotaRecord::decode("k", &raw).unwrap(), record);
    }

    #[test]
    fn record_encoding_is_big_endian() {
        let record = QuotaRecord {
            allocated: 1,
            capacity: 2,
            version: 3,
        };
        let raw = record.encode();
        assert_eq!(&raw[0..8], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&raw[8..16], &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(&raw[16..24], &[0, 0, 0, 0, 0, 0, 0, 3]);
    }

    #[test]
    fn record_decode_rejects_bad_lengths() {
        assert!(matches!(
            QuotaRecord::decode("k", &[1, 2, 3]),
            Err(StorageError::Corrupt { .. })
        ));
    }
}
