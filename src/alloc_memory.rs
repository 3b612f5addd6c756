//! In-memory alloc storage.
//!
//! A map of capped buckets, each guarded by its own mutex so operations on
//! distinct keys never contend. The map itself takes a reader/writer lock:
//! registration writes, every other operation reads.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::config::AllocStrategyConfig;
use crate::error::StorageError;
use crate::rate::quota_id;

/// A capped counter with an optimistic-concurrency version.
///
/// `version` starts at 1 and advances by exactly one on every successful
/// mutation. A caller-supplied expected version of 0 disables the check.
#[derive(Debug)]
pub struct CappedBucket {
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    allocated: i64,
    capacity: i64,
    version: i64,
}

impl CappedBucket {
    pub fn new(capacity: i64) -> Self {
        debug_assert!(capacity > 0);

        Self {
            state: Mutex::new(BucketState {
                allocated: 0,
                capacity,
                version: 1,
            }),
        }
    }

    pub fn view(&self) -> (i64, i64, i64) {
        let s = self.state.lock().unwrap();
        (s.allocated, s.capacity, s.version)
    }

    pub fn alloc(&self, tokens: i64, version: i64) -> Result<(i64, i64, bool), StorageError> {
        let mut s = self.state.lock().unwrap();

        if version != 0 && s.version != version {
            return Err(StorageError::InvalidVersion);
        }

        if s.allocated + tokens > s.capacity {
            return Ok((s.capacity - s.allocated, s.version, false));
        }

        s.allocated += tokens;
        s.version += 1;

        Ok((s.capacity - s.allocated, s.version, true))
    }

    pub fn free(&self, tokens: i64, version: i64) -> Result<(i64, i64, bool), StorageError> {
        let mut s = self.state.lock().unwrap();

        if version != 0 && s.version != version {
            return Err(StorageError::InvalidVersion);
        }

        if s.allocated - tokens < 0 {
            return Ok((s.capacity - s.allocated, s.version, false));
        }

        s.allocated -= tokens;
        s.version += 1;

        Ok((s.capacity - s.allocated, s.version, true))
    }
}

/// In-memory alloc storage backing a single process.
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, CappedBucket>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn view(&self, namespace: &str, resource: &str) -> Result<(i64, i64, i64), StorageError> {
        let buckets = self.buckets.read().unwrap();
        let bucket = buckets
            .get(&quota_id(namespace, resource))
            .ok_or(StorageError::NotFound)?;

        Ok(bucket.view())
    }

    pub fn alloc(
        &self,
        namespace: &str,
        resource: &str,
        tokens: i64,
        version: i64,
    ) -> Result<(i64, i64, bool), StorageError> {
        let buckets = self.buckets.read().unwrap();
        let bucket = buckets
            .get(&quota_id(namespace, resource))
            .ok_or(StorageError::NotFound)?;

        bucket.alloc(tokens, version)
    }

    pub fn free(
        &self,
        namespace: &str,
        resource: &str,
        tokens: i64,
        version: i64,
    ) -> Result<(i64, i64, bool), StorageError> {
        let buckets = self.buckets.read().unwrap();
        let bucket = buckets
            .get(&quota_id(namespace, resource))
            .ok_or(StorageError::NotFound)?;

        bucket.free(tokens, version)
    }

    /// Idempotent: an existing bucket is left untouched.
    pub fn register_quota(
        &self,
        namespace: &str,
        resource: &str,
        cfg: &AllocStrategyConfig,
    ) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().unwrap();
        buckets
            .entry(quota_id(namespace, resource))
            .or_insert_with(|| CappedBucket::new(cfg.capacity));

        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_with_quota(capacity: i64) -> MemoryStorage {
        let storage = MemoryStorage::new();
        storage
            .register_quota("pool", "mem", &AllocStrategyConfig { capacity })
            .unwrap();
        storage
    }

    #[test]
    fn fresh_bucket_views_empty_at_version_one() {
        let storage = storage_with_quota(10);
        assert_eq!(storage.view("pool", "mem").unwrap(), (0, 10, 1));
    }

    #[test]
    fn alloc_and_free_advance_the_version_once_per_success() {
        let storage = storage_with_quota(10);

        assert_eq!(storage.alloc("pool", "mem", 3, 1).unwrap(), (7, 2, true));

        // Over capacity: no mutation, no version bump.
        assert_eq!(storage.alloc("pool", "mem", 8, 2).unwrap(), (7, 2, false));

        assert_eq!(storage.free("pool", "mem", 3, 2).unwrap(), (10, 3, true));
    }

    #[test]
    fn version_mismatch_leaves_state_unchanged() {
        let storage = storage_with_quota(10);
        storage.alloc("pool", "mem", 1, 0).unwrap(); // version -> 2

        assert!(matches!(
            storage.alloc("pool", "mem", 1, 7),
            Err(StorageError::InvalidVersion)
        ));
        assert_eq!(storage.view("pool", "mem").unwrap(), (1, 10, 2));
    }

    #[test]
    fn version_zero_disables_the_check() {
        let storage = storage_with_quota(10);
        assert_eq!(storage.alloc("pool", "mem", 2, 0).unwrap(), (8, 2, true));
        assert_eq!(storage.free("pool", "mem", 2, 0).unwrap(), (10, 3, true));
    }

    #[test]
    fn free_below_zero_is_rejected_without_mutation() {
        let storage = storage_with_quota(10);
        assert_eq!(storage.free("pool", "mem", 1, 1).unwrap(), (10, 1, false));
        assert_eq!(storage.view("pool", "mem").unwrap(), (0, 10, 1));
    }

    #[test]
    fn alloc_then_free_returns_to_prior_state_two_versions_later() {
        let storage = storage_with_quota(10);
        let (_, _, before_version) = storage.view("pool", "mem").unwrap();

        storage.alloc("pool", "mem", 4, 0).unwrap();
        storage.free("pool", "mem", 4, 0).unwrap();

        let (allocated, _, version) = storage.view("pool", "mem").unwrap();
        assert_eq!(allocated, 0);
        assert_eq!(version, before_version + 2);
    }

    #[test]
    fn registration_is_idempotent() {
        let storage = storage_with_quota(10);
        storage.alloc("pool", "mem", 5, 0).unwrap();

        // Same key again, even with a different capacity: no-op.
        storage
            .register_quota("pool", "mem", &AllocStrategyConfig { capacity: 99 })
            .unwrap();
        assert_eq!(storage.view("pool", "mem").unwrap(), (5, 10, 2));
    }

    #[test]
    fn unknown_keys_return_not_found() {
        let storage = MemoryStorage::new();
        assert!(matches!(
            storage.view("ns", "res"),
            Err(StorageError::NotFound)
        ));
        assert!(matches!(
            storage.alloc("ns", "res", 1, 0),
            Err(StorageError::NotFound)
        ));
        assert!(matches!(
            storage.free("ns", "res", 1, 0),
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn allocated_never_leaves_bounds_under_interleaving() {
        let storage = storage_with_quota(5);

        for _ in 0..50 {
            let _ = storage.alloc("pool", "mem", 2, 0);
            let (allocated, capacity, _) = storage.view("pool", "mem").unwrap();
            assert!(allocated >= 0 && allocated <= capacity);
            let _ = storage.free("pool", "mem", 1, 0);
            let (allocated, capacity, _) = storage.view("pool", "mem").unwrap();
            assert!(allocated >= 0 && allocated <= capacity);
        }
    }
}
