//! Alloc engine: capped allocation counters with optimistic versioning.
//!
//! One abstract operation set — `view`, `alloc`, `free`, `register_quota` —
//! over a closed set of storage back-ends: in-memory, embedded key/value,
//! and raft-replicated. The raft variant additionally carries the
//! join/exit capability, exposed only through the internal API.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::alloc_local::LocalStorage;
use crate::alloc_memory::MemoryStorage;
use crate::alloc_raft::ReplicatedStorage;
use crate::client::RaftJoinClient;
use crate::config::AllocConfig;
use crate::error::{ConfigError, StorageError};
use crate::gossip::MemberlistService;
use crate::metrics::ALLOC_OPS_TOTAL;

pub const MEMORY_BACKEND: &str = "memory";
pub const LOCAL_BACKEND: &str = "local";
pub const RAFT_BACKEND: &str = "raft";

enum AllocStorage {
    Memory(MemoryStorage),
    Local(LocalStorage),
    Raft(Arc<ReplicatedStorage>),
}

/// The alloc engine service.
pub struct AllocService {
    cfg: AllocConfig,
    storage: AllocStorage,
}

impl AllocService {
    /// Builds the configured back-end. Memory and local back-ends register
    /// their quotas immediately; the raft back-end waits for
    /// [`AllocService::start`], once cluster membership is settled.
    ///
    /// `raft_addr` is this node's internal HTTP address, used as the raft
    /// peer address in replicated mode.
    pub async fn new(cfg: AllocConfig, raft_addr: String) -> Result<Self, ConfigError> {
        let storage = match cfg.backend.as_str() {
            MEMORY_BACKEND => {
                let storage = MemoryStorage::new();
                for quota in &cfg.quotas {
                    storage
                        .register_quota(&quota.namespace, &quota.resource, &quota.strategy)
                        .map_err(|e| ConfigError::Validation(e.to_string()))?;
                }
                AllocStorage::Memory(storage)
            }
            LOCAL_BACKEND => {
                let storage = LocalStorage::open(&cfg.local.dir)
                    .map_err(|e| ConfigError::Validation(e.to_string()))?;
                for quota in &cfg.quotas {
                    storage
                        .register_quota(&quota.namespace, &quota.resource, &quota.strategy)
                        .map_err(|e| ConfigError::Validation(e.to_string()))?;
                }
                AllocStorage::Local(storage)
            }
            RAFT_BACKEND => {
                let storage = ReplicatedStorage::open(cfg.raft.clone(), raft_addr)
                    .await
                    .map_err(|e| ConfigError::Validation(e.to_string()))?;
                AllocStorage::Raft(Arc::new(storage))
            }
            other => return Err(ConfigError::UnsupportedBackend(other.to_string())),
        };

        Ok(Self { cfg, storage })
    }

    /// Finishes startup. In raft mode this settles cluster membership,
    /// waits for every shard to elect a leader, and registers the
    /// configured quotas through the log.
    pub async fn start(
        &self,
        memberlist: &MemberlistService,
        join_client: &RaftJoinClient,
    ) -> Result<(), StorageError> {
        let AllocStorage::Raft(storage) = &self.storage else {
            return Ok(());
        };

        storage.start(memberlist, join_client).await?;
        storage
            .await_healthy(std::time::Duration::from_secs(30))
            .await?;

        for quota in &self.cfg.quotas {
            match storage
                .register_quota(&quota.namespace, &quota.resource, &quota.strategy)
                .await
            {
                Ok(()) => info!(
                    namespace = %quota.namespace,
                    resource = %quota.resource,
                    "registered replicated quota"
                ),
                // Follower replicas cannot propose; the leader registers the
                // same configured set.
                Err(e) => warn!(
                    namespace = %quota.namespace,
                    resource = %quota.resource,
                    error = %e,
                    "quota registration deferred to the leader"
                ),
            }
        }

        Ok(())
    }

    pub async fn view(
        &self,
        namespace: &str,
        resource: &str,
    ) -> Result<(i64, i64, i64), StorageError> {
        debug!(namespace = %namespace, resource = %resource, "view called");

        match &self.storage {
            AllocStorage::Memory(s) => s.view(namespace, resource),
            AllocStorage::Local(s) => s.view(namespace, resource),
            AllocStorage::Raft(s) => s.view(namespace, resource).await,
        }
    }

    pub async fn alloc(
        &self,
        namespace: &str,
        resource: &str,
        tokens: i64,
        version: i64,
    ) -> Result<(i64, i64, bool), StorageError> {
        debug!(namespace = %namespace, resource = %resource, tokens = tokens, "alloc called");

        let result = match &self.storage {
            AllocStorage::Memory(s) => s.alloc(namespace, resource, tokens, version),
            AllocStorage::Local(s) => s.alloc(namespace, resource, tokens, version),
            AllocStorage::Raft(s) => s.alloc(namespace, resource, tokens, version).await,
        };

        if let Ok((_, _, ok)) = &result {
            ALLOC_OPS_TOTAL
                .with_label_values(&["alloc", if *ok { "true" } else { "false" }])
                .inc();
        }

        result
    }

    pub async fn free(
        &self,
        namespace: &str,
        resource: &str,
        tokens: i64,
        version: i64,
    ) -> Result<(i64, i64, bool), StorageError> {
        debug!(namespace = %namespace, resource = %resource, tokens = tokens, "free called");

        let result = match &self.storage {
            AllocStorage::Memory(s) => s.free(namespace, resource, tokens, version),
            AllocStorage::Local(s) => s.free(namespace, resource, tokens, version),
            AllocStorage::Raft(s) => s.free(namespace, resource, tokens, version).await,
        };

        if let Ok((_, _, ok)) = &result {
            ALLOC_OPS_TOTAL
                .with_label_values(&["free", if *ok { "true" } else { "false" }])
                .inc();
        }

        result
    }

    /// The replicated back-end's narrow cluster-membership interface, when
    /// this node runs one.
    pub fn raft(&self) -> Option<&Arc<ReplicatedStorage>> {
        match &self.storage {
            AllocStorage::Raft(s) => Some(s),
            _ => None,
        }
    }

    /// Whether the engine can serve. Non-replicated back-ends are ready as
    /// soon as they exist; the raft back-end needs a leader on every shard.
    pub fn healthy(&self) -> bool {
        match &self.storage {
            AllocStorage::Raft(s) => s.all_shards_healthy(),
            _ => true,
        }
    }

    pub async fn shutdown(&self) {
        if let AllocStorage::Raft(s) = &self.storage {
            s.shutdown().await;
        }
    }
}
