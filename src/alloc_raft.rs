//! Raft-replicated alloc storage.
//!
//! A fixed number of shards is chosen at startup; each shard is an
//! independent raft group over the keys crc32 assigns to it. Mutations go
//! through the log via `client_write`; reads take the linearizable-read path
//! and consult the local state machine.
//!
//! ## Replica lifecycle
//!
//! Replica 1 bootstraps a fresh cluster with itself as the only voter.
//! Every other replica joins over the internal HTTP API against the
//! gossip-discovered peer set, with backoff; the receiving node adds the
//! newcomer to every shard and reports whether it was already a member. A
//! replica whose raft and data directories already exist rejoins from local
//! state without re-requesting membership.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use openraft::storage::Adaptor;
use openraft::BasicNode;
use tracing::{info, warn};

use crate::client::RaftJoinClient;
use crate::config::{AllocStrategyConfig, RaftStorageConfig};
use crate::error::StorageError;
use crate::gossip::MemberlistService;
use crate::raft::{
    shard_id_for_quota, NodeId, QuotaCommand, RaftInstance, ShardData, ShardStore,
};
use crate::raft_network::HttpRaftNetworkFactory;

/// Bounded deadline for a single proposal. A timeout is a transport-level
/// error and safe to retry under the version check.
const PROPOSE_TIMEOUT: Duration = Duration::from_secs(5);

struct Shard {
    raft: RaftInstance,
    data: Arc<ShardData>,
}

/// The replicated alloc back-end: one raft group per shard plus the
/// join/exit capability exposed through the internal API.
pub struct ReplicatedStorage {
    cfg: RaftStorageConfig,
    raft_addr: String,
    shards: BTreeMap<u64, Shard>,
    had_state: bool,
}

impl ReplicatedStorage {
    /// Creates the shard stores and raft instances. Cluster membership is
    /// settled later by [`ReplicatedStorage::start`], once the HTTP server
    /// is reachable for peers.
    pub async fn open(cfg: RaftStorageConfig, raft_addr: String) -> Result<Self, StorageError> {
        if cfg.shards == 0 {
            return Err(StorageError::Raft("shard count must be at least 1".into()));
        }

        let had_state = raft_and_data_dirs_exist(&cfg.dir, cfg.replica_id);
        let (raft_dir, data_dir) = create_raft_and_data_dirs(&cfg.dir, cfg.replica_id)?;
        info!(
            raft_dir = %raft_dir.display(),
            data_dir = %data_dir.display(),
            had_state = had_state,
            "opening replicated alloc storage"
        );

        let raft_config = Arc::new(
            openraft::Config {
                cluster_name: format!("qms-alloc-{}", cfg.replica_id),
                heartbeat_interval: 500,
                election_timeout_min: 1_500,
                election_timeout_max: 3_000,
                ..Default::default()
            }
            .validate()
            .map_err(|e| StorageError::Raft(e.to_string()))?,
        );

        let mut shards = BTreeMap::new();
        for shard_id in 1..=cfg.shards {
            let store = ShardStore::open(data_dir.join(shard_id.to_string()))?;
            let data = store.data();
            let (log_store, state_machine) = Adaptor::new(store);

            let raft = openraft::Raft::new(
                cfg.replica_id,
                Arc::clone(&raft_config),
                HttpRaftNetworkFactory::new(shard_id),
                log_store,
                state_machine,
            )
            .await
            .map_err(|e| StorageError::Raft(e.to_string()))?;

            shards.insert(shard_id, Shard { raft, data });
        }

        Ok(Self {
            cfg,
            raft_addr,
            shards,
            had_state,
        })
    }

    /// Settles cluster membership: join an existing cluster through the
    /// gossip-discovered peers, rejoin from disk, or bootstrap a new
    /// single-replica cluster. Non-replica-1 nodes with no peers and no
    /// local state fail here.
    pub async fn start(
        &self,
        memberlist: &MemberlistService,
        join_client: &RaftJoinClient,
    ) -> Result<(), StorageError> {
        if self.had_state && !self.cfg.join {
            // The shards resume from their persisted membership and votes;
            // no need to re-request cluster membership.
            info!("rejoining raft cluster from local state");
            return Ok(());
        }

        info!(replica_id = self.cfg.replica_id, "trying to join raft cluster");
        match join_client
            .join(memberlist, self.cfg.replica_id, &self.raft_addr)
            .await
        {
            Ok(already_member) => {
                info!(
                    already_member = already_member,
                    "successfully joined raft cluster"
                );
                return Ok(());
            }
            Err(e) => {
                if self.cfg.replica_id != 1 {
                    return Err(StorageError::Raft(format!(
                        "failed to join raft cluster: {}",
                        e
                    )));
                }

                info!(replica_id = self.cfg.replica_id, "bootstrapping new raft cluster");
            }
        }

        let members: BTreeMap<NodeId, BasicNode> = [(
            self.cfg.replica_id,
            BasicNode {
                addr: self.raft_addr.clone(),
            },
        )]
        .into();

        for (shard_id, shard) in &self.shards {
            if let Err(e) = shard.raft.initialize(members.clone()).await {
                // Expected on restart with local state: the shard resumes
                // from its persisted membership instead.
                info!(shard_id = shard_id, error = %e, "raft already initialised");
            }
        }

        Ok(())
    }

    // ── Quota operations ──────────────────────────────────────────────────────

    pub async fn view(
        &self,
        namespace: &str,
        resource: &str,
    ) -> Result<(i64, i64, i64), StorageError> {
        let shard = self.shard_for(namespace, resource);

        shard
            .raft
            .ensure_linearizable()
            .await
            .map_err(|e| StorageError::Raft(e.to_string()))?;

        shard.data.view(namespace, resource)
    }

    pub async fn alloc(
        &self,
        namespace: &str,
        resource: &str,
        tokens: i64,
        version: i64,
    ) -> Result<(i64, i64, bool), StorageError> {
        let cmd = QuotaCommand::Alloc {
            namespace: namespace.to_string(),
            resource: resource.to_string(),
            tokens,
            version,
        };

        self.propose(namespace, resource, cmd).await
    }

    pub async fn free(
        &self,
        namespace: &str,
        resource: &str,
        tokens: i64,
        version: i64,
    ) -> Result<(i64, i64, bool), StorageError> {
        let cmd = QuotaCommand::Free {
            namespace: namespace.to_string(),
            resource: resource.to_string(),
            tokens,
            version,
        };

        self.propose(namespace, resource, cmd).await
    }

    pub async fn register_quota(
        &self,
        namespace: &str,
        resource: &str,
        cfg: &AllocStrategyConfig,
    ) -> Result<(), StorageError> {
        let cmd = QuotaCommand::RegisterQuota {
            namespace: namespace.to_string(),
            resource: resource.to_string(),
            capacity: cfg.capacity,
        };

        self.propose(namespace, resource, cmd).await.map(|_| ())
    }

    async fn propose(
        &self,
        namespace: &str,
        resource: &str,
        cmd: QuotaCommand,
    ) -> Result<(i64, i64, bool), StorageError> {
        let shard = self.shard_for(namespace, resource);

        let write = tokio::time::timeout(PROPOSE_TIMEOUT, shard.raft.client_write(cmd))
            .await
            .map_err(|_| StorageError::Raft("proposal timed out".into()))?
            .map_err(|e| StorageError::Raft(e.to_string()))?;

        write.data.into_storage_result()
    }

    fn shard_for(&self, namespace: &str, resource: &str) -> &Shard {
        let shard_id = shard_id_for_quota(namespace, resource, self.cfg.shards);
        self.shards
            .get(&shard_id)
            .expect("shard ids cover [1, shards]")
    }

    // ── Cluster membership ────────────────────────────────────────────────────

    /// Adds `replica_id` to every shard, first as a learner and then as a
    /// voter. Returns `true` when the replica was already a member.
    pub async fn add_replica(
        &self,
        replica_id: NodeId,
        raft_addr: &str,
    ) -> Result<bool, StorageError> {
        if let Some(shard) = self.shards.values().next() {
            let metrics = shard.raft.metrics().borrow().clone();
            let is_member = metrics
                .membership_config
                .membership()
                .nodes()
                .any(|(_, node)| node.addr == raft_addr);
            if is_member {
                info!(
                    replica_id = replica_id,
                    raft_addr = %raft_addr,
                    "replica is already part of the raft cluster"
                );
                return Ok(true);
            }
        }

        let node = BasicNode {
            addr: raft_addr.to_string(),
        };

        for (shard_id, shard) in &self.shards {
            shard
                .raft
                .add_learner(replica_id, node.clone(), true)
                .await
                .map_err(|e| {
                    StorageError::Raft(format!(
                        "failed to add learner for shard {}: {}",
                        shard_id, e
                    ))
                })?;

            let mut voters: BTreeSet<NodeId> = {
                let metrics = shard.raft.metrics().borrow().clone();
                metrics
                    .membership_config
                    .membership()
                    .voter_ids()
                    .collect()
            };
            voters.insert(replica_id);

            shard
                .raft
                .change_membership(voters, false)
                .await
                .map_err(|e| {
                    StorageError::Raft(format!(
                        "failed to change membership for shard {}: {}",
                        shard_id, e
                    ))
                })?;
        }

        Ok(false)
    }

    /// Removes `replica_id` from every shard's voter set.
    pub async fn remove_replica(&self, replica_id: NodeId) -> Result<(), StorageError> {
        for (shard_id, shard) in &self.shards {
            let mut voters: BTreeSet<NodeId> = {
                let metrics = shard.raft.metrics().borrow().clone();
                metrics
                    .membership_config
                    .membership()
                    .voter_ids()
                    .collect()
            };

            if !voters.remove(&replica_id) {
                continue;
            }

            shard
                .raft
                .change_membership(voters, false)
                .await
                .map_err(|e| {
                    StorageError::Raft(format!(
                        "failed to remove replica from shard {}: {}",
                        shard_id, e
                    ))
                })?;
        }

        Ok(())
    }

    // ── Health and shutdown ───────────────────────────────────────────────────

    pub fn shard_healthy(&self, shard_id: u64) -> bool {
        self.shards
            .get(&shard_id)
            .map(|shard| shard.raft.metrics().borrow().current_leader.is_some())
            .unwrap_or(false)
    }

    pub fn all_shards_healthy(&self) -> bool {
        (1..=self.cfg.shards).all(|shard_id| self.shard_healthy(shard_id))
    }

    /// Blocks until every shard in `[1, shards]` has a known leader.
    pub async fn await_healthy(&self, timeout: Duration) -> Result<(), StorageError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.all_shards_healthy() {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(StorageError::Raft(
                    "timed out waiting for every shard to elect a leader".into(),
                ));
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Routes a raw raft RPC body to the owning shard.
    pub fn shard_raft(&self, shard_id: u64) -> Option<&RaftInstance> {
        self.shards.get(&shard_id).map(|s| &s.raft)
    }

    /// Stops every shard in `[1, shards]`.
    pub async fn shutdown(&self) {
        for (shard_id, shard) in &self.shards {
            if let Err(e) = shard.raft.shutdown().await {
                warn!(shard_id = shard_id, error = %e, "failed to stop shard");
            }
        }
    }
}

fn raft_node_dir(base: &str, replica_id: u64) -> PathBuf {
    Path::new(base).join(format!("raft_node_{}", replica_id))
}

fn data_node_dir(base: &str, replica_id: u64) -> PathBuf {
    Path::new(base).join(format!("data_node_{}", replica_id))
}

fn raft_and_data_dirs_exist(base: &str, replica_id: u64) -> bool {
    raft_node_dir(base, replica_id).is_dir() && data_node_dir(base, replica_id).is_dir()
}

fn create_raft_and_data_dirs(
    base: &str,
    replica_id: u64,
) -> Result<(PathBuf, PathBuf), StorageError> {
    let raft_dir = raft_node_dir(base, replica_id);
    let data_dir = data_node_dir(base, replica_id);

    for dir in [&raft_dir, &data_dir] {
        std::fs::create_dir_all(dir).map_err(|e| StorageError::Corrupt {
            key: dir.display().to_string(),
            reason: format!("failed to create dir: {}", e),
        })?;
    }

    Ok((raft_dir, data_dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_layout_is_per_replica() {
        assert_eq!(
            raft_node_dir("/tmp/qms", 2),
            PathBuf::from("/tmp/qms/raft_node_2")
        );
        assert_eq!(
            data_node_dir("/tmp/qms", 2),
            PathBuf::from("/tmp/qms/data_node_2")
        );
    }

    #[test]
    fn dir_detection_requires_both_dirs() {
        let base = tempfile::tempdir().unwrap();
        let base_str = base.path().to_str().unwrap();

        assert!(!raft_and_data_dirs_exist(base_str, 1));

        std::fs::create_dir_all(raft_node_dir(base_str, 1)).unwrap();
        assert!(!raft_and_data_dirs_exist(base_str, 1));

        std::fs::create_dir_all(data_node_dir(base_str, 1)).unwrap();
        assert!(raft_and_data_dirs_exist(base_str, 1));
    }

    #[tokio::test]
    async fn single_replica_serves_quota_operations() {
        let base = tempfile::tempdir().unwrap();
        let cfg = RaftStorageConfig {
            join: false,
            replica_id: 1,
            shards: 2,
            dir: base.path().to_str().unwrap().to_string(),
        };

        let storage = ReplicatedStorage::open(cfg, "127.0.0.1:0".to_string())
            .await
            .unwrap();

        // Bootstrap directly: no peers, replica 1.
        let members: BTreeMap<NodeId, BasicNode> = [(
            1,
            BasicNode {
                addr: "127.0.0.1:0".to_string(),
            },
        )]
        .into();
        for shard in storage.shards.values() {
            shard.raft.initialize(members.clone()).await.unwrap();
        }

        storage.await_healthy(Duration::from_secs(10)).await.unwrap();

        storage
            .register_quota("pool", "mem", &AllocStrategyConfig { capacity: 10 })
            .await
            .unwrap();

        assert_eq!(storage.view("pool", "mem").await.unwrap(), (0, 10, 1));
        assert_eq!(
            storage.alloc("pool", "mem", 3, 1).await.unwrap(),
            (7, 2, true)
        );
        assert_eq!(
            storage.alloc("pool", "mem", 8, 2).await.unwrap(),
            (7, 2, false)
        );
        assert!(matches!(
            storage.alloc("pool", "mem", 1, 9).await,
            Err(StorageError::InvalidVersion)
        ));
        assert_eq!(
            storage.free("pool", "mem", 3, 2).await.unwrap(),
            (10, 3, true)
        );

        storage.shutdown().await;
    }
}
