//! HTTP transport for raft RPCs.
//!
//! AppendEntries, Vote, and InstallSnapshot requests are JSON-serialised and
//! POSTed to the peer's internal API under
//! `/api/v1/internal/raft/{shard_id}/{rpc}`. The receiving node feeds them
//! to the matching shard's raft instance and returns the response as JSON.
//! Transport and decode failures map to `Unreachable` so openraft retries
//! against the current membership.

use std::time::Duration;

use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{AnyError, BasicNode};

use crate::raft::{NodeId, TypeConfig};

pub const APPEND_ENTRIES_RPC: &str = "append-entries";
pub const VOTE_RPC: &str = "vote";
pub const INSTALL_SNAPSHOT_RPC: &str = "install-snapshot";

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

/// Per-peer HTTP channel for one shard.
pub struct HttpRaftNetwork {
    target_addr: String,
    shard_id: u64,
    client: reqwest::Client,
}

impl HttpRaftNetwork {
    fn rpc_url(&self, rpc: &str) -> String {
        format!(
            "http://{}/api/v1/internal/raft/{}/{}",
            self.target_addr, self.shard_id, rpc
        )
    }

    async fn send<Req, Resp>(&self, rpc: &str, req: &Req) -> Result<Resp, Unreachable>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .post(self.rpc_url(rpc))
            .json(req)
            .send()
            .await
            .map_err(unreachable)?;

        if !response.status().is_success() {
            return Err(unreachable(format!(
                "raft rpc {} returned http status {}",
                rpc,
                response.status()
            )));
        }

        response.json().await.map_err(unreachable)
    }
}

impl RaftNetwork<TypeConfig> for HttpRaftNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>>
    {
        self.send(APPEND_ENTRIES_RPC, &rpc)
            .await
            .map_err(RPCError::Unreachable)
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.send(VOTE_RPC, &rpc).await.map_err(RPCError::Unreachable)
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.send(INSTALL_SNAPSHOT_RPC, &rpc)
            .await
            .map_err(RPCError::Unreachable)
    }
}

/// Creates `HttpRaftNetwork` instances per target peer for one shard.
pub struct HttpRaftNetworkFactory {
    shard_id: u64,
    client: reqwest::Client,
}

impl HttpRaftNetworkFactory {
    pub fn new(shard_id: u64) -> Self {
        // Short timeouts keep heartbeats failing fast rather than hanging
        // until a follower's election timer fires.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(4))
            .build()
            .expect("reqwest client builds");

        Self { shard_id, client }
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpRaftNetworkFactory {
    type Network = HttpRaftNetwork;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        HttpRaftNetwork {
            target_addr: node.addr.clone(),
            shard_id: self.shard_id,
            client: self.client.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_urls_are_shard_scoped() {
        let network = HttpRaftNetwork {
            target_addr: "10.0.0.1:6789".to_string(),
            shard_id: 3,
            client: reqwest::Client::new(),
        };
        assert_eq!(
            network.rpc_url(APPEND_ENTRIES_RPC),
            "http://10.0.0.1:6789/api/v1/internal/raft/3/append-entries"
        );
        assert_eq!(
            network.rpc_url(VOTE_RPC),
            "http://10.0.0.1:6789/api/v1/internal/raft/3/vote"
        );
    }
}
