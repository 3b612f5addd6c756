//! Gossip membership.
//!
//! Every process joins a UDP gossip cluster and publishes its identity
//! through the node name (`"{service}/{hostname}/{http_port}/{gossip_port}"`),
//! so any member can reconstruct the full [`Instance`] directory locally.
//!
//! Joining is best-effort: seeds are resolved (SRV-aware) and handed to the
//! gossip runtime, then a backoff loop waits for the first peer to appear.
//! A node that never reaches a peer keeps running as a singleton. Event
//! callbacks are dispatched serially from a single watcher task that diffs
//! successive live-member snapshots.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use rand::Rng;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::MemberlistConfig;
use crate::discovery::Discoverer;
use crate::error::ConfigError;
use crate::instance::{Instance, NodeName};
use crate::metrics::GOSSIP_LIVE_MEMBERS;

/// Membership change callbacks.
///
/// The watcher task delivers these serially — never concurrently — so
/// implementations can reason about ordering per instance. Ordering across
/// distinct instances is not guaranteed.
pub trait EventHandler: Send + Sync {
    fn on_join(&self, _instance: &Instance) {}
    fn on_leave(&self, _instance: &Instance) {}
    fn on_update(&self, _instance: &Instance) {}
}

/// The gossip membership service.
pub struct MemberlistService {
    cfg: MemberlistConfig,
    handle: tokio::sync::Mutex<Option<ChitchatHandle>>,
    chitchat: Arc<tokio::sync::Mutex<chitchat::Chitchat>>,
    self_instance: Instance,
    shutdown_tx: watch::Sender<bool>,
}

impl MemberlistService {
    /// Spawns the gossip runtime and the event watcher task.
    ///
    /// `service` is the advertised role; `http_port` lands in the node name
    /// so peers can route internal HTTP calls.
    pub async fn new(
        cfg: MemberlistConfig,
        discoverer: &Discoverer,
        service: &str,
        http_port: u16,
        handlers: Vec<Arc<dyn EventHandler>>,
    ) -> Result<Arc<Self>, ConfigError> {
        let hostname =
            std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-node".to_string());

        let node_name = NodeName::new(service, &hostname, http_port, cfg.gossip_port);
        let listen_addr: SocketAddr = format!("{}:{}", cfg.gossip_host, cfg.gossip_port)
            .parse()
            .map_err(|e| {
                ConfigError::Validation(format!(
                    "invalid gossip address {}:{}: {}",
                    cfg.gossip_host, cfg.gossip_port, e
                ))
            })?;

        let seeds = discoverer.resolve(&cfg.join_addresses).await;

        let chitchat_id = ChitchatId::new(node_name.to_string(), 0, listen_addr);
        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: cfg.cluster_id.clone(),
            gossip_interval: Duration::from_millis(500),
            listen_addr,
            seed_nodes: seeds.clone(),
            failure_detector_config: FailureDetectorConfig::default(),
            marked_for_deletion_grace_period: Duration::from_secs(60),
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let initial_kv: Vec<(String, String)> =
            vec![("status".to_string(), "active".to_string())];

        let handle = spawn_chitchat(chitchat_config, initial_kv, &UdpTransport)
            .await
            .map_err(|e| ConfigError::Validation(format!("failed to spawn gossip: {}", e)))?;

        let chitchat = handle.chitchat();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let service = Arc::new(Self {
            cfg,
            handle: tokio::sync::Mutex::new(Some(handle)),
            chitchat,
            self_instance: node_name.into_instance("127.0.0.1"),
            shutdown_tx,
        });

        service.spawn_watcher(handlers, shutdown_rx.clone());
        service.spawn_join_loop(seeds, shutdown_rx);

        Ok(service)
    }

    /// Snapshot of currently-known live members, self included.
    pub async fn members(&self) -> Vec<Instance> {
        let chitchat = self.chitchat.lock().await;
        chitchat
            .live_nodes()
            .filter_map(instance_from_chitchat_id)
            .collect()
    }

    /// The identity this node advertises.
    pub fn self_instance(&self) -> &Instance {
        &self.self_instance
    }

    /// The local machine identity, for filtering self out of peer lists.
    pub fn self_hostname(&self) -> &str {
        &self.self_instance.hostname
    }

    /// Marks the node as leaving and tears down the gossip runtime, bounded
    /// by `leave_timeout`. Failure to leave cleanly is logged, not surfaced.
    pub async fn leave(&self) {
        let _ = self.shutdown_tx.send(true);

        let leave_timeout = self
            .cfg
            .leave_timeout
            .to_duration()
            .unwrap_or(Duration::from_secs(10));

        let marked = tokio::time::timeout(leave_timeout, async {
            let mut chitchat = self.chitchat.lock().await;
            chitchat.self_node_state().set("status", "leaving");
        })
        .await;
        if marked.is_err() {
            warn!("timed out marking node as leaving");
        }

        if let Some(handle) = self.handle.lock().await.take() {
            match tokio::time::timeout(leave_timeout, handle.shutdown()).await {
                Ok(Ok(())) => info!("left gossip cluster"),
                Ok(Err(e)) => error!(error = %e, "failed to leave gossip cluster"),
                Err(_) => error!("timed out leaving gossip cluster"),
            }
        }
    }

    /// Waits for the first peer with exponential backoff, then keeps the
    /// member gauge current and re-checks connectivity on the rejoin
    /// interval. Exhausting the retries is non-fatal: the node runs as a
    /// singleton until gossip reaches it.
    fn spawn_join_loop(
        self: &Arc<Self>,
        seeds: Vec<String>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        if seeds.is_empty() {
            return;
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let min_backoff = service
                .cfg
                .min_join_backoff
                .to_duration()
                .unwrap_or(Duration::from_secs(1));
            let max_backoff = service
                .cfg
                .max_join_backoff
                .to_duration()
                .unwrap_or(Duration::from_secs(30));
            let max_retries = service.cfg.max_join_retries;

            let started = tokio::time::Instant::now();
            let mut backoff = min_backoff;
            let mut joined = false;

            for retry in 0..max_retries {
                if *shutdown_rx.borrow() {
                    return;
                }

                let peers = service.members().await.len().saturating_sub(1);
                if peers > 0 {
                    info!(
                        reached_nodes = peers,
                        elapsed = ?started.elapsed(),
                        "joining gossip cluster succeeded"
                    );
                    joined = true;
                    break;
                }

                warn!(retries = retry, "joining gossip cluster: failed to reach any nodes");

                // Full jitter keeps simultaneously-started nodes from
                // hammering the seeds in lockstep.
                let jittered = rand::thread_rng().gen_range(min_backoff..=backoff);
                tokio::select! {
                    _ = tokio::time::sleep(jittered) => {}
                    _ = shutdown_rx.changed() => return,
                }
                backoff = (backoff * 2).min(max_backoff);
            }

            if !joined {
                error!(
                    elapsed = ?started.elapsed(),
                    "joining gossip cluster failed; running as a singleton"
                );
            }

            // Partition healing: periodically confirm we still see peers.
            let rejoin_interval = service
                .cfg
                .rejoin_interval
                .to_duration()
                .unwrap_or(Duration::ZERO);
            if rejoin_interval.is_zero() {
                return;
            }

            let mut ticker = tokio::time::interval(rejoin_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let peers = service.members().await.len().saturating_sub(1);
                        if peers == 0 {
                            warn!("no live gossip peers; waiting for seeds to answer");
                        }
                    }
                    _ = shutdown_rx.changed() => return,
                }
            }
        });
    }

    /// Diffs successive live-member snapshots and dispatches join, leave,
    /// and update events. One task owns dispatch, so handlers run serially.
    fn spawn_watcher(
        self: &Arc<Self>,
        handlers: Vec<Arc<dyn EventHandler>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut known: Vec<(ChitchatId, Instance)> = Vec::new();
            let mut ticker = tokio::time::interval(Duration::from_secs(1));

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => return,
                }

                let current: Vec<(ChitchatId, Instance)> = {
                    let chitchat = service.chitchat.lock().await;
                    chitchat
                        .live_nodes()
                        .filter_map(|id| {
                            instance_from_chitchat_id(id).map(|inst| (id.clone(), inst))
                        })
                        .collect()
                };

                GOSSIP_LIVE_MEMBERS.set(current.len() as i64);

                for (id, instance) in &current {
                    match known.iter().find(|(k, _)| k.node_id == id.node_id) {
                        None => {
                            for handler in &handlers {
                                handler.on_join(instance);
                            }
                        }
                        // Same name at a newer generation: the process
                        // restarted or republished its identity.
                        Some((k, _)) if k.generation_id != id.generation_id => {
                            for handler in &handlers {
                                handler.on_update(instance);
                            }
                        }
                        Some(_) => {}
                    }
                }

                for (id, instance) in &known {
                    if !current.iter().any(|(c, _)| c.node_id == id.node_id) {
                        for handler in &handlers {
                            handler.on_leave(instance);
                        }
                    }
                }

                known = current;
            }
        });
    }
}

fn instance_from_chitchat_id(id: &ChitchatId) -> Option<Instance> {
    let name = NodeName::parse(&id.node_id)?;
    Some(name.into_instance(id.gossip_advertise_addr.ip().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chitchat_ids_parse_back_into_instances() {
        let id = ChitchatId::new(
            "alloc/node-1/6789/7946".to_string(),
            0,
            "10.0.0.5:7946".parse().unwrap(),
        );
        let instance = instance_from_chitchat_id(&id).unwrap();
        assert_eq!(instance.service, "alloc");
        assert_eq!(instance.hostname, "node-1");
        assert_eq!(instance.host, "10.0.0.5");
        assert_eq!(instance.http_port, 6789);
        assert_eq!(instance.gossip_port, 7946);
    }

    #[test]
    fn foreign_node_ids_are_skipped() {
        let id = ChitchatId::new(
            "not-a-qms-node".to_string(),
            0,
            "10.0.0.5:7946".parse().unwrap(),
        );
        assert!(instance_from_chitchat_id(&id).is_none());
    }
}
