//! Proxy router.
//!
//! Converts a client request into a request against exactly one back-end
//! (hash-ring policy) or all back-ends in order (round-robin policy) for
//! the relevant tier, then forwards through the typed internal clients.
//!
//! A maintenance task polls service discovery every second; when a tier's
//! member set changes, a freshly built ring replaces the old one under a
//! writer lock. Readers hold the lock only long enough to pick addresses —
//! forwarded I/O runs without it.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::client::{AllocClient, MemberlistClient, RateClient};
use crate::config::{LbStrategy, ProxyConfig};
use crate::discovery::Discoverer;
use crate::error::ClientError;
use crate::instance::Instance;
use crate::rate::quota_id;
use crate::ring::HashRing;

/// Per-tier routing state: the live member set and its ring.
#[derive(Default)]
struct TierState {
    members: Vec<Instance>,
    ring: HashRing,
}

impl TierState {
    /// Rebuilds the ring when the member set changed. Returns whether it did.
    fn update(&mut self, members: Vec<Instance>) -> bool {
        let mut old: Vec<&Instance> = self.members.iter().collect();
        let mut new: Vec<&Instance> = members.iter().collect();
        old.sort_by_key(|m| (m.host.clone(), m.http_port));
        new.sort_by_key(|m| (m.host.clone(), m.http_port));
        if old == new {
            return false;
        }

        self.ring = HashRing::new(members.iter().map(|m| m.http_addr()));
        self.members = members;
        true
    }

    fn owner_of(&self, id: &str) -> Result<Vec<String>, ClientError> {
        match self.ring.get(id) {
            Some(addr) => Ok(vec![addr.to_string()]),
            None => Err(ClientError::NoAddresses),
        }
    }

    fn all_addrs(&self) -> Vec<String> {
        self.members.iter().map(|m| m.http_addr()).collect()
    }
}

pub struct ProxyService {
    cfg: ProxyConfig,
    discoverer: Arc<Discoverer>,
    memberlist_client: MemberlistClient,
    rate_client: RateClient,
    alloc_client: AllocClient,
    rate_tier: RwLock<TierState>,
    alloc_tier: RwLock<TierState>,
}

impl ProxyService {
    pub fn new(cfg: ProxyConfig, discoverer: Arc<Discoverer>) -> Self {
        Self {
            cfg,
            discoverer,
            memberlist_client: MemberlistClient::new(),
            rate_client: RateClient::new(),
            alloc_client: AllocClient::new(),
            rate_tier: RwLock::new(TierState::default()),
            alloc_tier: RwLock::new(TierState::default()),
        }
    }

    /// Ring maintenance loop; polls discovery every second until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("running proxy service");

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.update_rings().await,
                _ = shutdown_rx.changed() => {
                    info!("stopping proxy service");
                    return;
                }
            }
        }
    }

    pub async fn update_rings(&self) {
        match self.fetch_members(&self.cfg.rate_addresses, "rate").await {
            Ok(members) => {
                if self.rate_tier.write().unwrap().update(members) {
                    info!(tier = "rate", "rebuilt hash ring");
                }
            }
            Err(e) => warn!(tier = "rate", error = %e, "failed to get rate members"),
        }

        match self.fetch_members(&self.cfg.alloc_addresses, "alloc").await {
            Ok(members) => {
                if self.alloc_tier.write().unwrap().update(members) {
                    info!(tier = "alloc", "rebuilt hash ring");
                }
            }
            Err(e) => warn!(tier = "alloc", error = %e, "failed to get alloc members"),
        }
    }

    /// Resolves the tier's discovery targets, asks any of them for the
    /// member directory, and keeps the instances serving this tier.
    async fn fetch_members(
        &self,
        targets: &[String],
        tier: &str,
    ) -> Result<Vec<Instance>, ClientError> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let addrs: Vec<String> = self
            .discoverer
            .discover(targets)
            .await
            .iter()
            .map(|m| m.http_addr())
            .collect();
        let members = self.memberlist_client.members(&addrs).await?;

        Ok(members.into_iter().filter(|m| m.serves(tier)).collect())
    }

    // ── Forwarding ────────────────────────────────────────────────────────────

    pub async fn allow(
        &self,
        namespace: &str,
        resource: &str,
        tokens: i64,
    ) -> Result<(Duration, bool), ClientError> {
        let addrs = self.pick_addrs(
            &self.rate_tier,
            self.cfg.rate_lb_strategy,
            namespace,
            resource,
        )?;

        self.rate_client
            .allow(&addrs, namespace, resource, tokens)
            .await
    }

    pub async fn view(
        &self,
        namespace: &str,
        resource: &str,
    ) -> Result<(i64, i64, i64), ClientError> {
        let addrs = self.pick_addrs(
            &self.alloc_tier,
            self.cfg.alloc_lb_strategy,
            namespace,
            resource,
        )?;

        self.alloc_client.view(&addrs, namespace, resource).await
    }

    pub async fn alloc(
        &self,
        namespace: &str,
        resource: &str,
        tokens: i64,
        version: i64,
    ) -> Result<(i64, i64, bool), ClientError> {
        let addrs = self.pick_addrs(
            &self.alloc_tier,
            self.cfg.alloc_lb_strategy,
            namespace,
            resource,
        )?;

        self.alloc_client
            .alloc(&addrs, namespace, resource, tokens, version)
            .await
    }

    pub async fn free(
        &self,
        namespace: &str,
        resource: &str,
        tokens: i64,
        version: i64,
    ) -> Result<(i64, i64, bool), ClientError> {
        let addrs = self.pick_addrs(
            &self.alloc_tier,
            self.cfg.alloc_lb_strategy,
            namespace,
            resource,
        )?;

        self.alloc_client
            .free(&addrs, namespace, resource, tokens, version)
            .await
    }

    /// Address selection under the tier's read lock; the lock is released
    /// before any I/O happens.
    fn pick_addrs(
        &self,
        tier: &RwLock<TierState>,
        strategy: LbStrategy,
        namespace: &str,
        resource: &str,
    ) -> Result<Vec<String>, ClientError> {
        let state = tier.read().unwrap();

        let addrs = match strategy {
            LbStrategy::HashRing => state.owner_of(&quota_id(namespace, resource))?,
            LbStrategy::RoundRobin => {
                let addrs = state.all_addrs();
                if addrs.is_empty() {
                    return Err(ClientError::NoAddresses);
                }
                addrs
            }
        };

        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(host: &str, service: &str) -> Instance {
        Instance::new(service, host, host, 6789, 7946)
    }

    fn proxy(rate_lb: LbStrategy, alloc_lb: LbStrategy) -> ProxyService {
        let cfg = ProxyConfig {
            rate_addresses: vec![],
            alloc_addresses: vec![],
            rate_lb_strategy: rate_lb,
            alloc_lb_strategy: alloc_lb,
        };
        ProxyService::new(cfg, Arc::new(Discoverer::new().unwrap()))
    }

    #[test]
    fn tier_update_rebuilds_only_on_change() {
        let mut tier = TierState::default();

        let members = vec![instance("a", "alloc"), instance("b", "alloc")];
        assert!(tier.update(members.clone()));
        assert_eq!(tier.ring.len(), 2);

        // Same set, different order: no rebuild.
        let reordered = vec![instance("b", "alloc"), instance("a", "alloc")];
        assert!(!tier.update(reordered));

        let shrunk = vec![instance("a", "alloc")];
        assert!(tier.update(shrunk));
        assert_eq!(tier.ring.len(), 1);
    }

    #[tokio::test]
    async fn hash_ring_policy_picks_exactly_one_owner() {
        let p = proxy(LbStrategy::HashRing, LbStrategy::HashRing);
        p.alloc_tier.write().unwrap().update(vec![
            instance("a", "alloc"),
            instance("b", "alloc"),
            instance("c", "alloc"),
        ]);

        let addrs = p
            .pick_addrs(&p.alloc_tier, LbStrategy::HashRing, "pool", "mem")
            .unwrap();
        assert_eq!(addrs.len(), 1);

        // Stable across calls.
        let again = p
            .pick_addrs(&p.alloc_tier, LbStrategy::HashRing, "pool", "mem")
            .unwrap();
        assert_eq!(addrs, again);
    }

    #[tokio::test]
    async fn round_robin_policy_returns_every_backend() {
        let p = proxy(LbStrategy::HashRing, LbStrategy::RoundRobin);
        p.alloc_tier.write().unwrap().update(vec![
            instance("a", "alloc"),
            instance("b", "alloc"),
        ]);

        let addrs = p
            .pick_addrs(&p.alloc_tier, LbStrategy::RoundRobin, "pool", "mem")
            .unwrap();
        assert_eq!(addrs, vec!["a:6789".to_string(), "b:6789".to_string()]);
    }

    #[tokio::test]
    async fn empty_tier_yields_no_addresses() {
        let p = proxy(LbStrategy::HashRing, LbStrategy::HashRing);
        assert!(matches!(
            p.pick_addrs(&p.alloc_tier, LbStrategy::HashRing, "pool", "mem"),
            Err(ClientError::NoAddresses)
        ));
        assert!(matches!(
            p.pick_addrs(&p.alloc_tier, LbStrategy::RoundRobin, "pool", "mem"),
            Err(ClientError::NoAddresses)
        ));
    }

    #[tokio::test]
    async fn alloc_routing_consults_the_alloc_ring() {
        let p = proxy(LbStrategy::HashRing, LbStrategy::HashRing);

        // Distinct tiers: rate members on one host set, alloc on another.
        p.rate_tier
            .write()
            .unwrap()
            .update(vec![instance("rate-1", "rate")]);
        p.alloc_tier
            .write()
            .unwrap()
            .update(vec![instance("alloc-1", "alloc")]);

        let addrs = p
            .pick_addrs(&p.alloc_tier, LbStrategy::HashRing, "pool", "mem")
            .unwrap();
        assert_eq!(addrs, vec!["alloc-1:6789".to_string()]);
    }
}
