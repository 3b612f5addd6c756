//! Cluster member identity.
//!
//! Every process publishes a five-field `Instance` record through gossip.
//! The first four fields are encoded into the gossip node name as
//! `"{service}/{hostname}/{http_port}/{gossip_port}"` so that any member can
//! reconstruct the record from the name alone; the reachable host address
//! comes from the gossip transport.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A member of the gossip cluster. The full five-tuple is the identity:
/// two instances are the same member only if every field matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instance {
    /// Target role this process runs (`proxy`, `alloc`, `rate`, `all`).
    pub service: String,
    /// Machine identity, used to filter out "self" during joins.
    pub hostname: String,
    /// Reachable address.
    pub host: String,
    pub http_port: u16,
    pub gossip_port: u16,
}

impl Instance {
    pub fn new(
        service: impl Into<String>,
        hostname: impl Into<String>,
        host: impl Into<String>,
        http_port: u16,
        gossip_port: u16,
    ) -> Self {
        Self {
            service: service.into(),
            hostname: hostname.into(),
            host: host.into(),
            http_port,
            gossip_port,
        }
    }

    /// The `host:http_port` address used for internal HTTP calls.
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }

    /// Whether this instance serves the given tier. Nodes running the `all`
    /// target serve every tier.
    pub fn serves(&self, service: &str) -> bool {
        self.service == service || self.service == "all"
    }
}

/// The gossip node name: everything but the reachable host, `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeName {
    pub service: String,
    pub hostname: String,
    pub http_port: u16,
    pub gossip_port: u16,
}

impl NodeName {
    pub fn new(service: &str, hostname: &str, http_port: u16, gossip_port: u16) -> Self {
        Self {
            service: service.to_string(),
            hostname: hostname.to_string(),
            http_port,
            gossip_port,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.split('/');
        let service = parts.next()?;
        let hostname = parts.next()?;
        let http_port = parts.next()?.parse().ok()?;
        let gossip_port = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(service, hostname, http_port, gossip_port))
    }

    /// Attach a reachable host to produce the full member record.
    pub fn into_instance(self, host: impl Into<String>) -> Instance {
        Instance {
            service: self.service,
            hostname: self.hostname,
            host: host.into(),
            http_port: self.http_port,
            gossip_port: self.gossip_port,
        }
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.service, self.hostname, self.http_port, self.gossip_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_name_round_trips() {
        let name = NodeName::new("alloc", "node-1", 6789, 7946);
        let encoded = name.to_string();
        assert_eq!(encoded, "alloc/node-1/6789/7946");
        assert_eq!(NodeName::parse(&encoded), Some(name));
    }

    #[test]
    fn node_name_rejects_malformed_input() {
        assert_eq!(NodeName::parse("alloc/node-1/6789"), None);
        assert_eq!(NodeName::parse("alloc/node-1/http/7946"), None);
        assert_eq!(NodeName::parse("a/b/1/2/3"), None);
        assert_eq!(NodeName::parse(""), None);
    }

    #[test]
    fn instance_identity_is_the_full_tuple() {
        let a = Instance::new("rate", "node-1", "10.0.0.1", 6789, 7946);
        let mut b = a.clone();
        assert_eq!(a, b);
        b.http_port = 6790;
        assert_ne!(a, b);
    }

    #[test]
    fn all_target_serves_every_tier() {
        let inst = Instance::new("all", "node-1", "10.0.0.1", 6789, 7946);
        assert!(inst.serves("rate"));
        assert!(inst.serves("alloc"));
        let rate = Instance::new("rate", "node-2", "10.0.0.2", 6789, 7946);
        assert!(rate.serves("rate"));
        assert!(!rate.serves("alloc"));
    }
}
