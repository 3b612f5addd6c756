//! Service discovery.
//!
//! Translates configured targets into reachable endpoints. Literal
//! `host:port` entries pass through unchanged; any target containing `+` is
//! an SRV-backed service name (`dnssrv+qms.cluster.local`).
//!
//! SRV targets get two resolve rounds per call — `_http._tcp.<name>` for
//! the HTTP-facing endpoints and `_gossip._tcp.<name>` for the gossip-facing
//! endpoints — merged per host: an instance is emitted only when both ports
//! are known. [`Discoverer::resolve`] is the single-round variant used for
//! gossip seeds, where the configured SRV name is queried as given.

use std::collections::BTreeMap;

use tracing::warn;
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::ConfigError;

/// A member produced by discovery. Literal targets carry only the HTTP
/// port; SRV-discovered members carry both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredMember {
    pub host: String,
    pub http_port: u16,
    pub gossip_port: u16,
}

impl DiscoveredMember {
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }
}

pub struct Discoverer {
    resolver: Option<TokioAsyncResolver>,
}

impl Discoverer {
    pub fn new() -> Result<Self, ConfigError> {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(r) => Some(r),
            Err(e) => {
                // No resolver only disables SRV targets; literals still work.
                warn!(error = %e, "failed to build DNS resolver; SRV targets will not resolve");
                None
            }
        };

        Ok(Self { resolver })
    }

    /// Single-round resolve of `targets` into flat `host:port` pairs. SRV
    /// names are queried exactly as configured.
    pub async fn resolve(&self, targets: &[String]) -> Vec<String> {
        let mut out = Vec::new();

        for target in targets {
            match srv_name(target) {
                None => out.push(target.clone()),
                Some(name) => {
                    for (host, port) in self.lookup_srv(name).await {
                        out.push(format!("{}:{}", host, port));
                    }
                }
            }
        }

        out
    }

    /// Dual-round resolve: each SRV target is queried once for its HTTP
    /// endpoints and once for its gossip endpoints, merged by host. Literal
    /// entries pass through unchanged as HTTP-only members.
    pub async fn discover(&self, targets: &[String]) -> Vec<DiscoveredMember> {
        let mut members = Vec::new();
        let mut http_round = Vec::new();
        let mut gossip_round = Vec::new();

        for target in targets {
            match srv_name(target) {
                None => match split_host_port(target) {
                    Some((host, port)) => members.push(DiscoveredMember {
                        host,
                        http_port: port,
                        gossip_port: 0,
                    }),
                    None => warn!(target = %target, "skipping malformed literal target"),
                },
                Some(name) => {
                    http_round
                        .extend(self.lookup_srv(&format!("_http._tcp.{}", name)).await);
                    gossip_round
                        .extend(self.lookup_srv(&format!("_gossip._tcp.{}", name)).await);
                }
            }
        }

        members.extend(merge_rounds(&http_round, &gossip_round));
        members
    }

    async fn lookup_srv(&self, name: &str) -> Vec<(String, u16)> {
        let Some(resolver) = &self.resolver else {
            warn!(name = %name, "no DNS resolver available for SRV target");
            return Vec::new();
        };

        match resolver.srv_lookup(name).await {
            Ok(lookup) => lookup
                .iter()
                .map(|srv| {
                    let host = srv.target().to_utf8();
                    (host.trim_end_matches('.').to_string(), srv.port())
                })
                .collect(),
            Err(e) => {
                warn!(name = %name, error = %e, "SRV lookup failed");
                Vec::new()
            }
        }
    }
}

/// The SRV name of a `prefix+service` target, or `None` for literals.
fn srv_name(target: &str) -> Option<&str> {
    target.split_once('+').map(|(_, name)| name)
}

fn split_host_port(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port = port.parse().ok()?;
    Some((host.to_string(), port))
}

/// Merges the HTTP and gossip resolve rounds per host. Only hosts present
/// in both rounds produce a member.
fn merge_rounds(
    http_round: &[(String, u16)],
    gossip_round: &[(String, u16)],
) -> Vec<DiscoveredMember> {
    let gossip_by_host: BTreeMap<&str, u16> = gossip_round
        .iter()
        .map(|(host, port)| (host.as_str(), *port))
        .collect();

    let mut seen = std::collections::BTreeSet::new();
    let mut members = Vec::new();

    for (host, http_port) in http_round {
        let Some(gossip_port) = gossip_by_host.get(host.as_str()) else {
            continue;
        };
        if seen.insert((host.clone(), *http_port)) {
            members.push(DiscoveredMember {
                host: host.clone(),
                http_port: *http_port,
                gossip_port: *gossip_port,
            });
        }
    }

    members
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn literal_targets_pass_through() {
        let targets = vec!["10.0.0.1:6789".to_string(), "node-2:6789".to_string()];
        let resolved = block_on(async {
            let discoverer = Discoverer::new().unwrap();
            discoverer.resolve(&targets).await
        });
        assert_eq!(resolved, targets);
    }

    #[test]
    fn literal_targets_discover_as_http_only_members() {
        let targets = vec!["10.0.0.1:6789".to_string()];
        let members = block_on(async {
            let discoverer = Discoverer::new().unwrap();
            discoverer.discover(&targets).await
        });
        assert_eq!(
            members,
            vec![DiscoveredMember {
                host: "10.0.0.1".to_string(),
                http_port: 6789,
                gossip_port: 0,
            }]
        );
        assert_eq!(members[0].http_addr(), "10.0.0.1:6789");
    }

    #[test]
    fn srv_names_are_detected_by_the_plus_marker() {
        assert_eq!(srv_name("10.0.0.1:6789"), None);
        assert_eq!(
            srv_name("dnssrv+qms.cluster.local"),
            Some("qms.cluster.local")
        );
    }

    #[test]
    fn host_port_splitting() {
        assert_eq!(
            split_host_port("10.0.0.1:6789"),
            Some(("10.0.0.1".to_string(), 6789))
        );
        assert_eq!(split_host_port("no-port"), None);
        assert_eq!(split_host_port("bad:port"), None);
    }

    #[test]
    fn merge_requires_both_ports() {
        let http = vec![
            ("node-1".to_string(), 6789),
            ("node-2".to_string(), 6789),
        ];
        let gossip = vec![("node-1".to_string(), 7946)];

        let members = merge_rounds(&http, &gossip);
        assert_eq!(
            members,
            vec![DiscoveredMember {
                host: "node-1".to_string(),
                http_port: 6789,
                gossip_port: 7946,
            }]
        );
    }

    #[test]
    fn merge_deduplicates_repeated_records() {
        let http = vec![
            ("node-1".to_string(), 6789),
            ("node-1".to_string(), 6789),
        ];
        let gossip = vec![("node-1".to_string(), 7946)];
        assert_eq!(merge_rounds(&http, &gossip).len(), 1);
    }
}
