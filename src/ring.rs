//! Weighted consistent-hash ring.
//!
//! Each physical back-end is placed on the ring `VIRTUAL_NODES` times under
//! the labels `vnode0_<addr>` … `vnode9_<addr>`; the label prefix is
//! stripped on lookup. The ring is immutable: membership changes build a new
//! ring that the owner swaps in wholesale, so readers never observe a
//! partial update. Lookups binary-search the sorted point list for the first
//! virtual node at or after the key's hash, wrapping at the top.

use std::collections::BTreeSet;

/// Virtual nodes per physical back-end. Smooths load and limits key churn
/// when the member set changes.
pub const VIRTUAL_NODES: usize = 10;

#[derive(Debug, Clone)]
struct VirtualNode {
    point: u32,
    /// Index into `nodes`.
    owner: usize,
}

/// An immutable consistent-hash ring over back-end addresses.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    nodes: Vec<String>,
    points: Vec<VirtualNode>,
}

fn hash_point(label: &str) -> u32 {
    crc32fast::hash(label.as_bytes())
}

impl HashRing {
    /// Builds a ring from the given back-end addresses. Duplicates are
    /// collapsed; order does not affect placement.
    pub fn new(addrs: impl IntoIterator<Item = String>) -> Self {
        let nodes: Vec<String> = addrs
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut points = Vec::with_capacity(nodes.len() * VIRTUAL_NODES);
        for (owner, addr) in nodes.iter().enumerate() {
            for k in 0..VIRTUAL_NODES {
                let label = format!("vnode{}_{}", k, addr);
                points.push(VirtualNode {
                    point: hash_point(&label),
                    owner,
                });
            }
        }

        points.sort_by_key(|v| v.point);

        Self { nodes, points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Total number of virtual nodes on the ring.
    pub fn virtual_len(&self) -> usize {
        self.points.len()
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Returns the back-end address owning `key`, with the vnode label
    /// already stripped. `None` on an empty ring.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }

        let h = hash_point(key);
        let idx = match self.points.binary_search_by_key(&h, |v| v.point) {
            Ok(i) => i,
            Err(i) if i == self.points.len() => 0,
            Err(i) => i,
        };

        Some(self.nodes[self.points[idx].owner].as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(addrs: &[&str]) -> HashRing {
        HashRing::new(addrs.iter().map(|s| s.to_string()))
    }

    #[test]
    fn empty_ring_has_no_owner() {
        let r = HashRing::default();
        assert!(r.is_empty());
        assert_eq!(r.get("svc_req"), None);
    }

    #[test]
    fn ring_carries_ten_vnodes_per_backend() {
        let r = ring(&["10.0.0.1:6789", "10.0.0.2:6789", "10.0.0.3:6789"]);
        assert_eq!(r.virtual_len(), 3 * VIRTUAL_NODES);
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn lookup_is_deterministic() {
        let a = ring(&["a:1", "b:1", "c:1"]);
        let b = ring(&["c:1", "a:1", "b:1"]);
        for key in ["svc_req", "pool_mem", "x_y"] {
            assert_eq!(a.get(key), b.get(key));
        }
    }

    #[test]
    fn duplicates_collapse() {
        let r = ring(&["a:1", "a:1", "b:1"]);
        assert_eq!(r.len(), 2);
        assert_eq!(r.virtual_len(), 2 * VIRTUAL_NODES);
    }

    #[test]
    fn removing_a_node_only_moves_its_own_keys() {
        let full = ring(&["a:1", "b:1", "c:1"]);
        let without_c = ring(&["a:1", "b:1"]);

        let mut moved = 0;
        let total = 1000;
        for i in 0..total {
            let key = format!("ns_res{}", i);
            let before = full.get(&key).unwrap();
            let after = without_c.get(&key).unwrap();
            if before == "c:1" {
                moved += 1;
                assert_ne!(after, "c:1");
            } else {
                // Keys owned by surviving nodes must not move.
                assert_eq!(before, after);
            }
        }

        // c owned a nontrivial share of the keyspace.
        assert!(moved > 0);
        assert!(moved < total);
    }

    #[test]
    fn load_spreads_over_backends() {
        let r = ring(&["a:1", "b:1", "c:1", "d:1"]);
        let mut counts = std::collections::HashMap::new();
        for i in 0..1000 {
            let key = format!("k{}", i);
            *counts.entry(r.get(&key).unwrap().to_string()).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 4);
        // No back-end should own a wildly disproportionate share.
        for (_, n) in counts {
            assert!(n > 50, "backend owns only {} of 1000 keys", n);
        }
    }
}
