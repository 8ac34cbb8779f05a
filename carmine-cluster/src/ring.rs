//! Consistent-hash ring over peer addresses.
//!
//! Each peer contributes several virtual nodes so key ownership spreads
//! evenly; a key belongs to the first ring point at or clockwise after
//! its FNV-32 hash.

use carmine_common::hash::fnv32;

const VIRTUAL_NODES_PER_PEER: usize = 3;

/// Immutable hash ring built at cluster startup.
#[derive(Debug, Clone)]
pub struct Ring {
    /// `(hash, peer)` points, ascending by hash.
    points: Vec<(u32, String)>,
}

impl Ring {
    /// Builds the ring from every node address (peers plus self).
    #[must_use]
    pub fn new(nodes: &[String]) -> Self {
        let mut points = Vec::with_capacity(nodes.len() * VIRTUAL_NODES_PER_PEER);
        for node in nodes {
            for replica in 0..VIRTUAL_NODES_PER_PEER {
                let point = fnv32(format!("{replica}{node}").as_bytes());
                points.push((point, node.clone()));
            }
        }
        points.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Self { points }
    }

    /// Returns the peer owning `key`.
    #[must_use]
    pub fn pick(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = fnv32(key.as_bytes());
        let at = self
            .points
            .partition_point(|(point, _)| *point < hash)
            .checked_rem(self.points.len())
            .unwrap_or(0);
        self.points.get(at).map(|(_, node)| node.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::Ring;
    use googletest::prelude::*;
    use rstest::rstest;

    fn nodes(addrs: &[&str]) -> Vec<String> {
        addrs.iter().map(|addr| (*addr).to_owned()).collect()
    }

    #[rstest]
    fn empty_ring_picks_nothing() {
        assert_that!(Ring::new(&[]).pick("k"), none());
    }

    #[rstest]
    fn placement_is_deterministic() {
        let ring = Ring::new(&nodes(&["10.0.0.1:7000", "10.0.0.2:7000", "10.0.0.3:7000"]));
        for key in ["a", "b", "user:42", "session:9"] {
            assert_that!(ring.pick(key), eq(ring.pick(key)));
        }
    }

    #[rstest]
    fn every_node_owns_some_keys() {
        let addrs = nodes(&["10.0.0.1:7000", "10.0.0.2:7000", "10.0.0.3:7000"]);
        let ring = Ring::new(&addrs);
        let mut owners = std::collections::HashSet::new();
        for i in 0..500 {
            let key = format!("key-{i}");
            let _ = owners.insert(ring.pick(&key).expect("non-empty ring").to_owned());
        }
        assert_that!(owners.len(), eq(addrs.len()));
    }

    #[rstest]
    fn single_node_owns_everything() {
        let ring = Ring::new(&nodes(&["solo:7000"]));
        assert_that!(ring.pick("anything"), some(eq("solo:7000")));
    }
}
