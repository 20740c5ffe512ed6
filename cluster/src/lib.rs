//! Disjoint-set over Bitcoin addresses, used for multi-input common-ownership
//! clustering.
//!
//! Addresses are interned to dense `u32` ids; the structure is three flat
//! arrays (address table, parent, rank) plus the interning map. With union by
//! rank and full path compression every operation is O(α(n)) amortized.
//!
//! Sizing: for ~200M addresses the arrays cost 4 + 1 bytes per entry and the
//! interned strings dominate (a bech32 address is ~42 bytes plus map
//! overhead), which keeps the whole structure inside a tens-of-GB RAM budget
//! on one host. `u32` ids cap the structure at ~4.2B addresses.
//!
//! Not thread-safe. The feeder is single-threaded; parallel block fetching
//! happens upstream and union operations are serialized.

use std::collections::HashMap;

pub mod checkpoint;

/// Aggregate statistics over the current partition.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterStats {
    pub cluster_count: usize,
    pub total_addresses: usize,
    pub max_cluster_size: usize,
    pub min_cluster_size: usize,
    pub avg_cluster_size: f64,
}

#[derive(Default)]
pub struct UnionFind {
    ids: HashMap<Box<str>, u32>,
    addrs: Vec<Box<str>>,
    parent: Vec<u32>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of addresses tracked.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Intern an address, creating a singleton set on first sight.
    fn intern(&mut self, addr: &str) -> u32 {
        if let Some(&id) = self.ids.get(addr) {
            return id;
        }
        let id = self.addrs.len() as u32;
        let boxed: Box<str> = addr.into();
        self.ids.insert(boxed.clone(), id);
        self.addrs.push(boxed);
        self.parent.push(id);
        self.rank.push(0);
        id
    }

    /// Root of `id`, compressing the path as it goes. Iterative: the chains
    /// after heavy merging can be long enough to overflow a recursive stack.
    fn find_id(&mut self, id: u32) -> u32 {
        let mut root = id;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        // Second pass: point every node on the path directly at the root.
        let mut cur = id;
        while self.parent[cur as usize] != root {
            let next = self.parent[cur as usize];
            self.parent[cur as usize] = root;
            cur = next;
        }
        root
    }

    /// Canonical representative for `addr`, inserting it as a singleton if
    /// it has not been seen before.
    pub fn find(&mut self, addr: &str) -> &str {
        let id = self.intern(addr);
        let root = self.find_id(id);
        &self.addrs[root as usize]
    }

    /// Merge the sets containing `a` and `b` (union by rank).
    pub fn union(&mut self, a: &str, b: &str) {
        let ia = self.intern(a);
        let ib = self.intern(b);
        let ra = self.find_id(ia);
        let rb = self.find_id(ib);
        if ra == rb {
            return;
        }
        let (ra, rb) = (ra as usize, rb as usize);
        if self.rank[ra] < self.rank[rb] {
            self.parent[ra] = rb as u32;
        } else if self.rank[ra] > self.rank[rb] {
            self.parent[rb] = ra as u32;
        } else {
            self.parent[rb] = ra as u32;
            self.rank[ra] += 1;
        }
    }

    /// Whether `a` and `b` share a set. Addresses never seen are not
    /// connected to anything and are NOT inserted by this query.
    pub fn connected(&mut self, a: &str, b: &str) -> bool {
        let (ia, ib) = match (self.ids.get(a), self.ids.get(b)) {
            (Some(&ia), Some(&ib)) => (ia, ib),
            _ => return false,
        };
        self.find_id(ia) == self.find_id(ib)
    }

    /// Feed one transaction's input address set (the multi-input heuristic):
    /// every address is unioned with the first. A single-address set only
    /// inserts a singleton; an empty set is a no-op.
    pub fn observe_inputs<S: AsRef<str>>(&mut self, addrs: &[S]) {
        match addrs {
            [] => {}
            [only] => {
                self.intern(only.as_ref());
            }
            [first, rest @ ..] => {
                for addr in rest {
                    self.union(first.as_ref(), addr.as_ref());
                }
            }
        }
    }

    /// Visit every (member, representative) pair. O(N); this is the most
    /// expensive operation in the component, so callers should not run it in
    /// a hot loop.
    pub fn for_each_member<F: FnMut(&str, &str)>(&mut self, mut f: F) {
        for id in 0..self.addrs.len() as u32 {
            let root = self.find_id(id);
            // Both borrows are immutable once roots are resolved.
            let (member, rep) = (&self.addrs[id as usize], &self.addrs[root as usize]);
            f(member, rep);
        }
    }

    /// Number of distinct sets.
    pub fn cluster_count(&mut self) -> usize {
        let mut count = 0usize;
        for id in 0..self.parent.len() as u32 {
            if self.find_id(id) == id {
                count += 1;
            }
        }
        count
    }

    pub fn stats(&mut self) -> ClusterStats {
        if self.addrs.is_empty() {
            return ClusterStats {
                cluster_count: 0,
                total_addresses: 0,
                max_cluster_size: 0,
                min_cluster_size: 0,
                avg_cluster_size: 0.0,
            };
        }
        let mut sizes: HashMap<u32, usize> = HashMap::new();
        for id in 0..self.addrs.len() as u32 {
            let root = self.find_id(id);
            *sizes.entry(root).or_insert(0) += 1;
        }
        let total = self.addrs.len();
        let count = sizes.len();
        let max = sizes.values().copied().max().unwrap_or(0);
        let min = sizes.values().copied().min().unwrap_or(0);
        ClusterStats {
            cluster_count: count,
            total_addresses: total,
            max_cluster_size: max,
            min_cluster_size: min,
            avg_cluster_size: total as f64 / count as f64,
        }
    }

    /// Raw parts for checkpoint serialization.
    pub(crate) fn parts(&self) -> (&[Box<str>], &[u32], &[u8]) {
        (&self.addrs, &self.parent, &self.rank)
    }

    /// Rebuild from checkpointed parts. The interning map is reconstructed;
    /// array lengths must agree.
    pub(crate) fn from_parts(addrs: Vec<Box<str>>, parent: Vec<u32>, rank: Vec<u8>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            addrs.len() == parent.len() && addrs.len() == rank.len(),
            "checkpoint arrays disagree: {} addresses, {} parents, {} ranks",
            addrs.len(),
            parent.len(),
            rank.len()
        );
        let mut ids = HashMap::with_capacity(addrs.len());
        for (i, addr) in addrs.iter().enumerate() {
            ids.insert(addr.clone(), i as u32);
        }
        Ok(Self { ids, addrs, parent, rank })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_is_its_own_representative() {
        let mut uf = UnionFind::new();
        assert_eq!(uf.find("bc1qaaa"), "bc1qaaa");
        assert_eq!(uf.len(), 1);
        assert_eq!(uf.cluster_count(), 1);
    }

    #[test]
    fn union_chains_share_a_root() {
        let mut uf = UnionFind::new();
        uf.union("a", "b");
        uf.union("b", "c");
        assert!(uf.connected("a", "c"));
        assert_eq!(uf.cluster_count(), 1);
        let root = uf.find("a").to_string();
        assert_eq!(uf.find("b"), root);
        assert_eq!(uf.find("c"), root);
    }

    #[test]
    fn connected_does_not_insert_unknown_addresses() {
        let mut uf = UnionFind::new();
        uf.union("a", "b");
        assert!(!uf.connected("a", "zzz"));
        assert_eq!(uf.len(), 2, "query must not create a singleton");
    }

    #[test]
    fn overlapping_transactions_merge_clusters() {
        // tx1 spends {A,B}, tx2 spends {B,C}: one entity controls all three.
        let mut uf = UnionFind::new();
        uf.observe_inputs(&["A", "B"]);
        uf.observe_inputs(&["B", "C"]);
        assert!(uf.connected("A", "C"));
        assert_eq!(uf.cluster_count(), 1);
    }

    #[test]
    fn single_input_tx_creates_singleton_only() {
        let mut uf = UnionFind::new();
        uf.observe_inputs(&["lone"]);
        uf.observe_inputs(&["x", "y"]);
        assert_eq!(uf.cluster_count(), 2);
        assert!(!uf.connected("lone", "x"));
    }

    #[test]
    fn member_enumeration_is_sound() {
        let mut uf = UnionFind::new();
        uf.observe_inputs(&["a", "b", "c"]);
        uf.observe_inputs(&["d", "e"]);
        uf.observe_inputs(&["f"]);

        let mut pairs = Vec::new();
        uf.for_each_member(|member, rep| pairs.push((member.to_string(), rep.to_string())));
        assert_eq!(pairs.len(), 6);

        // Every member's find() resolves to the representative it was
        // enumerated under.
        for (member, rep) in pairs {
            assert_eq!(uf.find(&member), rep);
        }
    }

    #[test]
    fn stats_over_mixed_partition() {
        let mut uf = UnionFind::new();
        uf.observe_inputs(&["a", "b", "c"]);
        uf.observe_inputs(&["d"]);
        let stats = uf.stats();
        assert_eq!(stats.cluster_count, 2);
        assert_eq!(stats.total_addresses, 4);
        assert_eq!(stats.max_cluster_size, 3);
        assert_eq!(stats.min_cluster_size, 1);
        assert!((stats.avg_cluster_size - 2.0).abs() < 1e-9);
    }

    #[test]
    fn deep_chain_does_not_overflow() {
        // A pathological merge order: every new element unions into the tail.
        let mut uf = UnionFind::new();
        let addrs: Vec<String> = (0..50_000).map(|i| format!("addr{i}")).collect();
        for pair in addrs.windows(2) {
            uf.union(&pair[0], &pair[1]);
        }
        assert_eq!(uf.cluster_count(), 1);
        assert!(uf.connected("addr0", "addr49999"));
    }
}
