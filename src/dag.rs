//! Compact per-repository commit parent graphs.
//!
//! A DAG is stored as three arrays in compressed-sparse-row form: `hashes`
//! (sorted commit shas), `vertexes` (CSR offsets, `N + 1` entries) and
//! `edges` (neighbour indices). `edges[vertexes[i]..vertexes[i + 1]]` lists
//! the *git parents* of `hashes[i]`; the first entry is the first parent
//! when the edge order is known. The source tables store parent/child
//! git-reversed, so builders in `dag::store` normalise before anything
//! reaches this module.

pub mod store;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dag {
    hashes: Vec<String>,
    vertexes: Vec<u32>,
    edges: Vec<u32>,
}

impl Default for Dag {
    fn default() -> Self {
        Dag::empty()
    }
}

impl Dag {
    /// The empty DAG: `(N = 0, vertexes = [0], edges = [])`.
    pub fn empty() -> Self {
        Dag {
            hashes: Vec::new(),
            vertexes: vec![0],
            edges: Vec::new(),
        }
    }

    /// Build from adjacency lists mapping a commit sha to its git parents.
    ///
    /// Parents that do not appear as keys become nodes with no outgoing
    /// edges. Parent order within a node is preserved (first parent first).
    pub fn from_parent_lists(adjacency: &HashMap<String, Vec<String>>) -> Dag {
        let mut hashes: Vec<&str> = adjacency
            .iter()
            .flat_map(|(sha, parents)| std::iter::once(sha.as_str()).chain(parents.iter().map(String::as_str)))
            .collect();
        hashes.sort_unstable();
        hashes.dedup();

        let index: HashMap<&str, u32> = hashes
            .iter()
            .enumerate()
            .map(|(i, sha)| (*sha, i as u32))
            .collect();

        let mut vertexes = Vec::with_capacity(hashes.len() + 1);
        let mut edges = Vec::new();
        vertexes.push(0u32);
        for sha in &hashes {
            if let Some(parents) = adjacency.get(*sha) {
                for parent in parents {
                    edges.push(index[parent.as_str()]);
                }
            }
            vertexes.push(edges.len() as u32);
        }

        Dag {
            hashes: hashes.into_iter().map(str::to_owned).collect(),
            vertexes,
            edges,
        }
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn hashes(&self) -> &[String] {
        &self.hashes
    }

    pub fn vertexes(&self) -> &[u32] {
        &self.vertexes
    }

    pub fn edges(&self) -> &[u32] {
        &self.edges
    }

    pub fn find(&self, sha: &str) -> Option<usize> {
        self.hashes.binary_search_by(|h| h.as_str().cmp(sha)).ok()
    }

    pub fn contains(&self, sha: &str) -> bool {
        self.find(sha).is_some()
    }

    /// Git parents of node `i` as indices into `hashes`.
    pub fn parents(&self, i: usize) -> &[u32] {
        let from = self.vertexes[i] as usize;
        let to = self.vertexes[i + 1] as usize;
        &self.edges[from..to]
    }

    /// Back to adjacency lists; the inverse of [`Dag::from_parent_lists`].
    pub fn to_parent_lists(&self) -> HashMap<String, Vec<String>> {
        let mut adjacency = HashMap::with_capacity(self.len());
        for (i, sha) in self.hashes.iter().enumerate() {
            let parents = self
                .parents(i)
                .iter()
                .map(|&p| self.hashes[p as usize].clone())
                .collect();
            adjacency.insert(sha.clone(), parents);
        }
        adjacency
    }

    /// Merge newly discovered adjacency into this DAG. Unknown endpoints are
    /// added as nodes; the call is idempotent when everything in `new` is
    /// already present.
    pub fn join(&self, new: &HashMap<String, Vec<String>>) -> Dag {
        let mut adjacency = self.to_parent_lists();
        for (sha, parents) in new {
            let known = adjacency.entry(sha.clone()).or_default();
            for parent in parents {
                if !known.contains(parent) {
                    known.push(parent.clone());
                }
            }
            for parent in parents {
                adjacency.entry(parent.clone()).or_default();
            }
        }
        Dag::from_parent_lists(&adjacency)
    }

    /// Indices of all nodes reachable from `heads` (inclusive), following
    /// parent edges. Heads absent from the DAG are ignored.
    fn reachable(&self, heads: &[&str]) -> Vec<bool> {
        let mut visited = vec![false; self.len()];
        let mut stack: Vec<usize> = heads.iter().filter_map(|h| self.find(h)).collect();
        while let Some(i) = stack.pop() {
            if std::mem::replace(&mut visited[i], true) {
                continue;
            }
            stack.extend(self.parents(i).iter().map(|&p| p as usize));
        }
        visited
    }

    /// The subgraph reachable from `heads` (inclusive), preserving the CSR
    /// invariants. Extracting the full hash set yields the same DAG back.
    pub fn extract_subdag(&self, heads: &[&str]) -> Dag {
        let visited = self.reachable(heads);
        // All parents of a reachable node are reachable, so every edge of a
        // kept node survives; only the index space shrinks.
        let mut remap = vec![u32::MAX; self.len()];
        let mut hashes = Vec::new();
        for (i, sha) in self.hashes.iter().enumerate() {
            if visited[i] {
                remap[i] = hashes.len() as u32;
                hashes.push(sha.clone());
            }
        }
        let mut vertexes = Vec::with_capacity(hashes.len() + 1);
        let mut edges = Vec::new();
        vertexes.push(0u32);
        for i in 0..self.len() {
            if visited[i] {
                edges.extend(self.parents(i).iter().map(|&p| remap[p as usize]));
                vertexes.push(edges.len() as u32);
            }
        }
        Dag {
            hashes,
            vertexes,
            edges,
        }
    }

    /// All shas reachable from `heads`, inclusive.
    pub fn reachable_hashes(&self, heads: &[&str]) -> Vec<&str> {
        self.reachable(heads)
            .iter()
            .enumerate()
            .filter(|(_, v)| **v)
            .map(|(i, _)| self.hashes[i].as_str())
            .collect()
    }

    /// Label every node with the index of its owning head: the head from
    /// which it is first reachable, heads iterated in input order. Nodes
    /// unreachable from any head get `-1`.
    pub fn mark_access(&self, heads: &[&str]) -> Vec<i32> {
        let mut owner = vec![-1i32; self.len()];
        for (hi, head) in heads.iter().enumerate() {
            let Some(root) = self.find(head) else {
                continue;
            };
            let mut stack = vec![root];
            while let Some(i) = stack.pop() {
                if owner[i] != -1 {
                    // Already claimed by an earlier head; its ancestors are
                    // claimed too, so the walk can stop here.
                    continue;
                }
                owner[i] = hi as i32;
                stack.extend(self.parents(i).iter().map(|&p| p as usize));
            }
        }
        owner
    }

    /// Check the CSR invariants: sorted unique hashes, non-decreasing
    /// offsets closing at `edges.len()`, in-bounds edges, acyclicity.
    pub fn verify(&self) -> Result<(), String> {
        let n = self.len();
        if self.vertexes.len() != n + 1 {
            return Err(format!(
                "vertexes has {} entries for {} nodes",
                self.vertexes.len(),
                n
            ));
        }
        if self.vertexes[0] != 0 {
            return Err("vertexes[0] != 0".to_owned());
        }
        if self.vertexes.windows(2).any(|w| w[0] > w[1]) {
            return Err("vertexes is not non-decreasing".to_owned());
        }
        if self.vertexes[n] as usize != self.edges.len() {
            return Err("vertexes does not close at edges.len()".to_owned());
        }
        if let Some(bad) = self.edges.iter().find(|&&e| e as usize >= n) {
            return Err(format!("edge target {bad} out of bounds"));
        }
        if self.hashes.windows(2).any(|w| w[0] >= w[1]) {
            return Err("hashes are not sorted and unique".to_owned());
        }

        // Kahn's algorithm over parent edges detects cycles.
        let mut indegree = vec![0usize; n];
        for &e in &self.edges {
            indegree[e as usize] += 1;
        }
        let mut queue: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut seen = 0;
        while let Some(i) = queue.pop() {
            seen += 1;
            for &p in self.parents(i) {
                indegree[p as usize] -= 1;
                if indegree[p as usize] == 0 {
                    queue.push(p as usize);
                }
            }
        }
        if seen != n {
            return Err("graph contains a cycle".to_owned());
        }
        Ok(())
    }

    /// Rough in-memory footprint in bytes, used for cache budgeting.
    pub fn estimated_size(&self) -> usize {
        let strings: usize = self.hashes.iter().map(|h| h.len() + 24).sum();
        strings + 4 * (self.vertexes.len() + self.edges.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // C1 -> C2 -> C3 -> C4 linear chain plus a side branch C2 -> B1.
    fn sample() -> Dag {
        let adjacency = HashMap::from([
            ("c1".to_owned(), vec![]),
            ("c2".to_owned(), vec!["c1".to_owned()]),
            ("c3".to_owned(), vec!["c2".to_owned()]),
            ("c4".to_owned(), vec!["c3".to_owned()]),
            ("b1".to_owned(), vec!["c2".to_owned()]),
        ]);
        Dag::from_parent_lists(&adjacency)
    }

    #[test]
    fn empty_dag_shape() {
        let dag = Dag::empty();
        assert_eq!(dag.len(), 0);
        assert_eq!(dag.vertexes(), &[0]);
        assert!(dag.edges().is_empty());
        dag.verify().unwrap();
    }

    #[test]
    fn csr_invariants_hold() {
        let dag = sample();
        dag.verify().unwrap();
        assert_eq!(dag.vertexes().len(), dag.len() + 1);
        assert_eq!(*dag.vertexes().last().unwrap() as usize, dag.edges().len());
        assert!(dag.edges().iter().all(|&e| (e as usize) < dag.len()));
    }

    #[test]
    fn verify_rejects_cycles() {
        let adjacency = HashMap::from([
            ("a".to_owned(), vec!["b".to_owned()]),
            ("b".to_owned(), vec!["a".to_owned()]),
        ]);
        let dag = Dag::from_parent_lists(&adjacency);
        assert!(dag.verify().is_err());
    }

    #[test]
    fn extract_full_set_is_identity() {
        let dag = sample();
        let heads: Vec<&str> = dag.hashes().iter().map(String::as_str).collect();
        assert_eq!(dag.extract_subdag(&heads), dag);
    }

    #[test]
    fn extract_subdag_bounds_reachability() {
        let dag = sample();
        let sub = dag.extract_subdag(&["c3"]);
        sub.verify().unwrap();
        assert_eq!(
            sub.hashes(),
            &["c1".to_owned(), "c2".to_owned(), "c3".to_owned()]
        );
        assert!(!sub.contains("b1"));
        assert!(!sub.contains("c4"));
    }

    #[test]
    fn extract_ignores_unknown_heads() {
        let dag = sample();
        assert!(dag.extract_subdag(&["nope"]).is_empty());
    }

    #[test]
    fn join_is_idempotent_on_known_edges() {
        let dag = sample();
        let same = dag.join(&dag.to_parent_lists());
        assert_eq!(same, dag);
    }

    #[test]
    fn join_adds_unknown_endpoints() {
        let dag = sample();
        let joined = dag.join(&HashMap::from([(
            "c5".to_owned(),
            vec!["c4".to_owned(), "x1".to_owned()],
        )]));
        joined.verify().unwrap();
        assert!(joined.contains("c5"));
        assert!(joined.contains("x1"));
        assert!(joined.parents(joined.find("x1").unwrap()).is_empty());
        // The old structure survives.
        let c2 = joined.find("c2").unwrap();
        assert_eq!(joined.parents(c2), &[joined.find("c1").unwrap() as u32]);
    }

    #[test]
    fn mark_access_prefers_earlier_heads() {
        let dag = sample();
        let owners = dag.mark_access(&["c3", "c4", "b1"]);
        let owner_of = |sha: &str| owners[dag.find(sha).unwrap()];
        // c1..c3 are first reachable from c3, c4 only from itself, b1
        // reaches c2/c1 too late to claim them.
        assert_eq!(owner_of("c3"), 0);
        assert_eq!(owner_of("c2"), 0);
        assert_eq!(owner_of("c1"), 0);
        assert_eq!(owner_of("c4"), 1);
        assert_eq!(owner_of("b1"), 2);
    }

    #[test]
    fn mark_access_labels_unreachable_with_minus_one() {
        let dag = sample();
        let owners = dag.mark_access(&["c2"]);
        assert_eq!(owners[dag.find("c4").unwrap()], -1);
        assert_eq!(owners[dag.find("b1").unwrap()], -1);
        assert_eq!(owners[dag.find("c1").unwrap()], 0);
    }

    #[test]
    fn serde_round_trip() {
        let dag = sample();
        let blob = serde_json::to_vec(&dag).unwrap();
        let back: Dag = serde_json::from_slice(&blob).unwrap();
        assert_eq!(back, dag);
    }
}
