use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use hashbrown::{HashMap, HashSet};
use keyrando_graph::{Graph, KeyId, KeyKind, KeyMultiset, NodeId};

/// A prerequisite that holds on every path from start to a target node.
///
/// Soft node requirements mark rooms merely passed through; they do not
/// persist across segment boundaries. Hard node requirements come from an
/// edge's `required_nodes` (flag semantics: once satisfied, satisfied
/// forever).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Requirement {
    Node { node: NodeId, soft: bool },
    Key(KeyId),
}

/// Static preprocessing: for a segment entry node, computes the
/// requirements that every path from start must have satisfied, so a fresh
/// segment can be seeded with what is already known to hold.
///
/// Node and key results are memoized for the analyzer's lifetime; the
/// tables are valid as long as the placement map it was built from does
/// not change, which is why the driver constructs a fresh analyzer per
/// segment.
pub struct RequirementAnalyzer<'a> {
    graph: &'a Graph,
    item_to_key: &'a BTreeMap<NodeId, Vec<KeyId>>,
    items_by_key: BTreeMap<KeyId, Vec<NodeId>>,
    node_memo: RefCell<HashMap<NodeId, Option<BTreeSet<Requirement>>>>,
    key_memo: RefCell<HashMap<KeyId, Option<BTreeSet<Requirement>>>>,
}

impl<'a> RequirementAnalyzer<'a> {
    pub fn new(graph: &'a Graph, item_to_key: &'a BTreeMap<NodeId, Vec<KeyId>>) -> Self {
        let mut items_by_key: BTreeMap<KeyId, Vec<NodeId>> = BTreeMap::new();
        for (&item, keys) in item_to_key {
            for &key in keys {
                items_by_key.entry(key).or_default().push(item);
            }
        }
        RequirementAnalyzer {
            graph,
            item_to_key,
            items_by_key,
            node_memo: RefCell::new(HashMap::new()),
            key_memo: RefCell::new(HashMap::new()),
        }
    }

    /// Requirements satisfied on every start-to-`root` path, expanded to a
    /// fixed point through key placements (a guaranteed key implies its
    /// hosting item's requirements; a guaranteed item implies its keys).
    pub fn guaranteed(&self, root: NodeId) -> BTreeSet<Requirement> {
        let mut visiting = HashSet::new();
        let base = self
            .node_requirements(root, &mut visiting)
            .unwrap_or_else(|| {
                BTreeSet::from([Requirement::Node {
                    node: root,
                    soft: true,
                }])
            });
        let mut out: BTreeSet<Requirement> = BTreeSet::new();
        let mut work: Vec<Requirement> = base.into_iter().collect();
        let mut expanded_keys: HashSet<KeyId> = HashSet::new();
        while let Some(req) = work.pop() {
            if !out.insert(req) {
                continue;
            }
            match req {
                Requirement::Node { node, .. } => {
                    // A guaranteed-visited item is a guaranteed pickup.
                    if let Some(keys) = self.item_to_key.get(&node) {
                        work.extend(keys.iter().map(|&k| Requirement::Key(k)));
                    }
                }
                Requirement::Key(key) => {
                    if expanded_keys.insert(key) {
                        if let Some(reqs) = self.key_requirements(key) {
                            work.extend(reqs);
                        }
                    }
                }
            }
        }
        out
    }

    /// Splits `guaranteed(root)` into the seed visited-set (hard node
    /// requirements) and seed keys (reusable keys only, plus nothing for
    /// keys that may have been spent).
    pub fn seed_for(&self, root: NodeId) -> (BTreeSet<NodeId>, KeyMultiset) {
        let mut visited = BTreeSet::new();
        let mut keys = KeyMultiset::new();
        for req in self.guaranteed(root) {
            match req {
                Requirement::Node { node, soft: false } => {
                    visited.insert(node);
                }
                Requirement::Node { .. } => {}
                Requirement::Key(key) => {
                    let key_info = self.graph.key(key);
                    if key_info.kind == KeyKind::Reusable {
                        keys.add_many(key, key_info.quantity);
                    }
                }
            }
        }
        (visited, keys)
    }

    /// Intersection, over incoming applicable edges, of the other
    /// endpoint's requirements plus the edge's own. Cycle re-entry
    /// contributes the identity for intersection: the edge is skipped, and
    /// a node with no non-cyclic incoming edge yields `None`.
    ///
    /// Memoized results hold the cycle-free value for a node, so any call
    /// may read them; only computations that started with an empty
    /// visiting set (whose result is not narrowed by on-stack exclusions)
    /// are written back.
    fn node_requirements(
        &self,
        n: NodeId,
        visiting: &mut HashSet<NodeId>,
    ) -> Option<BTreeSet<Requirement>> {
        if let Some(cached) = self.node_memo.borrow().get(&n) {
            return cached.clone();
        }
        if n == self.graph.start {
            return Some(BTreeSet::from([Requirement::Node {
                node: n,
                soft: true,
            }]));
        }
        if !visiting.insert(n) {
            return None;
        }
        let clean_entry = visiting.len() == 1;
        let mut acc: Option<BTreeSet<Requirement>> = None;
        for edge in self.graph.edges_to(n) {
            let other = edge.inverse(n);
            let Some(mut reqs) = self.node_requirements(other, visiting) else {
                continue;
            };
            for key in edge.required_keys.keys() {
                reqs.insert(Requirement::Key(key));
            }
            for &node in &edge.required_nodes {
                reqs.insert(Requirement::Node { node, soft: false });
            }
            acc = Some(match acc {
                None => reqs,
                Some(prev) => prev.intersection(&reqs).copied().collect(),
            });
        }
        visiting.remove(&n);
        let result = acc.map(|mut reqs| {
            reqs.insert(Requirement::Node { node: n, soft: true });
            reqs
        });
        if clean_entry {
            self.node_memo.borrow_mut().insert(n, result.clone());
        }
        result
    }

    /// Requirements implied by holding `key`: the intersection of its
    /// hosting items' requirements. Absent when the key is unplaced.
    /// Memoized per key.
    fn key_requirements(&self, key: KeyId) -> Option<BTreeSet<Requirement>> {
        if let Some(cached) = self.key_memo.borrow().get(&key) {
            return cached.clone();
        }
        let mut acc: Option<BTreeSet<Requirement>> = None;
        if let Some(items) = self.items_by_key.get(&key) {
            for &item in items {
                let mut visiting = HashSet::new();
                let Some(reqs) = self.node_requirements(item, &mut visiting) else {
                    continue;
                };
                acc = Some(match acc {
                    None => reqs,
                    Some(prev) => prev.intersection(&reqs).copied().collect(),
                });
            }
        }
        self.key_memo.borrow_mut().insert(key, acc.clone());
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrando_graph::{GraphBuilder, NodeKind};

    #[test]
    fn chain_yields_soft_markers_only() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let r1 = builder.and_gate("R1", &[r0], &[]);
        let r2 = builder.no_return("R2", r1, &[]);
        let graph = builder.build().unwrap();
        let placements = BTreeMap::new();
        let analyzer = RequirementAnalyzer::new(&graph, &placements);

        let reqs = analyzer.guaranteed(r2);
        assert!(reqs.contains(&Requirement::Node {
            node: r0,
            soft: true
        }));
        assert!(reqs.contains(&Requirement::Node {
            node: r1,
            soft: true
        }));
        // Rooms passed through do not seed the next segment.
        let (visited, keys) = analyzer.seed_for(r2);
        assert!(visited.is_empty());
        assert!(keys.is_empty());
    }

    #[test]
    fn reusable_key_on_every_path_seeds_segment() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let k0 = builder.reusable_key("K0", 0);
        let r1 = builder.no_return("R1", r0, &[k0]);
        let graph = builder.build().unwrap();
        let placements = BTreeMap::new();
        let analyzer = RequirementAnalyzer::new(&graph, &placements);

        let (visited, keys) = analyzer.seed_for(r1);
        assert!(visited.is_empty());
        assert_eq!(keys.count(k0), 1);
    }

    #[test]
    fn consumable_key_never_seeds_segment() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let k0 = builder.consumable_key("K0", 0);
        let r1 = builder.no_return("R1", r0, &[k0]);
        let graph = builder.build().unwrap();
        let placements = BTreeMap::new();
        let analyzer = RequirementAnalyzer::new(&graph, &placements);

        let (_, keys) = analyzer.seed_for(r1);
        assert!(keys.is_empty());
    }

    #[test]
    fn required_nodes_seed_as_hard() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let switch = builder.and_gate("switch", &[r0], &[]);
        let r1 = builder.add_node(NodeKind::NoReturn, 0, "R1");
        builder.add_edge(r0, r1, keyrando_graph::EdgeKind::NoReturn, &[], &[switch]);
        let graph = builder.build().unwrap();
        let placements = BTreeMap::new();
        let analyzer = RequirementAnalyzer::new(&graph, &placements);

        let (visited, _) = analyzer.seed_for(r1);
        assert!(visited.contains(&switch));
    }

    #[test]
    fn alternate_paths_intersect_away_requirements() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let k0 = builder.reusable_key("K0", 0);
        let a = builder.and_gate("A", &[r0], &[k0]);
        let b = builder.and_gate("B", &[r0], &[]);
        let goal = builder.or_gate("goal", &[a, b]);
        let graph = builder.build().unwrap();
        let placements = BTreeMap::new();
        let analyzer = RequirementAnalyzer::new(&graph, &placements);

        // The key-free path through B means K0 is not guaranteed.
        let (_, keys) = analyzer.seed_for(goal);
        assert!(keys.is_empty());
    }
}
