use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use keyrando_graph::{EdgeId, Graph, KeyId, KeyKind, KeyMultiset, NodeId};

use crate::randomize::RouteFinderError;

/// Snapshot of search progress within one segment.
///
/// The driver clones a state before every speculative placement and drops
/// the clone on backtrack. Forked segments keep their ancestors behind an
/// `Rc` so a fork does not copy the chain.
///
/// `visited`, `next`, `one_way` and `spare_items` are `BTreeSet`s: every
/// iteration that feeds the seeded PRNG or the output must be stable by
/// identity.
#[derive(Clone, Debug, Default)]
pub struct SearchState {
    pub visited: BTreeSet<NodeId>,
    pub keys: KeyMultiset,
    /// Edges known but not yet satisfied.
    pub next: BTreeSet<EdgeId>,
    /// Deferred OneWay/NoReturn crossings, already satisfied and debited.
    pub one_way: BTreeSet<EdgeId>,
    /// Visited Item nodes with no key placed yet.
    pub spare_items: BTreeSet<NodeId>,
    /// Key placements, accumulated across all segments of the run.
    pub item_to_key: BTreeMap<NodeId, Vec<KeyId>>,
    /// Nodes visited at any point in this timeline; survives `clear`/`fork`.
    pub total_visited: BTreeSet<NodeId>,
    pub parent: Option<Arc<SearchState>>,
    pub log: Vec<String>,
}

impl SearchState {
    pub fn new() -> Self {
        SearchState::default()
    }

    /// Reset to a fresh segment with no parent, seeded with nodes already
    /// guaranteed visited and keys already guaranteed held.
    pub fn clear(&mut self, visited: BTreeSet<NodeId>, keys: KeyMultiset, next: BTreeSet<EdgeId>) {
        self.total_visited.extend(visited.iter().copied());
        self.visited = visited;
        self.keys = keys;
        self.next = next;
        self.one_way = BTreeSet::new();
        self.spare_items = BTreeSet::new();
        self.parent = None;
    }

    /// As `clear`, but the current state becomes the new segment's parent.
    pub fn fork(&mut self, visited: BTreeSet<NodeId>, keys: KeyMultiset, next: BTreeSet<EdgeId>) {
        let parent = Arc::new(self.clone());
        self.clear(visited, keys, next);
        self.parent = Some(parent);
    }

    /// Marks `n` visited in the current segment.
    ///
    /// If `n` was visited in an ancestor segment, the fork has looped back:
    /// the current segment is merged into that ancestor instead. Visiting
    /// an assigned Item collects its keys; an unassigned Item becomes a
    /// spare slot.
    pub fn visit_node(&mut self, graph: &Graph, n: NodeId) -> Result<(), RouteFinderError> {
        if self.visited.contains(&n) {
            return Ok(());
        }
        if let Some(depth) = self.ancestor_depth_with(n) {
            return self.join(graph, depth);
        }
        self.visited.insert(n);
        self.total_visited.insert(n);
        if graph.node(n).is_item() {
            if let Some(keys) = self.item_to_key.get(&n) {
                for &k in keys {
                    self.keys.add_many(k, graph.key(k).quantity);
                }
            } else {
                self.spare_items.insert(n);
            }
        }
        for edge in graph.edges_from(n) {
            if !self.visited.contains(&edge.inverse(n)) {
                self.next.insert(edge.id);
            }
        }
        self.prune_fully_visited(graph);
        self.push_log(|| format!("visit {}", graph.node(n).label));
        Ok(())
    }

    /// Assigns `key` to the spare item slot `item` and takes its tokens.
    pub fn place_key(
        &mut self,
        graph: &Graph,
        item: NodeId,
        key: KeyId,
    ) -> Result<(), RouteFinderError> {
        if !self.spare_items.remove(&item) {
            return Err(RouteFinderError::InvariantViolation(format!(
                "place_key target {} is not a spare item",
                graph.node(item).label
            )));
        }
        self.item_to_key.entry(item).or_default().push(key);
        self.keys.add_many(key, graph.key(key).quantity);
        self.push_log(|| {
            format!(
                "place {} at {}",
                graph.key(key).label,
                graph.node(item).label
            )
        });
        Ok(())
    }

    /// Retires `edge` and debits the given consumed key tokens.
    pub fn use_key(&mut self, edge: EdgeId, consumed: &KeyMultiset) {
        self.next.remove(&edge);
        for (key, count) in consumed.iter() {
            self.keys.remove_many(key, count);
        }
    }

    pub fn add_one_way(&mut self, edge: EdgeId) {
        self.one_way.insert(edge);
    }

    pub fn remove_one_way(&mut self, edge: EdgeId) {
        self.one_way.remove(&edge);
    }

    /// Merges the current segment upward through `depth` ancestors.
    ///
    /// Everything discovered in the fork (and in intermediate forks) is
    /// unioned into the target ancestor; the merged state's parent is the
    /// ancestor's parent.
    pub fn join(&mut self, graph: &Graph, depth: usize) -> Result<(), RouteFinderError> {
        let mut cursor = self.parent.clone();
        for _ in 0..depth {
            let Some(ancestor) = cursor else {
                return Err(RouteFinderError::InvariantViolation(
                    "join target missing from the parent chain".to_string(),
                ));
            };
            self.union_from(graph, &ancestor);
            cursor = ancestor.parent.clone();
        }
        self.parent = cursor;
        self.prune_fully_visited(graph);
        self.push_log(|| format!("join up {depth}"));
        Ok(())
    }

    fn union_from(&mut self, graph: &Graph, other: &SearchState) {
        self.visited.extend(other.visited.iter().copied());
        self.total_visited.extend(other.total_visited.iter().copied());
        self.next.extend(other.next.iter().copied());
        self.one_way.extend(other.one_way.iter().copied());
        self.spare_items.extend(other.spare_items.iter().copied());
        // Reusable keys are held once regardless of which segment found
        // them; consumable/removable tokens earned in the fork are additive.
        let mut reusable = KeyMultiset::new();
        let mut spendable = KeyMultiset::new();
        for (key, count) in other.keys.iter() {
            match graph.key(key).kind {
                KeyKind::Reusable => reusable.add_many(key, count),
                KeyKind::Consumable | KeyKind::Removable => spendable.add_many(key, count),
            }
        }
        self.keys.union_max(&reusable);
        self.keys.union_sum(&spendable);
        for (item, keys) in &other.item_to_key {
            self.item_to_key.entry(*item).or_insert_with(|| keys.clone());
        }
        // An item with an assignment is never a spare slot.
        let assigned: Vec<NodeId> = self.item_to_key.keys().copied().collect();
        for item in assigned {
            self.spare_items.remove(&item);
        }
    }

    /// True iff `n` is visited in this segment or any ancestor segment.
    pub fn chain_visited(&self, n: NodeId) -> bool {
        self.visited.contains(&n) || self.ancestor_depth_with(n).is_some()
    }

    /// Depth (1-based) of the nearest ancestor whose segment visited `n`.
    fn ancestor_depth_with(&self, n: NodeId) -> Option<usize> {
        let mut cursor = self.parent.as_deref();
        let mut depth = 1;
        while let Some(state) = cursor {
            if state.visited.contains(&n) {
                return Some(depth);
            }
            cursor = state.parent.as_deref();
            depth += 1;
        }
        None
    }

    fn prune_fully_visited(&mut self, graph: &Graph) {
        let visited = &self.visited;
        self.next.retain(|&e| {
            let edge = graph.edge(e);
            !(visited.contains(&edge.source) && visited.contains(&edge.destination))
        });
    }

    /// Total number of key placements so far.
    pub fn placement_count(&self) -> usize {
        self.item_to_key.values().map(|keys| keys.len()).sum()
    }

    pub fn push_log<F: FnOnce() -> String>(&mut self, f: F) {
        if cfg!(debug_assertions) {
            self.log.push(f());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrando_graph::{GraphBuilder, NodeKind};

    fn chain_graph() -> (Graph, Vec<NodeId>) {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let r1 = builder.and_gate("R1", &[r0], &[]);
        let r2 = builder.and_gate("R2", &[r1], &[]);
        let graph = builder.build().unwrap();
        (graph, vec![r0, r1, r2])
    }

    #[test]
    fn visit_rejoins_ancestor_segment() {
        let (graph, nodes) = chain_graph();
        let mut state = SearchState::new();
        state.visit_node(&graph, nodes[0]).unwrap();
        state.fork(BTreeSet::new(), KeyMultiset::new(), BTreeSet::new());
        state.visit_node(&graph, nodes[2]).unwrap();
        assert!(state.parent.is_some());
        // Reaching a node the parent already visited merges the fork back.
        state.visit_node(&graph, nodes[0]).unwrap();
        assert!(state.parent.is_none());
        assert!(state.visited.contains(&nodes[0]));
        assert!(state.visited.contains(&nodes[2]));
    }

    #[test]
    fn place_key_requires_spare_slot() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let i0 = builder.item("I0", 0, r0, &[]);
        let k0 = builder.reusable_key("K0", 0);
        let graph = builder.build().unwrap();

        let mut state = SearchState::new();
        state.visit_node(&graph, r0).unwrap();
        state.visit_node(&graph, i0).unwrap();
        assert!(state.spare_items.contains(&i0));
        state.place_key(&graph, i0, k0).unwrap();
        assert_eq!(state.keys.count(k0), 1);
        // The slot is gone now.
        assert!(state.place_key(&graph, i0, k0).is_err());
    }

    #[test]
    fn clear_preserves_placements_and_total_visited() {
        let (graph, nodes) = chain_graph();
        let mut state = SearchState::new();
        state.visit_node(&graph, nodes[0]).unwrap();
        state.visit_node(&graph, nodes[1]).unwrap();
        state.clear(BTreeSet::new(), KeyMultiset::new(), BTreeSet::new());
        assert!(state.visited.is_empty());
        assert!(state.total_visited.contains(&nodes[0]));
        assert!(state.total_visited.contains(&nodes[1]));
    }
}
