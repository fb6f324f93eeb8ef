use std::cell::RefCell;

use hashbrown::HashMap;
use keyrando_graph::{Edge, EdgeId, Graph, KeyId, KeyKind, KeyMultiset, NodeId, NodeKind};

use crate::randomize::RouteFinderError;
use crate::state::SearchState;

/// Removable-key demand table.
///
/// For a removable key, each earlier crossing leaves a token behind, so a
/// gated node demands the minimum, over all start-to-node paths, of the
/// summed multiplicity of the key across the path's edge requirements.
/// Distances are computed once per key by shortest-path relaxation over
/// the traversable edge directions and memoized for the life of the table
/// (the graph is immutable).
pub struct MinOccurrences<'a> {
    graph: &'a Graph,
    memo: RefCell<HashMap<KeyId, Vec<usize>>>,
}

impl<'a> MinOccurrences<'a> {
    pub fn new(graph: &'a Graph) -> Self {
        MinOccurrences {
            graph,
            memo: RefCell::new(HashMap::new()),
        }
    }

    /// Minimum summed multiplicity of `key` on any path from start to
    /// `node`, or `None` when no path reaches it.
    pub fn get(&self, key: KeyId, node: NodeId) -> Option<usize> {
        let mut memo = self.memo.borrow_mut();
        let dist = memo.entry(key).or_insert_with(|| self.relax(key));
        match dist[node] {
            usize::MAX => None,
            d => Some(d),
        }
    }

    fn relax(&self, key: KeyId) -> Vec<usize> {
        let mut dist = vec![usize::MAX; self.graph.nodes.len()];
        dist[self.graph.start] = 0;
        loop {
            let mut changed = false;
            for edge in &self.graph.edges {
                let weight = edge.required_keys.count(key);
                if dist[edge.source] != usize::MAX {
                    let d = dist[edge.source] + weight;
                    if d < dist[edge.destination] {
                        dist[edge.destination] = d;
                        changed = true;
                    }
                }
                if edge.is_two_way() && dist[edge.destination] != usize::MAX {
                    let d = dist[edge.destination] + weight;
                    if d < dist[edge.source] {
                        dist[edge.source] = d;
                        changed = true;
                    }
                }
            }
            if !changed {
                return dist;
            }
        }
    }
}

/// Tokens of `key` that must be held to cross `edge` into `entering`.
/// Owning a reusable key once covers every multiplicity of it on an edge;
/// consumable tokens are each spent once; removable keys demand the
/// cumulative path count.
pub fn need(
    graph: &Graph,
    min_occ: &MinOccurrences,
    edge: &Edge,
    key: KeyId,
    entering: NodeId,
) -> Option<usize> {
    let multiplicity = edge.required_keys.count(key);
    match graph.key(key).kind {
        KeyKind::Reusable => Some(multiplicity.min(1)),
        KeyKind::Consumable => Some(multiplicity),
        KeyKind::Removable => min_occ.get(key, entering),
    }
}

/// Required nodes visited and every required key held in sufficient count.
pub fn is_satisfied(
    graph: &Graph,
    min_occ: &MinOccurrences,
    state: &SearchState,
    edge: &Edge,
    entering: NodeId,
) -> bool {
    if !edge
        .required_nodes
        .iter()
        .all(|n| state.visited.contains(n))
    {
        return false;
    }
    for key in edge.required_keys.keys() {
        match need(graph, min_occ, edge, key, entering) {
            Some(needed) => {
                if state.keys.count(key) < needed {
                    return false;
                }
            }
            None => return false,
        }
    }
    true
}

/// An AndGate opens only when every declared-incoming edge is satisfied
/// with its far side visited.
pub fn and_gate_ready(
    graph: &Graph,
    min_occ: &MinOccurrences,
    state: &SearchState,
    node: NodeId,
) -> bool {
    if graph.node(node).kind != NodeKind::AndGate {
        return true;
    }
    graph
        .edges_to(node)
        .filter(|edge| edge.destination == node)
        .all(|edge| {
            state.visited.contains(&edge.source)
                && is_satisfied(graph, min_occ, state, edge, node)
        })
}

/// The consumable portion of an edge's key requirements.
pub fn consumed_keys(graph: &Graph, edge: &Edge) -> KeyMultiset {
    let mut out = KeyMultiset::new();
    for (key, count) in edge.required_keys.iter() {
        if graph.key(key).kind == KeyKind::Consumable {
            out.add_many(key, count);
        }
    }
    out
}

/// Promotes satisfied edges until a full pass adds nothing.
///
/// Two-way edges are traversed from whichever end is visited. Satisfied
/// OneWay/NoReturn edges are debited and deferred into `one_way` for the
/// driver. Entering an AndGate consumes all of its declared-incoming
/// edges at once.
pub fn expand(
    graph: &Graph,
    min_occ: &MinOccurrences,
    state: &mut SearchState,
) -> Result<(), RouteFinderError> {
    loop {
        state.one_way.retain(|&e| {
            let edge = graph.edge(e);
            !state.visited.contains(&edge.destination)
        });
        let candidates: Vec<EdgeId> = state.next.iter().copied().collect();
        let mut changed = false;
        for e in candidates {
            if !state.next.contains(&e) {
                continue;
            }
            let edge = graph.edge(e);
            let src_visited = state.visited.contains(&edge.source);
            let dst_visited = state.visited.contains(&edge.destination);
            let entering = if src_visited && !dst_visited {
                edge.destination
            } else if dst_visited && !src_visited && edge.is_two_way() {
                edge.source
            } else {
                state.next.remove(&e);
                continue;
            };
            if !is_satisfied(graph, min_occ, state, edge, entering) {
                continue;
            }
            if !and_gate_ready(graph, min_occ, state, entering) {
                continue;
            }
            if entering == edge.destination && !edge.is_two_way() {
                // Tokens are committed to the crossing now; the driver
                // decides when to actually cross.
                let consumed = consumed_keys(graph, edge);
                state.use_key(e, &consumed);
                state.add_one_way(e);
                changed = true;
                continue;
            }
            // Consume the traversed edge, plus every declared-incoming
            // edge when the entered node is an AndGate.
            let mut used: Vec<EdgeId> = vec![e];
            if graph.node(entering).kind == NodeKind::AndGate {
                used.extend(
                    graph
                        .edges_to(entering)
                        .filter(|in_edge| in_edge.destination == entering)
                        .map(|in_edge| in_edge.id),
                );
            }
            used.sort_unstable();
            used.dedup();
            for used_edge in used {
                if state.next.contains(&used_edge) {
                    let consumed = consumed_keys(graph, graph.edge(used_edge));
                    state.use_key(used_edge, &consumed);
                }
            }
            state.visit_node(graph, entering)?;
            changed = true;
        }
        if !changed {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrando_graph::GraphBuilder;

    #[test]
    fn removable_demand_accumulates_along_chain() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let k0 = builder.removable_key("K0", 0);
        let r1 = builder.and_gate("R1", &[r0], &[k0]);
        let r2 = builder.and_gate("R2", &[r1], &[k0]);
        let r3 = builder.and_gate("R3", &[r2], &[k0]);
        let graph = builder.build().unwrap();

        let min_occ = MinOccurrences::new(&graph);
        assert_eq!(min_occ.get(k0, r1), Some(1));
        assert_eq!(min_occ.get(k0, r2), Some(2));
        assert_eq!(min_occ.get(k0, r3), Some(3));
    }

    #[test]
    fn removable_demand_takes_cheapest_path() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let k0 = builder.removable_key("K0", 0);
        let locked = builder.and_gate("locked", &[r0], &[k0]);
        let goal = builder.or_gate("goal", &[locked]);
        builder.door(r0, goal);
        let graph = builder.build().unwrap();

        let min_occ = MinOccurrences::new(&graph);
        assert_eq!(min_occ.get(k0, goal), Some(0));
        // Repeated queries come from the same cached distance table.
        assert_eq!(min_occ.get(k0, goal), Some(0));
        assert_eq!(min_occ.get(k0, locked), Some(1));
    }

    #[test]
    fn reusable_multiplicity_needs_a_single_token() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let reusable = builder.reusable_key("KR", 0);
        let consumable = builder.consumable_key("KC", 0);
        let r1 = builder.and_gate("R1", &[r0], &[reusable, reusable]);
        let r2 = builder.and_gate("R2", &[r0], &[consumable, consumable]);
        let graph = builder.build().unwrap();

        let min_occ = MinOccurrences::new(&graph);
        let into_r1 = graph.edges_to(r1).next().unwrap();
        let into_r2 = graph.edges_to(r2).next().unwrap();
        // Owning a reusable key once covers every multiplicity of it.
        assert_eq!(need(&graph, &min_occ, into_r1, reusable, r1), Some(1));
        assert_eq!(need(&graph, &min_occ, into_r2, consumable, r2), Some(2));
    }

    #[test]
    fn expansion_defers_one_way_edges() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let r1 = builder.and_gate("R1", &[r0], &[]);
        let chute = builder.one_way("chute", r1, &[]);
        let graph = builder.build().unwrap();

        let min_occ = MinOccurrences::new(&graph);
        let mut state = SearchState::new();
        state.visit_node(&graph, r0).unwrap();
        expand(&graph, &min_occ, &mut state).unwrap();
        assert!(state.visited.contains(&r1));
        assert!(!state.visited.contains(&chute));
        assert_eq!(state.one_way.len(), 1);
        assert!(state.next.is_empty());
    }

    #[test]
    fn and_gate_needs_every_entrance_open() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let k0 = builder.reusable_key("K0", 0);
        let side = builder.and_gate("side", &[r0], &[k0]);
        let gate = builder.and_gate("gate", &[r0, side], &[]);
        let graph = builder.build().unwrap();

        let min_occ = MinOccurrences::new(&graph);
        let mut state = SearchState::new();
        state.visit_node(&graph, r0).unwrap();
        expand(&graph, &min_occ, &mut state).unwrap();
        // Both entrances feed the gate; the locked one holds it shut.
        assert!(!state.visited.contains(&gate));

        state.keys.add(k0);
        expand(&graph, &min_occ, &mut state).unwrap();
        assert!(state.visited.contains(&side));
        assert!(state.visited.contains(&gate));
    }

    #[test]
    fn two_way_edges_open_from_the_far_end() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let r1 = builder.or_gate("R1", &[r0]);
        // Declared from the annex side, but first discovered from R1.
        let annex = builder.add_node(NodeKind::OrGate, 0, "annex");
        builder.door(annex, r1);
        let graph = builder.build().unwrap();

        let min_occ = MinOccurrences::new(&graph);
        let mut state = SearchState::new();
        state.visit_node(&graph, r0).unwrap();
        expand(&graph, &min_occ, &mut state).unwrap();
        assert!(state.visited.contains(&annex));
        assert!(state.next.is_empty());
    }
}
