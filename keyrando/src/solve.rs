use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;
use keyrando_graph::{Edge, EdgeId, Graph, KeyId, KeyMultiset, NodeId, NodeKind};

use crate::state::SearchState;
use crate::traverse::{consumed_keys, need, MinOccurrences};

pub type RouteSolverResult = u32;

pub const SOLVER_OK: RouteSolverResult = 0;
pub const SOLVER_POTENTIAL_SOFTLOCK: RouteSolverResult = 1 << 0;
pub const SOLVER_NOT_ALL_NODES_VISITED: RouteSolverResult = 1 << 1;

// Bounded search: beyond this many distinct player states the solver stops
// proving anything further.
const SOLVER_STATE_BUDGET: usize = 10_000;

type Fingerprint = (
    BTreeSet<NodeId>,
    KeyMultiset,
    BTreeSet<EdgeId>,
    BTreeSet<EdgeId>,
    BTreeSet<NodeId>,
);

/// Validates key placements against a pessimistic player.
///
/// The player automatically collects every reachable key and crosses every
/// edge that spends nothing; the adversarial choices are which consumable
/// tokens to spend where, and which pending one-way/no-return crossing to
/// take once nothing else opens. `SOLVER_POTENTIAL_SOFTLOCK` is set iff
/// some choice sequence strands the player with unvisited nodes remaining.
pub fn solve_route(graph: &Graph, placements: &BTreeMap<NodeId, Vec<KeyId>>) -> RouteSolverResult {
    let mut solver = Solver {
        graph,
        placements,
        min_occ: MinOccurrences::new(graph),
        memo: HashMap::new(),
        explored: 0,
    };
    let mut state = SearchState::new();
    solver.visit(&mut state, graph.start);
    solver.run(state)
}

struct Solver<'a> {
    graph: &'a Graph,
    placements: &'a BTreeMap<NodeId, Vec<KeyId>>,
    min_occ: MinOccurrences<'a>,
    memo: HashMap<Fingerprint, RouteSolverResult>,
    explored: usize,
}

impl<'a> Solver<'a> {
    fn run(&mut self, mut state: SearchState) -> RouteSolverResult {
        self.expand_free(&mut state);
        if state.total_visited.len() == self.graph.nodes.len() {
            // Everything seen: no remaining choice can strand the player.
            return SOLVER_OK;
        }
        let fp = fingerprint(&state);
        if let Some(&cached) = self.memo.get(&fp) {
            return cached;
        }
        if self.explored >= SOLVER_STATE_BUDGET {
            return SOLVER_OK;
        }
        self.explored += 1;
        // Provisional entry cuts crossing cycles: a revisited state proves
        // neither completion nor a softlock.
        self.memo.insert(fp.clone(), SOLVER_NOT_ALL_NODES_VISITED);

        let spends = self.spend_choices(&state);
        let crossings = self.crossing_choices(&state);
        let result = if spends.is_empty() && crossings.is_empty() {
            SOLVER_POTENTIAL_SOFTLOCK | SOLVER_NOT_ALL_NODES_VISITED
        } else {
            let mut softlock = false;
            let mut all_incomplete = true;
            for e in spends {
                let child = self.apply_spend(&state, e);
                let mask = self.run(child);
                softlock |= mask & SOLVER_POTENTIAL_SOFTLOCK != 0;
                all_incomplete &= mask & SOLVER_NOT_ALL_NODES_VISITED != 0;
            }
            for e in crossings {
                let child = self.apply_crossing(&state, e);
                let mask = self.run(child);
                softlock |= mask & SOLVER_POTENTIAL_SOFTLOCK != 0;
                all_incomplete &= mask & SOLVER_NOT_ALL_NODES_VISITED != 0;
            }
            let mut mask = SOLVER_OK;
            if softlock {
                mask |= SOLVER_POTENTIAL_SOFTLOCK;
            }
            if all_incomplete {
                mask |= SOLVER_NOT_ALL_NODES_VISITED;
            }
            mask
        };
        self.memo.insert(fp, result);
        result
    }

    /// Marks `n` reachable; keys are granted only on the first visit in
    /// the whole run (re-entering a segment must not duplicate tokens).
    fn visit(&self, state: &mut SearchState, n: NodeId) {
        if !state.visited.insert(n) {
            return;
        }
        if state.total_visited.insert(n) {
            if let Some(keys) = self.placements.get(&n) {
                for &key in keys {
                    state.keys.add_many(key, self.graph.key(key).quantity);
                }
            }
        }
        for edge in self.graph.edges_from(n) {
            if edge.source == n && !edge.is_two_way() {
                state.one_way.insert(edge.id);
            } else if !state.visited.contains(&edge.inverse(n)) {
                state.next.insert(edge.id);
            }
        }
        let visited = &state.visited;
        state.next.retain(|&e| {
            let edge = self.graph.edge(e);
            !(visited.contains(&edge.source) && visited.contains(&edge.destination))
        });
    }

    /// Crosses every satisfied edge that spends no consumable tokens,
    /// until nothing more opens for free.
    fn expand_free(&self, state: &mut SearchState) {
        loop {
            state.one_way.retain(|&e| {
                let edge = self.graph.edge(e);
                !state.visited.contains(&edge.destination)
            });
            let candidates: Vec<EdgeId> = state.next.iter().copied().collect();
            let mut changed = false;
            for e in candidates {
                if !state.next.contains(&e) {
                    continue;
                }
                let Some(entering) = self.entering(state, e) else {
                    continue;
                };
                let edge = self.graph.edge(e);
                if !self.satisfied(state, edge, entering) || !self.gate_ready(state, entering) {
                    continue;
                }
                if self.entry_cost(state, e, entering) {
                    continue;
                }
                self.consume_entry_edges(state, e, entering);
                self.visit(state, entering);
                changed = true;
            }
            if !changed {
                return;
            }
        }
    }

    /// Two-way edges whose crossing would spend consumable tokens, ready
    /// to be taken right now.
    fn spend_choices(&self, state: &SearchState) -> Vec<EdgeId> {
        state
            .next
            .iter()
            .copied()
            .filter(|&e| {
                let Some(entering) = self.entering(state, e) else {
                    return false;
                };
                let edge = self.graph.edge(e);
                self.satisfied(state, edge, entering)
                    && self.gate_ready(state, entering)
                    && self.entry_cost(state, e, entering)
            })
            .collect()
    }

    /// Pending one-way/no-return crossings whose requirements are met now.
    /// Crossings queued in earlier segments stay available, mirroring the
    /// driver's sequential no-return processing.
    fn crossing_choices(&self, state: &SearchState) -> Vec<EdgeId> {
        state
            .one_way
            .iter()
            .copied()
            .filter(|&e| {
                let edge = self.graph.edge(e);
                state.total_visited.contains(&edge.source)
                    && self.satisfied(state, edge, edge.destination)
            })
            .collect()
    }

    fn apply_spend(&self, state: &SearchState, e: EdgeId) -> SearchState {
        let mut child = state.clone();
        let entering = self
            .entering(state, e)
            .expect("spend choice lost its entry side");
        self.consume_entry_edges(&mut child, e, entering);
        self.visit(&mut child, entering);
        child
    }

    /// Takes a one-way or no-return crossing: the old segment's frontier
    /// is abandoned and exploration restarts at the destination. If the
    /// new segment loops back to old ground, its edges are rediscovered on
    /// revisit (keys are not re-granted).
    fn apply_crossing(&self, state: &SearchState, e: EdgeId) -> SearchState {
        let mut child = state.clone();
        child.one_way.remove(&e);
        let edge = self.graph.edge(e);
        for (key, count) in consumed_keys(self.graph, edge).iter() {
            child.keys.remove_many(key, count);
        }
        child.visited = BTreeSet::new();
        child.next = BTreeSet::new();
        self.visit(&mut child, edge.destination);
        child
    }

    /// Which endpoint crossing `e` would newly enter, if any.
    fn entering(&self, state: &SearchState, e: EdgeId) -> Option<NodeId> {
        let edge = self.graph.edge(e);
        let src_visited = state.visited.contains(&edge.source);
        let dst_visited = state.visited.contains(&edge.destination);
        if src_visited && !dst_visited {
            Some(edge.destination)
        } else if dst_visited && !src_visited && edge.is_two_way() {
            Some(edge.source)
        } else {
            None
        }
    }

    /// Like `traverse::is_satisfied`, but node requirements check the
    /// cumulative visited set: required nodes are flags that stay
    /// satisfied across segment resets.
    fn satisfied(&self, state: &SearchState, edge: &Edge, entering: NodeId) -> bool {
        if !edge
            .required_nodes
            .iter()
            .all(|n| state.total_visited.contains(n))
        {
            return false;
        }
        for key in edge.required_keys.keys() {
            match need(self.graph, &self.min_occ, edge, key, entering) {
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

    fn gate_ready(&self, state: &SearchState, node: NodeId) -> bool {
        if self.graph.node(node).kind != NodeKind::AndGate {
            return true;
        }
        self.graph
            .edges_to(node)
            .filter(|edge| edge.destination == node)
            .all(|edge| {
                state.visited.contains(&edge.source) && self.satisfied(state, edge, node)
            })
    }

    /// True iff entering through `e` debits any consumable tokens,
    /// counting every incoming edge consumed by an AndGate entry.
    fn entry_cost(&self, state: &SearchState, e: EdgeId, entering: NodeId) -> bool {
        self.entry_edges(state, e, entering)
            .iter()
            .any(|&edge| !consumed_keys(self.graph, self.graph.edge(edge)).is_empty())
    }

    /// The edges retired by entering `entering` through `e`: just `e`, or
    /// every declared-incoming edge for an AndGate.
    fn entry_edges(&self, state: &SearchState, e: EdgeId, entering: NodeId) -> Vec<EdgeId> {
        let mut out = vec![e];
        if self.graph.node(entering).kind == NodeKind::AndGate {
            out.extend(
                self.graph
                    .edges_to(entering)
                    .filter(|edge| edge.destination == entering && state.next.contains(&edge.id))
                    .map(|edge| edge.id),
            );
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    fn consume_entry_edges(&self, state: &mut SearchState, e: EdgeId, entering: NodeId) {
        for edge_id in self.entry_edges(state, e, entering) {
            if state.next.remove(&edge_id) || edge_id == e {
                let consumed = consumed_keys(self.graph, self.graph.edge(edge_id));
                for (key, count) in consumed.iter() {
                    state.keys.remove_many(key, count);
                }
            }
        }
    }
}

fn fingerprint(state: &SearchState) -> Fingerprint {
    (
        state.visited.clone(),
        state.keys.clone(),
        state.next.clone(),
        state.one_way.clone(),
        state.total_visited.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrando_graph::GraphBuilder;

    #[test]
    fn free_graph_is_ok() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let r1 = builder.and_gate("R1", &[r0], &[]);
        let _r2 = builder.or_gate("R2", &[r0, r1]);
        let graph = builder.build().unwrap();
        let placements = BTreeMap::new();
        assert_eq!(solve_route(&graph, &placements), SOLVER_OK);
    }

    #[test]
    fn wasted_consumable_token_flags_softlock() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let k0 = builder.consumable_key("K0", 0);
        let i0 = builder.item("I0", 0, r0, &[]);
        // Two doors competing for a single token.
        let _r1 = builder.and_gate("R1", &[r0], &[k0]);
        let _r2 = builder.and_gate("R2", &[r0], &[k0]);
        let graph = builder.build().unwrap();
        let mut placements = BTreeMap::new();
        placements.insert(i0, vec![k0]);
        let result = solve_route(&graph, &placements);
        assert_ne!(result & SOLVER_POTENTIAL_SOFTLOCK, 0);
    }

    #[test]
    fn funded_consumable_doors_are_ok() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let k0 = builder.consumable_key("K0", 0);
        let i0a = builder.item("I0a", 0, r0, &[]);
        let i0b = builder.item("I0b", 0, r0, &[]);
        let _r1 = builder.and_gate("R1", &[r0], &[k0]);
        let _r2 = builder.and_gate("R2", &[r0], &[k0]);
        let graph = builder.build().unwrap();
        let mut placements = BTreeMap::new();
        placements.insert(i0a, vec![k0]);
        placements.insert(i0b, vec![k0]);
        assert_eq!(solve_route(&graph, &placements), SOLVER_OK);
    }

    #[test]
    fn missing_key_reports_unvisitable_nodes() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let k0 = builder.reusable_key("K0", 0);
        let _r1 = builder.and_gate("R1", &[r0], &[k0]);
        let graph = builder.build().unwrap();
        let placements = BTreeMap::new();
        let result = solve_route(&graph, &placements);
        assert_ne!(result & SOLVER_NOT_ALL_NODES_VISITED, 0);
    }

    #[test]
    fn early_no_return_crossing_strands_locked_area() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let k0 = builder.reusable_key("K0", 0);
        // K0 only exists past the crossing, but the locked room is before it.
        let _r1 = builder.and_gate("R1", &[r0], &[k0]);
        let r2 = builder.no_return("R2", r0, &[]);
        let i2 = builder.item("I2", 0, r2, &[]);
        let graph = builder.build().unwrap();
        let mut placements = BTreeMap::new();
        placements.insert(i2, vec![k0]);
        let result = solve_route(&graph, &placements);
        assert_ne!(result & SOLVER_POTENTIAL_SOFTLOCK, 0);
    }
}
