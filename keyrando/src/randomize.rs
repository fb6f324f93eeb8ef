use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keyrando_graph::{EdgeId, EdgeKind, Graph, KeyId, KeyKind, NodeId};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;

use crate::analyze::RequirementAnalyzer;
use crate::route::Route;
use crate::solve::{solve_route, SOLVER_POTENTIAL_SOFTLOCK};
use crate::state::SearchState;
use crate::traverse::{expand, need, MinOccurrences};

#[derive(Error, Debug)]
pub enum RouteFinderError {
    #[error("speculative recursion exceeded depth limit at depth {depth}")]
    DepthLimitReached {
        depth: usize,
        best: Box<SearchState>,
    },
    #[error("route search cancelled")]
    Cancelled,
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub struct RouteFinderOptions {
    pub debug_depth_limit: usize,
    pub debug_dead_end_callback: Option<Box<dyn Fn(&SearchState)>>,
    pub cancel_flag: Option<Arc<AtomicBool>>,
}

impl Default for RouteFinderOptions {
    fn default() -> Self {
        RouteFinderOptions {
            debug_depth_limit: usize::MAX,
            debug_dead_end_callback: None,
            cancel_flag: None,
        }
    }
}

const NUM_PLACEMENT_ATTEMPTS: usize = 10;

/// Backtracking key-placement search over a lock/key graph.
///
/// All non-determinism flows from the seeded PRNG; equal seeds on equal
/// graphs produce equal routes.
pub struct RouteFinder<'a> {
    pub graph: &'a Graph,
    pub options: RouteFinderOptions,
    min_occ: MinOccurrences<'a>,
    rng: StdRng,
}

impl<'a> RouteFinder<'a> {
    pub fn new(graph: &'a Graph, seed: usize, options: RouteFinderOptions) -> Self {
        let mut rng_seed = [0u8; 32];
        rng_seed[..8].copy_from_slice(&(seed as u64).to_le_bytes());
        RouteFinder {
            graph,
            options,
            min_occ: MinOccurrences::new(graph),
            rng: StdRng::from_seed(rng_seed),
        }
    }

    pub fn find(&mut self) -> Result<Route<'a>, RouteFinderError> {
        info!(
            "route search: {} nodes, {} keys, {} edges",
            self.graph.nodes.len(),
            self.graph.keys.len(),
            self.graph.edges.len()
        );
        let state = self.do_subgraph(SearchState::new(), self.graph.start, false, 0)?;
        let all_nodes_visited = state.total_visited.len() == self.graph.nodes.len()
            && state.next.is_empty()
            && state.one_way.is_empty();
        info!(
            "route search done: visited {}/{} nodes, {} placements",
            state.total_visited.len(),
            self.graph.nodes.len(),
            state.placement_count()
        );
        Ok(Route::new(self.graph, state, all_nodes_visited))
    }

    /// Opens a new segment at `start`, seeded with whatever is guaranteed
    /// to hold on every path into it, and searches it to completion.
    fn do_subgraph(
        &mut self,
        mut state: SearchState,
        start: NodeId,
        fork: bool,
        depth: usize,
    ) -> Result<SearchState, RouteFinderError> {
        let analyzer = RequirementAnalyzer::new(self.graph, &state.item_to_key);
        let (mut seed_visited, seed_keys) = analyzer.seed_for(start);
        // The segment start always enters through visit_node so that its
        // outgoing edges land in `next`.
        seed_visited.remove(&start);
        debug!(
            "segment at {} (fork={fork}): {} seeded nodes, {} seeded tokens",
            self.graph.node(start).label,
            seed_visited.len(),
            seed_keys.total()
        );
        if fork {
            state.fork(seed_visited, seed_keys, BTreeSet::new());
        } else {
            state.clear(seed_visited, seed_keys, BTreeSet::new());
        }
        state.visit_node(self.graph, start)?;
        self.fulfill(state, depth)
    }

    /// Core recursion: expand, drive pending one-ways, then speculatively
    /// place keys for locked edges until the segment closes out or dead-ends.
    fn fulfill(
        &mut self,
        mut state: SearchState,
        depth: usize,
    ) -> Result<SearchState, RouteFinderError> {
        if let Some(flag) = &self.options.cancel_flag {
            if flag.load(Ordering::Relaxed) {
                return Err(RouteFinderError::Cancelled);
            }
        }
        if depth > self.options.debug_depth_limit {
            return Err(RouteFinderError::DepthLimitReached {
                depth,
                best: Box::new(state),
            });
        }
        expand(self.graph, &self.min_occ, &mut state)?;

        // Deferred one-way drops are free progress; take one and continue.
        let mut pending: Vec<EdgeId> = state
            .one_way
            .iter()
            .copied()
            .filter(|&e| self.graph.edge(e).kind == EdgeKind::OneWay)
            .collect();
        if !pending.is_empty() {
            pending.shuffle(&mut self.rng);
            let e = pending[0];
            state.remove_one_way(e);
            let dest = self.graph.edge(e).destination;
            if state.total_visited.contains(&dest) && !state.chain_visited(dest) {
                // Already explored in a segment this one cannot return to.
                return self.fulfill(state, depth + 1);
            }
            let state = self.do_subgraph(state, dest, true, depth + 1)?;
            return self.fulfill(state, depth + 1);
        }

        if !state.next.is_empty() {
            return self.fulfill_locked_edges(state, depth);
        }

        // Nothing left in this segment: cross pending no-returns, each one
        // starting a fresh segment that never rejoins.
        let mut crossings: Vec<EdgeId> = state.one_way.iter().copied().collect();
        crossings.shuffle(&mut self.rng);
        for e in crossings {
            let dest = self.graph.edge(e).destination;
            state.remove_one_way(e);
            if state.total_visited.contains(&dest) {
                continue;
            }
            state = self.do_subgraph(state, dest, false, depth + 1)?;
        }
        Ok(state)
    }

    /// Ranks locked edges, speculatively places their missing keys into
    /// spare item slots, and recurses; returns the first validated success
    /// or the best partial state.
    fn fulfill_locked_edges(
        &mut self,
        state: SearchState,
        depth: usize,
    ) -> Result<SearchState, RouteFinderError> {
        let mut candidates: Vec<EdgeId> = state.next.iter().copied().collect();
        candidates.shuffle(&mut self.rng);
        // Prefer edges whose requirements are least entangled with keys
        // already committed elsewhere; the stable sort keeps shuffled order
        // among ties.
        candidates.sort_by_key(|&e| self.placed_reusable_count(&state, e));

        let mut best: Option<SearchState> = None;
        for &e in &candidates {
            let Some(required) = self.missing_keys(&state, e) else {
                continue;
            };
            for attempt in 0..NUM_PLACEMENT_ATTEMPTS {
                if required.len() > state.spare_items.len() {
                    break;
                }
                let Some(placements) = self.pick_slots(&state, &required) else {
                    // A different shuffle may fit the zone constraints.
                    continue;
                };
                let mut child = state.clone();
                for &(item, key) in &placements {
                    child.place_key(self.graph, item, key)?;
                }
                debug!(
                    "depth {depth}: attempt {attempt} places {} keys for edge {e}",
                    placements.len()
                );
                let result = self.fulfill(child, depth + 1)?;
                if result.next.is_empty() && result.one_way.is_empty() {
                    if solve_route(self.graph, &result.item_to_key) & SOLVER_POTENTIAL_SOFTLOCK == 0
                    {
                        return Ok(result);
                    }
                    debug!("depth {depth}: placement rejected by route solver");
                    continue;
                }
                let better = match &best {
                    Some(b) => result.placement_count() > b.placement_count(),
                    None => true,
                };
                if better {
                    best = Some(result);
                }
            }
        }
        debug!("depth {depth}: dead end with {} locked edges", state.next.len());
        let out = best.unwrap_or(state);
        if let Some(callback) = &self.options.debug_dead_end_callback {
            callback(&out);
        }
        Ok(out)
    }

    /// Keys (one entry per placement needed) that would let `e` be
    /// crossed, including extra consumable tokens for other pending edges
    /// that are about to drain the same keys.
    fn missing_keys(&self, state: &SearchState, e: EdgeId) -> Option<Vec<KeyId>> {
        let edge = self.graph.edge(e);
        let src_visited = state.visited.contains(&edge.source);
        let dst_visited = state.visited.contains(&edge.destination);
        let entering = if src_visited && !dst_visited {
            edge.destination
        } else if dst_visited && !src_visited && edge.is_two_way() {
            edge.source
        } else {
            return None;
        };
        if !edge
            .required_nodes
            .iter()
            .all(|n| state.visited.contains(n))
        {
            return None;
        }
        let mut out: Vec<KeyId> = vec![];
        for key in edge.required_keys.keys() {
            let needed = need(self.graph, &self.min_occ, edge, key, entering)?;
            let mut deficit = needed.saturating_sub(state.keys.count(key));
            if self.graph.key(key).kind == KeyKind::Consumable {
                deficit += self.imminent_consumable_demand(state, e, key);
            }
            let quantity = self.graph.key(key).quantity.max(1);
            let placements = deficit.div_ceil(quantity);
            out.extend(std::iter::repeat(key).take(placements));
        }
        if out.is_empty() {
            return None;
        }
        Some(out)
    }

    /// Tokens of consumable `key` that other pending edges will take as
    /// soon as the key is available: expansion takes every satisfied edge
    /// simultaneously, so all imminent uses must be funded at once.
    fn imminent_consumable_demand(&self, state: &SearchState, e: EdgeId, key: KeyId) -> usize {
        let mut demand = 0;
        for &other in &state.next {
            if other == e {
                continue;
            }
            let edge = self.graph.edge(other);
            let multiplicity = edge.required_keys.count(key);
            if multiplicity == 0 {
                continue;
            }
            if !edge
                .required_nodes
                .iter()
                .all(|n| state.visited.contains(n))
            {
                continue;
            }
            let others_met = edge.required_keys.keys().filter(|&k| k != key).all(|k| {
                need(self.graph, &self.min_occ, edge, k, edge.destination)
                    .is_some_and(|needed| state.keys.count(k) >= needed)
            });
            if others_met {
                demand += multiplicity;
            }
        }
        demand
    }

    /// Greedy zone-compatible assignment of required keys to shuffled
    /// spare slots. `None` when the slots cannot accommodate the keys.
    fn pick_slots(
        &mut self,
        state: &SearchState,
        required: &[KeyId],
    ) -> Option<Vec<(NodeId, KeyId)>> {
        let mut slots: Vec<NodeId> = state.spare_items.iter().copied().collect();
        slots.shuffle(&mut self.rng);
        let mut taken = vec![false; slots.len()];
        let mut out: Vec<(NodeId, KeyId)> = vec![];
        for &key in required {
            let slot = slots
                .iter()
                .enumerate()
                .find(|&(i, &item)| !taken[i] && self.graph.zone_compatible(item, key));
            match slot {
                Some((i, &item)) => {
                    taken[i] = true;
                    out.push((item, key));
                }
                None => return None,
            }
        }
        Some(out)
    }

    /// Number of distinct required keys of `e` that are reusable and
    /// already placed somewhere.
    fn placed_reusable_count(&self, state: &SearchState, e: EdgeId) -> usize {
        self.graph
            .edge(e)
            .required_keys
            .keys()
            .filter(|&k| {
                self.graph.key(k).kind == KeyKind::Reusable
                    && state.item_to_key.values().any(|keys| keys.contains(&k))
            })
            .count()
    }
}

impl std::fmt::Debug for RouteFinderOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteFinderOptions")
            .field("debug_depth_limit", &self.debug_depth_limit)
            .field(
                "debug_dead_end_callback",
                &self.debug_dead_end_callback.is_some(),
            )
            .field("cancel_flag", &self.cancel_flag.is_some())
            .finish()
    }
}
