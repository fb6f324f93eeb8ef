use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use keyrando_graph::{EdgeKind, Graph, KeyId, KeyKind, NodeId};
use serde_derive::{Deserialize, Serialize};
use strum::VariantNames;

use crate::solve::{solve_route, RouteSolverResult};
use crate::state::SearchState;

/// A finished key assignment plus the search state it came from.
pub struct Route<'a> {
    graph: &'a Graph,
    state: SearchState,
    all_nodes_visited: bool,
}

impl<'a> Route<'a> {
    pub(crate) fn new(graph: &'a Graph, state: SearchState, all_nodes_visited: bool) -> Self {
        Route {
            graph,
            state,
            all_nodes_visited,
        }
    }

    pub fn all_nodes_visited(&self) -> bool {
        self.all_nodes_visited
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// The principal key placed at `item`: the first one assigned there.
    pub fn get_item_contents(&self, item: NodeId) -> Option<KeyId> {
        self.state
            .item_to_key
            .get(&item)
            .and_then(|keys| keys.first().copied())
    }

    /// Every item node hosting `key`, across all segments.
    pub fn get_items_containing_key(&self, key: KeyId) -> BTreeSet<NodeId> {
        self.state
            .item_to_key
            .iter()
            .filter(|(_, keys)| keys.contains(&key))
            .map(|(&item, _)| item)
            .collect()
    }

    pub fn item_to_key(&self) -> &BTreeMap<NodeId, Vec<KeyId>> {
        &self.state.item_to_key
    }

    pub fn final_state(&self) -> &SearchState {
        &self.state
    }

    /// Re-validates the placements against the pessimistic player.
    pub fn solve(&self) -> RouteSolverResult {
        solve_route(self.graph, &self.state.item_to_key)
    }

    pub fn summary(&self) -> RouteSummary {
        let placements: Vec<RoutePlacement> = self
            .state
            .item_to_key
            .iter()
            .flat_map(|(&item, keys)| {
                keys.iter().map(move |&key| RoutePlacement {
                    item,
                    key,
                    item_label: self.graph.node(item).label.clone(),
                    key_label: self.graph.key(key).label.clone(),
                })
            })
            .collect();
        let key_kind_counts = KeyKind::VARIANTS
            .iter()
            .enumerate()
            .map(|(i, &kind)| KeyKindCount {
                kind: kind.to_string(),
                placements: placements
                    .iter()
                    .filter(|p| self.graph.key(p.key).kind as usize == i)
                    .count(),
            })
            .collect();
        RouteSummary {
            all_nodes_visited: self.all_nodes_visited,
            nodes_visited: self.state.total_visited.len(),
            nodes_total: self.graph.nodes.len(),
            placements,
            key_kind_counts,
        }
    }

    /// Mermaid flowchart of the graph with placements written into the
    /// item labels.
    pub fn to_mermaid(&self) -> String {
        let mut out = String::new();
        writeln!(out, "flowchart TD").unwrap();
        for node in &self.graph.nodes {
            let keys = self.state.item_to_key.get(&node.id);
            let label = match keys {
                Some(keys) => {
                    let names: Vec<&str> = keys
                        .iter()
                        .map(|&k| self.graph.key(k).label.as_str())
                        .collect();
                    format!("{} [{}]", node.label, names.join(", "))
                }
                None => node.label.clone(),
            };
            writeln!(out, "    n{}[\"{}\"]", node.id, label).unwrap();
        }
        for edge in &self.graph.edges {
            let arrow = match edge.kind {
                EdgeKind::TwoWay => "---",
                EdgeKind::OneWay => "-->",
                EdgeKind::NoReturn => "==>",
            };
            let mut locks: Vec<String> = vec![];
            for (key, count) in edge.required_keys.iter() {
                let label = &self.graph.key(key).label;
                if count > 1 {
                    locks.push(format!("{count}x {label}"));
                } else {
                    locks.push(label.clone());
                }
            }
            for &node in &edge.required_nodes {
                locks.push(format!("[{}]", self.graph.node(node).label));
            }
            if locks.is_empty() {
                writeln!(out, "    n{} {} n{}", edge.source, arrow, edge.destination).unwrap();
            } else {
                writeln!(
                    out,
                    "    n{} {}|{}| n{}",
                    edge.source,
                    arrow,
                    locks.join(" + "),
                    edge.destination
                )
                .unwrap();
            }
        }
        out
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteSummary {
    pub all_nodes_visited: bool,
    pub nodes_visited: usize,
    pub nodes_total: usize,
    pub placements: Vec<RoutePlacement>,
    pub key_kind_counts: Vec<KeyKindCount>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutePlacement {
    pub item: NodeId,
    pub key: KeyId,
    pub item_label: String,
    pub key_label: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyKindCount {
    pub kind: String,
    pub placements: usize,
}
