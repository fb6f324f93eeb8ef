pub mod builder;
pub mod multiset;

pub use builder::GraphBuilder;
pub use multiset::KeyMultiset;

use serde::{Deserialize, Serialize};
use strum_macros::{EnumString, VariantNames};

pub type NodeId = usize; // Index into Graph.nodes
pub type KeyId = usize; // Index into Graph.keys
pub type EdgeId = usize; // Index into Graph.edges
pub type GroupMask = u32; // Bitmask where `i`th bit indicates membership in `i`th key zone

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, EnumString, VariantNames, Serialize, Deserialize,
)]
pub enum NodeKind {
    AndGate,
    OrGate,
    Item,
    OneWay,
    NoReturn,
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, EnumString, VariantNames, Serialize, Deserialize,
)]
pub enum KeyKind {
    Reusable,
    Consumable,
    Removable,
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, EnumString, VariantNames, Serialize, Deserialize,
)]
pub enum EdgeKind {
    TwoWay,
    OneWay,
    NoReturn,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub group: GroupMask, // which key zones may be placed here (Items only)
    pub label: String,
}

impl Node {
    pub fn is_item(&self) -> bool {
        self.kind == NodeKind::Item
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Key {
    pub id: KeyId,
    pub kind: KeyKind,
    pub group: GroupMask,
    pub quantity: usize, // tokens granted per collected placement
    pub label: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub destination: NodeId,
    pub kind: EdgeKind,
    pub required_keys: KeyMultiset,
    pub required_nodes: Vec<NodeId>,
}

impl Edge {
    /// The endpoint opposite to `n`.
    pub fn inverse(&self, n: NodeId) -> NodeId {
        if n == self.source {
            self.destination
        } else {
            self.source
        }
    }

    pub fn is_two_way(&self) -> bool {
        self.kind == EdgeKind::TwoWay
    }

    pub fn has_requirements(&self) -> bool {
        !self.required_keys.is_empty() || !self.required_nodes.is_empty()
    }
}

// Immutable once built. Adjacency indices are precomputed so the engine can
// iterate applicable edges without filtering on every lookup.
#[derive(Clone, Debug)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub keys: Vec<Key>,
    pub edges: Vec<Edge>,
    pub start: NodeId,
    edges_from_idx: Vec<Vec<EdgeId>>,
    edges_to_idx: Vec<Vec<EdgeId>>,
}

impl Graph {
    pub(crate) fn new(nodes: Vec<Node>, keys: Vec<Key>, edges: Vec<Edge>, start: NodeId) -> Self {
        let mut edges_from_idx: Vec<Vec<EdgeId>> = vec![vec![]; nodes.len()];
        let mut edges_to_idx: Vec<Vec<EdgeId>> = vec![vec![]; nodes.len()];
        for edge in &edges {
            edges_from_idx[edge.source].push(edge.id);
            edges_to_idx[edge.destination].push(edge.id);
            if edge.is_two_way() {
                edges_from_idx[edge.destination].push(edge.id);
                edges_to_idx[edge.source].push(edge.id);
            }
        }
        Graph {
            nodes,
            keys,
            edges,
            start,
            edges_from_idx,
            edges_to_idx,
        }
    }

    /// Edges traversable outward from `n`. Two-way edges appear for both
    /// endpoints; one-way and no-return edges only for their source.
    pub fn edges_from(&self, n: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.edges_from_idx[n].iter().map(move |&e| &self.edges[e])
    }

    /// Edges arriving at `n`, with the same directionality rules.
    pub fn edges_to(&self, n: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.edges_to_idx[n].iter().map(move |&e| &self.edges[e])
    }

    pub fn node(&self, n: NodeId) -> &Node {
        &self.nodes[n]
    }

    pub fn key(&self, k: KeyId) -> &Key {
        &self.keys[k]
    }

    pub fn edge(&self, e: EdgeId) -> &Edge {
        &self.edges[e]
    }

    /// Zone compatibility: a key may live at an item iff the item's group
    /// bits cover the key's group bits.
    pub fn zone_compatible(&self, item: NodeId, key: KeyId) -> bool {
        let item_group = self.nodes[item].group;
        let key_group = self.keys[key].group;
        item_group & key_group == key_group
    }
}
