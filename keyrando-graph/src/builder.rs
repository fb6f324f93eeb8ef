use anyhow::{bail, Result};

use crate::{
    Edge, EdgeId, EdgeKind, Graph, GroupMask, Key, KeyId, KeyKind, Node, NodeId,
    NodeKind,
};

/// Assembles an immutable [`Graph`].
///
/// Node, key and edge handles are plain indices handed out in insertion
/// order. `build` fixes the start node as the first `AndGate` that is not
/// the declared destination of any edge.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    keys: Vec<Key>,
    edges: Vec<Edge>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        GraphBuilder::default()
    }

    pub fn add_node(&mut self, kind: NodeKind, group: GroupMask, label: &str) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            kind,
            group,
            label: label.to_string(),
        });
        id
    }

    pub fn add_key(
        &mut self,
        kind: KeyKind,
        group: GroupMask,
        quantity: usize,
        label: &str,
    ) -> KeyId {
        assert!(quantity >= 1, "key quantity must be at least 1");
        let id = self.keys.len();
        self.keys.push(Key {
            id,
            kind,
            group,
            quantity,
            label: label.to_string(),
        });
        id
    }

    pub fn add_edge(
        &mut self,
        source: NodeId,
        destination: NodeId,
        kind: EdgeKind,
        required_keys: &[KeyId],
        required_nodes: &[NodeId],
    ) -> EdgeId {
        let id = self.edges.len();
        self.edges.push(Edge {
            id,
            source,
            destination,
            kind,
            required_keys: required_keys.iter().copied().collect(),
            required_nodes: required_nodes.to_vec(),
        });
        id
    }

    /// New `AndGate` node with one two-way edge from each source.
    /// `required_keys` are attached to every created edge (all incoming
    /// edges of an AndGate must be satisfied anyway).
    pub fn and_gate(&mut self, label: &str, sources: &[NodeId], required_keys: &[KeyId]) -> NodeId {
        let node = self.add_node(NodeKind::AndGate, 0, label);
        for &source in sources {
            self.add_edge(source, node, EdgeKind::TwoWay, required_keys, &[]);
        }
        node
    }

    /// New `OrGate` node with one free two-way edge from each source.
    pub fn or_gate(&mut self, label: &str, sources: &[NodeId]) -> NodeId {
        let node = self.add_node(NodeKind::OrGate, 0, label);
        for &source in sources {
            self.add_edge(source, node, EdgeKind::TwoWay, &[], &[]);
        }
        node
    }

    /// New `Item` node inside `room`, reachable through a two-way edge
    /// gated by `required_keys` (empty for a free pickup).
    pub fn item(
        &mut self,
        label: &str,
        group: GroupMask,
        room: NodeId,
        required_keys: &[KeyId],
    ) -> NodeId {
        let node = self.add_node(NodeKind::Item, group, label);
        self.add_edge(room, node, EdgeKind::TwoWay, required_keys, &[]);
        node
    }

    /// New node behind a one-way drop from `source`.
    pub fn one_way(&mut self, label: &str, source: NodeId, required_keys: &[KeyId]) -> NodeId {
        let node = self.add_node(NodeKind::OneWay, 0, label);
        self.add_edge(source, node, EdgeKind::OneWay, required_keys, &[]);
        node
    }

    /// New node behind a no-return crossing from `source`.
    pub fn no_return(&mut self, label: &str, source: NodeId, required_keys: &[KeyId]) -> NodeId {
        let node = self.add_node(NodeKind::NoReturn, 0, label);
        self.add_edge(source, node, EdgeKind::NoReturn, required_keys, &[]);
        node
    }

    pub fn door(&mut self, a: NodeId, b: NodeId) -> EdgeId {
        self.add_edge(a, b, EdgeKind::TwoWay, &[], &[])
    }

    pub fn blocked_door(&mut self, a: NodeId, b: NodeId, required_keys: &[KeyId]) -> EdgeId {
        self.add_edge(a, b, EdgeKind::TwoWay, required_keys, &[])
    }

    pub fn reusable_key(&mut self, label: &str, group: GroupMask) -> KeyId {
        self.add_key(KeyKind::Reusable, group, 1, label)
    }

    pub fn consumable_key(&mut self, label: &str, group: GroupMask) -> KeyId {
        self.add_key(KeyKind::Consumable, group, 1, label)
    }

    pub fn removable_key(&mut self, label: &str, group: GroupMask) -> KeyId {
        self.add_key(KeyKind::Removable, group, 1, label)
    }

    pub fn build(self) -> Result<Graph> {
        for edge in &self.edges {
            if edge.source >= self.nodes.len() || edge.destination >= self.nodes.len() {
                bail!(
                    "edge {} references an unknown endpoint ({} -> {})",
                    edge.id,
                    edge.source,
                    edge.destination
                );
            }
            for key in edge.required_keys.keys() {
                if key >= self.keys.len() {
                    bail!("edge {} requires unknown key {}", edge.id, key);
                }
            }
            for &node in &edge.required_nodes {
                if node >= self.nodes.len() {
                    bail!("edge {} requires unknown node {}", edge.id, node);
                }
            }
        }

        let mut has_incoming = vec![false; self.nodes.len()];
        for edge in &self.edges {
            has_incoming[edge.destination] = true;
        }
        let start = self
            .nodes
            .iter()
            .find(|node| node.kind == NodeKind::AndGate && !has_incoming[node.id])
            .map(|node| node.id);
        let Some(start) = start else {
            bail!("graph has no AndGate without incoming edges to serve as start");
        };
        Ok(Graph::new(self.nodes, self.keys, self.edges, start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_first_unentered_and_gate() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let r1 = builder.and_gate("R1", &[r0], &[]);
        let _r2 = builder.or_gate("R2", &[r0, r1]);
        let graph = builder.build().unwrap();
        assert_eq!(graph.start, r0);
    }

    #[test]
    fn two_way_edges_indexed_from_both_endpoints() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let r1 = builder.and_gate("R1", &[r0], &[]);
        let r2 = builder.one_way("R2", r1, &[]);
        let graph = builder.build().unwrap();
        assert_eq!(graph.edges_from(r1).count(), 2);
        assert_eq!(graph.edges_to(r0).count(), 1);
        // One-way edges are not traversable backwards.
        assert_eq!(graph.edges_from(r2).count(), 0);
    }

    #[test]
    fn build_without_start_fails() {
        let mut builder = GraphBuilder::new();
        builder.add_node(NodeKind::OrGate, 0, "lonely");
        assert!(builder.build().is_err());
    }

    #[test]
    fn duplicate_required_keys_form_a_multiset() {
        let mut builder = GraphBuilder::new();
        let r0 = builder.add_node(NodeKind::AndGate, 0, "R0");
        let k0 = builder.reusable_key("K0", 0);
        let r1 = builder.and_gate("R1", &[r0], &[k0, k0]);
        let graph = builder.build().unwrap();
        let edge = graph.edges_to(r1).next().unwrap();
        assert_eq!(edge.required_keys.count(k0), 2);
    }
}
