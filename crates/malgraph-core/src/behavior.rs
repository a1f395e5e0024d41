//! Whole-package behavior graph
//!
//! A behavior graph indexes nodes of the package arena by id. Building one
//! inlines callee graphs, so a graph usually spans several dependency units.

use std::collections::{HashMap, HashSet};

use crate::cpg::NodeId;
use crate::pdg::EdgeKind;

#[derive(Debug, Clone, Default)]
pub struct BehaviorGraph {
    entrance: NodeId,
    returns: Vec<NodeId>,
    nodes: Vec<NodeId>,
    members: HashSet<NodeId>,
    edges: HashMap<(NodeId, NodeId), Vec<String>>,
    successors: HashMap<NodeId, Vec<NodeId>>,
    predecessors: HashMap<NodeId, Vec<NodeId>>,
}

impl BehaviorGraph {
    pub fn new(entrance: NodeId) -> Self {
        Self {
            entrance,
            ..Default::default()
        }
    }

    pub fn entrance(&self) -> NodeId {
        self.entrance
    }

    pub fn returns(&self) -> &[NodeId] {
        &self.returns
    }

    pub fn add_return(&mut self, id: NodeId) {
        if !self.returns.contains(&id) {
            self.returns.push(id);
        }
    }

    /// Adds a node; nodes keep their insertion order.
    pub fn add_node(&mut self, id: NodeId) {
        if self.members.insert(id) {
            self.nodes.push(id);
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Creates the edge if needed and appends tags not yet present.
    pub fn add_edge<S: AsRef<str>>(&mut self, source: NodeId, target: NodeId, tags: &[S]) {
        let existing = self.link(source, target);
        for tag in tags {
            let tag = tag.as_ref();
            if !existing.iter().any(|t| t == tag) {
                existing.push(tag.to_string());
            }
        }
    }

    /// Creates the edge with `tags` only when the pair is not connected yet.
    pub fn ensure_edge<S: AsRef<str>>(&mut self, source: NodeId, target: NodeId, tags: &[S]) {
        if !self.has_edge(source, target) {
            self.add_edge(source, target, tags);
        }
    }

    fn link(&mut self, source: NodeId, target: NodeId) -> &mut Vec<String> {
        if !self.edges.contains_key(&(source, target)) {
            self.successors.entry(source).or_default().push(target);
            self.predecessors.entry(target).or_default().push(source);
        }
        self.edges.entry((source, target)).or_default()
    }

    /// Moves every outgoing edge of `from` onto `to`, keeping the tags.
    pub fn move_out_edges(&mut self, from: NodeId, to: NodeId) {
        for target in self.successors.remove(&from).unwrap_or_default() {
            let tags = self.edges.remove(&(from, target)).unwrap_or_default();
            if let Some(predecessors) = self.predecessors.get_mut(&target) {
                predecessors.retain(|p| *p != from);
            }
            self.add_edge(to, target, &tags);
        }
    }

    pub fn has_edge(&self, source: NodeId, target: NodeId) -> bool {
        self.edges.contains_key(&(source, target))
    }

    pub fn tags(&self, source: NodeId, target: NodeId) -> Option<&[String]> {
        self.edges.get(&(source, target)).map(Vec::as_slice)
    }

    pub fn edge_kind(&self, source: NodeId, target: NodeId) -> Option<EdgeKind> {
        self.tags(source, target).map(EdgeKind::classify)
    }

    pub fn successors(&self, id: NodeId) -> &[NodeId] {
        self.successors.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn predecessors(&self, id: NodeId) -> &[NodeId] {
        self.predecessors
            .get(&id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn edges(&self) -> impl Iterator<Item = (&(NodeId, NodeId), &Vec<String>)> {
        self.edges.iter()
    }

    /// Merges `other` into this graph unless its entrance is already here.
    pub fn join(&mut self, other: &BehaviorGraph) {
        if self.contains(other.entrance) {
            return;
        }
        for node in &other.nodes {
            self.add_node(*node);
        }
        for source in other.nodes.iter().chain(other.successors.keys()) {
            for target in other.successors(*source) {
                if let Some(tags) = other.tags(*source, *target) {
                    self.add_edge(*source, *target, tags);
                }
            }
        }
    }

    /// Pulls `start` and all of its transitive predecessors in `background`
    /// into this graph, together with the edges between them.
    pub fn pull_predecessors(&mut self, start: NodeId, background: &BehaviorGraph) {
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            for head in background.predecessors(current) {
                self.add_node(*head);
                if let Some(tags) = background.tags(*head, current) {
                    self.add_edge(*head, current, tags);
                }
                stack.push(*head);
            }
        }
    }
}
